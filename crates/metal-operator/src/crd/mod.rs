//! Custom resources managed or read by this operator.

use std::io::Write;

use kube::CustomResourceExt;
use snafu::{ResultExt, Snafu};

pub mod capi;
pub mod cluster;
pub mod machine;
pub mod validation;

pub use cluster::{ApiEndpoint, MetalCluster, MetalClusterSpec, MetalClusterStatus, VipManager};
pub use machine::{
    FailureReason, InstanceState, MachineAddress, MachineAddressType, MetalMachine,
    MetalMachineSpec, MetalMachineStatus,
};

/// ID of the load balancer fronting the control plane, stored on the [`MetalCluster`].
pub const LOAD_BALANCER_ID_ANNOTATION: &str = "equinix.com/loadbalancerID";
/// Number of the listener port of that load balancer, stored on the [`MetalCluster`].
pub const LOAD_BALANCER_PORT_NUMBER_ANNOTATION: &str = "equinix.com/loadbalancerPortNumber";
/// Metro the load balancer was created in, stored on the [`MetalCluster`].
pub const LOAD_BALANCER_METRO_ANNOTATION: &str = "equinix.com/loadbalancerMetro";
/// ID of the origin pool of a control plane machine, stored on the [`MetalMachine`].
pub const LOAD_BALANCER_POOL_ID_ANNOTATION: &str = "equinix.com/loadbalancerPoolID";
/// ID of the origin of a control plane machine, stored on the [`MetalMachine`].
pub const LOAD_BALANCER_ORIGIN_ID_ANNOTATION: &str = "equinix.com/loadbalancerOriginID";

pub const LAST_APPLIED_SPEC_ANNOTATION: &str = "infrastructure.cluster.x-k8s.io/last-applied-spec";

pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

pub const CLUSTER_FINALIZER: &str = "metalcluster.infrastructure.cluster.x-k8s.io";
pub const MACHINE_FINALIZER: &str = "metalmachine.infrastructure.cluster.x-k8s.io";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize CRD {name:?} as YAML"))]
    SerializeYaml {
        source: serde_yaml::Error,
        name: String,
    },

    #[snafu(display("failed to write CRD YAML"))]
    WriteYaml { source: std::io::Error },
}

/// Writes the `CustomResourceDefinition`s owned by this operator to `writer`.
///
/// Every definition is written as an explicit YAML document with leading dashes (`---`).
pub fn write_crds<W: Write>(mut writer: W) -> Result<(), Error> {
    for crd in [MetalCluster::crd(), MetalMachine::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        let yaml = serde_yaml::to_string(&crd).context(SerializeYamlSnafu { name })?;
        writer.write_all(b"---\n").context(WriteYamlSnafu)?;
        writer.write_all(yaml.as_bytes()).context(WriteYamlSnafu)?;
    }
    writer.flush().context(WriteYamlSnafu)
}

/// Writes the output of [`write_crds`] to stdout.
pub fn print_crds() -> Result<(), Error> {
    write_crds(std::io::stdout().lock())
}
