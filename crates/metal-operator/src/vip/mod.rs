//! The ways the control plane VIP of a cluster is provided.
//!
//! The strategy is selected once from [`VipManager`] and every strategy-specific step of both
//! controllers goes through [`VipStrategy`].

use std::time::Duration;

use metal_api::{ComputeApi, LoadBalancerApi, compute::Device};
use serde_json::Value;
use snafu::Snafu;

use crate::{
    crd::{MetalCluster, VipManager},
    provisioner,
    scope::{ClusterScope, MachineScope},
};

mod bgp;
mod elastic_ip;
mod load_balancer;

pub use bgp::Bgp;
pub use elastic_ip::ElasticIp;
pub use load_balancer::ExternalLoadBalancer;

/// Requeue delay after a stale load balancer origin was removed.
pub const ORIGIN_RECREATE_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to look up the elastic IP of cluster {cluster:?}"))]
    GetReservation {
        source: metal_api::Error,
        cluster: String,
    },

    #[snafu(display("failed to reserve an elastic IP for cluster {cluster:?}"))]
    CreateReservation {
        source: metal_api::Error,
        cluster: String,
    },

    #[snafu(display("cluster {cluster:?} has no elastic IP reserved yet"))]
    MissingReservation { cluster: String },

    #[snafu(display("failed to assign elastic IP {address} to device {device_id:?}"))]
    AssignIp {
        source: metal_api::Error,
        device_id: String,
        address: String,
    },

    #[snafu(display("failed to enable BGP for project {project_id:?}"))]
    EnableProjectBgp {
        source: metal_api::Error,
        project_id: String,
    },

    #[snafu(display("failed to enable BGP for device {device_id:?}"))]
    EnableDeviceBgp {
        source: metal_api::Error,
        device_id: String,
    },

    #[snafu(display("cluster {cluster:?} needs a metro to use an external load balancer"))]
    MissingMetro { cluster: String },

    #[snafu(display("cluster {cluster:?} has no load balancer yet"))]
    MissingLoadBalancer { cluster: String },

    #[snafu(display("load balancer {id:?} has no IP address yet"))]
    NoLoadBalancerIp { id: String },

    #[snafu(display("failed to provision the load balancer of cluster {cluster:?}"))]
    Provision {
        source: provisioner::Error,
        cluster: String,
    },
}

impl Error {
    /// Errors that will not go away by retrying with the same configuration.
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::MissingMetro { .. } => true,
            Self::Provision { source, .. } => source.is_configuration(),
            _ => false,
        }
    }

    /// Failures of the BGP session setup, retried after a fixed delay.
    pub fn is_bgp(&self) -> bool {
        matches!(self, Self::EnableProjectBgp { .. } | Self::EnableDeviceBgp { .. })
    }
}

/// Outcome of [`VipStrategy::post_device_ready`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostReady {
    Done,
    /// A step has to be repeated after the given delay before the machine is ready.
    Requeue(Duration),
}

/// The machine a device belongs to, as seen by the strategies.
pub struct MachineContext<'a> {
    /// Name of the Cluster API cluster, used for tags and load balancer names.
    pub cluster_name: &'a str,
    pub is_control_plane: bool,
}

pub enum VipStrategy<'a> {
    ManagedElasticIp(ElasticIp<'a>),
    BgpAnnounced(Bgp<'a>),
    ExternalLoadBalancer(ExternalLoadBalancer<'a>),
}

impl<'a> VipStrategy<'a> {
    pub fn select(
        manager: VipManager,
        compute: &'a dyn ComputeApi,
        load_balancers: &'a dyn LoadBalancerApi,
    ) -> Self {
        match manager {
            VipManager::ManagedElasticIp => Self::ManagedElasticIp(ElasticIp::new(compute)),
            VipManager::BgpAnnounced => Self::BgpAnnounced(Bgp::new(compute)),
            VipManager::ExternalLoadBalancer => {
                Self::ExternalLoadBalancer(ExternalLoadBalancer::new(load_balancers))
            }
        }
    }

    /// Makes sure the cluster has a control plane endpoint.
    pub async fn acquire_endpoint(
        &self,
        cluster: &mut ClusterScope,
        cluster_name: &str,
    ) -> Result<(), Error> {
        match self {
            Self::ManagedElasticIp(strategy) => {
                strategy.acquire_endpoint(cluster, cluster_name).await
            }
            Self::BgpAnnounced(strategy) => strategy.acquire_endpoint(cluster, cluster_name).await,
            Self::ExternalLoadBalancer(strategy) => {
                strategy.acquire_endpoint(cluster, cluster_name).await
            }
        }
    }

    /// Custom data to pass along with the device creation request.
    pub fn pre_device_create(
        &self,
        cluster: &MetalCluster,
        machine: &MachineContext<'_>,
    ) -> Result<Option<Value>, Error> {
        match self {
            Self::ManagedElasticIp(_) | Self::BgpAnnounced(_) => Ok(None),
            Self::ExternalLoadBalancer(strategy) => strategy.pre_device_create(cluster, machine),
        }
    }

    /// Runs on every pass once the device exists, whatever state it is in.
    pub async fn on_device(
        &self,
        device: &Device,
        machine: &MachineContext<'_>,
    ) -> Result<(), Error> {
        match self {
            Self::BgpAnnounced(strategy) => strategy.on_device(device, machine).await,
            Self::ManagedElasticIp(_) | Self::ExternalLoadBalancer(_) => Ok(()),
        }
    }

    /// Runs once the device is running, on every pass.
    pub async fn post_device_ready(
        &self,
        cluster: &MetalCluster,
        scope: &mut MachineScope,
        device: &Device,
        machine: &MachineContext<'_>,
    ) -> Result<PostReady, Error> {
        match self {
            Self::ManagedElasticIp(strategy) => {
                strategy.post_device_ready(cluster, device, machine).await?;
                Ok(PostReady::Done)
            }
            Self::BgpAnnounced(_) => Ok(PostReady::Done),
            Self::ExternalLoadBalancer(strategy) => {
                strategy.post_device_ready(cluster, scope, machine).await
            }
        }
    }

    /// Removes everything the strategy created for a machine.
    pub async fn teardown(
        &self,
        cluster: &MetalCluster,
        scope: &mut MachineScope,
    ) -> Result<(), Error> {
        match self {
            Self::ManagedElasticIp(_) | Self::BgpAnnounced(_) => Ok(()),
            Self::ExternalLoadBalancer(strategy) => strategy.teardown(cluster, scope).await,
        }
    }

    /// Removes everything the strategy created for a cluster.
    ///
    /// Elastic IPs are kept, releasing them is left to the operator of the project.
    pub async fn cluster_teardown(&self, cluster: &mut ClusterScope) -> Result<(), Error> {
        match self {
            Self::ManagedElasticIp(_) | Self::BgpAnnounced(_) => {
                tracing::info!(
                    cluster = cluster.name(),
                    "keeping elastic IP reservation of deleted cluster"
                );
                Ok(())
            }
            Self::ExternalLoadBalancer(strategy) => strategy.cluster_teardown(cluster).await,
        }
    }
}
