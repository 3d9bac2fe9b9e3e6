use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::status::conditions::Condition;

/// Default port of the Kubernetes API server behind the control plane endpoint.
pub const DEFAULT_API_SERVER_PORT: u16 = 6443;

/// Infrastructure of one workload cluster: the project and location its devices live in and
/// how the control plane endpoint is kept highly available.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "MetalCluster",
    plural = "metalclusters",
    namespaced,
    status = "MetalClusterStatus",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".spec.controlPlaneEndpoint.host"}"#,
    printcolumn = r#"{"name":"VIP Manager","type":"string","jsonPath":".spec.vipManager"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MetalClusterSpec {
    /// ID of the project all devices and IP reservations of this cluster are created in.
    #[serde(rename = "projectID")]
    pub project_id: String,

    /// Facility to create devices and IP reservations in. Mutually exclusive with `metro`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facility: Option<String>,

    /// Metro to create devices and IP reservations in. Mutually exclusive with `facility`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metro: Option<String>,

    /// How the control plane VIP is provided. Cannot be changed after creation.
    #[serde(default)]
    pub vip_manager: VipManager,

    /// Endpoint used to reach the API server. Filled in by the operator unless set explicitly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct ApiEndpoint {
    pub host: String,
    pub port: u16,
}

impl ApiEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

/// Strategy providing the highly-available control plane VIP.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize, strum::Display,
)]
pub enum VipManager {
    /// An elastic IP reserved in the cluster's location and assigned to one control plane
    /// device by the operator.
    #[default]
    #[serde(rename = "ManagedElasticIP", alias = "CPEM")]
    #[strum(serialize = "ManagedElasticIP")]
    ManagedElasticIp,

    /// The same elastic IP, announced over BGP by every control plane device.
    #[serde(rename = "BGPAnnounced", alias = "KUBE_VIP")]
    #[strum(serialize = "BGPAnnounced")]
    BgpAnnounced,

    /// A managed load balancer in front of all control plane devices.
    #[serde(rename = "ExternalLoadBalancer", alias = "EMLB")]
    ExternalLoadBalancer,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetalClusterStatus {
    /// The cluster infrastructure is ready for machines to be created.
    #[serde(default)]
    pub ready: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl MetalCluster {
    /// The locality selector devices of this cluster default to.
    pub fn locality(&self) -> (Option<&str>, Option<&str>) {
        (self.spec.facility.as_deref(), self.spec.metro.as_deref())
    }

    pub fn is_ready(&self) -> bool {
        self.status.as_ref().is_some_and(|status| status.ready)
    }
}
