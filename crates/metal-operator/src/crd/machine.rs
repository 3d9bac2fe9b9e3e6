use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::status::conditions::Condition;

/// Scheme of provider IDs written by this operator.
pub const PROVIDER_ID_PREFIX: &str = "equinixmetal://";
/// Scheme of provider IDs written by older releases, still accepted when parsing.
const LEGACY_PROVIDER_ID_PREFIX: &str = "packet://";

pub const DEFAULT_BILLING_CYCLE: &str = "hourly";

/// One device request.
#[derive(
    CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq,
)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "MetalMachine",
    plural = "metalmachines",
    namespaced,
    status = "MetalMachineStatus",
    printcolumn = r#"{"name":"Provider ID","type":"string","jsonPath":".spec.providerID"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.instanceState"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MetalMachineSpec {
    /// Set by the operator once the device exists, in the form `equinixmetal://<device-id>`.
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Overrides the facility of the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub facility: Option<String>,

    /// Overrides the metro of the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metro: Option<String>,

    /// Device plan, e.g. `c3.small.x86`.
    pub machine_type: String,

    /// Operating system slug.
    pub os: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_cycle: Option<String>,

    /// Either `next-available` or the ID of a specific hardware reservation.
    #[serde(
        rename = "hardwareReservationID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub hardware_reservation_id: Option<String>,

    /// Project SSH key IDs installed on the device.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,

    /// Extra tags put on the device.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetalMachineStatus {
    #[serde(default)]
    pub ready: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_state: Option<InstanceState>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Set once a problem occurred that needs manual intervention. The machine is not
    /// reconciled anymore afterwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// The provider's device state, mapped onto the states this operator acts on.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize, strum::Display,
)]
pub enum InstanceState {
    New,
    Queued,
    Provisioning,
    Running,
    /// Any state the provider reports that is not listed above.
    Undefined,
}

impl InstanceState {
    pub fn from_provider(state: &str) -> Self {
        match state {
            "new" => Self::New,
            "queued" => Self::Queued,
            "provisioning" => Self::Provisioning,
            "active" => Self::Running,
            _ => Self::Undefined,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display)]
pub enum FailureReason {
    CreateMachineError,
    UpdateMachineError,
    InstanceProvisionFailed,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct MachineAddress {
    #[serde(rename = "type")]
    pub type_: MachineAddressType,
    pub address: String,
}

impl MachineAddress {
    pub fn new(type_: MachineAddressType, address: impl Into<String>) -> Self {
        Self {
            type_,
            address: address.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
pub enum MachineAddressType {
    Hostname,
    #[serde(rename = "ExternalIP")]
    ExternalIp,
    #[serde(rename = "InternalIP")]
    InternalIp,
}

/// Formats the provider ID for a device.
pub fn provider_id(device_id: &str) -> String {
    format!("{PROVIDER_ID_PREFIX}{device_id}")
}

/// Extracts the device ID from a provider ID.
///
/// Returns [`None`] for foreign schemes and empty IDs.
pub fn device_id(provider_id: &str) -> Option<&str> {
    provider_id
        .strip_prefix(PROVIDER_ID_PREFIX)
        .or_else(|| provider_id.strip_prefix(LEGACY_PROVIDER_ID_PREFIX))
        .filter(|id| !id.is_empty())
}

impl MetalMachine {
    pub fn device_id(&self) -> Option<&str> {
        self.spec.provider_id.as_deref().and_then(device_id)
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        self.status.as_ref().and_then(|status| status.failure_reason)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::new("new", InstanceState::New)]
    #[case::queued("queued", InstanceState::Queued)]
    #[case::provisioning("provisioning", InstanceState::Provisioning)]
    #[case::active("active", InstanceState::Running)]
    #[case::failed("failed", InstanceState::Undefined)]
    #[case::empty("", InstanceState::Undefined)]
    fn instance_state_from_provider(#[case] state: &str, #[case] expected: InstanceState) {
        assert_eq!(InstanceState::from_provider(state), expected);
    }

    #[rstest]
    #[case::current("equinixmetal://abc", Some("abc"))]
    #[case::legacy("packet://abc", Some("abc"))]
    #[case::empty("equinixmetal://", None)]
    #[case::foreign("aws:///us-east-1/i-123", None)]
    fn device_id_from_provider_id(#[case] input: &str, #[case] expected: Option<&str>) {
        assert_eq!(device_id(input), expected);
    }

    #[test]
    fn provider_id_round_trips() {
        assert_eq!(device_id(&provider_id("d-1")), Some("d-1"));
    }

    #[test]
    fn addresses_use_cluster_api_type_names() {
        let address = MachineAddress::new(MachineAddressType::ExternalIp, "1.2.3.4");
        assert_eq!(
            serde_json::to_value(address).expect("serializable"),
            serde_json::json!({"type": "ExternalIP", "address": "1.2.3.4"})
        );
    }
}
