//! Models and client trait for the compute side of the provider API: devices, IP reservations
//! and BGP.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A facility or metro a resource lives in.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Location {
    #[serde(default)]
    pub id: Option<String>,
    pub code: String,
}

/// An IP address attached to a device.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeviceAddress {
    pub address: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default = "DeviceAddress::default_address_family")]
    pub address_family: u8,
    #[serde(default)]
    pub management: bool,
}

impl DeviceAddress {
    const fn default_address_family() -> u8 {
        4
    }
}

/// A compute instance.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub hostname: Option<String>,
    /// The raw provider state, e.g. `queued` or `active`.
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub facility: Option<Location>,
    #[serde(default)]
    pub metro: Option<Location>,
    #[serde(default)]
    pub ip_addresses: Vec<DeviceAddress>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Device {
    pub fn facility_code(&self) -> Option<&str> {
        self.facility.as_ref().map(|facility| facility.code.as_str())
    }

    pub fn metro_code(&self) -> Option<&str> {
        self.metro.as_ref().map(|metro| metro.code.as_str())
    }

    /// Returns `true` if the device carries every tag in `tags`.
    pub fn has_tags<S: AsRef<str>>(&self, tags: &[S]) -> bool {
        tags.iter()
            .all(|tag| self.tags.iter().any(|own| own == tag.as_ref()))
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Href {
    pub href: String,
}

/// A reserved (elastic) IP block.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct IpReservation {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub facility: Option<Location>,
    #[serde(default)]
    pub metro: Option<Location>,
    #[serde(default)]
    pub assignments: Vec<Href>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct CreateDeviceRequest {
    pub hostname: String,
    pub plan: String,
    pub operating_system: String,
    pub billing_cycle: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub facility: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metro: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hardware_reservation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub userdata: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub project_ssh_keys: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customdata: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct CreateIpReservationRequest {
    #[serde(rename = "type")]
    pub type_: String,
    pub quantity: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facility: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metro: Option<String>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CreateIpReservationRequest {
    /// A request for a single public IPv4 address.
    pub fn single_public_ipv4(
        facility: Option<String>,
        metro: Option<String>,
        tags: Vec<String>,
    ) -> Self {
        Self {
            type_: "public_ipv4".to_owned(),
            quantity: 1,
            facility,
            metro,
            tags,
            details: None,
        }
    }
}

/// Device, IP reservation and BGP operations against the compute API.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Lists the devices of a project carrying every tag in `tags`.
    async fn find_devices_by_project(&self, project_id: &str, tags: &[String])
    -> Result<Vec<Device>>;

    async fn get_device(&self, device_id: &str) -> Result<Device>;

    async fn create_device(&self, project_id: &str, request: &CreateDeviceRequest)
    -> Result<Device>;

    async fn delete_device(&self, device_id: &str, force: bool) -> Result<()>;

    /// Assigns `address` (an IP from a reservation) to the device.
    async fn create_ip_assignment(&self, device_id: &str, address: &str) -> Result<()>;

    /// Returns the first IP reservation of the project carrying `tag`.
    async fn get_ip_by_tag(&self, project_id: &str, tag: &str) -> Result<Option<IpReservation>>;

    async fn create_ip_reservation(
        &self,
        project_id: &str,
        request: &CreateIpReservationRequest,
    ) -> Result<IpReservation>;

    /// Enables local BGP for the project unless it already is.
    async fn enable_project_bgp(&self, project_id: &str) -> Result<()>;

    /// Creates an IPv4 BGP session for the device unless one exists.
    async fn enable_device_bgp(&self, device_id: &str) -> Result<()>;
}
