//! Everything about the devices backing [`MetalMachine`]s: discovery by tags, address mapping,
//! creation requests and classification of creation failures.

use std::net::Ipv4Addr;

use metal_api::{
    ComputeApi,
    compute::{CreateDeviceRequest, Device},
};
use serde_json::Value;
use snafu::{OptionExt, Snafu};

use crate::crd::{
    MachineAddress, MachineAddressType, MetalCluster, MetalMachine,
    machine::DEFAULT_BILLING_CYCLE,
};

const TAG_PREFIX: &str = "cluster-api-provider-packet";

/// Creation error codes the provider reports when it is temporarily out of capacity.
const RETRYABLE_CODES: &[&str] = &["no_hardware_available", "not_provisionable"];
/// Fallback for responses without a structured code.
const RETRYABLE_MESSAGES: &[&str] = &[
    "no available hardware reservations",
    "Server is not provisionable",
];
/// The connection dropped after the request was sent, the device is most likely being created.
const IGNORED_MESSAGES: &[&str] = &["unexpected EOF"];

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum Error {
    #[snafu(display("no external IPv4 addresses found"))]
    NoExternalIpv4,

    #[snafu(display(
        "device {device_id:?} is located in {actual:?}, but {requested:?} was requested"
    ))]
    LocationMismatch {
        device_id: String,
        requested: String,
        actual: String,
    },
}

/// The tags identifying the device of one machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceTags(Vec<String>);

impl DeviceTags {
    pub fn for_machine(namespace: &str, machine: &str, cluster: &str) -> Self {
        let mut tags = vec![
            cluster_tag(cluster),
            format!("{TAG_PREFIX}:machine-uuid:{namespace}/{machine}"),
        ];
        tags.sort();
        Self(tags)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

/// The tag put on every resource belonging to `cluster`.
pub fn cluster_tag(cluster: &str) -> String {
    format!("{TAG_PREFIX}:cluster-id:{cluster}")
}

/// Looks up a device by ID if one is known, otherwise by its tags.
///
/// Errors of the ID lookup are returned as is, so that the caller can tell a deleted device from
/// an unreachable API.
pub async fn find_device(
    compute: &dyn ComputeApi,
    project_id: &str,
    device_id: Option<&str>,
    tags: &DeviceTags,
) -> metal_api::Result<Option<Device>> {
    if let Some(device_id) = device_id {
        return compute.get_device(device_id).await.map(Some);
    }

    let mut devices = compute
        .find_devices_by_project(project_id, tags.as_slice())
        .await?
        .into_iter();
    let device = devices.next();
    if let Some(device) = &device {
        let duplicates = devices.count();
        if duplicates > 0 {
            tracing::warn!(
                device.id = device.id,
                duplicates,
                "found more than one device with the same tags, using the first one"
            );
        }
    }
    Ok(device)
}

/// Maps the device's hostname and IP addresses to machine addresses.
pub fn machine_addresses(device: &Device) -> Vec<MachineAddress> {
    let hostname = device
        .hostname
        .iter()
        .map(|hostname| MachineAddress::new(MachineAddressType::Hostname, hostname));
    let ips = device.ip_addresses.iter().map(|ip| {
        let type_ = if ip.public {
            MachineAddressType::ExternalIp
        } else {
            MachineAddressType::InternalIp
        };
        MachineAddress::new(type_, &ip.address)
    });
    hostname.chain(ips).collect()
}

/// The first external address that is a valid IPv4 address.
pub fn first_external_ipv4(addresses: &[MachineAddress]) -> Result<Ipv4Addr, Error> {
    addresses
        .iter()
        .filter(|address| address.type_ == MachineAddressType::ExternalIp)
        .find_map(|address| address.address.parse().ok())
        .context(NoExternalIpv4Snafu)
}

/// The facility and metro devices of `machine` are placed in.
///
/// A machine overriding either of them replaces the cluster's locality as a whole.
pub fn locality<'a>(
    machine: &'a MetalMachine,
    cluster: &'a MetalCluster,
) -> (Option<&'a str>, Option<&'a str>) {
    let spec = &machine.spec;
    if spec.facility.is_some() || spec.metro.is_some() {
        (spec.facility.as_deref(), spec.metro.as_deref())
    } else {
        cluster.locality()
    }
}

/// Fails if the device was placed somewhere other than requested.
pub fn check_location(
    device: &Device,
    facility: Option<&str>,
    metro: Option<&str>,
) -> Result<(), Error> {
    let requested_and_actual = [
        (facility, device.facility_code()),
        (metro, device.metro_code()),
    ];
    for (requested, actual) in requested_and_actual {
        if let (Some(requested), Some(actual)) = (requested, actual) {
            snafu::ensure!(
                requested == actual,
                LocationMismatchSnafu {
                    device_id: &device.id,
                    requested,
                    actual,
                }
            );
        }
    }
    Ok(())
}

/// Inputs for the creation of a device.
pub struct DeviceRequest<'a> {
    pub machine: &'a MetalMachine,
    pub cluster: &'a MetalCluster,
    pub tags: DeviceTags,
    pub user_data: String,
    pub custom_data: Option<Value>,
}

impl DeviceRequest<'_> {
    pub fn build(self) -> CreateDeviceRequest {
        let spec = &self.machine.spec;
        let (facility, metro) = locality(self.machine, self.cluster);

        let mut tags = self.tags.into_vec();
        tags.extend(spec.tags.iter().cloned());

        CreateDeviceRequest {
            hostname: kube::ResourceExt::name_any(self.machine),
            plan: spec.machine_type.clone(),
            operating_system: spec.os.clone(),
            billing_cycle: spec
                .billing_cycle
                .clone()
                .unwrap_or_else(|| DEFAULT_BILLING_CYCLE.to_owned()),
            facility: facility.map(str::to_owned).into_iter().collect(),
            metro: metro.map(str::to_owned),
            hardware_reservation_id: spec.hardware_reservation_id.clone(),
            userdata: Some(self.user_data),
            tags,
            project_ssh_keys: spec.ssh_keys.clone(),
            customdata: self.custom_data,
        }
    }
}

/// How a failed device creation is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum CreateFailure {
    /// The provider is temporarily unable to serve the request, try again later.
    Retry,
    /// The request most likely succeeded, the device will be found by its tags.
    Ignore,
    /// The request will never succeed.
    Fatal,
}

pub fn classify_create_error(error: &metal_api::Error) -> CreateFailure {
    if error.code().is_some_and(|code| RETRYABLE_CODES.contains(&code)) {
        return CreateFailure::Retry;
    }

    let message = error.full_message();
    if RETRYABLE_MESSAGES.iter().any(|m| message.contains(m)) {
        CreateFailure::Retry
    } else if IGNORED_MESSAGES.iter().any(|m| message.contains(m)) {
        CreateFailure::Ignore
    } else {
        CreateFailure::Fatal
    }
}

#[cfg(test)]
mod tests {
    use http::StatusCode;
    use metal_api::compute::{DeviceAddress, Location};
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::{
        crd::{MetalClusterSpec, MetalMachineSpec, VipManager},
        testing::FakeCompute,
    };

    fn address(type_: MachineAddressType, address: &str) -> MachineAddress {
        MachineAddress::new(type_, address)
    }

    fn cluster() -> MetalCluster {
        MetalCluster::new(
            "c1",
            MetalClusterSpec {
                project_id: "p1".to_owned(),
                facility: None,
                metro: Some("da".to_owned()),
                vip_manager: VipManager::ManagedElasticIp,
                control_plane_endpoint: None,
            },
        )
    }

    fn machine(spec: MetalMachineSpec) -> MetalMachine {
        MetalMachine::new(
            "cp-0",
            MetalMachineSpec {
                machine_type: "c3.small.x86".to_owned(),
                os: "ubuntu_22_04".to_owned(),
                ..spec
            },
        )
    }

    #[test]
    fn tags_are_sorted_and_deterministic() {
        let tags = DeviceTags::for_machine("default", "cp-0", "c1");
        assert_eq!(
            tags.as_slice(),
            [
                "cluster-api-provider-packet:cluster-id:c1",
                "cluster-api-provider-packet:machine-uuid:default/cp-0",
            ]
        );
        assert_eq!(tags, DeviceTags::for_machine("default", "cp-0", "c1"));
    }

    #[test]
    fn first_external_ipv4_skips_internal_empty_and_v6() {
        let addresses = [
            address(MachineAddressType::InternalIp, "10.2.1.5"),
            address(MachineAddressType::ExternalIp, ""),
            address(MachineAddressType::ExternalIp, "1.2.3.4"),
        ];
        assert_eq!(first_external_ipv4(&addresses), Ok(Ipv4Addr::new(1, 2, 3, 4)));

        let only_v6 = [address(MachineAddressType::ExternalIp, "ffff::0")];
        let err = first_external_ipv4(&only_v6).expect_err("no IPv4 address");
        assert_eq!(err.to_string(), "no external IPv4 addresses found");
    }

    #[test]
    fn addresses_are_mapped_by_visibility() {
        let device = Device {
            id: "d1".to_owned(),
            hostname: Some("cp-0".to_owned()),
            ip_addresses: vec![
                DeviceAddress {
                    address: "147.1.1.1".to_owned(),
                    public: true,
                    ..DeviceAddress::default()
                },
                DeviceAddress {
                    address: "10.0.0.3".to_owned(),
                    ..DeviceAddress::default()
                },
            ],
            ..Device::default()
        };

        assert_eq!(
            machine_addresses(&device),
            vec![
                address(MachineAddressType::Hostname, "cp-0"),
                address(MachineAddressType::ExternalIp, "147.1.1.1"),
                address(MachineAddressType::InternalIp, "10.0.0.3"),
            ]
        );
    }

    #[test]
    fn machine_locality_overrides_cluster() {
        let cluster = cluster();
        let inherited = machine(MetalMachineSpec::default());
        assert_eq!(locality(&inherited, &cluster), (None, Some("da")));

        let overriding = machine(MetalMachineSpec {
            facility: Some("sv15".to_owned()),
            ..MetalMachineSpec::default()
        });
        assert_eq!(locality(&overriding, &cluster), (Some("sv15"), None));
    }

    #[test]
    fn create_request_carries_machine_and_strategy_data() {
        let cluster = cluster();
        let machine = machine(MetalMachineSpec {
            hardware_reservation_id: Some("next-available".to_owned()),
            ssh_keys: vec!["key-1".to_owned()],
            tags: vec!["extra".to_owned()],
            ..MetalMachineSpec::default()
        });

        let request = DeviceRequest {
            machine: &machine,
            cluster: &cluster,
            tags: DeviceTags::for_machine("default", "cp-0", "c1"),
            user_data: "#cloud-config".to_owned(),
            custom_data: Some(json!({"loadBalancerID": "lb-1"})),
        }
        .build();

        assert_eq!(request.hostname, "cp-0");
        assert_eq!(request.billing_cycle, "hourly");
        assert_eq!(request.metro.as_deref(), Some("da"));
        assert!(request.facility.is_empty());
        assert_eq!(request.hardware_reservation_id.as_deref(), Some("next-available"));
        assert_eq!(request.userdata.as_deref(), Some("#cloud-config"));
        assert_eq!(request.tags.len(), 3);
        assert_eq!(request.tags[2], "extra");
        assert_eq!(request.customdata, Some(json!({"loadBalancerID": "lb-1"})));
    }

    #[rstest]
    #[case::code(
        metal_api::Error::with_code(StatusCode::UNPROCESSABLE_ENTITY, "no_hardware_available", "x"),
        CreateFailure::Retry
    )]
    #[case::reservations(
        metal_api::Error::from_status(
            StatusCode::UNPROCESSABLE_ENTITY,
            "There are no available hardware reservations in da11"
        ),
        CreateFailure::Retry
    )]
    #[case::not_provisionable(
        metal_api::Error::from_status(StatusCode::UNPROCESSABLE_ENTITY, "Server is not provisionable"),
        CreateFailure::Retry
    )]
    #[case::eof(metal_api::Error::other("read tcp: unexpected EOF"), CreateFailure::Ignore)]
    #[case::bad_plan(
        metal_api::Error::from_status(StatusCode::UNPROCESSABLE_ENTITY, "plan is invalid"),
        CreateFailure::Fatal
    )]
    fn create_errors_are_classified(
        #[case] error: metal_api::Error,
        #[case] expected: CreateFailure,
    ) {
        assert_eq!(classify_create_error(&error), expected);
    }

    #[rstest]
    #[case::matching(Some("da11"), Some("da"), true)]
    #[case::unspecified(None, None, true)]
    #[case::other_facility(Some("sv15"), None, false)]
    #[case::other_metro(None, Some("ny"), false)]
    fn location_is_checked(
        #[case] facility: Option<&str>,
        #[case] metro: Option<&str>,
        #[case] matches: bool,
    ) {
        let device = Device {
            id: "d1".to_owned(),
            facility: Some(Location {
                id: None,
                code: "da11".to_owned(),
            }),
            metro: Some(Location {
                id: None,
                code: "da".to_owned(),
            }),
            ..Device::default()
        };

        assert_eq!(check_location(&device, facility, metro).is_ok(), matches);
    }

    #[tokio::test]
    async fn tag_lookup_returns_the_tagged_device() {
        let compute = FakeCompute::default();
        let tags = DeviceTags::for_machine("default", "cp-0", "c1");
        compute.insert_device(Device {
            id: "other".to_owned(),
            tags: DeviceTags::for_machine("default", "cp-1", "c1").into_vec(),
            ..Device::default()
        });
        compute.insert_device(Device {
            id: "mine".to_owned(),
            tags: tags.as_slice().to_vec(),
            ..Device::default()
        });

        let device = find_device(&compute, "p1", None, &tags)
            .await
            .expect("lookup succeeds")
            .expect("device exists");
        assert_eq!(device.id, "mine");

        let missing = DeviceTags::for_machine("default", "cp-9", "c1");
        let not_found = find_device(&compute, "p1", None, &missing)
            .await
            .expect("lookup succeeds");
        assert_eq!(not_found, None);
    }
}
