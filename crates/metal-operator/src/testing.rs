//! In-memory stand-ins for the provider APIs and the Kubernetes patcher.

use std::{
    collections::BTreeMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use http::StatusCode;
use metal_api::{
    ComputeApi, LoadBalancerApi,
    compute::{
        CreateDeviceRequest, CreateIpReservationRequest, Device, DeviceAddress, Href,
        IpReservation, Location,
    },
    load_balancer::{
        CreateLoadBalancerRequest, CreateOriginRequest, CreatePoolRequest, CreatePortRequest,
        ListenerPort, LoadBalancer, Origin, Pool,
    },
};

use crate::scope::{Patcher, ResourcePatch};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("lock is never poisoned in tests")
}

fn not_found(what: &str, id: &str) -> metal_api::Error {
    metal_api::Error::from_status(StatusCode::NOT_FOUND, format!("{what} {id} not found"))
}

/// Counts calls per operation and hands out injected failures.
#[derive(Default)]
struct Calls {
    counts: Mutex<BTreeMap<&'static str, usize>>,
    failures: Mutex<BTreeMap<&'static str, metal_api::Error>>,
    next_id: Mutex<usize>,
}

impl Calls {
    fn record(&self, operation: &'static str) -> metal_api::Result<()> {
        *lock(&self.counts).entry(operation).or_default() += 1;
        match lock(&self.failures).remove(operation) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn count(&self, operation: &str) -> usize {
        lock(&self.counts).get(operation).copied().unwrap_or_default()
    }

    fn fail_next(&self, operation: &'static str, error: metal_api::Error) {
        lock(&self.failures).insert(operation, error);
    }

    fn id(&self, prefix: &str) -> String {
        let mut next = lock(&self.next_id);
        *next += 1;
        format!("{prefix}-{next}")
    }
}

#[derive(Default)]
pub struct FakeCompute {
    calls: Calls,
    devices: Mutex<Vec<Device>>,
    reservations: Mutex<Vec<IpReservation>>,
    pub create_requests: Mutex<Vec<CreateDeviceRequest>>,
}

impl FakeCompute {
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.count(operation)
    }

    /// The next call of `operation` fails with `error`.
    pub fn fail_next(&self, operation: &'static str, error: metal_api::Error) {
        self.calls.fail_next(operation, error);
    }

    pub fn insert_device(&self, device: Device) {
        lock(&self.devices).push(device);
    }

    pub fn insert_reservation(&self, reservation: IpReservation) {
        lock(&self.reservations).push(reservation);
    }

    pub fn device(&self, id: &str) -> Option<Device> {
        lock(&self.devices).iter().find(|device| device.id == id).cloned()
    }

    pub fn devices(&self) -> Vec<Device> {
        lock(&self.devices).clone()
    }

    pub fn reservations(&self) -> Vec<IpReservation> {
        lock(&self.reservations).clone()
    }

    /// Moves a device to `state`, giving it a public and a private address once it is active.
    pub fn set_device_state(&self, id: &str, state: &str) {
        let mut devices = lock(&self.devices);
        let Some(device) = devices.iter_mut().find(|device| device.id == id) else {
            return;
        };
        device.state = state.to_owned();
        if state == "active" && device.ip_addresses.is_empty() {
            device.ip_addresses = vec![
                DeviceAddress {
                    address: "147.75.1.10".to_owned(),
                    public: true,
                    ..DeviceAddress::default()
                },
                DeviceAddress {
                    address: "10.1.0.10".to_owned(),
                    ..DeviceAddress::default()
                },
            ];
        }
    }
}

#[async_trait]
impl ComputeApi for FakeCompute {
    async fn find_devices_by_project(
        &self,
        _project_id: &str,
        tags: &[String],
    ) -> metal_api::Result<Vec<Device>> {
        self.calls.record("find_devices_by_project")?;
        Ok(lock(&self.devices)
            .iter()
            .filter(|device| device.has_tags(tags))
            .cloned()
            .collect())
    }

    async fn get_device(&self, device_id: &str) -> metal_api::Result<Device> {
        self.calls.record("get_device")?;
        self.device(device_id)
            .ok_or_else(|| not_found("device", device_id))
    }

    async fn create_device(
        &self,
        _project_id: &str,
        request: &CreateDeviceRequest,
    ) -> metal_api::Result<Device> {
        self.calls.record("create_device")?;
        lock(&self.create_requests).push(request.clone());
        let device = Device {
            id: self.calls.id("device"),
            hostname: Some(request.hostname.clone()),
            state: "queued".to_owned(),
            facility: request.facility.first().map(|code| Location {
                id: None,
                code: code.clone(),
            }),
            metro: request.metro.as_ref().map(|code| Location {
                id: None,
                code: code.clone(),
            }),
            ip_addresses: Vec::new(),
            tags: request.tags.clone(),
        };
        self.insert_device(device.clone());
        Ok(device)
    }

    async fn delete_device(&self, device_id: &str, _force: bool) -> metal_api::Result<()> {
        self.calls.record("delete_device")?;
        let mut devices = lock(&self.devices);
        let before = devices.len();
        devices.retain(|device| device.id != device_id);
        if devices.len() == before {
            return Err(not_found("device", device_id));
        }
        Ok(())
    }

    async fn create_ip_assignment(&self, device_id: &str, address: &str) -> metal_api::Result<()> {
        self.calls.record("create_ip_assignment")?;
        let mut reservations = lock(&self.reservations);
        if let Some(reservation) = reservations
            .iter_mut()
            .find(|reservation| reservation.address == address)
        {
            reservation.assignments.push(Href {
                href: format!("/devices/{device_id}"),
            });
        }
        Ok(())
    }

    async fn get_ip_by_tag(
        &self,
        _project_id: &str,
        tag: &str,
    ) -> metal_api::Result<Option<IpReservation>> {
        self.calls.record("get_ip_by_tag")?;
        Ok(lock(&self.reservations)
            .iter()
            .find(|reservation| reservation.tags.iter().any(|own| own == tag))
            .cloned())
    }

    async fn create_ip_reservation(
        &self,
        _project_id: &str,
        request: &CreateIpReservationRequest,
    ) -> metal_api::Result<IpReservation> {
        self.calls.record("create_ip_reservation")?;
        let reservation = IpReservation {
            id: self.calls.id("ip"),
            address: format!("147.75.0.{}", lock(&self.reservations).len() + 1),
            tags: request.tags.clone(),
            ..IpReservation::default()
        };
        self.insert_reservation(reservation.clone());
        Ok(reservation)
    }

    async fn enable_project_bgp(&self, _project_id: &str) -> metal_api::Result<()> {
        self.calls.record("enable_project_bgp")
    }

    async fn enable_device_bgp(&self, _device_id: &str) -> metal_api::Result<()> {
        self.calls.record("enable_device_bgp")
    }
}

#[derive(Default)]
pub struct FakeLoadBalancers {
    calls: Calls,
    load_balancers: Mutex<BTreeMap<String, LoadBalancer>>,
    pools: Mutex<BTreeMap<String, Pool>>,
    origins: Mutex<BTreeMap<String, Origin>>,
    pub load_balancer_requests: Mutex<Vec<CreateLoadBalancerRequest>>,
}

impl FakeLoadBalancers {
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.count(operation)
    }

    /// The number of create calls of any kind.
    pub fn creates(&self) -> usize {
        ["create_load_balancer", "create_port", "create_pool", "create_origin"]
            .iter()
            .map(|operation| self.calls(operation))
            .sum()
    }

    pub fn fail_next(&self, operation: &'static str, error: metal_api::Error) {
        self.calls.fail_next(operation, error);
    }

    pub fn load_balancer(&self, id: &str) -> Option<LoadBalancer> {
        lock(&self.load_balancers).get(id).cloned()
    }

    pub fn pool(&self, id: &str) -> Option<Pool> {
        lock(&self.pools).get(id).cloned()
    }

    pub fn origin(&self, id: &str) -> Option<Origin> {
        lock(&self.origins).get(id).cloned()
    }

    pub fn origins(&self) -> Vec<Origin> {
        lock(&self.origins).values().cloned().collect()
    }

    pub fn insert_origin(&self, origin: Origin) {
        lock(&self.origins).insert(origin.id.clone(), origin);
    }

    pub fn insert_pool(&self, pool: Pool) {
        lock(&self.pools).insert(pool.id.clone(), pool);
    }
}

#[async_trait]
impl LoadBalancerApi for FakeLoadBalancers {
    async fn create_load_balancer(
        &self,
        _project_id: &str,
        request: &CreateLoadBalancerRequest,
    ) -> metal_api::Result<LoadBalancer> {
        self.calls.record("create_load_balancer")?;
        lock(&self.load_balancer_requests).push(request.clone());
        let load_balancer = LoadBalancer {
            id: self.calls.id("lb"),
            name: request.name.clone(),
            ips: vec!["147.75.200.1".to_owned()],
            ports: Vec::new(),
        };
        lock(&self.load_balancers).insert(load_balancer.id.clone(), load_balancer.clone());
        Ok(load_balancer)
    }

    async fn get_load_balancer(&self, id: &str) -> metal_api::Result<LoadBalancer> {
        self.calls.record("get_load_balancer")?;
        self.load_balancer(id)
            .ok_or_else(|| not_found("load balancer", id))
    }

    async fn delete_load_balancer(&self, id: &str) -> metal_api::Result<()> {
        self.calls.record("delete_load_balancer")?;
        lock(&self.load_balancers)
            .remove(id)
            .map(drop)
            .ok_or_else(|| not_found("load balancer", id))
    }

    async fn create_port(
        &self,
        load_balancer_id: &str,
        request: &CreatePortRequest,
    ) -> metal_api::Result<ListenerPort> {
        self.calls.record("create_port")?;
        let port = ListenerPort {
            id: self.calls.id("port"),
            name: request.name.clone(),
            number: request.number,
            pool_ids: Vec::new(),
        };
        lock(&self.load_balancers)
            .get_mut(load_balancer_id)
            .ok_or_else(|| not_found("load balancer", load_balancer_id))?
            .ports
            .push(port.clone());
        Ok(port)
    }

    async fn list_ports(&self, load_balancer_id: &str) -> metal_api::Result<Vec<ListenerPort>> {
        self.calls.record("list_ports")?;
        self.load_balancer(load_balancer_id)
            .map(|load_balancer| load_balancer.ports)
            .ok_or_else(|| not_found("load balancer", load_balancer_id))
    }

    async fn add_pool_to_port(&self, port_id: &str, pool_id: &str) -> metal_api::Result<ListenerPort> {
        self.calls.record("add_pool_to_port")?;
        let mut load_balancers = lock(&self.load_balancers);
        let port = load_balancers
            .values_mut()
            .flat_map(|load_balancer| load_balancer.ports.iter_mut())
            .find(|port| port.id == port_id)
            .ok_or_else(|| not_found("port", port_id))?;
        if !port.pool_ids.iter().any(|id| id == pool_id) {
            port.pool_ids.push(pool_id.to_owned());
        }
        Ok(port.clone())
    }

    async fn create_pool(&self, _project_id: &str, request: &CreatePoolRequest) -> metal_api::Result<Pool> {
        self.calls.record("create_pool")?;
        let pool = Pool {
            id: self.calls.id("pool"),
            name: request.name.clone(),
            protocol: request.protocol.clone(),
        };
        self.insert_pool(pool.clone());
        Ok(pool)
    }

    async fn get_pool(&self, id: &str) -> metal_api::Result<Pool> {
        self.calls.record("get_pool")?;
        self.pool(id).ok_or_else(|| not_found("pool", id))
    }

    async fn delete_pool(&self, id: &str) -> metal_api::Result<()> {
        self.calls.record("delete_pool")?;
        lock(&self.pools)
            .remove(id)
            .map(drop)
            .ok_or_else(|| not_found("pool", id))
    }

    async fn create_origin(
        &self,
        _pool_id: &str,
        request: &CreateOriginRequest,
    ) -> metal_api::Result<Origin> {
        self.calls.record("create_origin")?;
        let origin = Origin {
            id: self.calls.id("origin"),
            name: request.name.clone(),
            target: request.target.clone(),
            port_number: request.port_number,
            active: request.active,
        };
        self.insert_origin(origin.clone());
        Ok(origin)
    }

    async fn get_origin(&self, id: &str) -> metal_api::Result<Origin> {
        self.calls.record("get_origin")?;
        self.origin(id).ok_or_else(|| not_found("origin", id))
    }

    async fn delete_origin(&self, id: &str) -> metal_api::Result<()> {
        self.calls.record("delete_origin")?;
        lock(&self.origins)
            .remove(id)
            .map(drop)
            .ok_or_else(|| not_found("origin", id))
    }
}

/// [`Patcher`] remembering every patch instead of sending it.
#[derive(Default)]
pub struct RecordingPatcher {
    patches: Mutex<Vec<ResourcePatch>>,
    failing: bool,
}

impl RecordingPatcher {
    /// A patcher whose every call fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        lock(&self.patches).len()
    }

    pub fn last(&self) -> Option<ResourcePatch> {
        lock(&self.patches).last().cloned()
    }
}

#[async_trait]
impl<K: Send + Sync> Patcher<K> for RecordingPatcher {
    async fn patch(&self, _resource: &K, patch: &ResourcePatch) -> Result<(), kube::Error> {
        lock(&self.patches).push(patch.clone());
        if self.failing {
            return Err(kube::Error::Service(Box::new(std::io::Error::other(
                "patch rejected",
            ))));
        }
        Ok(())
    }
}
