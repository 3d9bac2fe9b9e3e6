//! Idempotent provisioning of the load balancer fronting a cluster's control plane.
//!
//! Every `ensure_*` operation takes the ID persisted by an earlier pass. With an ID the resource
//! is only read back, without one it is created. Callers persist the returned IDs immediately so
//! that an interrupted pass resumes where it stopped.

use metal_api::{
    LoadBalancerApi,
    load_balancer::{
        CreateLoadBalancerRequest, CreateOriginRequest, CreatePoolRequest, CreatePortRequest,
        ListenerPort, LoadBalancer, Origin, Pool,
    },
};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{crd::MachineAddress, device};

/// Provider of the managed load balancers.
pub const LOAD_BALANCER_PROVIDER_ID: &str = "loadpvd-gOB_-byp5ebFo7A3LHv2B";

const POOL_PROTOCOL: &str = "tcp";

/// Metros offering managed load balancers and the matching location IDs.
const LOCATIONS: &[(&str, &str)] = &[
    ("da", "lctnloc--uxs0GLeAELHKV8GxO_AI"),
    ("ny", "lctnloc-Vy-1Qpw31mPi6RJQwVf9A"),
    ("sv", "lctnloc-H5rl2M2VL5dcFmdxhbEKx"),
];

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("metro {metro:?} does not offer managed load balancers"))]
    UnknownMetro { metro: String },

    #[snafu(display("failed to create load balancer {name:?}"))]
    CreateLoadBalancer {
        source: metal_api::Error,
        name: String,
    },

    #[snafu(display("failed to get load balancer {id:?}"))]
    GetLoadBalancer { source: metal_api::Error, id: String },

    #[snafu(display("failed to delete load balancer {id:?}"))]
    DeleteLoadBalancer { source: metal_api::Error, id: String },

    #[snafu(display("failed to create listener port {number} on load balancer {load_balancer_id:?}"))]
    CreatePort {
        source: metal_api::Error,
        load_balancer_id: String,
        number: u16,
    },

    #[snafu(display("failed to list listener ports of load balancer {load_balancer_id:?}"))]
    ListPorts {
        source: metal_api::Error,
        load_balancer_id: String,
    },

    #[snafu(display("failed to add pool {pool_id:?} to listener port {port_id:?}"))]
    UpdatePort {
        source: metal_api::Error,
        port_id: String,
        pool_id: String,
    },

    #[snafu(display("failed to create pool {name:?}"))]
    CreatePool {
        source: metal_api::Error,
        name: String,
    },

    #[snafu(display("failed to get pool {id:?}"))]
    GetPool { source: metal_api::Error, id: String },

    #[snafu(display("failed to delete pool {id:?}"))]
    DeletePool { source: metal_api::Error, id: String },

    #[snafu(display("failed to determine the target of origin {name:?}"))]
    OriginTarget { source: device::Error, name: String },

    #[snafu(display("failed to create origin {name:?}"))]
    CreateOrigin {
        source: metal_api::Error,
        name: String,
    },

    #[snafu(display("failed to get origin {id:?}"))]
    GetOrigin { source: metal_api::Error, id: String },

    #[snafu(display("failed to delete origin {id:?}"))]
    DeleteOrigin { source: metal_api::Error, id: String },
}

impl Error {
    /// Errors that will not go away by retrying with the same configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::UnknownMetro { .. } | Self::OriginTarget { .. })
    }
}

pub fn location_id(metro: &str) -> Option<&'static str> {
    LOCATIONS
        .iter()
        .find(|(code, _)| code.eq_ignore_ascii_case(metro))
        .map(|(_, location)| *location)
}

pub fn load_balancer_name(cluster: &str) -> String {
    format!("{cluster}-capp-vip")
}

pub fn port_name(cluster: &str) -> String {
    format!("{cluster}-capp-vip-port")
}

/// Name of the pool and the origin serving one control plane machine.
pub fn origin_name(cluster: &str, machine: &str) -> String {
    format!("{cluster}-capp-vip-{machine}")
}

/// The provisioning string telling a device which load balancer it sits behind.
pub fn lb_config(metro: &str) -> String {
    format!("emlb:///{metro}")
}

/// Outcome of [`LoadBalancerProvisioner::ensure_origin`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OriginStatus {
    /// The origin exists and points at the device.
    Ready(Origin),
    /// The stored origin no longer matched the device and has been deleted.
    Stale,
}

pub struct LoadBalancerProvisioner<'a> {
    api: &'a dyn LoadBalancerApi,
    project_id: &'a str,
}

impl<'a> LoadBalancerProvisioner<'a> {
    pub fn new(api: &'a dyn LoadBalancerApi, project_id: &'a str) -> Self {
        Self { api, project_id }
    }

    /// Returns the cluster's load balancer, creating it in `metro` when no ID is stored.
    ///
    /// The listener port is a separate step so that the caller can persist the ID first.
    #[tracing::instrument(skip(self))]
    pub async fn ensure_load_balancer(
        &self,
        id: Option<&str>,
        cluster: &str,
        metro: &str,
    ) -> Result<LoadBalancer> {
        if let Some(id) = id {
            return self
                .api
                .get_load_balancer(id)
                .await
                .context(GetLoadBalancerSnafu { id });
        }

        let location_id = location_id(metro).context(UnknownMetroSnafu { metro })?;
        let name = load_balancer_name(cluster);
        let request = CreateLoadBalancerRequest {
            name: name.clone(),
            location_id: location_id.to_owned(),
            provider_id: LOAD_BALANCER_PROVIDER_ID.to_owned(),
        };
        let created = self
            .api
            .create_load_balancer(self.project_id, &request)
            .await
            .context(CreateLoadBalancerSnafu { name })?;
        tracing::info!(load_balancer.id = created.id, "created load balancer");
        Ok(created)
    }

    /// Returns the listener port on `number`, creating it when the load balancer lacks one.
    #[tracing::instrument(
        skip(self, load_balancer),
        fields(load_balancer.id = %load_balancer.id)
    )]
    pub async fn ensure_port(
        &self,
        load_balancer: &LoadBalancer,
        cluster: &str,
        number: u16,
    ) -> Result<ListenerPort> {
        if let Some(port) = load_balancer.ports.iter().find(|port| port.number == number) {
            return Ok(port.clone());
        }

        let ports = self
            .api
            .list_ports(&load_balancer.id)
            .await
            .context(ListPortsSnafu {
                load_balancer_id: &load_balancer.id,
            })?;
        if let Some(port) = ports.into_iter().find(|port| port.number == number) {
            return Ok(port);
        }

        let request = CreatePortRequest {
            name: port_name(cluster),
            number,
        };
        let port = self
            .api
            .create_port(&load_balancer.id, &request)
            .await
            .context(CreatePortSnafu {
                load_balancer_id: &load_balancer.id,
                number,
            })?;
        tracing::info!(port.id = port.id, port.number = number, "created listener port");
        Ok(port)
    }

    #[tracing::instrument(skip(self))]
    pub async fn ensure_pool(&self, id: Option<&str>, name: &str) -> Result<Pool> {
        match id {
            Some(id) => self.api.get_pool(id).await.context(GetPoolSnafu { id }),
            None => {
                let request = CreatePoolRequest {
                    name: name.to_owned(),
                    protocol: POOL_PROTOCOL.to_owned(),
                };
                let pool = self
                    .api
                    .create_pool(self.project_id, &request)
                    .await
                    .context(CreatePoolSnafu { name })?;
                tracing::info!(pool.id = pool.id, "created origin pool");
                Ok(pool)
            }
        }
    }

    /// Ensures an origin for the device owning `addresses` exists in the pool.
    ///
    /// A stored origin pointing somewhere else is deleted and [`OriginStatus::Stale`] returned.
    /// The replacement is created by the next call without an ID.
    #[tracing::instrument(skip(self, addresses))]
    pub async fn ensure_origin(
        &self,
        id: Option<&str>,
        pool_id: &str,
        name: &str,
        addresses: &[MachineAddress],
        port_number: u16,
    ) -> Result<OriginStatus> {
        let target = device::first_external_ipv4(addresses)
            .context(OriginTargetSnafu { name })?
            .to_string();

        let Some(id) = id else {
            let request = CreateOriginRequest {
                name: name.to_owned(),
                target,
                port_number,
                active: true,
            };
            let origin = self
                .api
                .create_origin(pool_id, &request)
                .await
                .context(CreateOriginSnafu { name })?;
            tracing::info!(origin.id = origin.id, origin.target = origin.target, "created origin");
            return Ok(OriginStatus::Ready(origin));
        };

        match self.api.get_origin(id).await {
            Ok(origin) if origin.target == target && origin.port_number == port_number => {
                Ok(OriginStatus::Ready(origin))
            }
            Ok(origin) => {
                tracing::info!(
                    origin.id = id,
                    origin.target = origin.target,
                    device.target = target,
                    "origin no longer matches the device, deleting it"
                );
                self.delete_origin(id).await?;
                Ok(OriginStatus::Stale)
            }
            Err(error) if error.is_not_found() => {
                tracing::info!(origin.id = id, "origin disappeared");
                Ok(OriginStatus::Stale)
            }
            Err(error) => Err(error).context(GetOriginSnafu { id }),
        }
    }

    /// Makes `port` serve `pool_id`.
    pub async fn update_listener_port(&self, port: &ListenerPort, pool_id: &str) -> Result<()> {
        if port.pool_ids.iter().any(|id| id == pool_id) {
            return Ok(());
        }
        self.api
            .add_pool_to_port(&port.id, pool_id)
            .await
            .context(UpdatePortSnafu {
                port_id: &port.id,
                pool_id,
            })?;
        Ok(())
    }

    pub async fn delete_load_balancer(&self, id: &str) -> Result<()> {
        ignore_not_found(self.api.delete_load_balancer(id).await)
            .context(DeleteLoadBalancerSnafu { id })
    }

    pub async fn delete_pool(&self, id: &str) -> Result<()> {
        ignore_not_found(self.api.delete_pool(id).await).context(DeletePoolSnafu { id })
    }

    pub async fn delete_origin(&self, id: &str) -> Result<()> {
        ignore_not_found(self.api.delete_origin(id).await).context(DeleteOriginSnafu { id })
    }
}

fn ignore_not_found(result: metal_api::Result<()>) -> metal_api::Result<()> {
    match result {
        Err(error) if error.is_not_found() => Ok(()),
        other => other,
    }
}
