use metal_api::LoadBalancerApi;
use serde_json::{Value, json};
use snafu::{OptionExt, ResultExt};

use super::{
    Error, MachineContext, MissingLoadBalancerSnafu, MissingMetroSnafu, NoLoadBalancerIpSnafu,
    ORIGIN_RECREATE_DELAY, PostReady, ProvisionSnafu,
};
use crate::{
    crd::{
        ApiEndpoint, LOAD_BALANCER_ID_ANNOTATION, LOAD_BALANCER_METRO_ANNOTATION,
        LOAD_BALANCER_ORIGIN_ID_ANNOTATION, LOAD_BALANCER_POOL_ID_ANNOTATION,
        LOAD_BALANCER_PORT_NUMBER_ANNOTATION, MetalCluster, cluster::DEFAULT_API_SERVER_PORT,
    },
    provisioner::{self, LoadBalancerProvisioner, OriginStatus},
    scope::{ClusterScope, MachineScope},
    status::conditions::{Condition, ConditionReason, ConditionSeverity, ConditionType},
};

/// A managed load balancer with one origin per control plane device.
pub struct ExternalLoadBalancer<'a> {
    api: &'a dyn LoadBalancerApi,
}

fn annotation<'c>(cluster: &'c MetalCluster, key: &str) -> Option<&'c str> {
    kube::ResourceExt::annotations(cluster)
        .get(key)
        .map(String::as_str)
}

/// The metro the load balancer lives in: where it was created, or where it is going to be.
fn metro<'c>(cluster: &'c MetalCluster, cluster_name: &str) -> Result<&'c str, Error> {
    annotation(cluster, LOAD_BALANCER_METRO_ANNOTATION)
        .or(cluster.spec.metro.as_deref())
        .context(MissingMetroSnafu {
            cluster: cluster_name,
        })
}

fn port_number(cluster: &MetalCluster) -> u16 {
    annotation(cluster, LOAD_BALANCER_PORT_NUMBER_ANNOTATION)
        .and_then(|number| number.parse().ok())
        .or_else(|| {
            cluster
                .spec
                .control_plane_endpoint
                .as_ref()
                .filter(|endpoint| endpoint.is_valid())
                .map(|endpoint| endpoint.port)
        })
        .unwrap_or(DEFAULT_API_SERVER_PORT)
}

impl<'a> ExternalLoadBalancer<'a> {
    pub fn new(api: &'a dyn LoadBalancerApi) -> Self {
        Self { api }
    }

    fn provisioner<'p>(&'p self, project_id: &'p str) -> LoadBalancerProvisioner<'p> {
        LoadBalancerProvisioner::new(self.api, project_id)
    }

    pub(super) async fn acquire_endpoint(
        &self,
        cluster: &mut ClusterScope,
        cluster_name: &str,
    ) -> Result<(), Error> {
        let resource = cluster.resource();
        let metro = metro(resource, cluster_name)?.to_owned();
        let number = port_number(resource);
        let stored_id = annotation(resource, LOAD_BALANCER_ID_ANNOTATION).map(str::to_owned);
        let project_id = resource.spec.project_id.clone();
        let provisioner = self.provisioner(&project_id);

        let load_balancer = provisioner
            .ensure_load_balancer(stored_id.as_deref(), cluster_name, &metro)
            .await
            .context(ProvisionSnafu {
                cluster: cluster_name,
            })?;
        cluster.set_annotation(LOAD_BALANCER_ID_ANNOTATION, &load_balancer.id);
        cluster.set_annotation(LOAD_BALANCER_METRO_ANNOTATION, metro);

        let port = provisioner
            .ensure_port(&load_balancer, cluster_name, number)
            .await
            .context(ProvisionSnafu {
                cluster: cluster_name,
            })?;
        cluster.set_annotation(LOAD_BALANCER_PORT_NUMBER_ANNOTATION, port.number.to_string());

        if cluster.control_plane_endpoint().is_none() {
            let host = load_balancer
                .ips
                .first()
                .context(NoLoadBalancerIpSnafu {
                    id: &load_balancer.id,
                })?;
            cluster.set_control_plane_endpoint(ApiEndpoint::new(host, port.number));
        }
        Ok(())
    }

    /// The custom data telling the device which load balancer fronts it.
    pub(super) fn pre_device_create(
        &self,
        cluster: &MetalCluster,
        machine: &MachineContext<'_>,
    ) -> Result<Option<Value>, Error> {
        let id = annotation(cluster, LOAD_BALANCER_ID_ANNOTATION).context(
            MissingLoadBalancerSnafu {
                cluster: machine.cluster_name,
            },
        )?;
        let metro = metro(cluster, machine.cluster_name)?;
        Ok(Some(json!({
            "loadBalancerID": id,
            "loadBalancerConfig": provisioner::lb_config(metro),
        })))
    }

    pub(super) async fn post_device_ready(
        &self,
        cluster: &MetalCluster,
        scope: &mut MachineScope,
        machine: &MachineContext<'_>,
    ) -> Result<PostReady, Error> {
        if !machine.is_control_plane {
            return Ok(PostReady::Done);
        }

        match self.ensure_origin(cluster, scope, machine).await {
            Ok(status) => Ok(status),
            Err(error) => {
                scope.set_condition(Condition::false_(
                    ConditionType::LoadBalancerReady,
                    ConditionReason::LoadBalancerProvisionFailed,
                    ConditionSeverity::Error,
                    error.to_string(),
                ));
                Err(error)
            }
        }
    }

    async fn ensure_origin(
        &self,
        cluster: &MetalCluster,
        scope: &mut MachineScope,
        machine: &MachineContext<'_>,
    ) -> Result<PostReady, Error> {
        let provisioner = self.provisioner(&cluster.spec.project_id);
        let context = || ProvisionSnafu {
            cluster: machine.cluster_name,
        };

        let load_balancer_id = annotation(cluster, LOAD_BALANCER_ID_ANNOTATION).context(
            MissingLoadBalancerSnafu {
                cluster: machine.cluster_name,
            },
        )?;
        let load_balancer = provisioner
            .ensure_load_balancer(
                Some(load_balancer_id),
                machine.cluster_name,
                metro(cluster, machine.cluster_name)?,
            )
            .await
            .with_context(|_| context())?;
        let port = provisioner
            .ensure_port(&load_balancer, machine.cluster_name, port_number(cluster))
            .await
            .with_context(|_| context())?;

        let name = provisioner::origin_name(machine.cluster_name, &scope.name());
        let pool = provisioner
            .ensure_pool(scope.annotation(LOAD_BALANCER_POOL_ID_ANNOTATION), &name)
            .await
            .with_context(|_| context())?;
        scope.set_annotation(LOAD_BALANCER_POOL_ID_ANNOTATION, &pool.id);

        let addresses = scope
            .resource()
            .status
            .as_ref()
            .map(|status| status.addresses.clone())
            .unwrap_or_default();
        let status = provisioner
            .ensure_origin(
                scope.annotation(LOAD_BALANCER_ORIGIN_ID_ANNOTATION),
                &pool.id,
                &name,
                &addresses,
                DEFAULT_API_SERVER_PORT,
            )
            .await
            .with_context(|_| context())?;

        match status {
            OriginStatus::Ready(origin) => {
                scope.set_annotation(LOAD_BALANCER_ORIGIN_ID_ANNOTATION, &origin.id);
                provisioner
                    .update_listener_port(&port, &pool.id)
                    .await
                    .with_context(|_| context())?;
                scope.set_condition(Condition::true_(ConditionType::LoadBalancerReady));
                Ok(PostReady::Done)
            }
            OriginStatus::Stale => {
                scope.remove_annotation(LOAD_BALANCER_ORIGIN_ID_ANNOTATION);
                scope.set_condition(Condition::false_(
                    ConditionType::LoadBalancerReady,
                    ConditionReason::LoadBalancerOriginRecreating,
                    ConditionSeverity::Info,
                    "device address changed, recreating load balancer origin",
                ));
                Ok(PostReady::Requeue(ORIGIN_RECREATE_DELAY))
            }
        }
    }

    /// Deletes the machine's origin, then its pool.
    pub(super) async fn teardown(
        &self,
        cluster: &MetalCluster,
        scope: &mut MachineScope,
    ) -> Result<(), Error> {
        let provisioner = self.provisioner(&cluster.spec.project_id);
        let cluster_name = kube::ResourceExt::name_any(cluster);

        if let Some(origin_id) = scope.annotation(LOAD_BALANCER_ORIGIN_ID_ANNOTATION) {
            provisioner
                .delete_origin(origin_id)
                .await
                .context(ProvisionSnafu {
                    cluster: &cluster_name,
                })?;
            scope.remove_annotation(LOAD_BALANCER_ORIGIN_ID_ANNOTATION);
        }
        if let Some(pool_id) = scope.annotation(LOAD_BALANCER_POOL_ID_ANNOTATION) {
            provisioner
                .delete_pool(pool_id)
                .await
                .context(ProvisionSnafu {
                    cluster: &cluster_name,
                })?;
            scope.remove_annotation(LOAD_BALANCER_POOL_ID_ANNOTATION);
        }
        Ok(())
    }

    pub(super) async fn cluster_teardown(&self, cluster: &mut ClusterScope) -> Result<(), Error> {
        let Some(id) = cluster
            .annotation(LOAD_BALANCER_ID_ANNOTATION)
            .map(str::to_owned)
        else {
            return Ok(());
        };

        self.provisioner(cluster.project_id())
            .delete_load_balancer(&id)
            .await
            .context(ProvisionSnafu {
                cluster: cluster.name(),
            })?;
        tracing::info!(load_balancer.id = id, "deleted load balancer");

        for key in [
            LOAD_BALANCER_ID_ANNOTATION,
            LOAD_BALANCER_PORT_NUMBER_ANNOTATION,
            LOAD_BALANCER_METRO_ANNOTATION,
        ] {
            cluster.remove_annotation(key);
        }
        Ok(())
    }
}
