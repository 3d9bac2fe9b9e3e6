//! Reconciles [`MetalCluster`]s: validates them and provides their control plane endpoint.

use std::sync::Arc;

use futures::StreamExt;
use kube::{
    Api, ResourceExt,
    core::DynamicObject,
    runtime::{
        Controller,
        controller::Action,
        finalizer::{self, finalizer},
        reflector::ObjectRef,
        watcher,
    },
};
use metal_api::{ComputeApi, LoadBalancerApi};
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};

use super::{BGP_REQUEUE, Ctx, ERROR_REQUEUE};
use crate::{
    crd::{
        CLUSTER_FINALIZER, MetalCluster, MetalClusterSpec, VipManager,
        capi::{self, Cluster},
        validation,
    },
    logging::controller::{ReconcilerError, report_controller_reconciled},
    namespace::WatchNamespace,
    scope::{self, ClusterScope},
    status::conditions::{Condition, ConditionReason, ConditionSeverity, ConditionType},
    vip::{self, VipStrategy},
};

pub const CONTROLLER_NAME: &str = "metalcluster";

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to get owner {cluster}"))]
    GetOwner {
        source: kube::Error,
        cluster: ObjectRef<Cluster>,
    },

    #[snafu(display("invalid MetalCluster spec"))]
    InvalidSpec { source: validation::Errors },

    #[snafu(display("rejected change of MetalCluster spec"))]
    InvalidUpdate { source: validation::Errors },

    #[snafu(display("failed to record the applied MetalCluster spec"))]
    RecordSpec { source: serde_json::Error },

    #[snafu(display("failed to acquire the control plane endpoint"))]
    AcquireEndpoint { source: vip::Error },

    #[snafu(display("failed to tear down the control plane VIP"))]
    Teardown { source: vip::Error },

    #[snafu(display("failed to persist MetalCluster changes"))]
    PersistChanges { source: scope::Error },

    #[snafu(display("failed to run finalizer"))]
    Finalizer {
        #[snafu(source(from(finalizer::Error<Error>, Box::new)))]
        source: Box<finalizer::Error<Error>>,
    },
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }

    fn is_terminal(&self) -> bool {
        match self {
            Self::InvalidSpec { .. } | Self::InvalidUpdate { .. } => true,
            Self::AcquireEndpoint { source } => source.is_configuration(),
            Self::Finalizer { source } => match source.as_ref() {
                finalizer::Error::ApplyFailed(error) | finalizer::Error::CleanupFailed(error) => {
                    error.is_terminal()
                }
                _ => false,
            },
            _ => false,
        }
    }

    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        match self {
            Self::GetOwner { cluster, .. } => Some(cluster.clone().erase()),
            _ => None,
        }
    }
}

/// The objects a [`MetalCluster`] depends on, each `None` until it exists.
#[derive(Clone, Debug, Default)]
pub struct ClusterInputs {
    /// The owning Cluster API `Cluster`.
    pub cluster: Option<Cluster>,
}

fn network_not_ready(
    reason: ConditionReason,
    severity: ConditionSeverity,
    message: impl Into<String>,
) -> Condition {
    Condition::false_(
        ConditionType::NetworkInfrastructureReady,
        reason,
        severity,
        message,
    )
}

pub struct ClusterReconciler<'a> {
    compute: &'a dyn ComputeApi,
    load_balancers: &'a dyn LoadBalancerApi,
}

impl<'a> ClusterReconciler<'a> {
    pub fn new(compute: &'a dyn ComputeApi, load_balancers: &'a dyn LoadBalancerApi) -> Self {
        Self {
            compute,
            load_balancers,
        }
    }

    fn strategy(&self, scope: &ClusterScope) -> VipStrategy<'a> {
        VipStrategy::select(
            scope.resource().spec.vip_manager,
            self.compute,
            self.load_balancers,
        )
    }

    pub async fn reconcile(
        &self,
        scope: &mut ClusterScope,
        inputs: &ClusterInputs,
    ) -> Result<Action, Error> {
        let spec = scope.resource().spec.clone();
        let applied = validation::last_applied_spec::<MetalClusterSpec, _>(scope.resource());
        let validated = match &applied {
            Some(applied) => validation::validate_cluster_update(applied, &spec),
            None => validation::validate_cluster(&spec),
        };
        if let Err(source) = validated {
            scope.set_condition(network_not_ready(
                ConditionReason::InvalidConfiguration,
                ConditionSeverity::Error,
                source.to_string(),
            ));
            return Err(match applied {
                Some(_) => Error::InvalidUpdate { source },
                None => Error::InvalidSpec { source },
            });
        }

        let Some(cluster) = &inputs.cluster else {
            scope.set_condition(network_not_ready(
                ConditionReason::WaitingForOwner,
                ConditionSeverity::Info,
                "waiting for the owning Cluster",
            ));
            return Ok(Action::await_change());
        };
        let cluster_name = cluster.name_any();

        if let Err(error) = self.strategy(scope).acquire_endpoint(scope, &cluster_name).await {
            if error.is_bgp() {
                tracing::warn!(
                    cluster = cluster_name,
                    error = &error as &dyn std::error::Error,
                    "failed to enable BGP, retrying later"
                );
                return Ok(Action::requeue(BGP_REQUEUE));
            }

            let reason = match spec.vip_manager {
                VipManager::ExternalLoadBalancer => ConditionReason::LoadBalancerProvisionFailed,
                VipManager::ManagedElasticIp | VipManager::BgpAnnounced => {
                    ConditionReason::ElasticIpProvisionFailed
                }
            };
            scope.set_condition(network_not_ready(
                reason,
                ConditionSeverity::Error,
                error.to_string(),
            ));
            return Err(Error::AcquireEndpoint { source: error });
        }

        scope.set_condition(Condition::true_(ConditionType::NetworkInfrastructureReady));
        scope.set_ready(true);

        let spec = scope.resource().spec.clone();
        validation::record_applied_spec(scope.resource_mut(), &spec).context(RecordSpecSnafu)?;
        Ok(Action::await_change())
    }

    /// Removes the cluster-wide VIP resources.
    pub async fn cleanup(&self, scope: &mut ClusterScope) -> Result<Action, Error> {
        self.strategy(scope)
            .cluster_teardown(scope)
            .await
            .context(TeardownSnafu)?;
        Ok(Action::await_change())
    }
}

async fn fetch_inputs(
    client: &kube::Client,
    metal_cluster: &MetalCluster,
) -> Result<ClusterInputs, Error> {
    let Some(name) = capi::cluster_api_owner(metal_cluster, "Cluster") else {
        return Ok(ClusterInputs::default());
    };
    let namespace = metal_cluster.namespace().unwrap_or_default();
    let cluster = Api::<Cluster>::namespaced(client.clone(), &namespace)
        .get_opt(name)
        .await
        .with_context(|_| GetOwnerSnafu {
            cluster: ObjectRef::new(name).within(&namespace),
        })?;
    Ok(ClusterInputs { cluster })
}

pub async fn reconcile(metal_cluster: Arc<MetalCluster>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    tracing::info!(cluster = metal_cluster.name_any(), "starting reconcile");

    let inputs = fetch_inputs(&ctx.client, &metal_cluster).await?;
    if inputs
        .cluster
        .as_ref()
        .is_some_and(|cluster| capi::is_paused(cluster, metal_cluster.as_ref()))
    {
        tracing::info!(
            cluster = metal_cluster.name_any(),
            "reconciliation is paused"
        );
        return Ok(Action::await_change());
    }

    let api = Api::<MetalCluster>::namespaced(
        ctx.client.clone(),
        &metal_cluster.namespace().unwrap_or_default(),
    );
    let reconciler = ClusterReconciler::new(ctx.compute.as_ref(), ctx.load_balancers.as_ref());
    let (reconciler, inputs, ctx) = (&reconciler, &inputs, &ctx);

    finalizer(&api, CLUSTER_FINALIZER, metal_cluster, move |event| async move {
        let (resource, cleanup) = match event {
            finalizer::Event::Apply(resource) => (resource, false),
            finalizer::Event::Cleanup(resource) => (resource, true),
        };
        let mut scope = ClusterScope::open(Arc::unwrap_or_clone(resource));
        let outcome = if cleanup {
            reconciler.cleanup(&mut scope).await
        } else {
            reconciler.reconcile(&mut scope, inputs).await
        };
        scope
            .close_with(&ctx.patcher, outcome, |source| Error::PersistChanges {
                source,
            })
            .await
    })
    .await
    .context(FinalizerSnafu)
}

pub fn error_policy(_metal_cluster: Arc<MetalCluster>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    if error.is_terminal() {
        Action::await_change()
    } else {
        Action::requeue(ERROR_REQUEUE)
    }
}

/// The [`MetalCluster`] a `Cluster` points to as its infrastructure.
fn infrastructure_of(cluster: &Cluster) -> Option<ObjectRef<MetalCluster>> {
    let name = capi::referenced_name(cluster.spec.infrastructure_ref.as_ref(), "MetalCluster")?;
    Some(ObjectRef::new(name).within(&cluster.namespace()?))
}

pub async fn run(ctx: Arc<Ctx>, watch_namespace: &WatchNamespace) {
    let client = ctx.client.clone();
    Controller::new(
        watch_namespace.get_api::<MetalCluster>(&client),
        watcher::Config::default(),
    )
    .watches(
        watch_namespace.get_api::<Cluster>(&client),
        watcher::Config::default(),
        |cluster| infrastructure_of(&cluster),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|result| {
        report_controller_reconciled(&client, CONTROLLER_NAME, &result);
        futures::future::ready(())
    })
    .await;
}
