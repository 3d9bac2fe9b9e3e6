//! The `MetalCluster` and `MetalMachine` controllers.
//!
//! Each controller is split in two: a reconciler working only on a [`Scope`](crate::scope::Scope)
//! and the provider APIs, and the Kubernetes wiring that gathers the related objects, handles
//! pausing and finalizers and persists the scope.

use std::{sync::Arc, time::Duration};

use metal_api::{ComputeApi, LoadBalancerApi};

use crate::{namespace::WatchNamespace, scope::KubePatcher};

pub mod cluster;
pub mod machine;

pub const OPERATOR_NAME: &str = "metal-operator";

/// Requeue delay while a device is being provisioned.
pub const PROVISIONING_REQUEUE: Duration = Duration::from_secs(10);
/// Requeue delay after BGP could not be enabled.
pub const BGP_REQUEUE: Duration = Duration::from_secs(20);
/// Requeue delay after a failed reconciliation.
pub const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// State shared by all reconciliations of both controllers.
pub struct Ctx {
    pub client: kube::Client,
    pub compute: Arc<dyn ComputeApi>,
    pub load_balancers: Arc<dyn LoadBalancerApi>,
    pub patcher: KubePatcher,
}

impl Ctx {
    pub fn new(
        client: kube::Client,
        compute: Arc<dyn ComputeApi>,
        load_balancers: Arc<dyn LoadBalancerApi>,
    ) -> Self {
        Self {
            patcher: KubePatcher::new(client.clone(), OPERATOR_NAME),
            client,
            compute,
            load_balancers,
        }
    }
}

/// Runs both controllers until the process receives a termination signal.
pub async fn run(ctx: Ctx, watch_namespace: &WatchNamespace) {
    let ctx = Arc::new(ctx);
    futures::future::join(
        cluster::run(ctx.clone(), watch_namespace),
        machine::run(ctx, watch_namespace),
    )
    .await;
}
