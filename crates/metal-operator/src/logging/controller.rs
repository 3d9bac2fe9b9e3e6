//! Reporting of `MetalCluster` and `MetalMachine` reconciliations.
//!
//! Both controllers hand every result of their stream to [`report_controller_reconciled`].

use std::error::Error;

use kube::{
    Resource,
    core::DynamicObject,
    runtime::{
        controller::{self, Action},
        reflector::ObjectRef,
    },
};

use super::k8s_events::publish_controller_error_as_k8s_event;

/// What the controllers need to know about their reconcile errors.
pub trait ReconcilerError: Error {
    /// `PascalCase` name of the error, used as the reason of the published event.
    ///
    /// Derived from [`strum::EnumDiscriminants`] and [`strum::IntoStaticStr`].
    fn category(&self) -> &'static str;

    /// The related object the error is about, such as the owning `Machine` of a
    /// `MetalMachine` or the bootstrap `Secret`.
    fn secondary_object(&self) -> Option<ObjectRef<DynamicObject>> {
        None
    }

    /// Retrying cannot help, the object waits until it is changed.
    ///
    /// A terminal failure has already been recorded in the object's status.
    fn is_terminal(&self) -> bool {
        false
    }
}

/// Logs the outcome of one reconciliation and publishes failures as Kubernetes events.
pub fn report_controller_reconciled<K, ReconcileErr, QueueErr>(
    client: &kube::Client,
    controller_name: &str,
    result: &Result<(ObjectRef<K>, Action), controller::Error<ReconcileErr, QueueErr>>,
) where
    K: Resource,
    ReconcileErr: ReconcilerError,
    QueueErr: Error,
{
    match result {
        Ok((object, action)) => tracing::info!(
            controller.name = controller_name,
            %object,
            ?action,
            "reconciled"
        ),
        Err(error) => report_controller_error(client, controller_name, error),
    }
}

fn report_controller_error<ReconcileErr, QueueErr>(
    client: &kube::Client,
    controller_name: &str,
    error: &controller::Error<ReconcileErr, QueueErr>,
) where
    ReconcileErr: ReconcilerError,
    QueueErr: Error,
{
    match error {
        controller::Error::ReconcilerFailed(reconcile_error, object)
            if reconcile_error.is_terminal() =>
        {
            tracing::warn!(
                controller.name = controller_name,
                %object,
                error = reconcile_error as &dyn Error,
                "reconcile failed permanently, waiting for a change"
            );
        }
        _ => tracing::error!(
            controller.name = controller_name,
            error = error as &dyn Error,
            "reconcile failed"
        ),
    }
    publish_controller_error_as_k8s_event(client, controller_name, error);
}
