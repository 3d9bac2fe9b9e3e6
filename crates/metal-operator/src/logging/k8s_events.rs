//! Utilities for publishing Kubernetes events

use std::error::Error;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::{
    controller,
    events::{Event, EventType, Recorder, Reporter},
};
use tracing::Instrument;

use super::controller::ReconcilerError;

const MAX_NOTE_LEN: usize = 1024;

/// Converts an [`Error`] into a publishable Kubernetes [`Event`]
fn error_to_event<E: ReconcilerError>(err: &E) -> Event {
    // Walk the whole error chain, so that the note carries the full reason
    let mut full_msg = {
        use std::fmt::Write;
        let mut buf = err.to_string();
        let mut err: &dyn Error = err;
        while let Some(source) = err.source() {
            // Writing into a String cannot fail
            let _ = write!(buf, ": {source}");
            err = source;
        }
        buf
    };
    message::truncate_with_ellipsis(&mut full_msg, MAX_NOTE_LEN);
    Event {
        type_: EventType::Warning,
        reason: err.category().to_owned(),
        note: Some(full_msg),
        action: "Reconcile".to_owned(),
        secondary: err.secondary_object().map(Into::into),
    }
}

/// Reports an error coming from a controller to Kubernetes
///
/// This is intended to be executed on the results returned by [`kube::runtime::Controller::run`]
#[tracing::instrument(skip(client))]
pub fn publish_controller_error_as_k8s_event<ReconcileErr, QueueErr>(
    client: &kube::Client,
    controller: &str,
    controller_error: &controller::Error<ReconcileErr, QueueErr>,
) where
    ReconcileErr: ReconcilerError,
    QueueErr: Error,
{
    let controller::Error::ReconcilerFailed(error, obj) = controller_error else {
        // Other errors concern the operator administrator, not a specific object
        return;
    };
    let recorder = Recorder::new(
        client.clone(),
        Reporter {
            controller: controller.to_owned(),
            instance: None,
        },
    );
    let reference = ObjectReference::from(obj.clone());
    let event = error_to_event(error);
    // Run in the background
    tokio::spawn(
        async move {
            if let Err(err) = recorder.publish(&event, &reference).await {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "Failed to report error as K8s event"
                );
            }
        }
        .in_current_span(),
    );
}

mod message {
    /// Ensures that `msg` is at most `max_len` _bytes_ long
    ///
    /// If `msg` is longer than `max_len` then the extra text is replaced with an ellipsis.
    pub fn truncate_with_ellipsis(msg: &mut String, max_len: usize) {
        const ELLIPSIS: char = '…';
        const ELLIPSIS_LEN: usize = ELLIPSIS.len_utf8();
        if msg.len() > max_len {
            let start_of_trunc_char = find_start_of_char(msg, max_len.saturating_sub(ELLIPSIS_LEN));
            msg.truncate(start_of_trunc_char);
            if ELLIPSIS_LEN <= max_len {
                msg.push(ELLIPSIS);
            }
        }
        debug_assert!(msg.len() <= max_len);
    }

    pub(super) fn find_start_of_char(s: &str, mut pos: usize) -> usize {
        while !s.is_char_boundary(pos) {
            pos -= 1;
        }
        pos
    }

}

#[cfg(test)]
mod tests {
    use kube::runtime::reflector::ObjectRef;
    use snafu::Snafu;
    use strum::EnumDiscriminants;

    use super::{MAX_NOTE_LEN, ReconcilerError, error_to_event};
    use crate::crd::capi::Machine;

    #[derive(Snafu, Debug, EnumDiscriminants)]
    #[strum_discriminants(derive(strum::IntoStaticStr))]
    enum ReconcileError {
        #[snafu(display("failed to look up device"))]
        FindDevice { source: LookupError },

        #[snafu(display("owner {machine} is gone: {detail}"))]
        OwnerGone {
            machine: ObjectRef<Machine>,
            detail: String,
        },
    }

    #[derive(Snafu, Debug)]
    enum LookupError {
        #[snafu(display("request to provider failed"))]
        Request { source: std::io::Error },
    }

    impl ReconcilerError for ReconcileError {
        fn category(&self) -> &'static str {
            ReconcileErrorDiscriminants::from(self).into()
        }

        fn secondary_object(&self) -> Option<ObjectRef<kube::core::DynamicObject>> {
            match self {
                Self::OwnerGone { machine, .. } => Some(machine.clone().erase()),
                Self::FindDevice { .. } => None,
            }
        }
    }

    fn find_device_failed() -> ReconcileError {
        ReconcileError::FindDevice {
            source: LookupError::Request {
                source: std::io::Error::other("connection reset"),
            },
        }
    }

    #[test]
    fn event_reports_full_nested_message() {
        let event = error_to_event(&find_device_failed());
        assert_eq!(
            event.note.as_deref(),
            Some("failed to look up device: request to provider failed: connection reset")
        );
        assert_eq!(event.reason, "FindDevice");
        assert!(event.secondary.is_none());
    }

    #[test]
    fn event_includes_secondary_object() {
        let err = ReconcileError::OwnerGone {
            machine: ObjectRef::new("cp-0").within("default"),
            detail: "deleted".to_owned(),
        };
        let secondary = error_to_event(&err).secondary.expect("secondary is set");
        assert_eq!(secondary.name.as_deref(), Some("cp-0"));
        assert_eq!(secondary.namespace.as_deref(), Some("default"));
        assert_eq!(secondary.kind.as_deref(), Some("Machine"));
    }

    #[test]
    fn event_note_is_truncated() {
        let err = ReconcileError::OwnerGone {
            machine: ObjectRef::new("cp-0"),
            detail: "x".repeat(2 * MAX_NOTE_LEN),
        };
        let note = error_to_event(&err).note.expect("note is set");
        assert_eq!(note.len(), MAX_NOTE_LEN);
        assert!(note.ends_with('…'));
    }
}
