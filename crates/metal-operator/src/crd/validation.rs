//! Field-level update rules for the custom resources.
//!
//! Every rule compares one typed field of the previously accepted spec with the current one.
//! The previously accepted spec is remembered in the [`LAST_APPLIED_SPEC_ANNOTATION`] so that
//! the controllers can enforce the rules without an admission webhook.

use std::fmt;

use itertools::Itertools;
use kube::ResourceExt;
use serde::{Serialize, de::DeserializeOwned};
use snafu::Snafu;

use super::{LAST_APPLIED_SPEC_ANNOTATION, MetalClusterSpec, MetalMachineSpec};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViolationKind {
    /// The field may never change.
    Immutable,
    /// The field may go from unset to set, but never change afterwards.
    SetOnce,
    /// Two fields were set although at most one of them may be.
    MutuallyExclusive,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    pub field: &'static str,
    pub kind: ViolationKind,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let field = self.field;
        match self.kind {
            ViolationKind::Immutable => write!(f, "{field} is immutable"),
            ViolationKind::SetOnce => write!(f, "{field} cannot be changed once set"),
            ViolationKind::MutuallyExclusive => write!(f, "{field} are mutually exclusive"),
        }
    }
}

#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(display("invalid spec: {}", violations.iter().join(", ")))]
pub struct Errors {
    pub violations: Vec<Violation>,
}

struct FieldRule<S> {
    field: &'static str,
    kind: ViolationKind,
    allows: fn(&S, &S) -> bool,
}

impl<S> FieldRule<S> {
    fn immutable(field: &'static str, unchanged: fn(&S, &S) -> bool) -> Self {
        Self {
            field,
            kind: ViolationKind::Immutable,
            allows: unchanged,
        }
    }

    fn set_once(field: &'static str, allows: fn(&S, &S) -> bool) -> Self {
        Self {
            field,
            kind: ViolationKind::SetOnce,
            allows,
        }
    }
}

fn cluster_rules() -> [FieldRule<MetalClusterSpec>; 5] {
    [
        FieldRule::immutable("projectID", |old, new| old.project_id == new.project_id),
        FieldRule::immutable("facility", |old, new| old.facility == new.facility),
        FieldRule::immutable("metro", |old, new| old.metro == new.metro),
        FieldRule::immutable("vipManager", |old, new| old.vip_manager == new.vip_manager),
        FieldRule::set_once("controlPlaneEndpoint", |old, new| {
            old.control_plane_endpoint.is_none()
                || old.control_plane_endpoint == new.control_plane_endpoint
        }),
    ]
}

fn machine_rules() -> [FieldRule<MetalMachineSpec>; 7] {
    [
        FieldRule::immutable("machineType", |old, new| old.machine_type == new.machine_type),
        FieldRule::immutable("os", |old, new| old.os == new.os),
        FieldRule::immutable("facility", |old, new| old.facility == new.facility),
        FieldRule::immutable("metro", |old, new| old.metro == new.metro),
        FieldRule::immutable("hardwareReservationID", |old, new| {
            old.hardware_reservation_id == new.hardware_reservation_id
        }),
        FieldRule::immutable("sshKeys", |old, new| old.ssh_keys == new.ssh_keys),
        FieldRule::set_once("providerID", |old, new| {
            old.provider_id.is_none() || old.provider_id == new.provider_id
        }),
    ]
}

fn check<S>(rules: &[FieldRule<S>], old: &S, new: &S) -> Vec<Violation> {
    rules
        .iter()
        .filter(|rule| !(rule.allows)(old, new))
        .map(|rule| Violation {
            field: rule.field,
            kind: rule.kind,
        })
        .collect()
}

fn into_result(violations: Vec<Violation>) -> Result<(), Errors> {
    if violations.is_empty() {
        Ok(())
    } else {
        Err(Errors { violations })
    }
}

/// `facility` and `metro` select the location of a resource, at most one of them may be set.
pub fn validate_locality(facility: Option<&str>, metro: Option<&str>) -> Result<(), Errors> {
    let mut violations = Vec::new();
    locality_violation(facility, metro, &mut violations);
    into_result(violations)
}

fn locality_violation(facility: Option<&str>, metro: Option<&str>, into: &mut Vec<Violation>) {
    if facility.is_some() && metro.is_some() {
        into.push(Violation {
            field: "facility and metro",
            kind: ViolationKind::MutuallyExclusive,
        });
    }
}

pub fn validate_cluster(spec: &MetalClusterSpec) -> Result<(), Errors> {
    validate_locality(spec.facility.as_deref(), spec.metro.as_deref())
}

pub fn validate_cluster_update(old: &MetalClusterSpec, new: &MetalClusterSpec) -> Result<(), Errors> {
    let mut violations = check(&cluster_rules(), old, new);
    locality_violation(new.facility.as_deref(), new.metro.as_deref(), &mut violations);
    into_result(violations)
}

pub fn validate_machine_update(old: &MetalMachineSpec, new: &MetalMachineSpec) -> Result<(), Errors> {
    let mut violations = check(&machine_rules(), old, new);
    locality_violation(new.facility.as_deref(), new.metro.as_deref(), &mut violations);
    into_result(violations)
}

/// Reads the spec recorded in [`LAST_APPLIED_SPEC_ANNOTATION`].
///
/// An unreadable annotation is treated like a missing one.
pub fn last_applied_spec<S, K>(resource: &K) -> Option<S>
where
    S: DeserializeOwned,
    K: ResourceExt,
{
    let raw = resource.annotations().get(LAST_APPLIED_SPEC_ANNOTATION)?;
    match serde_json::from_str(raw) {
        Ok(spec) => Some(spec),
        Err(error) => {
            tracing::warn!(
                object = resource.name_any(),
                error = &error as &dyn std::error::Error,
                "ignoring unreadable last applied spec"
            );
            None
        }
    }
}

/// Records `spec` in [`LAST_APPLIED_SPEC_ANNOTATION`] on `resource`.
pub fn record_applied_spec<S, K>(resource: &mut K, spec: &S) -> Result<(), serde_json::Error>
where
    S: Serialize,
    K: ResourceExt,
{
    let serialized = serde_json::to_string(spec)?;
    resource
        .annotations_mut()
        .insert(LAST_APPLIED_SPEC_ANNOTATION.to_owned(), serialized);
    Ok(())
}
