//! Typed status conditions shared by both custom resources.
//!
//! Conditions are keyed by [`ConditionType`]. Replacing a condition keeps its position in the
//! list and only moves `lastTransitionTime` when the status actually changes.

use std::cmp;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize, strum::Display,
)]
pub enum ConditionType {
    /// Summary of all other conditions of the object.
    Ready,
    /// The device backing a machine is running and all post-ready steps succeeded.
    DeviceReady,
    /// The control plane endpoint of a cluster is reserved.
    NetworkInfrastructureReady,
    /// The load balancer origin for a control plane machine is in place.
    LoadBalancerReady,
}

/// Ordered from best to worst, so that [`cmp::max`] yields the worst status.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::Display,
)]
pub enum ConditionStatus {
    True,
    #[default]
    Unknown,
    False,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display)]
pub enum ConditionSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize, strum::Display)]
pub enum ConditionReason {
    InstanceNotFound,
    InstanceProvisionFailed,
    InstanceProvisionStarted,
    InstanceStateUnknown,
    WaitingForClusterInfrastructure,
    WaitingForBootstrapData,
    WaitingForOwner,
    LoadBalancerProvisionFailed,
    LoadBalancerOriginRecreating,
    ElasticIpProvisionFailed,
    InvalidConfiguration,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<ConditionSeverity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ConditionReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

impl Condition {
    pub fn true_(type_: ConditionType) -> Self {
        Self {
            type_,
            status: ConditionStatus::True,
            severity: None,
            reason: None,
            message: None,
            last_transition_time: None,
        }
    }

    pub fn false_(
        type_: ConditionType,
        reason: ConditionReason,
        severity: ConditionSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            status: ConditionStatus::False,
            severity: Some(severity),
            reason: Some(reason),
            message: Some(message.into()),
            last_transition_time: None,
        }
    }

    pub fn unknown(type_: ConditionType, reason: ConditionReason, message: impl Into<String>) -> Self {
        Self {
            type_,
            status: ConditionStatus::Unknown,
            severity: None,
            reason: Some(reason),
            message: Some(message.into()),
            last_transition_time: None,
        }
    }

    /// Two conditions are equivalent if they only differ in their transition time.
    fn is_equivalent(&self, other: &Self) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.severity == other.severity
            && self.reason == other.reason
            && self.message == other.message
    }
}

pub fn get(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|condition| condition.type_ == type_)
}

pub fn is_true(conditions: &[Condition], type_: ConditionType) -> bool {
    get(conditions, type_).is_some_and(|condition| condition.status == ConditionStatus::True)
}

/// Inserts or replaces the condition of the same type.
///
/// Returns `true` if the list changed.
pub fn set(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions
        .iter_mut()
        .find(|existing| existing.type_ == condition.type_)
    {
        Some(existing) if existing.is_equivalent(&condition) => false,
        Some(existing) => {
            condition.last_transition_time = if existing.status == condition.status {
                existing.last_transition_time.clone()
            } else {
                Some(now())
            };
            *existing = condition;
            true
        }
        None => {
            condition.last_transition_time = Some(now());
            conditions.push(condition);
            true
        }
    }
}

/// Sets the [`ConditionType::Ready`] summary to the worst status of all other conditions.
///
/// The summary copies reason and message of the first condition carrying that worst status.
pub fn set_summary(conditions: &mut Vec<Condition>) -> bool {
    let others = conditions
        .iter()
        .filter(|condition| condition.type_ != ConditionType::Ready);
    let Some(worst) = others.clone().map(|condition| condition.status).reduce(cmp::max) else {
        return false;
    };

    let summary = match others.clone().find(|condition| condition.status == worst) {
        Some(source) if worst != ConditionStatus::True => Condition {
            type_: ConditionType::Ready,
            last_transition_time: None,
            ..source.clone()
        },
        _ => Condition::true_(ConditionType::Ready),
    };
    set(conditions, summary)
}

fn now() -> Time {
    Time(jiff::Timestamp::now())
}
