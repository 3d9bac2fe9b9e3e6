//! The subset of the Cluster API core types this operator reads.
//!
//! These objects are owned by the Cluster API controllers. This operator never writes them, so
//! only the fields it consumes are modelled and everything else is ignored on deserialization.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL, PAUSED_ANNOTATION, cluster::ApiEndpoint};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub paused: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ApiEndpoint>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default)]
    pub infrastructure_ready: bool,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1beta1",
    kind = "Machine",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    pub cluster_name: String,

    #[serde(default)]
    pub bootstrap: Bootstrap,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ObjectReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    /// Name of the secret holding the bootstrap data under the `value` key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
}

impl Cluster {
    pub fn infrastructure_ready(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|status| status.infrastructure_ready)
    }
}

impl Machine {
    pub fn is_control_plane(&self) -> bool {
        self.labels().contains_key(CONTROL_PLANE_LABEL)
    }

    /// The cluster this machine belongs to, preferring the label Cluster API maintains.
    pub fn cluster_name(&self) -> &str {
        self.labels()
            .get(CLUSTER_NAME_LABEL)
            .map_or(self.spec.cluster_name.as_str(), String::as_str)
    }
}

/// Returns `true` if reconciliation of `object` is paused, either through the owning cluster or
/// through the pause annotation on the object itself.
pub fn is_paused<K: Resource>(cluster: &Cluster, object: &K) -> bool {
    cluster.spec.paused
        || cluster.annotations().contains_key(PAUSED_ANNOTATION)
        || object
            .meta()
            .annotations
            .as_ref()
            .is_some_and(|annotations| annotations.contains_key(PAUSED_ANNOTATION))
}

/// Name of the object of `kind` that `reference` points to.
pub fn referenced_name<'a>(reference: Option<&'a ObjectReference>, kind: &str) -> Option<&'a str> {
    reference
        .filter(|reference| reference.kind.as_deref() == Some(kind))
        .and_then(|reference| reference.name.as_deref())
}

/// Finds the owner reference of kind `kind` in the Cluster API group.
pub fn cluster_api_owner<'a, K: Resource>(object: &'a K, kind: &str) -> Option<&'a str> {
    object
        .meta()
        .owner_references
        .iter()
        .flatten()
        .find(|owner| {
            owner.kind == kind
                && owner
                    .api_version
                    .split_once('/')
                    .is_some_and(|(group, _)| group == "cluster.x-k8s.io")
        })
        .map(|owner| owner.name.as_str())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::crd::MetalMachine;

    fn owner(api_version: &str, kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: api_version.to_owned(),
            kind: kind.to_owned(),
            name: name.to_owned(),
            uid: "uid".to_owned(),
            ..OwnerReference::default()
        }
    }

    #[test]
    fn owner_lookup_ignores_other_groups() {
        let metal_machine = MetalMachine {
            metadata: ObjectMeta {
                owner_references: Some(vec![
                    owner("example.com/v1", "Machine", "not-this-one"),
                    owner("cluster.x-k8s.io/v1beta1", "Machine", "m-0"),
                ]),
                ..ObjectMeta::default()
            },
            spec: Default::default(),
            status: None,
        };

        assert_eq!(cluster_api_owner(&metal_machine, "Machine"), Some("m-0"));
        assert_eq!(cluster_api_owner(&metal_machine, "Cluster"), None);
    }

    #[test]
    fn pause_is_read_from_cluster_and_object() {
        let mut cluster = Cluster::new("c1", ClusterSpec::default());
        let mut machine = Machine::new("m-0", MachineSpec::default());
        assert!(!is_paused(&cluster, &machine));

        machine.metadata.annotations = Some(BTreeMap::from([(
            PAUSED_ANNOTATION.to_owned(),
            String::new(),
        )]));
        assert!(is_paused(&cluster, &machine));

        machine.metadata.annotations = None;
        cluster.spec.paused = true;
        assert!(is_paused(&cluster, &machine));
    }

    #[test]
    fn cluster_name_prefers_label() {
        let mut machine = Machine::new(
            "m-0",
            MachineSpec {
                cluster_name: "from-spec".to_owned(),
                ..MachineSpec::default()
            },
        );
        assert_eq!(machine.cluster_name(), "from-spec");

        machine.metadata.labels = Some(BTreeMap::from([(
            CLUSTER_NAME_LABEL.to_owned(),
            "from-label".to_owned(),
        )]));
        assert_eq!(machine.cluster_name(), "from-label");
    }
}
