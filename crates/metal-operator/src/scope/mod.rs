//! Batching of all changes a reconciliation makes to its resource.
//!
//! A [`Scope`] snapshots the resource when it is opened. The reconciler only ever mutates the
//! working copy and [`Scope::close`] writes the difference back in a single [`Patcher::patch`]
//! call, or not at all if nothing changed.

use std::fmt::Debug;

use async_trait::async_trait;
use kube::{
    Api, Resource, ResourceExt,
    api::{Patch, PatchParams},
    core::NamespaceResourceScope,
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use snafu::{ResultExt, Snafu};

pub mod cluster;
pub mod machine;
pub mod merge_patch;

pub use cluster::ClusterScope;
pub use machine::MachineScope;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize {kind} {name:?}"))]
    SerializeResource {
        source: serde_json::Error,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to patch {kind} {name:?}"))]
    PatchResource {
        source: kube::Error,
        kind: String,
        name: String,
    },
}

/// The changes of one [`Scope`], split by the endpoint they have to be sent to.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourcePatch {
    /// Merge patch for everything but the status: metadata and spec.
    pub object: Option<Value>,
    /// Merge patch for the content of `.status`.
    pub status: Option<Value>,
}

impl ResourcePatch {
    fn from_diff(diff: Value) -> Self {
        let Value::Object(mut fields) = diff else {
            return Self {
                object: Some(diff),
                status: None,
            };
        };
        let status = fields.remove("status");
        Self {
            object: (!fields.is_empty()).then_some(Value::Object(fields)),
            status,
        }
    }
}

/// Writes a [`ResourcePatch`] back to wherever `K` is stored.
#[async_trait]
pub trait Patcher<K>: Send + Sync {
    async fn patch(&self, resource: &K, patch: &ResourcePatch) -> Result<(), kube::Error>;
}

/// [`Patcher`] storing resources in Kubernetes.
///
/// The object part is sent to the resource itself, the status part to its `status` subresource.
#[derive(Clone)]
pub struct KubePatcher {
    client: kube::Client,
    params: PatchParams,
}

impl KubePatcher {
    pub fn new(client: kube::Client, field_manager: &str) -> Self {
        Self {
            client,
            params: PatchParams {
                field_manager: Some(field_manager.to_owned()),
                ..PatchParams::default()
            },
        }
    }
}

#[async_trait]
impl<K> Patcher<K> for KubePatcher
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Send
        + Sync,
    K::DynamicType: Default,
{
    async fn patch(&self, resource: &K, patch: &ResourcePatch) -> Result<(), kube::Error> {
        let api: Api<K> =
            Api::namespaced(self.client.clone(), &resource.namespace().unwrap_or_default());
        let name = resource.name_any();

        if let Some(object) = &patch.object {
            api.patch(&name, &self.params, &Patch::Merge(object)).await?;
        }
        if let Some(status) = &patch.status {
            api.patch_status(&name, &self.params, &Patch::Merge(json!({ "status": status })))
                .await?;
        }
        Ok(())
    }
}

/// A resource being reconciled together with the snapshot it started from.
#[derive(Debug)]
pub struct Scope<K> {
    original: K,
    working: K,
}

impl<K> Scope<K>
where
    K: Resource + Clone + Serialize,
    K::DynamicType: Default,
{
    pub fn open(resource: K) -> Self {
        Self {
            original: resource.clone(),
            working: resource,
        }
    }

    pub fn resource(&self) -> &K {
        &self.working
    }

    pub fn resource_mut(&mut self) -> &mut K {
        &mut self.working
    }

    pub fn name(&self) -> String {
        self.working.name_any()
    }

    pub fn namespace(&self) -> String {
        self.working.namespace().unwrap_or_default()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.working.annotations().get(key).map(String::as_str)
    }

    pub fn set_annotation(&mut self, key: &str, value: impl Into<String>) {
        self.working
            .annotations_mut()
            .insert(key.to_owned(), value.into());
    }

    pub fn remove_annotation(&mut self, key: &str) {
        self.working.annotations_mut().remove(key);
    }

    /// The changes made since the scope was opened.
    pub fn changes(&self) -> Result<Option<ResourcePatch>, Error> {
        let original = self.to_value(&self.original)?;
        let working = self.to_value(&self.working)?;
        Ok(merge_patch::diff(&original, &working).map(ResourcePatch::from_diff))
    }

    fn to_value(&self, resource: &K) -> Result<Value, Error> {
        serde_json::to_value(resource).with_context(|_| SerializeResourceSnafu {
            kind: K::kind(&K::DynamicType::default()).into_owned(),
            name: self.name(),
        })
    }

    /// Writes all changes with at most one [`Patcher::patch`] call.
    pub async fn close<P>(self, patcher: &P) -> Result<(), Error>
    where
        P: Patcher<K> + ?Sized,
    {
        let Some(changes) = self.changes()? else {
            tracing::trace!(name = self.name(), "resource unchanged, skipping patch");
            return Ok(());
        };

        tracing::debug!(
            name = self.name(),
            object = changes.object.is_some(),
            status = changes.status.is_some(),
            "patching resource"
        );
        patcher
            .patch(&self.working, &changes)
            .await
            .with_context(|_| PatchResourceSnafu {
                kind: K::kind(&K::DynamicType::default()).into_owned(),
                name: self.name(),
            })
    }

    /// Closes the scope after a reconciliation finished with `outcome`.
    ///
    /// A failed close is returned through `close_failed` unless the reconciliation itself already
    /// failed. In that case the close failure is only logged.
    pub async fn close_with<P, T, E>(
        self,
        patcher: &P,
        outcome: Result<T, E>,
        close_failed: impl FnOnce(Error) -> E,
    ) -> Result<T, E>
    where
        P: Patcher<K> + ?Sized,
    {
        match (self.close(patcher).await, outcome) {
            (Ok(()), outcome) => outcome,
            (Err(close), Ok(_)) => Err(close_failed(close)),
            (Err(close), Err(error)) => {
                tracing::warn!(
                    error = &close as &dyn std::error::Error,
                    "failed to persist changes of failed reconciliation"
                );
                Err(error)
            }
        }
    }
}
