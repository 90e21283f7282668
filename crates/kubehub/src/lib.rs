//! Skiff kubehub: target cluster access.
//!
//! [`TargetClient`] is the narrow set of verbs the engine needs, over raw JSON objects.
//! [`KubeTarget`] implements it with kube-rs dynamic APIs; [`MemoryCluster`] (feature
//! `memory`) implements it in process for tests.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value as Json};
use skiff_core::{ClusterError, ObjectRef};

mod connector;
mod kube_target;
#[cfg(any(test, feature = "memory"))]
mod memory;

pub use connector::{resolve_target_spec, KubeConnector, TargetConnector, TargetLookup};
pub use kube_target::KubeTarget;
#[cfg(any(test, feature = "memory"))]
pub use memory::{Call, MemoryCluster, MemoryConnector, Verb};

/// Cluster verbs used by the applier, readiness checks, exporter and deletion manager.
#[async_trait::async_trait]
pub trait TargetClient: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn get(&self, r: &ObjectRef) -> Result<Option<Json>, ClusterError>;
    async fn create(&self, obj: &Json) -> Result<Json, ClusterError>;
    /// Full replace; `metadata.resourceVersion` must match the live object when set.
    async fn replace(&self, obj: &Json) -> Result<Json, ClusterError>;
    /// JSON merge patch (RFC 7386).
    async fn merge_patch(&self, r: &ObjectRef, patch: &Json) -> Result<Json, ClusterError>;
    /// `ClusterError::NotFound` when the object is already gone.
    async fn delete(&self, r: &ObjectRef) -> Result<(), ClusterError>;
    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Json>, ClusterError>;
    /// `ClusterError::NoMatch` when the kind is not served.
    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<bool, ClusterError>;
}

pub type SharedClient = Arc<dyn TargetClient>;

/// Read a label from a raw object.
pub fn label<'a>(obj: &'a Json, key: &str) -> Option<&'a str> {
    obj.get("metadata")?.get("labels")?.get(key)?.as_str()
}

/// `a=b,c=d` selector string for the kube list API.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// RFC 7386 merge patch.
pub fn apply_merge_patch(target: &mut Json, patch: &Json) {
    match patch {
        Json::Object(p) => {
            if !target.is_object() {
                *target = Json::Object(Map::new());
            }
            if let Some(t) = target.as_object_mut() {
                for (k, v) in p {
                    if v.is_null() {
                        t.remove(k);
                    } else {
                        apply_merge_patch(t.entry(k.clone()).or_insert(Json::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}
