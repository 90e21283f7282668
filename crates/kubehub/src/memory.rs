//! In-process cluster for tests: API-server-like semantics for the verbs in [`TargetClient`],
//! a journal of every call, and failure injection.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{json, Map, Value as Json};
use skiff_core::{ClusterError, DeployError, ObjectRef, WorkItem};

use crate::{apply_merge_patch, label, SharedClient, TargetClient, TargetConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Create,
    Replace,
    Patch,
    Delete,
    List,
}

/// One journaled call. `resource.name` is empty for list calls.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub verb: Verb,
    pub resource: ObjectRef,
}

struct Failure {
    verb: Verb,
    name: Option<String>,
    error: ClusterError,
    remaining: Option<usize>,
}

/// Storage key; the version is not part of an object's identity.
type Key = (String, String, Option<String>, String);

fn key_of(r: &ObjectRef) -> Key {
    (r.group().to_string(), r.kind.clone(), r.namespace.clone(), r.name.clone())
}

const CLUSTER_SCOPED: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "StorageClass",
    "PriorityClass",
    "APIService",
    "ValidatingWebhookConfiguration",
    "MutatingWebhookConfiguration",
];

struct Inner {
    objects: BTreeMap<Key, Json>,
    next_rv: u64,
    journal: Vec<Call>,
    failures: Vec<Failure>,
    cluster_scoped: HashSet<String>,
    unserved: HashSet<String>,
}

pub struct MemoryCluster {
    inner: Mutex<Inner>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                next_rv: 1,
                journal: Vec::new(),
                failures: Vec::new(),
                cluster_scoped: CLUSTER_SCOPED.iter().map(|s| s.to_string()).collect(),
                unserved: HashSet::new(),
            }),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not wedge the rest of the test.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Store an object directly, bypassing the journal and failure injection.
    pub fn seed(&self, obj: Json) {
        let mut inner = self.lock();
        if let Some(r) = ObjectRef::from_object(&obj) {
            let r = inner.normalize(r);
            let obj = inner.stamp_new(obj);
            inner.objects.insert(key_of(&r), obj);
        }
    }

    pub fn object(&self, r: &ObjectRef) -> Option<Json> {
        self.lock().objects.get(&key_of(r)).cloned()
    }

    pub fn contains(&self, r: &ObjectRef) -> bool {
        self.lock().objects.contains_key(&key_of(r))
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite `status` of a stored object, as a workload controller would.
    pub fn set_status(&self, r: &ObjectRef, status: Json) {
        if let Some(obj) = self.lock().objects.get_mut(&key_of(r)) {
            if let Some(o) = obj.as_object_mut() {
                o.insert("status".into(), status);
            }
        }
    }

    /// Merge labels into a stored object without journaling.
    pub fn set_labels(&self, r: &ObjectRef, labels: &[(&str, &str)]) {
        if let Some(obj) = self.lock().objects.get_mut(&key_of(r)) {
            let meta = ensure_object(obj, "metadata");
            let l = ensure_object(meta, "labels");
            if let Some(map) = l.as_object_mut() {
                for (k, v) in labels {
                    map.insert(k.to_string(), Json::String(v.to_string()));
                }
            }
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().journal.clone()
    }

    pub fn calls_for(&self, verb: Verb) -> Vec<ObjectRef> {
        self.lock().journal.iter().filter(|c| c.verb == verb).map(|c| c.resource.clone()).collect()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    /// Fail every `verb` call on `name` (any name when `None`) until cleared.
    pub fn fail_on(&self, verb: Verb, name: Option<&str>, error: ClusterError) {
        self.lock().failures.push(Failure { verb, name: name.map(|s| s.to_string()), error, remaining: None });
    }

    /// Fail the next `verb` call on `name` once.
    pub fn fail_once(&self, verb: Verb, name: Option<&str>, error: ClusterError) {
        self.lock().failures.push(Failure { verb, name: name.map(|s| s.to_string()), error, remaining: Some(1) });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Make a kind unknown to the cluster, as if its CRD were removed.
    pub fn unserve_kind(&self, kind: &str) {
        self.lock().unserved.insert(kind.to_string());
    }
}

impl Inner {
    fn record(&mut self, verb: Verb, resource: ObjectRef) -> Result<(), ClusterError> {
        self.journal.push(Call { verb, resource: resource.clone() });
        if self.unserved.contains(&resource.kind) {
            return Err(ClusterError::NoMatch(format!("{}/{}", resource.api_version, resource.kind)));
        }
        let pos = self.failures.iter().position(|f| f.verb == verb && f.name.as_deref().map_or(true, |n| n == resource.name));
        if let Some(pos) = pos {
            let err = self.failures[pos].error.clone();
            if let Some(rem) = self.failures[pos].remaining.as_mut() {
                *rem -= 1;
                if *rem == 0 {
                    self.failures.remove(pos);
                }
            }
            return Err(err);
        }
        Ok(())
    }

    fn bump_rv(&mut self) -> String {
        let rv = self.next_rv;
        self.next_rv += 1;
        rv.to_string()
    }

    fn stamp_new(&mut self, mut obj: Json) -> Json {
        let rv = self.bump_rv();
        let kind = obj.get("kind").and_then(|k| k.as_str()).unwrap_or_default().to_string();
        let cluster_scoped = self.cluster_scoped.contains(&kind);
        let meta = ensure_object(&mut obj, "metadata");
        if let Some(m) = meta.as_object_mut() {
            m.entry("uid").or_insert_with(|| Json::String(uuid::Uuid::new_v4().to_string()));
            m.insert("resourceVersion".into(), Json::String(rv));
            m.entry("generation").or_insert(json!(1));
            if cluster_scoped {
                m.remove("namespace");
            }
        }
        self.learn_crd(&obj);
        obj
    }

    /// A created CRD registers the scope of the kind it defines.
    fn learn_crd(&mut self, obj: &Json) {
        if obj.get("kind").and_then(|k| k.as_str()) != Some("CustomResourceDefinition") {
            return;
        }
        let spec = obj.get("spec");
        let kind = spec.and_then(|s| s.get("names")).and_then(|n| n.get("kind")).and_then(|k| k.as_str());
        let scope = spec.and_then(|s| s.get("scope")).and_then(|s| s.as_str());
        if let (Some(kind), Some("Cluster")) = (kind, scope) {
            self.cluster_scoped.insert(kind.to_string());
        }
    }

    fn normalize(&self, mut r: ObjectRef) -> ObjectRef {
        if self.cluster_scoped.contains(&r.kind) {
            r.namespace = None;
        }
        r
    }
}

fn ensure_object<'a>(v: &'a mut Json, key: &str) -> &'a mut Json {
    if !v.get(key).map_or(false, |x| x.is_object()) {
        if let Some(o) = v.as_object_mut() {
            o.insert(key.to_string(), Json::Object(Map::new()));
        }
    }
    match v {
        Json::Object(o) => o.entry(key.to_string()).or_insert(Json::Null),
        other => other,
    }
}

fn finalizers_empty(obj: &Json) -> bool {
    obj.get("metadata").and_then(|m| m.get("finalizers")).and_then(|f| f.as_array()).map_or(true, |a| a.is_empty())
}

fn is_terminating(obj: &Json) -> bool {
    obj.get("metadata").and_then(|m| m.get("deletionTimestamp")).map_or(false, |v| !v.is_null())
}

fn meta_str<'a>(obj: &'a Json, key: &str) -> Option<&'a str> {
    obj.get("metadata")?.get(key)?.as_str()
}

fn bump_generation(before: &Json, after: &mut Json) {
    if before.get("spec") != after.get("spec") {
        let gen = before.get("metadata").and_then(|m| m.get("generation")).and_then(|g| g.as_i64()).unwrap_or(1);
        if let Some(m) = after.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            m.insert("generation".into(), json!(gen + 1));
        }
    }
}

fn not_found(r: &ObjectRef) -> ClusterError {
    ClusterError::NotFound(format!("{} not found", r))
}

#[async_trait::async_trait]
impl TargetClient for MemoryCluster {
    async fn get(&self, r: &ObjectRef) -> Result<Option<Json>, ClusterError> {
        let mut inner = self.lock();
        let r = inner.normalize(r.clone());
        inner.record(Verb::Get, r.clone())?;
        Ok(inner.objects.get(&key_of(&r)).cloned())
    }

    async fn create(&self, obj: &Json) -> Result<Json, ClusterError> {
        let r = ObjectRef::from_object(obj).ok_or_else(|| ClusterError::Decode("object without identity".into()))?;
        let mut inner = self.lock();
        let r = inner.normalize(r);
        inner.record(Verb::Create, r.clone())?;
        let namespaced = !inner.cluster_scoped.contains(&r.kind);
        if namespaced && r.namespace.is_none() {
            return Err(ClusterError::Api { code: 400, message: format!("{}: namespace required", r) });
        }
        let key = key_of(&r);
        if inner.objects.contains_key(&key) {
            return Err(ClusterError::Conflict(format!("{} already exists", r)));
        }
        let mut obj = obj.clone();
        if let Some(m) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            m.remove("uid");
            m.remove("generation");
        }
        let stored = inner.stamp_new(obj);
        inner.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace(&self, obj: &Json) -> Result<Json, ClusterError> {
        let r = ObjectRef::from_object(obj).ok_or_else(|| ClusterError::Decode("object without identity".into()))?;
        let mut inner = self.lock();
        let r = inner.normalize(r);
        inner.record(Verb::Replace, r.clone())?;
        let key = key_of(&r);
        let live = inner.objects.get(&key).cloned().ok_or_else(|| not_found(&r))?;
        if let Some(rv) = meta_str(obj, "resourceVersion") {
            if Some(rv) != meta_str(&live, "resourceVersion") {
                return Err(ClusterError::Conflict(format!("{}: resourceVersion {} is stale", r, rv)));
            }
        }
        let mut next = obj.clone();
        let rv = inner.bump_rv();
        if let Some(o) = next.as_object_mut() {
            // Status is owned by the cluster.
            match live.get("status") {
                Some(s) => o.insert("status".into(), s.clone()),
                None => o.remove("status"),
            };
        }
        let meta = ensure_object(&mut next, "metadata");
        if let Some(m) = meta.as_object_mut() {
            for k in ["uid", "generation", "deletionTimestamp", "namespace"] {
                match live.get("metadata").and_then(|lm| lm.get(k)) {
                    Some(v) => m.insert(k.into(), v.clone()),
                    None => m.remove(k),
                };
            }
            m.insert("resourceVersion".into(), Json::String(rv));
        }
        bump_generation(&live, &mut next);
        inner.objects.insert(key, next.clone());
        Ok(next)
    }

    async fn merge_patch(&self, r: &ObjectRef, patch: &Json) -> Result<Json, ClusterError> {
        let mut inner = self.lock();
        let r = inner.normalize(r.clone());
        inner.record(Verb::Patch, r.clone())?;
        let key = key_of(&r);
        let live = inner.objects.get(&key).cloned().ok_or_else(|| not_found(&r))?;
        let mut next = live.clone();
        apply_merge_patch(&mut next, patch);
        if next != live {
            let rv = inner.bump_rv();
            if let Some(m) = next.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                m.insert("resourceVersion".into(), Json::String(rv));
            }
            bump_generation(&live, &mut next);
        }
        if is_terminating(&next) && finalizers_empty(&next) {
            inner.objects.remove(&key);
        } else {
            inner.objects.insert(key, next.clone());
        }
        Ok(next)
    }

    async fn delete(&self, r: &ObjectRef) -> Result<(), ClusterError> {
        let mut inner = self.lock();
        let r = inner.normalize(r.clone());
        inner.record(Verb::Delete, r.clone())?;
        let key = key_of(&r);
        let live = inner.objects.get(&key).cloned().ok_or_else(|| not_found(&r))?;
        if finalizers_empty(&live) {
            inner.objects.remove(&key);
        } else if !is_terminating(&live) {
            let mut next = live;
            if let Some(m) = next.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                m.insert("deletionTimestamp".into(), Json::String("1970-01-01T00:00:00Z".into()));
            }
            inner.objects.insert(key, next);
        }
        Ok(())
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Json>, ClusterError> {
        let mut inner = self.lock();
        let probe = inner.normalize(ObjectRef::new(api_version, kind, namespace, ""));
        inner.record(Verb::List, probe.clone())?;
        let group = probe.group().to_string();
        Ok(inner
            .objects
            .iter()
            .filter(|((g, k, ns, _), _)| *g == group && k == kind && (probe.namespace.is_none() || *ns == probe.namespace))
            .filter(|(_, obj)| labels.iter().all(|(lk, lv)| label(obj, lk) == Some(lv.as_str())))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<bool, ClusterError> {
        let inner = self.lock();
        if inner.unserved.contains(kind) {
            return Err(ClusterError::NoMatch(format!("{}/{}", api_version, kind)));
        }
        Ok(!inner.cluster_scoped.contains(kind))
    }
}

/// Connector handing out one shared [`MemoryCluster`] to every work item that names a target.
pub struct MemoryConnector {
    cluster: Arc<MemoryCluster>,
}

impl MemoryConnector {
    pub fn new(cluster: Arc<MemoryCluster>) -> Self {
        Self { cluster }
    }
}

#[async_trait::async_trait]
impl TargetConnector for MemoryConnector {
    async fn connect(&self, item: &WorkItem) -> Result<SharedClient, DeployError> {
        if item.spec.inline_target.is_none() && item.spec.target.is_none() {
            return Err(DeployError::NoTarget);
        }
        Ok(self.cluster.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str) -> Json {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "ns"}, "data": {"k": "v"}})
    }

    fn cm_ref(name: &str) -> ObjectRef {
        ObjectRef::new("v1", "ConfigMap", Some("ns"), name)
    }

    #[tokio::test]
    async fn create_get_replace_roundtrip() {
        let c = MemoryCluster::new();
        let created = c.create(&cm("a")).await.unwrap();
        assert!(meta_str(&created, "uid").is_some());
        assert!(matches!(c.create(&cm("a")).await, Err(ClusterError::Conflict(_))));

        let mut stale = cm("a");
        stale["metadata"]["resourceVersion"] = json!("999");
        assert!(matches!(c.replace(&stale).await, Err(ClusterError::Conflict(_))));

        let mut fresh = cm("a");
        fresh["metadata"]["resourceVersion"] = created["metadata"]["resourceVersion"].clone();
        fresh["data"]["k"] = json!("w");
        let replaced = c.replace(&fresh).await.unwrap();
        assert_eq!(replaced["data"]["k"], json!("w"));
        assert_eq!(replaced["metadata"]["uid"], created["metadata"]["uid"]);
    }

    #[tokio::test]
    async fn merge_patch_removes_nulls_and_keeps_rv_on_noop() {
        let c = MemoryCluster::new();
        let created = c.create(&cm("a")).await.unwrap();
        let same = c.merge_patch(&cm_ref("a"), &json!({"data": {"k": "v"}})).await.unwrap();
        assert_eq!(same["metadata"]["resourceVersion"], created["metadata"]["resourceVersion"]);
        let gone = c.merge_patch(&cm_ref("a"), &json!({"data": {"k": null}})).await.unwrap();
        assert_eq!(gone["data"], json!({}));
    }

    #[tokio::test]
    async fn delete_honours_finalizers() {
        let c = MemoryCluster::new();
        let mut obj = cm("a");
        obj["metadata"]["finalizers"] = json!(["x"]);
        c.create(&obj).await.unwrap();
        c.delete(&cm_ref("a")).await.unwrap();
        assert!(is_terminating(&c.object(&cm_ref("a")).unwrap()));
        c.merge_patch(&cm_ref("a"), &json!({"metadata": {"finalizers": null}})).await.unwrap();
        assert!(!c.contains(&cm_ref("a")));
        assert!(matches!(c.delete(&cm_ref("a")).await, Err(ClusterError::NotFound(_))));
    }

    #[tokio::test]
    async fn cluster_scoped_kinds_drop_namespace() {
        let c = MemoryCluster::new();
        c.create(&json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "x", "namespace": "junk"}})).await.unwrap();
        assert!(c.contains(&ObjectRef::new("v1", "Namespace", None, "x")));
        assert!(!c.is_namespaced("v1", "Namespace").await.unwrap());
        let missing_ns = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "y"}});
        assert!(matches!(c.create(&missing_ns).await, Err(ClusterError::Api { code: 400, .. })));
    }

    #[tokio::test]
    async fn crd_registers_cluster_scope() {
        let c = MemoryCluster::new();
        let crd = json!({
            "apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition",
            "metadata": {"name": "widgets.example.com"},
            "spec": {"group": "example.com", "scope": "Cluster", "names": {"kind": "Widget"}}
        });
        c.create(&crd).await.unwrap();
        assert!(!c.is_namespaced("example.com/v1", "Widget").await.unwrap());
        c.unserve_kind("Widget");
        assert!(matches!(c.is_namespaced("example.com/v1", "Widget").await, Err(ClusterError::NoMatch(_))));
    }

    #[tokio::test]
    async fn failure_injection_and_journal() {
        let c = MemoryCluster::new();
        c.fail_once(Verb::Create, Some("a"), ClusterError::Transport("eof".into()));
        assert!(matches!(c.create(&cm("a")).await, Err(ClusterError::Transport(_))));
        c.create(&cm("a")).await.unwrap();
        c.create(&cm("b")).await.unwrap();
        assert_eq!(c.calls_for(Verb::Create).len(), 3);

        let mut sel = BTreeMap::new();
        c.set_labels(&cm_ref("b"), &[("team", "x")]);
        sel.insert("team".to_string(), "x".to_string());
        let listed = c.list("v1", "ConfigMap", Some("ns"), &sel).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["metadata"]["name"], json!("b"));
    }
}
