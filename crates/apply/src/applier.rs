use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use serde_json::{Map, Value as Json};
use skiff_core::config::DeletionGroupDefinition;
use skiff_core::{
    ClusterError, DeployError, ManagedResource, ManifestEntry, ObjectRef, Policy, ProviderConfiguration, UpdateStrategy,
    OWNERSHIP_LABEL,
};
use skiff_guard::{Checkpoint, Guard};
use skiff_kubehub::{apply_merge_patch, TargetClient};
use tracing::{debug, info, warn};

use crate::{is_crd, ownership, strip_noisy, DeletionManager, Ownership};

pub const DEFAULT_PARALLELISM: usize = 16;

/// How one work item's manifests are written to the target.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Value of the ownership label; the work item's name.
    pub owner: String,
    pub update_strategy: UpdateStrategy,
    pub default_namespace: String,
    pub labels: BTreeMap<String, String>,
    pub parallelism: usize,
    /// Ordering for orphan deletion.
    pub deletion_groups: Vec<DeletionGroupDefinition>,
    pub poll_interval: Duration,
}

impl ApplyOptions {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            update_strategy: UpdateStrategy::default(),
            default_namespace: "default".to_string(),
            labels: BTreeMap::new(),
            parallelism: DEFAULT_PARALLELISM,
            deletion_groups: Vec::new(),
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn from_config(owner: impl Into<String>, cfg: &ProviderConfiguration) -> Self {
        Self {
            update_strategy: cfg.update_strategy,
            default_namespace: cfg.default_namespace().to_string(),
            labels: cfg.labels.clone(),
            deletion_groups: cfg.deletion_groups_during_update.clone(),
            ..Self::new(owner)
        }
    }

    pub fn with_parallelism(mut self, n: usize) -> Self {
        self.parallelism = n.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_update_strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.update_strategy = strategy;
        self
    }
}

/// Outcome of one apply pass.
///
/// `managed` is always the list to persist, also when `error` is set: on failure it
/// holds everything applied in this pass plus every previously owned object that was
/// not re-applied, so nothing already owned drops out of the record.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub managed: Vec<ManagedResource>,
    pub error: Option<DeployError>,
}

impl ApplyReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<Vec<ManagedResource>, DeployError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.managed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wave {
    Crds,
    ClusterScoped,
    Namespaced,
}

const WAVES: [Wave; 3] = [Wave::Crds, Wave::ClusterScoped, Wave::Namespaced];

struct Prepared {
    policy: Policy,
    object: Json,
    resource: ObjectRef,
    wave: Wave,
    annotate_before_create: BTreeMap<String, String>,
    annotate_before_delete: BTreeMap<String, String>,
}

impl Prepared {
    /// Full object for a replace over `live`; creation annotations are kept.
    fn replacement(&self, live: &Json) -> Json {
        let mut obj = self.object.clone();
        annotate(&mut obj, &self.annotate_before_create);
        carry_server_fields(&mut obj, live);
        obj
    }

    fn record(&self) -> ManagedResource {
        ManagedResource {
            policy: self.policy,
            resource: self.resource.clone(),
            annotate_before_delete: self.annotate_before_delete.clone(),
        }
    }
}

pub struct ObjectApplier<'a> {
    client: &'a dyn TargetClient,
    guard: &'a Guard,
    opts: ApplyOptions,
}

impl<'a> ObjectApplier<'a> {
    pub fn new(client: &'a dyn TargetClient, guard: &'a Guard, opts: ApplyOptions) -> Self {
        Self { client, guard, opts }
    }

    /// Apply `entries` and delete objects of `previous` that are no longer desired.
    ///
    /// CRDs go first, then cluster-scoped objects, then namespaced ones. Within a wave
    /// objects are written concurrently and a failing entry does not stop the others.
    /// Orphans are only cleaned up when every entry succeeded.
    pub async fn apply(&self, entries: &[ManifestEntry], previous: &[ManagedResource]) -> ApplyReport {
        if let Err(e) = self.guard.check(Checkpoint::ProcessManifests).await {
            return ApplyReport { managed: previous.to_vec(), error: Some(e) };
        }
        let (prepared, ignored, mut errors) = self.prepare(entries).await;
        let applied = Mutex::new(Vec::with_capacity(prepared.len()));
        let failed = Mutex::new(Vec::new());
        for wave in WAVES {
            let batch: Vec<&Prepared> = prepared.iter().filter(|p| p.wave == wave).collect();
            if batch.is_empty() {
                continue;
            }
            debug!(owner = %self.opts.owner, wave = ?wave, count = batch.len(), "applying wave");
            stream::iter(batch)
                .for_each_concurrent(self.opts.parallelism, |p| {
                    let (applied, failed) = (&applied, &failed);
                    async move {
                        match self.apply_one(p).await {
                            Ok(rec) => lock(applied).push(rec),
                            Err(e) => {
                                counter!("apply_err", 1u64);
                                warn!(resource = %p.resource, error = %e, "apply failed");
                                lock(failed).push(e);
                            }
                        }
                    }
                })
                .await;
            if lock(&failed).iter().any(|e| e.is_timeout() || e.is_interrupted()) {
                break;
            }
        }
        errors.extend(into_inner(failed));
        let mut managed = into_inner(applied);

        if !errors.is_empty() {
            for prev in previous {
                if !managed.iter().any(|m| m.resource.same_object(&prev.resource)) {
                    managed.push(prev.clone());
                }
            }
            sort_records(&mut managed);
            return ApplyReport { managed, error: DeployError::aggregate(errors) };
        }

        let orphans: Vec<ManagedResource> = previous
            .iter()
            .filter(|p| p.policy.deletes())
            .filter(|p| !managed.iter().any(|m| m.resource.same_object(&p.resource)))
            .filter(|p| !ignored.iter().any(|i| loosely_same(i, &p.resource)))
            .cloned()
            .collect();
        let mut error = None;
        if !orphans.is_empty() {
            info!(owner = %self.opts.owner, count = orphans.len(), "deleting orphaned objects");
            let report = DeletionManager::new(self.client, self.guard, self.opts.owner.clone())
                .with_groups(self.opts.deletion_groups.clone())
                .with_checkpoint(Checkpoint::CleanupOrphaned)
                .with_poll_interval(self.opts.poll_interval)
                .with_parallelism(self.opts.parallelism)
                .delete(&orphans)
                .await;
            counter!("orphans_deleted_total", (orphans.len() - report.remaining.len()) as u64);
            managed.extend(report.remaining);
            error = report.error;
        }
        sort_records(&mut managed);
        ApplyReport { managed, error }
    }

    /// Resolve scope, namespace and labels of every entry. Ignored entries only
    /// contribute their identity.
    async fn prepare(&self, entries: &[ManifestEntry]) -> (Vec<Prepared>, Vec<ObjectRef>, Vec<DeployError>) {
        let mut prepared = Vec::with_capacity(entries.len());
        let mut ignored = Vec::new();
        let mut errors = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            let Some(mut resource) = ObjectRef::from_object(&entry.manifest) else {
                errors.push(DeployError::Object(format!("manifests[{}]: apiVersion, kind and metadata.name are required", i)));
                continue;
            };
            if entry.policy == Policy::Ignore {
                ignored.push(resource);
                continue;
            }
            let namespaced = match self.client.is_namespaced(&resource.api_version, &resource.kind).await {
                Ok(n) => n,
                Err(e) if e.is_gone() => match scope_from_manifests(entries, &resource) {
                    Some(n) => n,
                    None => {
                        errors.push(DeployError::cluster("resolve scope", &resource, e));
                        continue;
                    }
                },
                Err(e) => {
                    errors.push(DeployError::cluster("resolve scope", &resource, e));
                    continue;
                }
            };
            let mut object = entry.manifest.clone();
            let Some(meta) = object_field(&mut object, "metadata") else {
                errors.push(DeployError::Object(format!("manifests[{}]: metadata must be an object", i)));
                continue;
            };
            if namespaced {
                if resource.namespace.is_none() {
                    meta.insert("namespace".into(), Json::String(self.opts.default_namespace.clone()));
                    resource.namespace = Some(self.opts.default_namespace.clone());
                }
            } else {
                meta.remove("namespace");
                resource.namespace = None;
            }
            if let Some(labels) = object_field(&mut object, "metadata").and_then(|m| object_field_in(m, "labels")) {
                for (k, v) in &self.opts.labels {
                    labels.insert(k.clone(), Json::String(v.clone()));
                }
                labels.insert(OWNERSHIP_LABEL.into(), Json::String(self.opts.owner.clone()));
            }
            let wave = if is_crd(&resource) {
                Wave::Crds
            } else if namespaced {
                Wave::Namespaced
            } else {
                Wave::ClusterScoped
            };
            prepared.push(Prepared {
                policy: entry.policy,
                object,
                resource,
                wave,
                annotate_before_create: entry.annotate_before_create.clone(),
                annotate_before_delete: entry.annotate_before_delete.clone(),
            });
        }
        (prepared, ignored, errors)
    }

    async fn apply_one(&self, p: &Prepared) -> Result<ManagedResource, DeployError> {
        self.guard.check(Checkpoint::ApplyManifests).await?;
        let t0 = Instant::now();
        let live = self.client.get(&p.resource).await.map_err(|e| DeployError::cluster("get", &p.resource, e))?;
        let Some(live) = live else {
            let mut obj = p.object.clone();
            annotate(&mut obj, &p.annotate_before_create);
            self.client.create(&obj).await.map_err(|e| DeployError::cluster("create", &p.resource, e))?;
            counter!("apply_objects_total", 1u64);
            histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            info!(resource = %p.resource, policy = p.policy.as_str(), "created");
            return Ok(p.record());
        };

        let owner = ownership(&live, &self.opts.owner);
        let mutate = match p.policy {
            Policy::Ignore => false,
            Policy::Fallback => owner == Ownership::Ours,
            Policy::Manage | Policy::Keep | Policy::Immutable => {
                if let Ownership::Foreign(other) = owner {
                    return Err(DeployError::ForeignOwner { resource: p.resource.clone(), owner: other });
                }
                p.policy != Policy::Immutable
            }
        };
        if !mutate {
            debug!(resource = %p.resource, policy = p.policy.as_str(), "existing object left untouched");
            return Ok(p.record());
        }
        if self.update(p, live).await? {
            counter!("apply_objects_total", 1u64);
            histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
            info!(resource = %p.resource, strategy = ?self.opts.update_strategy, "updated");
        } else {
            counter!("apply_noop_total", 1u64);
            debug!(resource = %p.resource, "unchanged");
        }
        Ok(p.record())
    }

    /// Write `p` over `live`. Returns false when the live object already matches.
    async fn update(&self, p: &Prepared, live: Json) -> Result<bool, DeployError> {
        match self.opts.update_strategy {
            UpdateStrategy::Update => {
                let obj = p.replacement(&live);
                if strip_noisy(obj.clone()) == strip_noisy(live) {
                    return Ok(false);
                }
                match self.client.replace(&obj).await {
                    Ok(_) => Ok(true),
                    Err(ClusterError::Conflict(msg)) => {
                        debug!(resource = %p.resource, conflict = %msg, "replace conflicted; retrying on fresh copy");
                        let fresh = self
                            .client
                            .get(&p.resource)
                            .await
                            .map_err(|e| DeployError::cluster("get", &p.resource, e))?
                            .ok_or_else(|| {
                                DeployError::cluster("update", &p.resource, ClusterError::NotFound(p.resource.to_string()))
                            })?;
                        let obj = p.replacement(&fresh);
                        self.client.replace(&obj).await.map_err(|e| DeployError::cluster("update", &p.resource, e))?;
                        Ok(true)
                    }
                    Err(e) => Err(DeployError::cluster("update", &p.resource, e)),
                }
            }
            UpdateStrategy::Patch => {
                let mut merged = live.clone();
                apply_merge_patch(&mut merged, &p.object);
                if strip_noisy(merged) == strip_noisy(live) {
                    return Ok(false);
                }
                self.client
                    .merge_patch(&p.resource, &p.object)
                    .await
                    .map_err(|e| DeployError::cluster("patch", &p.resource, e))?;
                Ok(true)
            }
        }
    }
}

/// Scope of a kind defined by a CRD in the same manifest list, for kinds the cluster
/// does not serve yet.
fn scope_from_manifests(entries: &[ManifestEntry], r: &ObjectRef) -> Option<bool> {
    entries.iter().find_map(|e| {
        let m = &e.manifest;
        if m.get("kind").and_then(|k| k.as_str()) != Some("CustomResourceDefinition") {
            return None;
        }
        let spec = m.get("spec")?;
        let group = spec.get("group").and_then(|g| g.as_str())?;
        let kind = spec.get("names").and_then(|n| n.get("kind")).and_then(|k| k.as_str())?;
        if group != r.group() || kind != r.kind {
            return None;
        }
        Some(spec.get("scope").and_then(|s| s.as_str()) != Some("Cluster"))
    })
}

/// Fields a full replace must carry over from the live object.
fn carry_server_fields(obj: &mut Json, live: &Json) {
    let live_meta = live.get("metadata");
    if let Some(rv) = live_meta.and_then(|m| m.get("resourceVersion")).cloned() {
        if let Some(meta) = object_field(obj, "metadata") {
            meta.insert("resourceVersion".into(), rv);
        }
    }
    let is_service = obj.get("kind").and_then(|k| k.as_str()) == Some("Service")
        && obj.get("apiVersion").and_then(|v| v.as_str()) == Some("v1");
    if is_service {
        let live_spec = live.get("spec");
        if let Some(spec) = object_field(obj, "spec") {
            for key in ["clusterIP", "clusterIPs"] {
                if !spec.contains_key(key) {
                    if let Some(v) = live_spec.and_then(|s| s.get(key)) {
                        spec.insert(key.into(), v.clone());
                    }
                }
            }
        }
    }
}

fn annotate(obj: &mut Json, annotations: &BTreeMap<String, String>) {
    if annotations.is_empty() {
        return;
    }
    if let Some(target) = object_field(obj, "metadata").and_then(|m| object_field_in(m, "annotations")) {
        for (k, v) in annotations {
            target.insert(k.clone(), Json::String(v.clone()));
        }
    }
}

fn object_field<'v>(v: &'v mut Json, key: &str) -> Option<&'v mut Map<String, Json>> {
    object_field_in(v.as_object_mut()?, key)
}

fn object_field_in<'v>(m: &'v mut Map<String, Json>, key: &str) -> Option<&'v mut Map<String, Json>> {
    let slot = m.entry(key.to_string()).or_insert_with(|| Json::Object(Map::new()));
    if !slot.is_object() {
        *slot = Json::Object(Map::new());
    }
    slot.as_object_mut()
}

/// Manifest identity against a record; a manifest without namespace matches any.
fn loosely_same(manifest: &ObjectRef, record: &ObjectRef) -> bool {
    manifest.group() == record.group()
        && manifest.kind == record.kind
        && manifest.name == record.name
        && (manifest.namespace.is_none() || manifest.namespace == record.namespace)
}

fn sort_records(records: &mut Vec<ManagedResource>) {
    records.sort_by(|a, b| a.resource.cmp(&b.resource));
    records.dedup_by(|a, b| a.resource == b.resource);
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn into_inner<T>(m: Mutex<T>) -> T {
    m.into_inner().unwrap_or_else(|p| p.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;
    use skiff_core::{ErrorClass, Timeout};
    use skiff_guard::{Deadlines, NoInterruption};
    use skiff_kubehub::{MemoryCluster, Verb};
    use std::sync::Arc;

    fn cm(name: &str, data: &str) -> Json {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}, "data": {"k": data}})
    }

    fn cm_ref(name: &str) -> ObjectRef {
        ObjectRef::new("v1", "ConfigMap", Some("default"), name)
    }

    fn entry(policy: Policy, manifest: Json) -> ManifestEntry {
        ManifestEntry::new(policy, manifest)
    }

    async fn run(cluster: &MemoryCluster, opts: ApplyOptions, entries: &[ManifestEntry], prev: &[ManagedResource]) -> ApplyReport {
        let guard = Guard::relaxed();
        ObjectApplier::new(cluster, &guard, opts).apply(entries, prev).await
    }

    #[tokio::test]
    async fn create_sets_owner_label_and_default_namespace() {
        let cluster = MemoryCluster::new();
        let mut opts = ApplyOptions::new("item-a");
        opts.labels.insert("team".into(), "x".into());
        let report = run(&cluster, opts, &[entry(Policy::Manage, cm("a", "1"))], &[]).await;
        assert!(report.is_ok(), "{:?}", report.error);
        assert_eq!(report.managed, vec![ManagedResource::new(Policy::Manage, cm_ref("a"))]);
        let live = cluster.object(&cm_ref("a")).unwrap();
        assert_eq!(live["metadata"]["labels"][OWNERSHIP_LABEL], json!("item-a"));
        assert_eq!(live["metadata"]["labels"]["team"], json!("x"));
        assert_eq!(live["metadata"]["namespace"], json!("default"));
    }

    #[tokio::test]
    async fn second_apply_issues_no_writes() {
        let cluster = MemoryCluster::new();
        let entries = [entry(Policy::Manage, cm("a", "1")), entry(Policy::Keep, cm("b", "1"))];
        let first = run(&cluster, ApplyOptions::new("w"), &entries, &[]).await;
        cluster.clear_journal();
        let second = run(&cluster, ApplyOptions::new("w"), &entries, &first.managed).await;
        assert!(second.is_ok());
        assert_eq!(first.managed, second.managed);
        assert!(cluster.calls_for(Verb::Replace).is_empty());
        assert!(cluster.calls_for(Verb::Create).is_empty());
        assert!(cluster.calls_for(Verb::Delete).is_empty());
    }

    #[tokio::test]
    async fn creation_annotations_do_not_force_a_replace() {
        let cluster = MemoryCluster::new();
        let mut e = entry(Policy::Manage, cm("a", "1"));
        e.annotate_before_create.insert("example.com/created-by".into(), "skiff".into());
        let first = run(&cluster, ApplyOptions::new("w"), &[e.clone()], &[]).await;
        assert!(first.is_ok(), "{:?}", first.error);
        cluster.clear_journal();
        let second = run(&cluster, ApplyOptions::new("w"), &[e.clone()], &first.managed).await;
        assert!(second.is_ok(), "{:?}", second.error);
        assert!(cluster.calls_for(Verb::Replace).is_empty());
        let live = cluster.object(&cm_ref("a")).unwrap();
        assert_eq!(live["metadata"]["annotations"]["example.com/created-by"], json!("skiff"));

        e.manifest["data"]["k"] = json!("2");
        let third = run(&cluster, ApplyOptions::new("w"), &[e], &second.managed).await;
        assert!(third.is_ok(), "{:?}", third.error);
        assert_eq!(cluster.calls_for(Verb::Replace), vec![cm_ref("a")]);
        let live = cluster.object(&cm_ref("a")).unwrap();
        assert_eq!(live["data"]["k"], json!("2"));
        assert_eq!(live["metadata"]["annotations"]["example.com/created-by"], json!("skiff"));
    }

    #[tokio::test]
    async fn changed_manifest_is_replaced() {
        let cluster = MemoryCluster::new();
        let first = run(&cluster, ApplyOptions::new("w"), &[entry(Policy::Manage, cm("a", "1"))], &[]).await;
        run(&cluster, ApplyOptions::new("w"), &[entry(Policy::Manage, cm("a", "2"))], &first.managed).await;
        assert_eq!(cluster.object(&cm_ref("a")).unwrap()["data"]["k"], json!("2"));
        assert_eq!(cluster.calls_for(Verb::Replace), vec![cm_ref("a")]);
    }

    #[tokio::test]
    async fn patch_strategy_merges() {
        let cluster = MemoryCluster::new();
        let mut live = cm("a", "1");
        live["metadata"]["namespace"] = json!("default");
        live["metadata"]["labels"] = json!({OWNERSHIP_LABEL: "w"});
        live["data"]["extra"] = json!("kept");
        cluster.seed(live);
        let opts = ApplyOptions::new("w").with_update_strategy(UpdateStrategy::Patch);
        let report = run(&cluster, opts, &[entry(Policy::Manage, cm("a", "2"))], &[]).await;
        assert!(report.is_ok());
        let obj = cluster.object(&cm_ref("a")).unwrap();
        assert_eq!(obj["data"], json!({"k": "2", "extra": "kept"}));
        assert_eq!(cluster.calls_for(Verb::Patch), vec![cm_ref("a")]);
    }

    #[tokio::test]
    async fn orphan_is_deleted_and_list_replaced() {
        let cluster = MemoryCluster::new();
        let all = [entry(Policy::Manage, cm("a", "1")), entry(Policy::Manage, cm("b", "1")), entry(Policy::Manage, cm("c", "1"))];
        let first = run(&cluster, ApplyOptions::new("w"), &all, &[]).await;
        assert_eq!(first.managed.len(), 3);
        let second = run(&cluster, ApplyOptions::new("w"), &[all[0].clone(), all[2].clone()], &first.managed).await;
        assert!(second.is_ok(), "{:?}", second.error);
        let names: Vec<_> = second.managed.iter().map(|m| m.resource.name.as_str()).collect();
        assert_eq!(names, ["a", "c"]);
        assert!(!cluster.contains(&cm_ref("b")));
    }

    #[tokio::test]
    async fn keep_orphan_survives_but_is_forgotten() {
        let cluster = MemoryCluster::new();
        let first = run(&cluster, ApplyOptions::new("w"), &[entry(Policy::Keep, cm("k", "1"))], &[]).await;
        let second = run(&cluster, ApplyOptions::new("w"), &[entry(Policy::Manage, cm("a", "1"))], &first.managed).await;
        assert!(second.is_ok());
        assert!(cluster.contains(&cm_ref("k")));
        assert_eq!(second.managed, vec![ManagedResource::new(Policy::Manage, cm_ref("a"))]);
    }

    #[tokio::test]
    async fn ignored_entry_is_not_an_orphan() {
        let cluster = MemoryCluster::new();
        let first = run(&cluster, ApplyOptions::new("w"), &[entry(Policy::Manage, cm("a", "1"))], &[]).await;
        cluster.clear_journal();
        let second = run(&cluster, ApplyOptions::new("w"), &[entry(Policy::Ignore, cm("a", "9"))], &first.managed).await;
        assert!(second.is_ok());
        assert!(cluster.calls().is_empty(), "ignored object was touched: {:?}", cluster.calls());
        assert_eq!(cluster.object(&cm_ref("a")).unwrap()["data"]["k"], json!("1"));
    }

    #[tokio::test]
    async fn fallback_leaves_foreign_object_untouched() {
        let cluster = MemoryCluster::new();
        let mut live = cm("f", "theirs");
        live["metadata"]["namespace"] = json!("default");
        live["metadata"]["labels"] = json!({OWNERSHIP_LABEL: "other"});
        cluster.seed(live);
        let report = run(&cluster, ApplyOptions::new("w"), &[entry(Policy::Fallback, cm("f", "mine"))], &[]).await;
        assert!(report.is_ok());
        assert!(cluster.calls_for(Verb::Replace).is_empty());
        let obj = cluster.object(&cm_ref("f")).unwrap();
        assert_eq!(obj["data"]["k"], json!("theirs"));
        assert_eq!(obj["metadata"]["labels"][OWNERSHIP_LABEL], json!("other"));
    }

    #[tokio::test]
    async fn manage_refuses_foreign_object_but_applies_the_rest() {
        let cluster = MemoryCluster::new();
        let mut live = cm("x", "theirs");
        live["metadata"]["namespace"] = json!("default");
        live["metadata"]["labels"] = json!({OWNERSHIP_LABEL: "other"});
        cluster.seed(live);
        let prev = vec![ManagedResource::new(Policy::Manage, cm_ref("old"))];
        let report = run(
            &cluster,
            ApplyOptions::new("w"),
            &[entry(Policy::Manage, cm("x", "mine")), entry(Policy::Manage, cm("y", "1"))],
            &prev,
        )
        .await;
        let err = report.error.expect("foreign owner must fail");
        assert!(matches!(err, DeployError::ForeignOwner { ref owner, .. } if owner == "other"), "{}", err);
        assert_eq!(cluster.object(&cm_ref("x")).unwrap()["data"]["k"], json!("theirs"));
        assert!(cluster.contains(&cm_ref("y")));
        let names: Vec<_> = report.managed.iter().map(|m| m.resource.name.as_str()).collect();
        assert_eq!(names, ["old", "y"]);
        assert!(cluster.calls_for(Verb::Delete).is_empty());
    }

    #[tokio::test]
    async fn immutable_is_never_updated() {
        let cluster = MemoryCluster::new();
        let first = run(&cluster, ApplyOptions::new("w"), &[entry(Policy::Immutable, cm("i", "1"))], &[]).await;
        let second = run(&cluster, ApplyOptions::new("w"), &[entry(Policy::Immutable, cm("i", "2"))], &first.managed).await;
        assert!(second.is_ok());
        assert_eq!(cluster.object(&cm_ref("i")).unwrap()["data"]["k"], json!("1"));
        assert_eq!(second.managed, first.managed);
    }

    #[tokio::test]
    async fn partial_failure_keeps_successes_and_previous_records() {
        let cluster = MemoryCluster::new();
        cluster.fail_on(Verb::Create, Some("b"), ClusterError::Transport("connection reset".into()));
        let prev = vec![ManagedResource::new(Policy::Manage, cm_ref("stale"))];
        cluster.seed(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "stale", "namespace": "default"}}));
        let report = run(
            &cluster,
            ApplyOptions::new("w"),
            &[entry(Policy::Manage, cm("a", "1")), entry(Policy::Manage, cm("b", "1"))],
            &prev,
        )
        .await;
        let err = report.error.expect("create of b fails");
        assert_eq!(err.class(), ErrorClass::Transient);
        let names: Vec<_> = report.managed.iter().map(|m| m.resource.name.as_str()).collect();
        assert_eq!(names, ["a", "stale"]);
        assert!(cluster.contains(&cm_ref("stale")), "no cleanup after a failed pass");
    }

    #[tokio::test]
    async fn crds_then_cluster_scoped_then_namespaced() {
        let cluster = MemoryCluster::new();
        let crd = json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": "widgets.example.com"},
            "spec": {"group": "example.com", "names": {"kind": "Widget"}, "scope": "Namespaced"}
        });
        let role = json!({"apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRole", "metadata": {"name": "r"}});
        let entries = [entry(Policy::Manage, cm("a", "1")), entry(Policy::Manage, role), entry(Policy::Manage, crd)];
        let report = run(&cluster, ApplyOptions::new("w"), &entries, &[]).await;
        assert!(report.is_ok(), "{:?}", report.error);
        let kinds: Vec<_> = cluster.calls_for(Verb::Create).into_iter().map(|r| r.kind).collect();
        assert_eq!(kinds, ["CustomResourceDefinition", "ClusterRole", "ConfigMap"]);
        let role_rec = report.managed.iter().find(|m| m.resource.kind == "ClusterRole").unwrap();
        assert_eq!(role_rec.resource.namespace, None);
    }

    #[tokio::test]
    async fn service_cluster_ip_survives_replace() {
        let cluster = MemoryCluster::new();
        cluster.seed(json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": {"name": "svc", "namespace": "default", "labels": {OWNERSHIP_LABEL: "w"}},
            "spec": {"clusterIP": "10.0.0.7", "ports": [{"port": 80}]}
        }));
        let desired = json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "svc"}, "spec": {"ports": [{"port": 8080}]}});
        let report = run(&cluster, ApplyOptions::new("w"), &[entry(Policy::Manage, desired)], &[]).await;
        assert!(report.is_ok(), "{:?}", report.error);
        let live = cluster.object(&ObjectRef::new("v1", "Service", Some("default"), "svc")).unwrap();
        assert_eq!(live["spec"]["clusterIP"], json!("10.0.0.7"));
        assert_eq!(live["spec"]["ports"][0]["port"], json!(8080));
    }

    #[tokio::test]
    async fn expired_deadline_applies_nothing() {
        let cluster = MemoryCluster::new();
        let deadlines = Deadlines::new(Some(Utc::now() - ChronoDuration::minutes(10)), None, Timeout::from_secs(60));
        let guard = Guard::new(deadlines, Arc::new(NoInterruption));
        let prev = vec![ManagedResource::new(Policy::Manage, cm_ref("p"))];
        let report = ObjectApplier::new(&cluster, &guard, ApplyOptions::new("w"))
            .apply(&[entry(Policy::Manage, cm("a", "1"))], &prev)
            .await;
        assert_eq!(report.error.map(|e| e.class()), Some(ErrorClass::Timeout));
        assert_eq!(report.managed, prev);
        assert!(cluster.calls_for(Verb::Create).is_empty());
    }
}
