use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use metrics::counter;
use serde_json::json;
use skiff_core::config::{DeletionGroupDefinition, PredefinedGroupType};
use skiff_core::{DeployError, ManagedResource, ObjectRef, Policy};
use skiff_guard::{Checkpoint, Guard};
use skiff_kubehub::TargetClient;
use tracing::{debug, info, warn};

use crate::applier::DEFAULT_PARALLELISM;
use crate::{is_crd, ownership, Ownership};

/// What is left after a deletion run.
///
/// `remaining` holds the records that still have to be deleted and must stay in the
/// managed list. Records that were skipped because another owner holds the object,
/// or whose policy never deletes, are not part of it.
#[derive(Debug, Default)]
pub struct DeletionReport {
    pub remaining: Vec<ManagedResource>,
    pub error: Option<DeployError>,
}

impl DeletionReport {
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.remaining.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Target {
    record: ManagedResource,
    /// Objects listed by a delete-all group are deleted regardless of ownership.
    check_owner: bool,
}

enum Outcome {
    Gone,
    Skipped,
    Issued,
}

/// Deletes managed objects group by group.
pub struct DeletionManager<'a> {
    client: &'a dyn TargetClient,
    guard: &'a Guard,
    owner: String,
    groups: Vec<DeletionGroupDefinition>,
    checkpoint: Checkpoint,
    poll_interval: Duration,
    parallelism: usize,
}

impl<'a> DeletionManager<'a> {
    pub fn new(client: &'a dyn TargetClient, guard: &'a Guard, owner: impl Into<String>) -> Self {
        Self {
            client,
            guard,
            owner: owner.into(),
            groups: Vec::new(),
            checkpoint: Checkpoint::DeleteResources,
            poll_interval: Duration::from_secs(1),
            parallelism: DEFAULT_PARALLELISM,
        }
    }

    pub fn with_groups(mut self, groups: Vec<DeletionGroupDefinition>) -> Self {
        self.groups = groups;
        self
    }

    /// Checkpoint consulted before each group and each delete.
    pub fn with_checkpoint(mut self, cp: Checkpoint) -> Self {
        self.checkpoint = cp;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_parallelism(mut self, n: usize) -> Self {
        self.parallelism = n.max(1);
        self
    }

    /// Delete `records`. Each record belongs to the first group that matches it;
    /// groups run strictly in order and records no group matches go last. The first
    /// failing group stops the run.
    pub async fn delete(&self, records: &[ManagedResource]) -> DeletionReport {
        let mut pending: Vec<ManagedResource> = records.iter().filter(|r| r.policy.deletes()).cloned().collect();
        let skipped = records.len() - pending.len();
        if skipped > 0 {
            debug!(owner = %self.owner, skipped, "records with keep or ignore policy are not deleted");
        }

        let mut buckets: Vec<Vec<Target>> = vec![Vec::new(); self.groups.len()];
        let mut unmatched = Vec::new();
        for rec in &pending {
            let target = Target { record: rec.clone(), check_owner: true };
            match self.groups.iter().position(|g| group_matches(g, &rec.resource)) {
                Some(i) => buckets[i].push(target),
                None => unmatched.push(target),
            }
        }

        for (i, group) in self.groups.iter().enumerate() {
            if let Err(e) = self.guard.check(self.checkpoint).await {
                return DeletionReport { remaining: pending, error: Some(e) };
            }
            let mut targets = std::mem::take(&mut buckets[i]);
            if group.custom_resource_group.as_ref().map_or(false, |c| c.delete_all_resources) {
                match self.list_group(group).await {
                    Ok(listed) => {
                        for r in listed {
                            if !targets.iter().any(|t| t.record.resource.same_object(&r)) {
                                targets.push(Target { record: ManagedResource::new(Policy::Manage, r), check_owner: false });
                            }
                        }
                    }
                    Err(e) => return DeletionReport { remaining: pending, error: Some(e) },
                }
            }
            if targets.is_empty() {
                continue;
            }
            info!(owner = %self.owner, group = i, count = targets.len(), "deleting group");
            let (done, error) = self.delete_targets(&targets, group.force_delete, group.wait_for_deletion).await;
            pending.retain(|p| !done.iter().any(|d| d.same_object(&p.resource)));
            if error.is_some() {
                return DeletionReport { remaining: pending, error };
            }
        }

        if !unmatched.is_empty() {
            if let Err(e) = self.guard.check(self.checkpoint).await {
                return DeletionReport { remaining: pending, error: Some(e) };
            }
            let (done, error) = self.delete_targets(&unmatched, false, false).await;
            pending.retain(|p| !done.iter().any(|d| d.same_object(&p.resource)));
            return DeletionReport { remaining: pending, error };
        }
        DeletionReport { remaining: pending, error: None }
    }

    /// Delete all targets concurrently, then optionally wait until they are gone.
    /// Returns the references that need no further work.
    async fn delete_targets(&self, targets: &[Target], force: bool, wait: bool) -> (Vec<ObjectRef>, Option<DeployError>) {
        let done = Mutex::new(Vec::new());
        let issued = Mutex::new(Vec::new());
        let errors = Mutex::new(Vec::new());
        stream::iter(targets)
            .for_each_concurrent(self.parallelism, |t| {
                let (done, issued, errors) = (&done, &issued, &errors);
                async move {
                    let r = t.record.resource.clone();
                    match self.delete_one(t, force).await {
                        Ok(Outcome::Gone) | Ok(Outcome::Skipped) => push(done, r),
                        Ok(Outcome::Issued) => push(issued, r),
                        Err(e) => {
                            warn!(resource = %r, error = %e, "delete failed");
                            push(errors, e);
                        }
                    }
                }
            })
            .await;
        let mut done = take(done);
        let issued = take(issued);
        if let Some(e) = DeployError::aggregate(take(errors)) {
            done.extend(issued);
            return (done, Some(e));
        }
        if !wait {
            done.extend(issued);
            return (done, None);
        }
        let (gone, error) = self.wait_gone(issued).await;
        done.extend(gone);
        (done, error)
    }

    async fn delete_one(&self, t: &Target, force: bool) -> Result<Outcome, DeployError> {
        let r = &t.record.resource;
        self.guard.check(self.checkpoint).await?;
        let live = match self.client.get(r).await {
            Ok(Some(live)) => live,
            Ok(None) => return Ok(Outcome::Gone),
            Err(e) if e.is_gone() => return Ok(Outcome::Gone),
            Err(e) => return Err(DeployError::cluster("get", r, e)),
        };
        if t.check_owner {
            match (t.record.policy, ownership(&live, &self.owner)) {
                (_, Ownership::Foreign(other)) => {
                    info!(resource = %r, owner = %other, "owned by another work item; not deleted");
                    return Ok(Outcome::Skipped);
                }
                (Policy::Fallback, Ownership::Unowned) => {
                    info!(resource = %r, "fallback object lost its ownership label; not deleted");
                    return Ok(Outcome::Skipped);
                }
                _ => {}
            }
        }
        if !t.record.annotate_before_delete.is_empty() {
            let patch = json!({"metadata": {"annotations": t.record.annotate_before_delete}});
            match self.client.merge_patch(r, &patch).await {
                Ok(_) => {}
                Err(e) if e.is_gone() => return Ok(Outcome::Gone),
                Err(e) => return Err(DeployError::cluster("annotate", r, e)),
            }
        }
        match self.client.delete(r).await {
            Ok(()) => {}
            Err(e) if e.is_gone() => return Ok(Outcome::Gone),
            Err(e) => return Err(DeployError::cluster("delete", r, e)),
        }
        counter!("deletion_issued_total", 1u64);
        debug!(resource = %r, "delete issued");
        if force {
            match self.client.get(r).await {
                Ok(Some(obj)) if has_finalizers(&obj) => {
                    let patch = json!({"metadata": {"finalizers": null}});
                    match self.client.merge_patch(r, &patch).await {
                        Ok(_) => info!(resource = %r, "finalizers removed"),
                        Err(e) if e.is_gone() => return Ok(Outcome::Gone),
                        Err(e) => return Err(DeployError::cluster("remove finalizers", r, e)),
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) => return Ok(Outcome::Gone),
                Err(e) if e.is_gone() => return Ok(Outcome::Gone),
                Err(e) => return Err(DeployError::cluster("get", r, e)),
            }
        }
        Ok(Outcome::Issued)
    }

    /// Poll until every reference is gone or the guard stops the wait.
    async fn wait_gone(&self, mut left: Vec<ObjectRef>) -> (Vec<ObjectRef>, Option<DeployError>) {
        let mut gone = Vec::new();
        loop {
            let mut still = Vec::new();
            for r in left {
                match self.client.get(&r).await {
                    Ok(None) => gone.push(r),
                    Err(e) if e.is_gone() => gone.push(r),
                    Ok(Some(_)) => still.push(r),
                    Err(e) => {
                        warn!(resource = %r, error = %e, "checking deletion failed");
                        still.push(r);
                    }
                }
            }
            left = still;
            if left.is_empty() {
                return (gone, None);
            }
            debug!(owner = %self.owner, waiting = left.len(), "waiting for deletion");
            if let Err(e) = self.guard.check(Checkpoint::WaitForDeletion).await {
                return (gone, Some(e));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Live objects of every type of a delete-all group.
    async fn list_group(&self, group: &DeletionGroupDefinition) -> Result<Vec<ObjectRef>, DeployError> {
        let Some(custom) = &group.custom_resource_group else { return Ok(Vec::new()) };
        let mut out = Vec::new();
        for t in &custom.resources {
            let items = match self.client.list(&t.api_version, &t.kind, None, &BTreeMap::new()).await {
                Ok(items) => items,
                Err(e) if e.is_gone() => continue,
                Err(e) => {
                    let probe = ObjectRef::new(t.api_version.clone(), t.kind.clone(), None, "");
                    return Err(DeployError::cluster("list", &probe, e));
                }
            };
            out.extend(items.iter().filter_map(ObjectRef::from_object).filter(|r| t.matches(r)));
        }
        Ok(out)
    }
}

fn group_matches(group: &DeletionGroupDefinition, r: &ObjectRef) -> bool {
    if let Some(p) = &group.predefined_resource_group {
        return match p.group_type {
            None | Some(PredefinedGroupType::Empty) => false,
            Some(PredefinedGroupType::NamespacedResources) => r.namespace.is_some(),
            Some(PredefinedGroupType::ClusterScopedResources) => r.namespace.is_none() && !is_crd(r),
            Some(PredefinedGroupType::Crds) => is_crd(r),
        };
    }
    group.custom_resource_group.as_ref().map_or(false, |c| c.resources.iter().any(|t| t.matches(r)))
}

fn has_finalizers(obj: &serde_json::Value) -> bool {
    obj.get("metadata").and_then(|m| m.get("finalizers")).and_then(|f| f.as_array()).map_or(false, |a| !a.is_empty())
}

fn push<T>(m: &Mutex<Vec<T>>, v: T) {
    m.lock().unwrap_or_else(|p| p.into_inner()).push(v);
}

fn take<T>(m: Mutex<Vec<T>>) -> Vec<T> {
    m.into_inner().unwrap_or_else(|p| p.into_inner())
}
