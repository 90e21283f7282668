//! Skiff persistence: the work item store.
//!
//! Every write goes through one mutex per store, so status writes for an item are
//! applied in the order they are issued. Removing the last finalizer from an item
//! that is being deleted purges it together with its exports.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use skiff_core::{ExportReference, TargetSpec, WorkItem, WorkItemKey, WorkItemSpec, WorkItemStatus};

mod sqlite;

pub use sqlite::{default_db_path, SqliteStore};

pub trait WorkItemStore: Send + Sync {
    fn get(&self, key: &WorkItemKey) -> Result<Option<WorkItem>>;
    fn list_keys(&self) -> Result<Vec<WorkItemKey>>;
    /// Create the item or replace its spec. The generation moves only when the spec changes.
    fn upsert_spec(&self, key: &WorkItemKey, spec: WorkItemSpec) -> Result<WorkItem>;
    /// Persist annotations, finalizers and deletion timestamp of `item`.
    /// Returns `None` when this purged the item.
    fn update_meta(&self, item: &WorkItem) -> Result<Option<WorkItem>>;
    fn write_status(&self, key: &WorkItemKey, status: &WorkItemStatus) -> Result<()>;
    /// Mark the item for deletion. Returns false when it does not exist.
    fn request_deletion(&self, key: &WorkItemKey, now: DateTime<Utc>) -> Result<bool>;
    fn annotate(&self, key: &WorkItemKey, annotations: &BTreeMap<String, String>) -> Result<()>;
    fn put_export(&self, key: &WorkItemKey, values: &Json) -> Result<ExportReference>;
    fn get_export(&self, r: &ExportReference) -> Result<Option<Json>>;
    fn put_target(&self, namespace: &str, name: &str, spec: &TargetSpec) -> Result<()>;
    fn get_target(&self, namespace: &str, name: &str) -> Result<Option<TargetSpec>>;
}

pub fn export_reference(key: &WorkItemKey) -> ExportReference {
    ExportReference { namespace: key.namespace.clone(), name: format!("{}-export", key.name) }
}

fn with_spec(existing: Option<WorkItem>, key: &WorkItemKey, spec: WorkItemSpec) -> WorkItem {
    match existing {
        None => WorkItem::new(&key.namespace, &key.name, spec),
        Some(mut item) => {
            if item.spec != spec {
                item.spec = spec;
                item.generation += 1;
            }
            item
        }
    }
}

fn with_meta(mut stored: WorkItem, item: &WorkItem) -> Option<WorkItem> {
    stored.annotations = item.annotations.clone();
    stored.finalizers = item.finalizers.clone();
    stored.deletion_timestamp = stored.deletion_timestamp.or(item.deletion_timestamp);
    purge_if_released(stored)
}

fn purge_if_released(item: WorkItem) -> Option<WorkItem> {
    if item.is_deleting() && item.finalizers.is_empty() {
        None
    } else {
        Some(item)
    }
}

fn missing(key: &WorkItemKey) -> anyhow::Error {
    anyhow!("work item {} not found", key)
}

#[derive(Default)]
struct MemInner {
    items: BTreeMap<WorkItemKey, WorkItem>,
    exports: BTreeMap<(String, String), Json>,
    targets: BTreeMap<(String, String), TargetSpec>,
    status_writes: usize,
    fail_status_writes: bool,
}

/// In-process store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemInner>> {
        self.inner.lock().map_err(|_| anyhow!("memory store lock poisoned"))
    }

    /// Number of successful status writes so far.
    pub fn status_writes(&self) -> usize {
        self.inner.lock().map(|g| g.status_writes).unwrap_or(0)
    }

    /// Make every following status write fail.
    pub fn fail_status_writes(&self, fail: bool) {
        if let Ok(mut g) = self.inner.lock() {
            g.fail_status_writes = fail;
        }
    }

    /// Store an item as is, bypassing generation bookkeeping.
    pub fn insert(&self, item: WorkItem) -> Result<()> {
        self.lock()?.items.insert(item.key(), item);
        Ok(())
    }
}

impl WorkItemStore for MemoryStore {
    fn get(&self, key: &WorkItemKey) -> Result<Option<WorkItem>> {
        Ok(self.lock()?.items.get(key).cloned())
    }

    fn list_keys(&self) -> Result<Vec<WorkItemKey>> {
        Ok(self.lock()?.items.keys().cloned().collect())
    }

    fn upsert_spec(&self, key: &WorkItemKey, spec: WorkItemSpec) -> Result<WorkItem> {
        let mut g = self.lock()?;
        let item = with_spec(g.items.get(key).cloned(), key, spec);
        g.items.insert(key.clone(), item.clone());
        Ok(item)
    }

    fn update_meta(&self, item: &WorkItem) -> Result<Option<WorkItem>> {
        let key = item.key();
        let mut g = self.lock()?;
        let stored = g.items.remove(&key).ok_or_else(|| missing(&key))?;
        match with_meta(stored, item) {
            Some(next) => {
                g.items.insert(key, next.clone());
                Ok(Some(next))
            }
            None => {
                let r = export_reference(&key);
                g.exports.remove(&(r.namespace, r.name));
                Ok(None)
            }
        }
    }

    fn write_status(&self, key: &WorkItemKey, status: &WorkItemStatus) -> Result<()> {
        let mut g = self.lock()?;
        if g.fail_status_writes {
            return Err(anyhow!("status write rejected"));
        }
        let item = g.items.get_mut(key).ok_or_else(|| missing(key))?;
        item.status = status.clone();
        g.status_writes += 1;
        Ok(())
    }

    fn request_deletion(&self, key: &WorkItemKey, now: DateTime<Utc>) -> Result<bool> {
        let mut g = self.lock()?;
        let Some(mut item) = g.items.remove(key) else { return Ok(false) };
        item.deletion_timestamp.get_or_insert(now);
        if let Some(item) = purge_if_released(item) {
            g.items.insert(key.clone(), item);
        }
        Ok(true)
    }

    fn annotate(&self, key: &WorkItemKey, annotations: &BTreeMap<String, String>) -> Result<()> {
        let mut g = self.lock()?;
        let item = g.items.get_mut(key).ok_or_else(|| missing(key))?;
        item.annotations.extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn put_export(&self, key: &WorkItemKey, values: &Json) -> Result<ExportReference> {
        let r = export_reference(key);
        self.lock()?.exports.insert((r.namespace.clone(), r.name.clone()), values.clone());
        Ok(r)
    }

    fn get_export(&self, r: &ExportReference) -> Result<Option<Json>> {
        Ok(self.lock()?.exports.get(&(r.namespace.clone(), r.name.clone())).cloned())
    }

    fn put_target(&self, namespace: &str, name: &str, spec: &TargetSpec) -> Result<()> {
        self.lock()?.targets.insert((namespace.to_string(), name.to_string()), spec.clone());
        Ok(())
    }

    fn get_target(&self, namespace: &str, name: &str) -> Result<Option<TargetSpec>> {
        Ok(self.lock()?.targets.get(&(namespace.to_string(), name.to_string())).cloned())
    }
}
