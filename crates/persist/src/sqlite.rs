use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value as Json;
use skiff_core::{ExportReference, TargetSpec, WorkItem, WorkItemKey, WorkItemSpec, WorkItemStatus};
use tracing::debug;

use crate::{export_reference, missing, purge_if_released, with_meta, with_spec, WorkItemStore};

/// SQLite-backed store. Items are kept as JSON documents keyed by namespace and name.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("SKIFF_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = Instant::now();
        let db = Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS work_items (
                namespace TEXT NOT NULL,
                name      TEXT NOT NULL,
                item      TEXT NOT NULL,
                updated   INTEGER NOT NULL,
                PRIMARY KEY (namespace, name)
            );
            CREATE TABLE IF NOT EXISTS exports (
                namespace TEXT NOT NULL,
                name      TEXT NOT NULL,
                value     TEXT NOT NULL,
                PRIMARY KEY (namespace, name)
            );
            CREATE TABLE IF NOT EXISTS targets (
                namespace TEXT NOT NULL,
                name      TEXT NOT NULL,
                spec      TEXT NOT NULL,
                PRIMARY KEY (namespace, name)
            );",
        )
        .context("creating tables")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, "store opened");
        Ok(Self { db: Mutex::new(db) })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite store lock poisoned"))
    }
}

fn load(db: &Connection, key: &WorkItemKey) -> Result<Option<WorkItem>> {
    let raw: Option<String> = db
        .query_row(
            "SELECT item FROM work_items WHERE namespace = ?1 AND name = ?2",
            (&key.namespace, &key.name),
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s).with_context(|| format!("decoding work item {}", key))?)),
        None => Ok(None),
    }
}

fn save(db: &Connection, item: &WorkItem) -> Result<()> {
    let started = Instant::now();
    let doc = serde_json::to_string(item)?;
    db.execute(
        "INSERT INTO work_items(namespace, name, item, updated) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(namespace, name) DO UPDATE SET item = excluded.item, updated = excluded.updated",
        (&item.namespace, &item.name, &doc, Utc::now().timestamp()),
    )?;
    histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
    counter!("persist_put_total", 1u64);
    Ok(())
}

fn purge(db: &Connection, key: &WorkItemKey) -> Result<()> {
    let r = export_reference(key);
    db.execute("DELETE FROM work_items WHERE namespace = ?1 AND name = ?2", (&key.namespace, &key.name))?;
    db.execute("DELETE FROM exports WHERE namespace = ?1 AND name = ?2", (&r.namespace, &r.name))?;
    debug!(item = %key, "work item purged");
    Ok(())
}

impl WorkItemStore for SqliteStore {
    fn get(&self, key: &WorkItemKey) -> Result<Option<WorkItem>> {
        load(&*self.lock()?, key)
    }

    fn list_keys(&self) -> Result<Vec<WorkItemKey>> {
        let db = self.lock()?;
        let mut stmt = db.prepare("SELECT namespace, name FROM work_items ORDER BY namespace, name")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(WorkItemKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?));
        }
        Ok(out)
    }

    fn upsert_spec(&self, key: &WorkItemKey, spec: WorkItemSpec) -> Result<WorkItem> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        let item = with_spec(load(&tx, key)?, key, spec);
        save(&tx, &item)?;
        tx.commit()?;
        Ok(item)
    }

    fn update_meta(&self, item: &WorkItem) -> Result<Option<WorkItem>> {
        let key = item.key();
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        let stored = load(&tx, &key)?.ok_or_else(|| missing(&key))?;
        let next = with_meta(stored, item);
        match &next {
            Some(next) => save(&tx, next)?,
            None => purge(&tx, &key)?,
        }
        tx.commit()?;
        Ok(next)
    }

    fn write_status(&self, key: &WorkItemKey, status: &WorkItemStatus) -> Result<()> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        let mut item = load(&tx, key)?.ok_or_else(|| missing(key))?;
        item.status = status.clone();
        save(&tx, &item)?;
        tx.commit()?;
        Ok(())
    }

    fn request_deletion(&self, key: &WorkItemKey, now: DateTime<Utc>) -> Result<bool> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        let Some(mut item) = load(&tx, key)? else { return Ok(false) };
        item.deletion_timestamp.get_or_insert(now);
        match purge_if_released(item) {
            Some(item) => save(&tx, &item)?,
            None => purge(&tx, key)?,
        }
        tx.commit()?;
        Ok(true)
    }

    fn annotate(&self, key: &WorkItemKey, annotations: &BTreeMap<String, String>) -> Result<()> {
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        let mut item = load(&tx, key)?.ok_or_else(|| missing(key))?;
        item.annotations.extend(annotations.iter().map(|(k, v)| (k.clone(), v.clone())));
        save(&tx, &item)?;
        tx.commit()?;
        Ok(())
    }

    fn put_export(&self, key: &WorkItemKey, values: &Json) -> Result<ExportReference> {
        let r = export_reference(key);
        let doc = serde_json::to_string(values)?;
        self.lock()?.execute(
            "INSERT INTO exports(namespace, name, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, name) DO UPDATE SET value = excluded.value",
            (&r.namespace, &r.name, &doc),
        )?;
        Ok(r)
    }

    fn get_export(&self, r: &ExportReference) -> Result<Option<Json>> {
        let raw: Option<String> = self
            .lock()?
            .query_row("SELECT value FROM exports WHERE namespace = ?1 AND name = ?2", (&r.namespace, &r.name), |row| row.get(0))
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).context("decoding export")).transpose()
    }

    fn put_target(&self, namespace: &str, name: &str, spec: &TargetSpec) -> Result<()> {
        let doc = serde_json::to_string(spec)?;
        self.lock()?.execute(
            "INSERT INTO targets(namespace, name, spec) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, name) DO UPDATE SET spec = excluded.spec",
            (namespace, name, &doc),
        )?;
        Ok(())
    }

    fn get_target(&self, namespace: &str, name: &str) -> Result<Option<TargetSpec>> {
        let raw: Option<String> = self
            .lock()?
            .query_row("SELECT spec FROM targets WHERE namespace = ?1 AND name = ?2", (namespace, name), |row| row.get(0))
            .optional()?;
        raw.map(|s| serde_json::from_str(&s).context("decoding target")).transpose()
    }
}

pub fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".skiff");
        let _ = std::fs::create_dir_all(&p);
        p.push("skiff.db");
        return p.to_string_lossy().to_string();
    }
    "skiff.db".to_string()
}
