//! Skiff export: reads configured values out of deployed objects and assembles them
//! into the work item's export document.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use futures::future::join_all;
use metrics::counter;
use serde_json::{json, Value as Json};
use skiff_core::config::{Export, Exports};
use skiff_core::jsonpath::{construct, merge_into, JsonPath, JsonPathError};
use skiff_core::{format_duration, DeployError, ObjectRef, Timeout};
use skiff_guard::{Checkpoint, Guard};
use skiff_kubehub::TargetClient;
use tracing::{debug, info, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Why one attempt produced no value.
enum Miss {
    /// The cluster may still catch up; retried until the export times out.
    Retry(String),
    Fatal(DeployError),
}

pub struct Exporter<'a> {
    client: &'a dyn TargetClient,
    guard: &'a Guard,
    default_timeout: Duration,
    initial_backoff: Duration,
}

impl<'a> Exporter<'a> {
    pub fn new(client: &'a dyn TargetClient, guard: &'a Guard) -> Self {
        Self { client, guard, default_timeout: DEFAULT_TIMEOUT, initial_backoff: Duration::from_millis(100) }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Evaluate every export concurrently and deep-merge the results. Exports without
    /// `fromResource` are skipped. All failures are reported together.
    pub async fn export(&self, exports: &Exports) -> Result<Json, DeployError> {
        let runs = exports
            .exports
            .iter()
            .filter(|e| e.from_resource.is_some())
            .map(|e| self.export_one(e, e.timeout.or(exports.default_timeout)));
        let mut out = json!({});
        let mut errors = Vec::new();
        for result in join_all(runs).await {
            match result {
                Ok(v) => merge_into(&mut out, v),
                Err(e) => {
                    counter!("export_err", 1u64);
                    errors.push(e);
                }
            }
        }
        match DeployError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }

    async fn export_one(&self, export: &Export, timeout: Option<Timeout>) -> Result<Json, DeployError> {
        let own = timeout.filter(|t| !t.is_disabled()).map_or(self.default_timeout, |t| t.duration());
        let timeout = match self.guard.check(Checkpoint::ReadExports).await? {
            Some(left) => left.min(own),
            None => own,
        };
        let deadline = Instant::now() + timeout;
        let mut backoff = self.initial_backoff;
        loop {
            self.guard.check_interrupted(Checkpoint::ReadExports).await?;
            let reason = match self.attempt(export).await {
                Ok(v) => {
                    info!(key = %export.key, "export read");
                    return Ok(v);
                }
                Err(Miss::Fatal(e)) => return Err(e),
                Err(Miss::Retry(reason)) => reason,
            };
            let now = Instant::now();
            if now >= deadline {
                warn!(key = %export.key, reason = %reason, "export timed out");
                return Err(DeployError::Timeout {
                    checkpoint: Checkpoint::ReadExports.as_str().to_string(),
                    message: format!("export {:?} not available within {}: {}", export.key, format_duration(timeout), reason),
                });
            }
            debug!(key = %export.key, reason = %reason, backoff = ?backoff, "export not available yet");
            tokio::time::sleep(backoff.min(deadline - now)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn attempt(&self, export: &Export) -> Result<Json, Miss> {
        let fatal = |message: String| Miss::Fatal(DeployError::Export { key: export.key.clone(), message });
        let Some(from) = &export.from_resource else {
            return Err(fatal("fromResource is required".into()));
        };
        let path = JsonPath::parse(&export.json_path).map_err(|e| fatal(e.to_string()))?;
        let mut value = self.read(from, &path).await?;

        if let Some(next) = &export.from_object_reference {
            let target = referenced(&value, from, &next.api_version, &next.kind).map_err(&fatal)?;
            let path = JsonPath::parse(&next.json_path).map_err(|e| fatal(e.to_string()))?;
            value = self.read(&target, &path).await?;
        }
        construct(&export.key, value).map_err(|e| fatal(e.to_string()))
    }

    async fn read(&self, r: &ObjectRef, path: &JsonPath) -> Result<Json, Miss> {
        let obj = match self.client.get(r).await {
            Ok(Some(obj)) => obj,
            Ok(None) => return Err(Miss::Retry(format!("{} not found", r))),
            Err(e) => return Err(Miss::Retry(format!("get {}: {}", r, e))),
        };
        match path.get(&obj) {
            Ok(v) => Ok(v),
            Err(JsonPathError::NotFound(p)) => Err(Miss::Retry(format!("{} has no value at {}", r, p))),
            Err(e) => Err(Miss::Retry(e.to_string())),
        }
    }
}

/// Object named by a `{name, namespace}` value; the namespace defaults to the one of
/// the object the value was read from.
fn referenced(value: &Json, from: &ObjectRef, api_version: &str, kind: &str) -> Result<ObjectRef, String> {
    let Some(map) = value.as_object() else {
        return Err(format!("unexpected reference {}, expected map with name and namespace", value));
    };
    let name = match map.get("name") {
        Some(Json::String(s)) => s.as_str(),
        Some(other) => return Err(format!("expected name {} to be a string", other)),
        None => return Err(format!("unexpected reference {}, expected map to have a name key", value)),
    };
    let namespace = match map.get("namespace") {
        Some(Json::String(s)) => Some(s.as_str()),
        Some(other) => return Err(format!("expected namespace {} to be a string", other)),
        None => from.namespace.as_deref(),
    };
    Ok(ObjectRef::new(api_version, kind, namespace, name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_core::config::FromObjectReference;
    use skiff_core::ErrorClass;
    use skiff_guard::InterruptFlag;
    use skiff_kubehub::MemoryCluster;
    use std::sync::Arc;

    fn cm_ref(name: &str) -> ObjectRef {
        ObjectRef::new("v1", "ConfigMap", Some("default"), name)
    }

    fn export(key: &str, path: &str, from: Option<ObjectRef>) -> Export {
        Export { key: key.into(), json_path: path.into(), from_resource: from, from_object_reference: None, timeout: None }
    }

    fn exports(list: Vec<Export>) -> Exports {
        Exports { default_timeout: Some(Timeout(Duration::from_millis(300))), exports: list }
    }

    fn seeded() -> MemoryCluster {
        let cluster = MemoryCluster::new();
        cluster.seed(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "conf", "namespace": "default"},
            "data": {"url": "https://db:5432", "user": "app"},
            "spec": {"secretRef": {"name": "creds"}}
        }));
        cluster.seed(json!({
            "apiVersion": "v1", "kind": "Secret",
            "metadata": {"name": "creds", "namespace": "default"},
            "data": {"password": "c2VjcmV0"}
        }));
        cluster
    }

    #[tokio::test]
    async fn values_are_constructed_and_merged() {
        let cluster = seeded();
        let guard = Guard::relaxed();
        let out = Exporter::new(&cluster, &guard)
            .export(&exports(vec![
                export("db.url", ".data.url", Some(cm_ref("conf"))),
                export("db.user", ".data.user", Some(cm_ref("conf"))),
                export("skipped", ".data.url", None),
            ]))
            .await
            .unwrap();
        assert_eq!(out, json!({"db": {"url": "https://db:5432", "user": "app"}}));
    }

    #[tokio::test]
    async fn follows_object_reference_in_source_namespace() {
        let cluster = seeded();
        let guard = Guard::relaxed();
        let mut e = export("password", ".spec.secretRef", Some(cm_ref("conf")));
        e.from_object_reference =
            Some(FromObjectReference { api_version: "v1".into(), kind: "Secret".into(), json_path: ".data.password".into() });
        let out = Exporter::new(&cluster, &guard).export(&exports(vec![e])).await.unwrap();
        assert_eq!(out, json!({"password": "c2VjcmV0"}));
    }

    #[tokio::test]
    async fn malformed_reference_fails_without_retry() {
        let cluster = seeded();
        let guard = Guard::relaxed();
        let mut e = export("password", ".data.url", Some(cm_ref("conf")));
        e.from_object_reference =
            Some(FromObjectReference { api_version: "v1".into(), kind: "Secret".into(), json_path: ".data.password".into() });
        let err = Exporter::new(&cluster, &guard).export(&exports(vec![e])).await.unwrap_err();
        assert!(matches!(err, DeployError::Export { .. }), "{}", err);
        assert!(err.to_string().contains("expected map"), "{}", err);
    }

    #[tokio::test]
    async fn missing_value_times_out() {
        let cluster = seeded();
        let guard = Guard::relaxed();
        let started = Instant::now();
        let err = Exporter::new(&cluster, &guard)
            .with_initial_backoff(Duration::from_millis(20))
            .export(&exports(vec![export("x", ".data.absent", Some(cm_ref("conf")))]))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Timeout);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn interruption_aborts_retries() {
        let cluster = seeded();
        let flag = Arc::new(InterruptFlag::default());
        flag.trigger();
        let guard = Guard::new(skiff_guard::Deadlines::unbounded(), flag);
        let err = Exporter::new(&cluster, &guard)
            .export(&exports(vec![export("x", ".data.url", Some(cm_ref("conf")))]))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Interrupted);
    }
}
