//! Skiff readiness: waits until managed objects satisfy the built-in workload
//! heuristics and the configured custom checks.
//!
//! Every check family polls on an interval until it passes or its timeout elapses.
//! Running out of time is reported as [`DeployError::Timeout`], never as a plain
//! not-ready error, so the reconciler can tell "too slow" from "broken".

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use metrics::counter;
use serde_json::Value as Json;
use skiff_core::config::{CustomReadinessCheck, Operator, ReadinessCheckConfiguration, RequirementSpec};
use skiff_core::jsonpath::{values_equal, JsonPath};
use skiff_core::{format_duration, DeployError, ManagedResource, ObjectRef, Timeout};
use skiff_guard::{Checkpoint, Guard};
use skiff_kubehub::TargetClient;
use tracing::{debug, info, warn};

mod workload;

pub use workload::has_heuristic;

/// Used when neither the check nor the readiness configuration names a timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

/// Result of one polling attempt.
enum Verdict {
    Ready,
    /// Worth another attempt; carries the reason shown if time runs out.
    NotReady(DeployError),
}

pub struct ReadinessEvaluator<'a> {
    client: &'a dyn TargetClient,
    guard: &'a Guard,
    poll_interval: Duration,
}

impl<'a> ReadinessEvaluator<'a> {
    pub fn new(client: &'a dyn TargetClient, guard: &'a Guard) -> Self {
        Self { client, guard, poll_interval: Duration::from_secs(5) }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run the default check (unless disabled) and then every enabled custom check.
    pub async fn check(&self, cfg: &ReadinessCheckConfiguration, managed: &[ManagedResource]) -> Result<(), DeployError> {
        if !cfg.disable_default {
            let refs: Vec<&ObjectRef> = managed
                .iter()
                .map(|m| &m.resource)
                .filter(|r| cfg.fail_on_missing_object || has_heuristic(r))
                .collect();
            if !refs.is_empty() {
                let timeout = self.timeout_for(cfg.timeout).await?;
                self.poll("default readiness check", timeout, || self.default_attempt(&refs, cfg.fail_on_missing_object))
                    .await?;
            }
        }
        for check in cfg.custom_readiness_checks.iter().filter(|c| !c.disabled) {
            let timeout = self.timeout_for(check.timeout.or(cfg.timeout)).await?;
            let what = format!("custom readiness check {:?}", check.name);
            self.poll(&what, timeout, || self.custom_attempt(check)).await?;
        }
        Ok(())
    }

    /// Own timeout (zero or unset falls back to [`DEFAULT_TIMEOUT`]), capped by what
    /// the guard leaves at the readiness checkpoint.
    async fn timeout_for(&self, own: Option<Timeout>) -> Result<Duration, DeployError> {
        let own = own.filter(|t| !t.is_disabled()).map_or(DEFAULT_TIMEOUT, |t| t.duration());
        let left = self.guard.check(Checkpoint::CheckReadiness).await?;
        Ok(left.map_or(own, |l| l.min(own)))
    }

    async fn poll<F, Fut>(&self, what: &str, timeout: Duration, mut attempt: F) -> Result<(), DeployError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Verdict, DeployError>>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.guard.check_interrupted(Checkpoint::CheckReadiness).await?;
            counter!("readiness_poll_total", 1u64);
            let reason = match attempt().await? {
                Verdict::Ready => {
                    info!(check = what, "ready");
                    return Ok(());
                }
                Verdict::NotReady(reason) => reason,
            };
            let now = Instant::now();
            if now >= deadline {
                counter!("readiness_timeout_total", 1u64);
                warn!(check = what, reason = %reason, "readiness timed out");
                return Err(DeployError::Timeout {
                    checkpoint: Checkpoint::CheckReadiness.as_str().to_string(),
                    message: format!("{} not satisfied within {}: {}", what, format_duration(timeout), reason),
                });
            }
            debug!(check = what, reason = %reason, "not ready yet");
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn default_attempt(&self, refs: &[&ObjectRef], fail_on_missing: bool) -> Result<Verdict, DeployError> {
        for r in refs {
            let obj = match self.client.get(r).await {
                Ok(Some(obj)) => obj,
                Ok(None) if fail_on_missing => return Ok(not_ready(r, "object not found")),
                Ok(None) => continue,
                Err(e) => return Ok(Verdict::NotReady(DeployError::cluster("get", r, e))),
            };
            match workload::check(r, &obj) {
                Ok(None) => {}
                Ok(Some(reason)) => return Ok(not_ready(r, &reason)),
                Err(e) => return Err(DeployError::Object(format!("{}: unexpected object shape: {}", r, e))),
            }
        }
        Ok(Verdict::Ready)
    }

    async fn custom_attempt(&self, check: &CustomReadinessCheck) -> Result<Verdict, DeployError> {
        let mut objects: Vec<(ObjectRef, Json)> = Vec::new();
        for r in &check.resources {
            match self.client.get(r).await {
                Ok(Some(obj)) => objects.push((r.clone(), obj)),
                Ok(None) => return Ok(not_ready(r, "object not found")),
                Err(e) => return Ok(Verdict::NotReady(DeployError::cluster("get", r, e))),
            }
        }
        if let Some(sel) = &check.label_selector {
            let listed = match self.client.list(&sel.api_version, &sel.kind, None, &sel.match_labels).await {
                Ok(items) => items,
                Err(e) => {
                    let probe = ObjectRef::new(sel.api_version.clone(), sel.kind.clone(), None, "");
                    return Ok(Verdict::NotReady(DeployError::cluster("list", &probe, e)));
                }
            };
            if listed.is_empty() {
                return Ok(Verdict::NotReady(DeployError::NotReady {
                    resource: format!("{}/{}", sel.api_version, sel.kind),
                    message: format!("no objects match labels {}", skiff_kubehub::label_selector(&sel.match_labels)),
                }));
            }
            for obj in listed {
                let r = ObjectRef::from_object(&obj)
                    .unwrap_or_else(|| ObjectRef::new(sel.api_version.clone(), sel.kind.clone(), None, "<unnamed>"));
                objects.push((r, obj));
            }
        }
        for (r, obj) in &objects {
            for req in &check.requirements {
                if let Some(reason) = unmet(req, obj)? {
                    return Ok(not_ready(r, &reason));
                }
            }
        }
        Ok(Verdict::Ready)
    }
}

fn not_ready(r: &ObjectRef, message: &str) -> Verdict {
    Verdict::NotReady(DeployError::NotReady { resource: r.to_string(), message: message.to_string() })
}

/// Why `req` does not hold for `obj`, or `None` when it does. Malformed requirements
/// are configuration errors.
pub fn unmet(req: &RequirementSpec, obj: &Json) -> Result<Option<String>, DeployError> {
    let path = JsonPath::parse(&req.json_path)
        .map_err(|e| DeployError::Configuration(format!("requirement {:?}: {}", req.json_path, e)))?;
    let found = path.find(obj);
    if found.is_empty() {
        return Ok(match req.operator {
            Operator::DoesNotExist => None,
            _ => Some(format!("field with JSON path {} does not exist", req.json_path)),
        });
    }
    let values = match req.operator {
        Operator::Exists => return Ok(None),
        Operator::DoesNotExist => return Ok(Some(format!("field with JSON path {} exists", req.json_path))),
        _ => req.parsed_values()?,
    };
    for field in found {
        let ok = match req.operator {
            Operator::Equals | Operator::DoubleEquals | Operator::In => values.iter().any(|v| values_equal(field, v)),
            Operator::NotEquals => values.first().map_or(true, |v| !values_equal(field, v)),
            Operator::NotIn => !values.iter().any(|v| values_equal(field, v)),
            Operator::Exists | Operator::DoesNotExist => true,
        };
        if !ok {
            return Ok(Some(format!("resource requirement is not fulfilled for field {}", req.json_path)));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn req(path: &str, op: Operator, values: &[Json]) -> RequirementSpec {
        RequirementSpec {
            json_path: path.to_string(),
            operator: op,
            values: values.iter().map(|v| json!({ "value": v })).collect(),
        }
    }

    #[test]
    fn requirement_operators() {
        let obj = json!({"status": {"phase": "Running", "replicas": 3, "tags": ["a", "b"]}});
        assert_eq!(unmet(&req(".status.phase", Operator::Equals, &[json!("Running")]), &obj).unwrap(), None);
        assert!(unmet(&req(".status.phase", Operator::NotEquals, &[json!("Running")]), &obj).unwrap().is_some());
        assert_eq!(unmet(&req(".status.replicas", Operator::In, &[json!(1), json!(3.0)]), &obj).unwrap(), None);
        assert!(unmet(&req(".status.tags[*]", Operator::NotIn, &[json!("b")]), &obj).unwrap().is_some());
        assert_eq!(unmet(&req(".status.tags[*]", Operator::NotIn, &[json!("c")]), &obj).unwrap(), None);
        assert_eq!(unmet(&req(".status.phase", Operator::Exists, &[]), &obj).unwrap(), None);
        assert_eq!(unmet(&req(".status.missing", Operator::DoesNotExist, &[]), &obj).unwrap(), None);
        assert!(unmet(&req(".status.phase", Operator::DoesNotExist, &[]), &obj).unwrap().is_some());
        let missing = unmet(&req(".status.missing", Operator::Equals, &[json!(1)]), &obj).unwrap().unwrap();
        assert!(missing.contains("does not exist"), "{}", missing);
    }

    #[test]
    fn malformed_requirement_is_configuration_error() {
        let obj = json!({"a": 1});
        let bad_path = unmet(&req("..a", Operator::Exists, &[]), &obj).unwrap_err();
        assert_eq!(bad_path.class(), skiff_core::ErrorClass::Configuration);
        let raw = RequirementSpec { json_path: ".a".into(), operator: Operator::Equals, values: vec![json!(1)] };
        assert_eq!(unmet(&raw, &obj).unwrap_err().class(), skiff_core::ErrorClass::Configuration);
    }
}
