//! Built-in readiness heuristics for the core workload kinds.

use serde::Deserialize;
use serde_json::Value as Json;
use skiff_core::ObjectRef;

/// Kinds with a built-in heuristic, as (group, kind).
const KINDS: &[(&str, &str)] = &[
    ("", "Pod"),
    ("apps", "Deployment"),
    ("apps", "ReplicaSet"),
    ("apps", "StatefulSet"),
    ("apps", "DaemonSet"),
    ("", "ReplicationController"),
];

pub fn has_heuristic(r: &ObjectRef) -> bool {
    KINDS.iter().any(|(g, k)| *g == r.group() && *k == r.kind)
}

/// The fields the heuristics read, shared by all workload kinds.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Workload {
    metadata: Meta,
    spec: Spec,
    status: Status,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Meta {
    generation: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Spec {
    replicas: Option<i32>,
    update_strategy: Option<UpdateStrategy>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct UpdateStrategy {
    #[serde(rename = "type")]
    kind: String,
    rolling_update: Option<RollingUpdate>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RollingUpdate {
    max_unavailable: Option<Json>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Status {
    observed_generation: i64,
    replicas: i32,
    updated_replicas: i32,
    available_replicas: i32,
    ready_replicas: i32,
    current_number_scheduled: i32,
    desired_number_scheduled: i32,
    conditions: Vec<Condition>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Condition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
    reason: String,
    message: String,
}

/// `Ok(None)` when ready or when the kind has no heuristic, `Ok(Some(reason))`
/// when not ready yet.
pub fn check(r: &ObjectRef, obj: &Json) -> Result<Option<String>, serde_json::Error> {
    if !has_heuristic(r) {
        return Ok(None);
    }
    let w: Workload = serde_json::from_value(obj.clone())?;
    let verdict = match r.kind.as_str() {
        "Pod" => pod(&w),
        "Deployment" => deployment(&w),
        "ReplicaSet" | "ReplicationController" => replica_set(&w),
        "StatefulSet" => stateful_set(&w),
        "DaemonSet" => daemon_set(&w),
        _ => Ok(()),
    };
    Ok(verdict.err())
}

fn outdated(w: &Workload) -> Result<(), String> {
    if w.status.observed_generation < w.metadata.generation {
        return Err(format!("observed generation outdated ({}/{})", w.status.observed_generation, w.metadata.generation));
    }
    Ok(())
}

fn not_enough(current: i32, expected: i32) -> String {
    format!("not enough ready replicas ({}/{})", current, expected)
}

fn condition_is(c: &Condition, expected: &str) -> Result<(), String> {
    if c.status != expected {
        return Err(format!(
            "condition {:?} has invalid status {} (expected {}) due to {}: {}",
            c.kind, c.status, expected, c.reason, c.message
        ));
    }
    Ok(())
}

fn pod(w: &Workload) -> Result<(), String> {
    let Some(ready) = w.status.conditions.iter().find(|c| c.kind == "Ready") else {
        return Err("condition \"Ready\" is missing".to_string());
    };
    if ready.reason == "PodCompleted" {
        return Ok(());
    }
    condition_is(ready, "True")
}

fn deployment(w: &Workload) -> Result<(), String> {
    outdated(w)?;
    let want = w.spec.replicas.unwrap_or(0);
    let s = &w.status;
    if want != s.replicas || want != s.updated_replicas || want != s.available_replicas {
        return Err(not_enough(s.available_replicas, want));
    }
    Ok(())
}

fn replica_set(w: &Workload) -> Result<(), String> {
    outdated(w)?;
    for c in w.status.conditions.iter().filter(|c| c.kind == "ReplicaFailure") {
        condition_is(c, "False")?;
    }
    let want = w.spec.replicas.unwrap_or(1);
    if w.status.ready_replicas < want {
        return Err(not_enough(w.status.ready_replicas, want));
    }
    Ok(())
}

fn stateful_set(w: &Workload) -> Result<(), String> {
    outdated(w)?;
    let want = w.spec.replicas.unwrap_or(1);
    if w.status.updated_replicas < want || w.status.available_replicas < want {
        return Err(not_enough(w.status.available_replicas, want));
    }
    Ok(())
}

fn daemon_set(w: &Workload) -> Result<(), String> {
    outdated(w)?;
    let required = w.status.desired_number_scheduled - max_unavailable(w);
    if w.status.current_number_scheduled < required {
        return Err(not_enough(w.status.current_number_scheduled, required));
    }
    Ok(())
}

/// `maxUnavailable` of a rolling-update daemon set, as an absolute count rounded down.
fn max_unavailable(w: &Workload) -> i32 {
    let desired = w.status.desired_number_scheduled;
    let Some(strategy) = &w.spec.update_strategy else { return 0 };
    if desired == 0 || strategy.kind != "RollingUpdate" {
        return 0;
    }
    match strategy.rolling_update.as_ref().and_then(|r| r.max_unavailable.as_ref()) {
        Some(Json::Number(n)) => n.as_i64().unwrap_or(0) as i32,
        Some(Json::String(s)) => s
            .strip_suffix('%')
            .and_then(|p| p.trim().parse::<i64>().ok())
            .map_or(0, |pct| (pct * desired as i64 / 100) as i32),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn r(api_version: &str, kind: &str) -> ObjectRef {
        ObjectRef::new(api_version, kind, Some("default"), "x")
    }

    #[test]
    fn pod_needs_ready_condition() {
        let pod = r("v1", "Pod");
        let missing = json!({"status": {}});
        assert_eq!(check(&pod, &missing).unwrap().as_deref(), Some("condition \"Ready\" is missing"));
        let ready = json!({"status": {"conditions": [{"type": "Ready", "status": "True"}]}});
        assert_eq!(check(&pod, &ready).unwrap(), None);
        let completed = json!({"status": {"conditions": [{"type": "Ready", "status": "False", "reason": "PodCompleted"}]}});
        assert_eq!(check(&pod, &completed).unwrap(), None);
        let unready = json!({"status": {"conditions": [{"type": "Ready", "status": "False", "reason": "ContainersNotReady"}]}});
        assert!(check(&pod, &unready).unwrap().unwrap().contains("ContainersNotReady"));
    }

    #[test]
    fn deployment_needs_current_generation_and_all_replicas() {
        let d = r("apps/v1", "Deployment");
        let stale = json!({"metadata": {"generation": 3}, "spec": {"replicas": 2}, "status": {"observedGeneration": 2}});
        assert_eq!(check(&d, &stale).unwrap().as_deref(), Some("observed generation outdated (2/3)"));
        let rolling = json!({"metadata": {"generation": 3}, "spec": {"replicas": 2},
            "status": {"observedGeneration": 3, "replicas": 2, "updatedReplicas": 2, "availableReplicas": 1}});
        assert_eq!(check(&d, &rolling).unwrap().as_deref(), Some("not enough ready replicas (1/2)"));
        let done = json!({"metadata": {"generation": 3}, "spec": {"replicas": 2},
            "status": {"observedGeneration": 3, "replicas": 2, "updatedReplicas": 2, "availableReplicas": 2}});
        assert_eq!(check(&d, &done).unwrap(), None);
    }

    #[test]
    fn replica_set_failure_condition_blocks() {
        let rs = r("apps/v1", "ReplicaSet");
        let failing = json!({"spec": {"replicas": 1}, "status": {"readyReplicas": 1,
            "conditions": [{"type": "ReplicaFailure", "status": "True", "reason": "FailedCreate", "message": "quota"}]}});
        assert!(check(&rs, &failing).unwrap().unwrap().contains("FailedCreate"));
        let ok = json!({"status": {"readyReplicas": 1}});
        assert_eq!(check(&rs, &ok).unwrap(), None);
    }

    #[test]
    fn daemon_set_allows_max_unavailable() {
        let ds = r("apps/v1", "DaemonSet");
        let obj = json!({"spec": {"updateStrategy": {"type": "RollingUpdate", "rollingUpdate": {"maxUnavailable": "50%"}}},
            "status": {"desiredNumberScheduled": 4, "currentNumberScheduled": 2}});
        assert_eq!(check(&ds, &obj).unwrap(), None);
        let obj = json!({"spec": {"updateStrategy": {"type": "OnDelete"}},
            "status": {"desiredNumberScheduled": 4, "currentNumberScheduled": 3}});
        assert_eq!(check(&ds, &obj).unwrap().as_deref(), Some("not enough ready replicas (3/4)"));
    }

    #[test]
    fn stateful_set_defaults_to_one_replica() {
        let sts = r("apps/v1", "StatefulSet");
        assert!(check(&sts, &json!({"status": {}})).unwrap().is_some());
        assert_eq!(check(&sts, &json!({"status": {"updatedReplicas": 1, "availableReplicas": 1}})).unwrap(), None);
    }

    #[test]
    fn other_kinds_are_always_ready() {
        let cm = r("v1", "ConfigMap");
        assert!(!has_heuristic(&cm));
        assert_eq!(check(&cm, &json!({"anything": true})).unwrap(), None);
        assert!(!has_heuristic(&r("extensions.example.com/v1", "Deployment")));
    }
}
