use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use skiff_core::config::{CustomReadinessCheck, LabelSelectorSpec, Operator, ReadinessCheckConfiguration, RequirementSpec};
use skiff_core::{DeployError, ErrorClass, ManagedResource, ObjectRef, Policy, Timeout};
use skiff_guard::{Deadlines, Guard, InterruptFlag, NoInterruption};
use skiff_kubehub::MemoryCluster;
use skiff_readiness::ReadinessEvaluator;

fn deployment(name: &str) -> serde_json::Value {
    json!({
        "apiVersion": "apps/v1", "kind": "Deployment",
        "metadata": {"name": name, "namespace": "default", "labels": {"app": name}},
        "spec": {"replicas": 1}
    })
}

fn deployment_ref(name: &str) -> ObjectRef {
    ObjectRef::new("apps/v1", "Deployment", Some("default"), name)
}

fn managed(name: &str) -> Vec<ManagedResource> {
    vec![ManagedResource::new(Policy::Manage, deployment_ref(name))]
}

fn with_timeout(secs: u64) -> ReadinessCheckConfiguration {
    ReadinessCheckConfiguration { timeout: Some(Timeout::from_secs(secs)), ..Default::default() }
}

fn ready_status() -> serde_json::Value {
    json!({"observedGeneration": 1, "replicas": 1, "updatedReplicas": 1, "availableReplicas": 1})
}

#[tokio::test]
async fn never_ready_deployment_times_out_after_one_second() {
    let cluster = MemoryCluster::new();
    cluster.seed(deployment("web"));
    let guard = Guard::relaxed();
    let started = Instant::now();
    let err = ReadinessEvaluator::new(&cluster, &guard)
        .with_poll_interval(Duration::from_millis(100))
        .check(&with_timeout(1), &managed("web"))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert_eq!(err.class(), ErrorClass::Timeout, "{}", err);
    assert!(elapsed >= Duration::from_millis(900), "returned too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    assert!(err.to_string().contains("not enough ready replicas"), "{}", err);
}

#[tokio::test]
async fn becomes_ready_while_polling() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.seed(deployment("web"));
    let c = cluster.clone();
    let flip = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        c.set_status(&deployment_ref("web"), ready_status());
    });
    let guard = Guard::relaxed();
    ReadinessEvaluator::new(cluster.as_ref(), &guard)
        .with_poll_interval(Duration::from_millis(50))
        .check(&with_timeout(5), &managed("web"))
        .await
        .unwrap();
    flip.await.unwrap();
}

#[tokio::test]
async fn guard_deadline_caps_the_readiness_timeout() {
    let cluster = MemoryCluster::new();
    cluster.seed(deployment("web"));
    let guard = Guard::new(Deadlines::new(Some(Utc::now()), None, Timeout::from_secs(1)), Arc::new(NoInterruption));
    let started = Instant::now();
    let err = ReadinessEvaluator::new(&cluster, &guard)
        .with_poll_interval(Duration::from_millis(100))
        .check(&with_timeout(60), &managed("web"))
        .await
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Timeout);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn interruption_stops_polling() {
    let cluster = MemoryCluster::new();
    cluster.seed(deployment("web"));
    let flag = Arc::new(InterruptFlag::default());
    flag.trigger();
    let guard = Guard::new(Deadlines::unbounded(), flag);
    let err = ReadinessEvaluator::new(&cluster, &guard).check(&with_timeout(30), &managed("web")).await.unwrap_err();
    assert!(matches!(err, DeployError::Interrupted { .. }), "{}", err);
}

#[tokio::test]
async fn missing_objects_only_fail_when_asked_to() {
    let cluster = MemoryCluster::new();
    let guard = Guard::relaxed();
    let eval = ReadinessEvaluator::new(&cluster, &guard).with_poll_interval(Duration::from_millis(50));
    eval.check(&with_timeout(1), &managed("gone")).await.unwrap();
    let strict = ReadinessCheckConfiguration { fail_on_missing_object: true, ..with_timeout(1) };
    let err = eval.check(&strict, &managed("gone")).await.unwrap_err();
    assert!(err.to_string().contains("object not found"), "{}", err);
}

#[tokio::test]
async fn custom_check_by_label_selector() {
    let cluster = MemoryCluster::new();
    cluster.seed(deployment("api"));
    cluster.set_status(&deployment_ref("api"), json!({"phase": "Pending"}));
    let check = CustomReadinessCheck {
        name: "api-running".into(),
        disabled: false,
        timeout: Some(Timeout::from_secs(1)),
        resources: vec![],
        label_selector: Some(LabelSelectorSpec {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            match_labels: [("app".to_string(), "api".to_string())].into_iter().collect(),
        }),
        requirements: vec![RequirementSpec {
            json_path: ".status.phase".into(),
            operator: Operator::Equals,
            values: vec![json!({"value": "Running"})],
        }],
    };
    let cfg = ReadinessCheckConfiguration { disable_default: true, custom_readiness_checks: vec![check], ..Default::default() };
    let guard = Guard::relaxed();
    let eval = ReadinessEvaluator::new(&cluster, &guard).with_poll_interval(Duration::from_millis(50));
    let err = eval.check(&cfg, &[]).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Timeout);
    assert!(err.to_string().contains("api-running"), "{}", err);

    cluster.set_status(&deployment_ref("api"), json!({"phase": "Running"}));
    eval.check(&cfg, &[]).await.unwrap();
}
