//! Work items, managed-resource records and status shapes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::duration::Timeout;

/// Finalizer placed on every work item before any work is done.
pub const FINALIZER: &str = "skiff.dev/finalizer";
/// Ownership label written onto every live object this engine creates or updates.
pub const OWNERSHIP_LABEL: &str = "skiff.dev/deployitem";
/// Operation annotation: `reconcile` forces a new attempt, `interrupt` aborts the running one.
pub const OPERATION_ANNOTATION: &str = "skiff.dev/operation";
/// RFC3339 time at which a reconcile was requested (pickup timeout basis).
pub const RECONCILE_TIME_ANNOTATION: &str = "skiff.dev/reconcile-time";
/// RFC3339 time at which an interruption was requested (abort timeout basis).
pub const ABORT_TIME_ANNOTATION: &str = "skiff.dev/abort-time";

pub const OPERATION_RECONCILE: &str = "reconcile";
pub const OPERATION_INTERRUPT: &str = "interrupt";

/// Namespace/name key of a work item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItemKey {
    pub namespace: String,
    pub name: String,
}

impl WorkItemKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Parse `ns/name`; a bare `name` lands in `default`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => Some(Self::new(ns, name)),
            None if !s.is_empty() => Some(Self::new("default", s)),
            _ => None,
        }
    }
}

impl fmt::Display for WorkItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Typed reference to an object on the target cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.filter(|s| !s.is_empty()).map(|s| s.to_string()),
            name: name.into(),
        }
    }

    /// API group; empty for the core group.
    pub fn group(&self) -> &str {
        split_api_version(&self.api_version).0
    }

    pub fn version(&self) -> &str {
        split_api_version(&self.api_version).1
    }

    /// Identity ignoring the version, so `apps/v1` and `apps/v1beta1` refer to the same object.
    pub fn same_object(&self, other: &ObjectRef) -> bool {
        self.group() == other.group() && self.kind == other.kind && self.name == other.name && self.namespace == other.namespace
    }

    /// Reference extracted from a raw object (`apiVersion`, `kind`, `metadata.name`, `metadata.namespace`).
    pub fn from_object(obj: &serde_json::Value) -> Option<Self> {
        let api_version = obj.get("apiVersion")?.as_str()?;
        let kind = obj.get("kind")?.as_str()?;
        let meta = obj.get("metadata")?;
        let name = meta.get("name")?.as_str()?;
        let ns = meta.get("namespace").and_then(|v| v.as_str());
        Some(Self::new(api_version, kind, ns, name))
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}

/// Split `group/version` into its parts; `v1` is the core group.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

/// Ownership and lifecycle rule attached to a manifest entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    Manage,
    Fallback,
    Keep,
    Ignore,
    Immutable,
}

impl Default for Policy {
    fn default() -> Self { Policy::Manage }
}

impl Policy {
    /// Whether orphan cleanup and deletion may remove objects recorded with this policy.
    pub fn deletes(self) -> bool {
        matches!(self, Policy::Manage | Policy::Fallback | Policy::Immutable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Policy::Manage => "manage",
            Policy::Fallback => "fallback",
            Policy::Keep => "keep",
            Policy::Ignore => "ignore",
            Policy::Immutable => "immutable",
        }
    }
}

/// One entry of the managed-resource list kept in status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResource {
    pub policy: Policy,
    pub resource: ObjectRef,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotate_before_delete: BTreeMap<String, String>,
}

impl ManagedResource {
    pub fn new(policy: Policy, resource: ObjectRef) -> Self {
        Self { policy, resource, annotate_before_delete: BTreeMap::new() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Progressing,
    Succeeded,
    Failed,
    Deleting,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Progressing => "Progressing",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
            Phase::Deleting => "Deleting",
        };
        f.write_str(s)
    }
}

/// User-visible error recorded on the work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub operation: String,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
}

impl LastError {
    /// Next error given the previous one. The transition time survives while the
    /// same operation and reason repeat; the update time moves whenever content changes.
    pub fn updated(prev: Option<&LastError>, operation: &str, reason: &str, message: &str, now: DateTime<Utc>) -> LastError {
        match prev {
            Some(p) if p.operation == operation && p.reason == reason => LastError {
                operation: operation.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: p.last_transition_time,
                last_update_time: if p.message == message { p.last_update_time } else { now },
            },
            _ => LastError {
                operation: operation.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: now,
                last_update_time: now,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    #[serde(default)]
    pub managed_resources: Vec<ManagedResource>,
}

/// Reference to the stored export values of a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportReference {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub provider_status: ProviderStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_reference: Option<ExportReference>,
    /// Id of the current reconcile attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Start of the current phase; checkpoint deadlines are relative to it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_started_at: Option<DateTime<Utc>>,
    /// Generation whose manifests were fully applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_generation: Option<i64>,
}

impl WorkItemStatus {
    pub fn managed_resources(&self) -> &[ManagedResource] {
        &self.provider_status.managed_resources
    }
}

/// Reference to a named target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

/// Credentials for a target cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetSpec {
    /// Inline kubeconfig document.
    Kubeconfig(String),
    /// Whatever the controller process itself resolves (in-cluster or local kubeconfig).
    CurrentContext,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_target: Option<TargetSpec>,
    /// Provider configuration blob, decoded by [`crate::config::ProviderConfiguration::decode`].
    #[serde(default)]
    pub configuration: serde_json::Value,
    /// Progressing timeout for this item; overrides the controller default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Timeout>,
}

/// The unit of reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub generation: i64,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub spec: WorkItemSpec,
    #[serde(default)]
    pub status: WorkItemStatus,
}

impl WorkItem {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: WorkItemSpec) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            generation: 1,
            annotations: BTreeMap::new(),
            finalizers: Vec::new(),
            deletion_timestamp: None,
            spec,
            status: WorkItemStatus::default(),
        }
    }

    pub fn key(&self) -> WorkItemKey {
        WorkItemKey::new(&self.namespace, &self.name)
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers.iter().any(|f| f == FINALIZER)
    }

    /// Returns false when already present.
    pub fn add_finalizer(&mut self) -> bool {
        if self.has_finalizer() { return false; }
        self.finalizers.push(FINALIZER.to_string());
        true
    }

    pub fn remove_finalizer(&mut self) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != FINALIZER);
        before != self.finalizers.len()
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn operation(&self) -> Option<&str> {
        self.annotations.get(OPERATION_ANNOTATION).map(|s| s.as_str())
    }

    pub fn reconcile_requested(&self) -> bool {
        self.operation() == Some(OPERATION_RECONCILE)
    }

    pub fn interrupt_requested(&self) -> bool {
        self.operation() == Some(OPERATION_INTERRUPT)
    }

    /// Timestamp annotation parsed as RFC3339; malformed values are ignored.
    pub fn timestamp_annotation(&self, key: &str) -> Option<DateTime<Utc>> {
        self.annotations
            .get(key)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}
