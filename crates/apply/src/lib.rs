//! Skiff apply: policy-driven object application with ownership tracking, orphan
//! cleanup, and ordered deletion of managed objects.

#![forbid(unsafe_code)]

use serde_json::Value as Json;
use skiff_core::{ObjectRef, OWNERSHIP_LABEL};

mod applier;
mod deletion;

pub use applier::{ApplyOptions, ApplyReport, ObjectApplier, DEFAULT_PARALLELISM};
pub use deletion::{DeletionManager, DeletionReport};

pub(crate) fn is_crd(r: &ObjectRef) -> bool {
    r.group() == "apiextensions.k8s.io" && r.kind == "CustomResourceDefinition"
}

/// Who owns a live object according to its ownership label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    Ours,
    Unowned,
    Foreign(String),
}

pub fn ownership(live: &Json, owner: &str) -> Ownership {
    match skiff_kubehub::label(live, OWNERSHIP_LABEL) {
        Some(v) if v == owner => Ownership::Ours,
        Some(v) => Ownership::Foreign(v.to_string()),
        None => Ownership::Unowned,
    }
}

/// Drop server-populated fields that should not count as a difference.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("uid");
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}
