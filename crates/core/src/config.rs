//! Provider configuration carried in a work item's spec, plus its validation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::duration::Timeout;
use crate::error::DeployError;
use crate::jsonpath::JsonPath;
use crate::model::{ObjectRef, Policy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStrategy {
    /// Replace the live object with the desired one.
    #[default]
    Update,
    /// JSON merge patch of the desired object onto the live one.
    Patch,
}

/// One manifest to deploy together with its policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    #[serde(default)]
    pub policy: Policy,
    pub manifest: Json,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotate_before_create: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotate_before_delete: BTreeMap<String, String>,
}

impl ManifestEntry {
    pub fn new(policy: Policy, manifest: Json) -> Self {
        Self { policy, manifest, annotate_before_create: BTreeMap::new(), annotate_before_delete: BTreeMap::new() }
    }
}

/// Requirement operators. Serialized with the label-selector spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "=")]
    Equals,
    #[serde(rename = "==")]
    DoubleEquals,
    #[serde(rename = "!=")]
    NotEquals,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "notin")]
    NotIn,
    #[serde(rename = "exists")]
    Exists,
    #[serde(rename = "!")]
    DoesNotExist,
}

impl Operator {
    fn takes_values(self) -> bool {
        !matches!(self, Operator::Exists | Operator::DoesNotExist)
    }

    fn single_value(self) -> bool {
        matches!(self, Operator::Equals | Operator::DoubleEquals | Operator::NotEquals)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequirementSpec {
    pub json_path: String,
    pub operator: Operator,
    /// Each entry is an object of the form `{"value": <any>}`.
    #[serde(default, alias = "value")]
    pub values: Vec<Json>,
}

impl RequirementSpec {
    /// The wrapped requirement values.
    pub fn parsed_values(&self) -> Result<Vec<Json>, DeployError> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                v.get("value")
                    .cloned()
                    .ok_or_else(|| DeployError::Configuration(format!("requirement value at index {} does not contain the value key", i)))
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorSpec {
    pub api_version: String,
    pub kind: String,
    #[serde(default, alias = "labels")]
    pub match_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomReadinessCheck {
    pub name: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Timeout>,
    #[serde(default, rename = "resourceSelector", skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ObjectRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelectorSpec>,
    #[serde(default)]
    pub requirements: Vec<RequirementSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessCheckConfiguration {
    #[serde(default)]
    pub disable_default: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Timeout>,
    /// When false, managed objects of kinds without a default heuristic are not fetched.
    #[serde(default)]
    pub fail_on_missing_object: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_readiness_checks: Vec<CustomReadinessCheck>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredefinedGroupType {
    #[serde(rename = "empty")]
    Empty,
    #[serde(rename = "namespaced-resources")]
    NamespacedResources,
    #[serde(rename = "cluster-scoped-resources")]
    ClusterScopedResources,
    #[serde(rename = "crds")]
    Crds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredefinedResourceGroup {
    #[serde(rename = "type")]
    pub group_type: Option<PredefinedGroupType>,
}

/// Selects objects by type, optionally narrowed to names and namespaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceType {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
}

impl ResourceType {
    pub fn matches(&self, r: &ObjectRef) -> bool {
        let (group, _) = crate::model::split_api_version(&self.api_version);
        if group != r.group() || self.kind != r.kind {
            return false;
        }
        if !self.names.is_empty() && !self.names.iter().any(|n| n == &r.name) {
            return false;
        }
        if !self.namespaces.is_empty() {
            let ns = r.namespace.as_deref().unwrap_or("");
            if !self.namespaces.iter().any(|n| n == ns) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomResourceGroup {
    #[serde(default)]
    pub resources: Vec<ResourceType>,
    /// Delete every live object of the listed types, managed or not.
    #[serde(default)]
    pub delete_all_resources: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionGroupDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predefined_resource_group: Option<PredefinedResourceGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_resource_group: Option<CustomResourceGroup>,
    /// Strip finalizers from objects of this group after the delete call.
    #[serde(default)]
    pub force_delete: bool,
    #[serde(default)]
    pub wait_for_deletion: bool,
}

/// Second hop of an export: the first value is a `{name, namespace}` reference to this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FromObjectReference {
    pub api_version: String,
    pub kind: String,
    pub json_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Export {
    pub key: String,
    pub json_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_resource: Option<ObjectRef>,
    #[serde(default, alias = "fromObjectRef", skip_serializing_if = "Option::is_none")]
    pub from_object_reference: Option<FromObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Timeout>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Exports {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_timeout: Option<Timeout>,
    #[serde(default)]
    pub exports: Vec<Export>,
}

/// Limits applied to each manifest during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for ManifestLimits {
    fn default() -> Self {
        Self { max_bytes: 1_000_000, max_nodes: 100_000 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfiguration {
    #[serde(default)]
    pub update_strategy: UpdateStrategy,
    #[serde(default)]
    pub manifests: Vec<ManifestEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_namespace: Option<String>,
    /// Extra labels stamped on every created or updated object.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub readiness_checks: ReadinessCheckConfiguration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_timeout: Option<Timeout>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deletion_groups: Vec<DeletionGroupDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deletion_groups_during_update: Vec<DeletionGroupDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exports: Option<Exports>,
}

impl ProviderConfiguration {
    /// Decode and validate a configuration blob. Any problem is a configuration error.
    pub fn decode(raw: &Json, limits: ManifestLimits) -> Result<Self, DeployError> {
        if raw.is_null() {
            return Err(DeployError::Configuration("provider configuration is missing".into()));
        }
        let cfg: ProviderConfiguration =
            serde_json::from_value(raw.clone()).map_err(|e| DeployError::Configuration(format!("decoding provider configuration: {}", e)))?;
        let errs = cfg.validate(limits);
        if !errs.is_empty() {
            return Err(DeployError::Configuration(errs.join("; ")));
        }
        Ok(cfg)
    }

    /// Field-path prefixed validation messages; empty when valid.
    pub fn validate(&self, limits: ManifestLimits) -> Vec<String> {
        let mut errs = Vec::new();
        if self.manifests.is_empty() {
            errs.push("manifests: at least one manifest is required".to_string());
        }
        for (i, m) in self.manifests.iter().enumerate() {
            validate_manifest(&format!("manifests[{}]", i), m, limits, &mut errs);
        }
        validate_readiness(&self.readiness_checks, &mut errs);
        validate_deletion_groups("deletionGroups", &self.deletion_groups, &mut errs);
        validate_deletion_groups("deletionGroupsDuringUpdate", &self.deletion_groups_during_update, &mut errs);
        if let Some(exports) = &self.exports {
            for (i, e) in exports.exports.iter().enumerate() {
                validate_export(&format!("exports.exports[{}]", i), e, &mut errs);
            }
        }
        errs
    }

    /// Default namespace for namespaced objects without one.
    pub fn default_namespace(&self) -> &str {
        self.default_namespace.as_deref().filter(|s| !s.is_empty()).unwrap_or("default")
    }
}

fn validate_manifest(path: &str, m: &ManifestEntry, limits: ManifestLimits, errs: &mut Vec<String>) {
    let Some(obj) = m.manifest.as_object() else {
        errs.push(format!("{}.manifest: must be an object", path));
        return;
    };
    let size = serde_json::to_vec(&m.manifest).map(|b| b.len()).unwrap_or(usize::MAX);
    if size > limits.max_bytes {
        errs.push(format!("{}.manifest: payload too large (>{} bytes)", path, limits.max_bytes));
        return;
    }
    if let Some(at) = node_budget_overrun(&m.manifest, limits.max_nodes) {
        errs.push(format!("{}.manifest: document too complex (>{} nodes, limit reached at {})", path, limits.max_nodes, at));
        return;
    }
    if obj.get("apiVersion").and_then(|v| v.as_str()).map_or(true, str::is_empty) {
        errs.push(format!("{}.manifest: missing apiVersion", path));
    }
    if obj.get("kind").and_then(|v| v.as_str()).map_or(true, str::is_empty) {
        errs.push(format!("{}.manifest: missing kind", path));
    }
    let name = obj.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str());
    if name.map_or(true, str::is_empty) {
        errs.push(format!("{}.manifest: missing metadata.name", path));
    }
}

/// Path of the node at which `v` goes over `max` nodes, or `None` when it fits.
fn node_budget_overrun(v: &Json, max: usize) -> Option<String> {
    let mut seen = 0usize;
    let mut stack = vec![(String::new(), v)];
    while let Some((at, node)) = stack.pop() {
        seen += 1;
        if seen > max {
            return Some(if at.is_empty() { ".".to_string() } else { at });
        }
        match node {
            Json::Object(map) => stack.extend(map.iter().rev().map(|(k, child)| (format!("{}.{}", at, k), child))),
            Json::Array(items) => stack.extend(items.iter().enumerate().rev().map(|(i, child)| (format!("{}[{}]", at, i), child))),
            _ => {}
        }
    }
    None
}

fn validate_readiness(rc: &ReadinessCheckConfiguration, errs: &mut Vec<String>) {
    for (i, c) in rc.custom_readiness_checks.iter().enumerate() {
        let path = format!("readinessChecks.customReadinessChecks[{}]", i);
        if c.name.is_empty() {
            errs.push(format!("{}.name: required", path));
        }
        if c.resources.is_empty() && c.label_selector.is_none() {
            errs.push(format!("{}: either resourceSelector or labelSelector is required", path));
        }
        if let Some(ls) = &c.label_selector {
            if ls.match_labels.is_empty() {
                errs.push(format!("{}.labelSelector.matchLabels: required", path));
            }
        }
        if c.requirements.is_empty() {
            errs.push(format!("{}.requirements: at least one requirement is required", path));
        }
        for (j, r) in c.requirements.iter().enumerate() {
            let rpath = format!("{}.requirements[{}]", path, j);
            if r.json_path.is_empty() {
                errs.push(format!("{}.jsonPath: required", rpath));
            } else if let Err(e) = JsonPath::parse(&r.json_path) {
                errs.push(format!("{}.jsonPath: {}", rpath, e));
            }
            if r.operator.takes_values() {
                if r.values.is_empty() {
                    errs.push(format!("{}.values: required for operator {:?}", rpath, r.operator));
                } else if r.operator.single_value() && r.values.len() > 1 {
                    errs.push(format!("{}.values: operator {:?} takes exactly one value", rpath, r.operator));
                }
            }
        }
    }
}

fn validate_deletion_groups(path: &str, groups: &[DeletionGroupDefinition], errs: &mut Vec<String>) {
    for (i, g) in groups.iter().enumerate() {
        let gpath = format!("{}[{}]", path, i);
        match (&g.predefined_resource_group, &g.custom_resource_group) {
            (None, None) => errs.push(format!("{}: exactly one of predefinedResourceGroup or customResourceGroup is required", gpath)),
            (Some(_), Some(_)) => errs.push(format!("{}: predefinedResourceGroup and customResourceGroup are mutually exclusive", gpath)),
            _ => {}
        }
        if let Some(p) = &g.predefined_resource_group {
            if p.group_type.is_none() {
                errs.push(format!("{}.predefinedResourceGroup.type: required", gpath));
            }
        }
        if let Some(c) = &g.custom_resource_group {
            if c.resources.is_empty() {
                errs.push(format!("{}.customResourceGroup.resources: required", gpath));
            }
            for (j, r) in c.resources.iter().enumerate() {
                if r.api_version.is_empty() || r.kind.is_empty() {
                    errs.push(format!("{}.customResourceGroup.resources[{}]: apiVersion and kind are required", gpath, j));
                }
            }
        }
    }
}

fn validate_export(path: &str, e: &Export, errs: &mut Vec<String>) {
    if e.key.is_empty() {
        errs.push(format!("{}.key: required", path));
    }
    if e.json_path.is_empty() {
        errs.push(format!("{}.jsonPath: required", path));
    } else if let Err(err) = JsonPath::parse(&e.json_path) {
        errs.push(format!("{}.jsonPath: {}", path, err));
    }
    if let Some(r) = &e.from_resource {
        if r.api_version.is_empty() {
            errs.push(format!("{}.fromResource.apiVersion: required", path));
        }
        if r.kind.is_empty() {
            errs.push(format!("{}.fromResource.kind: required", path));
        }
        if r.name.is_empty() {
            errs.push(format!("{}.fromResource.name: required", path));
        }
    }
    if let Some(r) = &e.from_object_reference {
        if r.api_version.is_empty() {
            errs.push(format!("{}.fromObjectReference.apiVersion: required", path));
        }
        if r.kind.is_empty() {
            errs.push(format!("{}.fromObjectReference.kind: required", path));
        }
        if r.json_path.is_empty() {
            errs.push(format!("{}.fromObjectReference.jsonPath: required", path));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(name: &str) -> Json {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}, "data": {"k": "v"}})
    }

    fn base() -> Json {
        json!({
            "updateStrategy": "patch",
            "manifests": [{"policy": "manage", "manifest": cm("a")}],
        })
    }

    #[test]
    fn decodes_minimal_configuration() {
        let cfg = ProviderConfiguration::decode(&base(), ManifestLimits::default()).unwrap();
        assert_eq!(cfg.update_strategy, UpdateStrategy::Patch);
        assert_eq!(cfg.manifests.len(), 1);
        assert_eq!(cfg.default_namespace(), "default");
        assert!(!cfg.readiness_checks.disable_default);
    }

    #[test]
    fn rejects_empty_manifests_and_unknown_policy() {
        let empty = json!({"manifests": []});
        let err = ProviderConfiguration::decode(&empty, ManifestLimits::default()).unwrap_err();
        assert!(err.to_string().contains("at least one manifest"), "err={}", err);

        let bad_policy = json!({"manifests": [{"policy": "sometimes", "manifest": cm("a")}]});
        let err = ProviderConfiguration::decode(&bad_policy, ManifestLimits::default()).unwrap_err();
        assert!(matches!(err, DeployError::Configuration(_)));

        let bad_strategy = json!({"updateStrategy": "merge", "manifests": [{"manifest": cm("a")}]});
        assert!(ProviderConfiguration::decode(&bad_strategy, ManifestLimits::default()).is_err());
    }

    #[test]
    fn rejects_negative_timeouts() {
        let mut raw = base();
        raw["readinessChecks"] = json!({"timeout": "-10s"});
        let err = ProviderConfiguration::decode(&raw, ManifestLimits::default()).unwrap_err();
        assert!(err.to_string().contains("negative"), "err={}", err);
    }

    #[test]
    fn manifest_limits_are_enforced() {
        let limits = ManifestLimits { max_bytes: 1_000_000, max_nodes: 4 };
        let err = ProviderConfiguration::decode(&base(), limits).unwrap_err();
        assert!(err.to_string().contains("too complex"), "err={}", err);
        let limits = ManifestLimits { max_bytes: 10, max_nodes: 100 };
        let err = ProviderConfiguration::decode(&base(), limits).unwrap_err();
        assert!(err.to_string().contains("too large"), "err={}", err);
    }

    #[test]
    fn node_budget_names_where_it_ran_out() {
        let doc = json!({"a": {"b": {"c": [1, 2]}}});
        assert_eq!(node_budget_overrun(&doc, 5).as_deref(), Some(".a.b.c[1]"));
        assert_eq!(node_budget_overrun(&doc, 6), None);
        assert_eq!(node_budget_overrun(&json!(1), 0).as_deref(), Some("."));

        let raw = json!({"manifests": [
            {"manifest": {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}}},
            {"manifest": {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "b"}, "data": {"k": "v"}}}
        ]});
        let err = ProviderConfiguration::decode(&raw, ManifestLimits { max_bytes: 1_000_000, max_nodes: 5 }).unwrap_err();
        assert!(err.to_string().contains("manifests[1].manifest: document too complex"), "err={}", err);
        assert!(!err.to_string().contains("manifests[0]"), "err={}", err);
    }

    #[test]
    fn manifest_needs_identity() {
        let raw = json!({"manifests": [{"manifest": {"apiVersion": "v1", "kind": "ConfigMap", "metadata": {}}}]});
        let err = ProviderConfiguration::decode(&raw, ManifestLimits::default()).unwrap_err();
        assert!(err.to_string().contains("missing metadata.name"), "err={}", err);
    }

    #[test]
    fn custom_readiness_validation() {
        let mut raw = base();
        raw["readinessChecks"] = json!({
            "customReadinessChecks": [{
                "name": "",
                "requirements": [
                    {"jsonPath": ".status.phase", "operator": "=", "values": [{"value": "a"}, {"value": "b"}]},
                    {"jsonPath": ".status.phase", "operator": "in"},
                    {"jsonPath": ".status.x", "operator": "exists"}
                ]
            }]
        });
        let cfg: ProviderConfiguration = serde_json::from_value(raw).unwrap();
        let errs = cfg.validate(ManifestLimits::default());
        assert_eq!(errs.len(), 4, "errs={:?}", errs);
        assert!(errs.iter().any(|e| e.ends_with(".name: required")));
        assert!(errs.iter().any(|e| e.contains("resourceSelector or labelSelector")));
        assert!(errs.iter().any(|e| e.contains("takes exactly one value")));
        assert!(errs.iter().any(|e| e.contains("requirements[1].values")));
    }

    #[test]
    fn deletion_group_validation() {
        let mut raw = base();
        raw["deletionGroups"] = json!([
            {"predefinedResourceGroup": {"type": "namespaced-resources"}},
            {"customResourceGroup": {"resources": [{"apiVersion": "apps/v1", "kind": "Deployment"}]}},
            {},
            {"predefinedResourceGroup": {}, "customResourceGroup": {}}
        ]);
        let cfg: ProviderConfiguration = serde_json::from_value(raw).unwrap();
        let errs = cfg.validate(ManifestLimits::default());
        assert!(errs.iter().any(|e| e.starts_with("deletionGroups[2]:")), "errs={:?}", errs);
        assert!(errs.iter().any(|e| e.contains("deletionGroups[3]: predefinedResourceGroup and customResourceGroup")));
        assert!(errs.iter().any(|e| e.contains("deletionGroups[3].predefinedResourceGroup.type")));
        assert!(errs.iter().any(|e| e.contains("deletionGroups[3].customResourceGroup.resources")));
        assert!(!errs.iter().any(|e| e.starts_with("deletionGroups[0]") || e.starts_with("deletionGroups[1]")));

        let bad_type = json!({"predefinedResourceGroup": {"type": "test"}});
        assert!(serde_json::from_value::<DeletionGroupDefinition>(bad_type).is_err());
    }

    #[test]
    fn export_validation_and_alias() {
        let mut raw = base();
        raw["exports"] = json!({"exports": [
            {"key": "a", "jsonPath": ".data.k", "fromResource": {"apiVersion": "v1", "kind": "ConfigMap", "name": "a", "namespace": "ns"}},
            {"key": "", "jsonPath": "", "fromObjectRef": {"apiVersion": "v1", "kind": "Secret", "jsonPath": ""}}
        ]});
        let cfg: ProviderConfiguration = serde_json::from_value(raw).unwrap();
        assert!(cfg.exports.as_ref().unwrap().exports[1].from_object_reference.is_some());
        let errs = cfg.validate(ManifestLimits::default());
        assert_eq!(errs.len(), 3, "errs={:?}", errs);
        assert!(errs.iter().all(|e| e.starts_with("exports.exports[1]")));
    }

    #[test]
    fn resource_type_matching() {
        let rt = ResourceType { api_version: "apps/v1".into(), kind: "Deployment".into(), names: vec![], namespaces: vec!["a".into()] };
        assert!(rt.matches(&ObjectRef::new("apps/v1beta2", "Deployment", Some("a"), "x")));
        assert!(!rt.matches(&ObjectRef::new("apps/v1", "Deployment", Some("b"), "x")));
        assert!(!rt.matches(&ObjectRef::new("apps/v1", "StatefulSet", Some("a"), "x")));
    }

    #[test]
    fn requirement_values_unwrap_value_key() {
        let r = RequirementSpec { json_path: ".a".into(), operator: Operator::In, values: vec![json!({"value": 1}), json!({"other": 2})] };
        assert!(r.parsed_values().is_err());
        let r = RequirementSpec { json_path: ".a".into(), operator: Operator::In, values: vec![json!({"value": 1})] };
        assert_eq!(r.parsed_values().unwrap(), vec![json!(1)]);
    }
}
