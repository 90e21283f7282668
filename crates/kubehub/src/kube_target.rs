use std::collections::{BTreeMap, HashMap};

use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use serde_json::Value as Json;
use skiff_core::{split_api_version, ClusterError, ObjectRef};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{label_selector, TargetClient};

type GvkKey = (String, String, String);

/// [`TargetClient`] over a kube-rs client, with discovery results cached per target.
pub struct KubeTarget {
    client: Client,
    resources: RwLock<HashMap<GvkKey, (ApiResource, bool)>>,
}

impl KubeTarget {
    pub fn new(client: Client) -> Self {
        Self { client, resources: RwLock::new(HashMap::new()) }
    }

    async fn refresh_discovery(&self) -> Result<(), ClusterError> {
        let discovery = Discovery::new(self.client.clone()).run().await.map_err(map_kube_err)?;
        let mut found = HashMap::new();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    found.insert((ar.group.clone(), ar.version.clone(), ar.kind.clone()), (ar, namespaced));
                }
            }
        }
        debug!(count = found.len(), "discovery refreshed");
        *self.resources.write().await = found;
        Ok(())
    }

    /// Resolve an apiVersion/kind pair; a miss refreshes discovery once before giving up.
    async fn resolve(&self, api_version: &str, kind: &str) -> Result<(ApiResource, bool), ClusterError> {
        let (group, version) = split_api_version(api_version);
        let key = (group.to_string(), version.to_string(), kind.to_string());
        if let Some(hit) = self.resources.read().await.get(&key) {
            return Ok(hit.clone());
        }
        self.refresh_discovery().await?;
        self.resources
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| ClusterError::NoMatch(format!("{}/{}", api_version, kind)))
    }

    async fn api_for(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>, ClusterError> {
        let (ar, namespaced) = self.resolve(api_version, kind).await?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }

    async fn api_for_ref(&self, r: &ObjectRef) -> Result<Api<DynamicObject>, ClusterError> {
        self.api_for(&r.api_version, &r.kind, r.namespace.as_deref()).await
    }
}

fn to_dynamic(obj: &Json) -> Result<DynamicObject, ClusterError> {
    serde_json::from_value(obj.clone()).map_err(|e| ClusterError::Decode(e.to_string()))
}

fn to_json(obj: &DynamicObject) -> Result<Json, ClusterError> {
    let mut v = serde_json::to_value(obj).map_err(|e| ClusterError::Decode(e.to_string()))?;
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
    Ok(v)
}

fn obj_ref(obj: &Json) -> Result<ObjectRef, ClusterError> {
    ObjectRef::from_object(obj).ok_or_else(|| ClusterError::Decode("object is missing apiVersion, kind or metadata.name".into()))
}

/// Map kube errors onto the engine's cluster error kinds.
pub(crate) fn map_kube_err(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(resp) => match resp.code {
            404 => ClusterError::NotFound(resp.message),
            409 => ClusterError::Conflict(resp.message),
            code => {
                counter!("cluster_api_err", 1u64);
                ClusterError::Api { code, message: resp.message }
            }
        },
        kube::Error::SerdeError(e) => ClusterError::Decode(e.to_string()),
        other => {
            counter!("cluster_transport_err", 1u64);
            ClusterError::Transport(other.to_string())
        }
    }
}

#[async_trait::async_trait]
impl TargetClient for KubeTarget {
    async fn get(&self, r: &ObjectRef) -> Result<Option<Json>, ClusterError> {
        let api = self.api_for_ref(r).await?;
        match api.get_opt(&r.name).await.map_err(map_kube_err)? {
            Some(obj) => Ok(Some(to_json(&obj)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, obj: &Json) -> Result<Json, ClusterError> {
        let r = obj_ref(obj)?;
        let api = self.api_for_ref(&r).await?;
        let created = api.create(&PostParams::default(), &to_dynamic(obj)?).await.map_err(map_kube_err)?;
        to_json(&created)
    }

    async fn replace(&self, obj: &Json) -> Result<Json, ClusterError> {
        let r = obj_ref(obj)?;
        let api = self.api_for_ref(&r).await?;
        let replaced = api.replace(&r.name, &PostParams::default(), &to_dynamic(obj)?).await.map_err(map_kube_err)?;
        to_json(&replaced)
    }

    async fn merge_patch(&self, r: &ObjectRef, patch: &Json) -> Result<Json, ClusterError> {
        let api = self.api_for_ref(r).await?;
        let patched = api.patch(&r.name, &PatchParams::default(), &Patch::Merge(patch)).await.map_err(map_kube_err)?;
        to_json(&patched)
    }

    async fn delete(&self, r: &ObjectRef) -> Result<(), ClusterError> {
        let api = self.api_for_ref(r).await?;
        api.delete(&r.name, &DeleteParams::background()).await.map_err(map_kube_err)?;
        Ok(())
    }

    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Json>, ClusterError> {
        let api = self.api_for(api_version, kind, namespace).await?;
        let mut lp = ListParams::default();
        if !labels.is_empty() {
            lp = lp.labels(&label_selector(labels));
        }
        let list = api.list(&lp).await.map_err(map_kube_err)?;
        let mut out = Vec::with_capacity(list.items.len());
        for item in &list.items {
            let mut v = to_json(item)?;
            // List items come back without type meta.
            if let Some(o) = v.as_object_mut() {
                o.entry("apiVersion").or_insert_with(|| Json::String(api_version.to_string()));
                o.entry("kind").or_insert_with(|| Json::String(kind.to_string()));
            }
            out.push(v);
        }
        Ok(out)
    }

    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<bool, ClusterError> {
        Ok(self.resolve(api_version, kind).await?.1)
    }
}
