use std::sync::Arc;

use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use metrics::counter;
use skiff_core::{DeployError, TargetSpec, WorkItem};
use tracing::{debug, info};

use crate::{KubeTarget, SharedClient};

/// Source of named targets (`spec.target`).
#[async_trait::async_trait]
pub trait TargetLookup: Send + Sync {
    async fn lookup(&self, namespace: &str, name: &str) -> anyhow::Result<Option<TargetSpec>>;
}

/// Resolves a cluster client for a work item.
#[async_trait::async_trait]
pub trait TargetConnector: Send + Sync {
    async fn connect(&self, item: &WorkItem) -> Result<SharedClient, DeployError>;
}

/// Inline credentials win over a named target; neither is a configuration error.
pub async fn resolve_target_spec(item: &WorkItem, lookup: &dyn TargetLookup) -> Result<TargetSpec, DeployError> {
    if let Some(inline) = &item.spec.inline_target {
        return Ok(inline.clone());
    }
    let Some(target) = &item.spec.target else {
        return Err(DeployError::NoTarget);
    };
    let ns = target.namespace.as_deref().unwrap_or(&item.namespace);
    let display = format!("{}/{}", ns, target.name);
    match lookup.lookup(ns, &target.name).await {
        Ok(Some(spec)) => Ok(spec),
        Ok(None) => Err(DeployError::Target { target: display, message: "target not found".into() }),
        Err(e) => Err(DeployError::Target { target: display, message: format!("{:#}", e) }),
    }
}

/// Connector producing [`KubeTarget`] clients.
pub struct KubeConnector<L> {
    lookup: L,
}

impl<L: TargetLookup> KubeConnector<L> {
    pub fn new(lookup: L) -> Self {
        Self { lookup }
    }

    async fn client_for(spec: &TargetSpec) -> Result<Client, String> {
        match spec {
            TargetSpec::Kubeconfig(yaml) => {
                let kubeconfig = Kubeconfig::from_yaml(yaml).map_err(|e| format!("parsing kubeconfig: {}", e))?;
                let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| format!("loading kubeconfig: {}", e))?;
                Client::try_from(config).map_err(|e| format!("building client: {}", e))
            }
            TargetSpec::CurrentContext => Client::try_default().await.map_err(|e| format!("default client: {}", e)),
        }
    }
}

#[async_trait::async_trait]
impl<L: TargetLookup> TargetConnector for KubeConnector<L> {
    async fn connect(&self, item: &WorkItem) -> Result<SharedClient, DeployError> {
        let spec = resolve_target_spec(item, &self.lookup).await?;
        debug!(item = %item.key(), inline = item.spec.inline_target.is_some(), "resolving target client");
        let client = Self::client_for(&spec).await.map_err(|message| {
            counter!("target_connect_err", 1u64);
            DeployError::Target { target: target_name(item), message }
        })?;
        info!(item = %item.key(), target = %target_name(item), "target client ready");
        Ok(Arc::new(KubeTarget::new(client)))
    }
}

fn target_name(item: &WorkItem) -> String {
    match (&item.spec.inline_target, &item.spec.target) {
        (Some(_), _) => "inline".to_string(),
        (None, Some(t)) => format!("{}/{}", t.namespace.as_deref().unwrap_or(&item.namespace), t.name),
        (None, None) => "none".to_string(),
    }
}
