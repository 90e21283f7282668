use std::sync::Arc;

use skiff_core::{TargetSpec, WorkItemKey};
use skiff_guard::InterruptionSignal;
use skiff_kubehub::TargetLookup;
use skiff_persist::WorkItemStore;
use tracing::warn;

/// Interruption requested through the item's operation annotation.
pub struct AnnotationSignal {
    store: Arc<dyn WorkItemStore>,
    key: WorkItemKey,
}

impl AnnotationSignal {
    pub fn new(store: Arc<dyn WorkItemStore>, key: WorkItemKey) -> Self {
        Self { store, key }
    }
}

#[async_trait::async_trait]
impl InterruptionSignal for AnnotationSignal {
    async fn is_interrupted(&self) -> bool {
        match self.store.get(&self.key) {
            Ok(Some(item)) => item.interrupt_requested(),
            Ok(None) => false,
            Err(e) => {
                warn!(item = %self.key, error = %e, "reading interruption annotation failed");
                false
            }
        }
    }
}

/// Named targets kept in the work item store.
pub struct StoreTargetLookup {
    store: Arc<dyn WorkItemStore>,
}

impl StoreTargetLookup {
    pub fn new(store: Arc<dyn WorkItemStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl TargetLookup for StoreTargetLookup {
    async fn lookup(&self, namespace: &str, name: &str) -> anyhow::Result<Option<TargetSpec>> {
        self.store.get_target(namespace, name)
    }
}
