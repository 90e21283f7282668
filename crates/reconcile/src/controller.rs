use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use skiff_core::WorkItemKey;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::reconciler::{needs_work, ReconcileOutcome, Reconciler};

/// Polls the store and reconciles items needing work on a bounded worker pool.
/// An item is never reconciled by two workers at once.
pub struct Controller {
    reconciler: Arc<Reconciler>,
    workers: usize,
    poll_interval: Duration,
}

impl Controller {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        let workers = reconciler.config().workers.max(1);
        let poll_interval = reconciler.config().poll_interval;
        Self { reconciler, workers, poll_interval }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run until `cancel` fires, then wait for in-flight reconciles to wind down.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.workers));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(WorkItemKey, Option<Duration>)>();
        let mut in_flight: HashSet<WorkItemKey> = HashSet::new();
        let mut not_before: HashMap<WorkItemKey, Instant> = HashMap::new();
        info!(workers = self.workers, "controller started");

        loop {
            while let Ok((key, requeue)) = done_rx.try_recv() {
                in_flight.remove(&key);
                match requeue {
                    Some(delay) => {
                        not_before.insert(key, Instant::now() + delay);
                    }
                    None => {
                        not_before.remove(&key);
                    }
                }
            }

            let now = Instant::now();
            let keys = self.reconciler.store().list_keys().unwrap_or_else(|e| {
                error!(error = %format!("{:#}", e), "listing work items failed");
                Vec::new()
            });
            for key in keys {
                if in_flight.contains(&key) || not_before.get(&key).is_some_and(|t| *t > now) {
                    continue;
                }
                let wanted = match self.reconciler.store().get(&key) {
                    Ok(Some(item)) => needs_work(&item) || not_before.contains_key(&key),
                    Ok(None) => false,
                    Err(e) => {
                        warn!(item = %key, error = %format!("{:#}", e), "reading work item failed");
                        false
                    }
                };
                if !wanted {
                    continue;
                }
                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    debug!("all workers busy");
                    break;
                };
                in_flight.insert(key.clone());
                let (reconciler, done_tx, cancel) = (self.reconciler.clone(), done_tx.clone(), cancel.clone());
                tokio::spawn(async move {
                    let requeue = match reconciler.reconcile(&key, &cancel).await {
                        Ok(ReconcileOutcome::Done) => None,
                        Ok(ReconcileOutcome::Requeue(delay)) => Some(delay),
                        Err(e) => {
                            error!(item = %key, error = %format!("{:#}", e), "reconcile failed");
                            Some(reconciler.config().retry_interval)
                        }
                    };
                    drop(permit);
                    let _ = done_tx.send((key, requeue));
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!(in_flight = in_flight.len(), "controller stopping");
        let _ = permits.acquire_many(self.workers as u32).await;
        Ok(())
    }
}
