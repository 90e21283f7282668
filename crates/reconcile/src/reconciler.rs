use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use skiff_apply::{ApplyOptions, DeletionManager, ObjectApplier};
use skiff_core::{
    format_duration, DeployError, LastError, Phase, ProviderConfiguration, Timeout, WorkItem, WorkItemKey, ABORT_TIME_ANNOTATION,
    OPERATION_ANNOTATION, RECONCILE_TIME_ANNOTATION,
};
use skiff_export::Exporter;
use skiff_guard::{Checkpoint, Deadlines, Guard};
use skiff_kubehub::TargetConnector;
use skiff_persist::WorkItemStore;
use skiff_readiness::ReadinessEvaluator;
use tokio_util::sync::CancellationToken;
use tracing::{debug, field, info, info_span, warn, Instrument, Span};

use crate::config::ControllerConfig;
use crate::phase;
use crate::signal::AnnotationSignal;

const OP_VALIDATE: &str = "Validate";
const OP_CONNECT: &str = "Connect";
const OP_APPLY: &str = "Apply";
const OP_READINESS: &str = "Readiness";
const OP_EXPORT: &str = "Export";
const OP_DELETE: &str = "Delete";
const OP_PICKUP: &str = "Pickup";
const OP_ABORT: &str = "Abort";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Done,
    /// Run again after the given delay.
    Requeue(Duration),
}

/// Whether the controller loop has anything to do for `item`.
pub fn needs_work(item: &WorkItem) -> bool {
    if item.is_deleting() {
        return !deletion_failed(item);
    }
    !item.has_finalizer()
        || item.generation != item.status.observed_generation
        || item.operation().is_some()
        || item.status.phase == Some(Phase::Progressing)
}

/// A failed deletion waits for an explicit reconcile trigger.
fn deletion_failed(item: &WorkItem) -> bool {
    item.status.phase == Some(Phase::Failed)
        && item.status.last_error.as_ref().is_some_and(|e| e.operation == OP_DELETE)
        && !item.reconcile_requested()
}

fn expired(since: Option<DateTime<Utc>>, limit: Timeout, now: DateTime<Utc>) -> bool {
    match since {
        Some(t) if !limit.is_disabled() => (now - t).to_std().map_or(false, |age| age >= limit.duration()),
        _ => false,
    }
}

/// Drives one work item through apply, readiness and export, or through deletion.
///
/// Status is written after every phase, so an attempt that dies half way resumes from
/// the last completed phase: manifests already applied for the current generation are
/// not applied again.
pub struct Reconciler {
    store: Arc<dyn WorkItemStore>,
    connector: Arc<dyn TargetConnector>,
    config: ControllerConfig,
}

impl Reconciler {
    pub fn new(store: Arc<dyn WorkItemStore>, connector: Arc<dyn TargetConnector>, config: ControllerConfig) -> Self {
        Self { store, connector, config }
    }

    pub fn store(&self) -> &Arc<dyn WorkItemStore> {
        &self.store
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub async fn reconcile(&self, key: &WorkItemKey, cancel: &CancellationToken) -> Result<ReconcileOutcome> {
        let Some(item) = self.store.get(key)? else {
            debug!(item = %key, "work item gone");
            return Ok(ReconcileOutcome::Done);
        };
        counter!("reconcile_total", 1u64);
        let started = Instant::now();
        let span = info_span!("reconcile", item = %key, job = field::Empty);
        let outcome = async {
            if item.is_deleting() {
                self.reconcile_delete(item, cancel).await
            } else {
                self.reconcile_deploy(item, cancel).await
            }
        }
        .instrument(span)
        .await;
        histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        outcome
    }

    /// Reconcile until the item needs nothing more, sleeping through requeues.
    pub async fn reconcile_until_done(&self, key: &WorkItemKey, cancel: &CancellationToken) -> Result<()> {
        loop {
            match self.reconcile(key, cancel).await? {
                ReconcileOutcome::Done => return Ok(()),
                ReconcileOutcome::Requeue(delay) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn reconcile_deploy(&self, mut item: WorkItem, cancel: &CancellationToken) -> Result<ReconcileOutcome> {
        if item.add_finalizer() {
            self.store.update_meta(&item)?;
            info!("finalizer added");
            return Ok(ReconcileOutcome::Requeue(Duration::ZERO));
        }
        let now = Utc::now();
        let progressing = item.status.phase == Some(Phase::Progressing);

        if item.interrupt_requested() {
            if !progressing {
                debug!("nothing to interrupt");
                self.clear_operation(&mut item)?;
            } else if expired(item.timestamp_annotation(ABORT_TIME_ANNOTATION), self.config.abort_timeout, now) {
                let message = format!("interruption was not honoured within {}", self.config.abort_timeout);
                return self.fail(&mut item, OP_ABORT, "AbortTimeout", message);
            } else {
                return self.fail(&mut item, OP_ABORT, "Interrupted", "interrupted on request".to_string());
            }
        }

        let triggered = item.reconcile_requested();
        let changed = item.generation != item.status.observed_generation;
        if !(triggered || changed || progressing) {
            debug!(phase = ?item.status.phase, "up to date");
            return Ok(ReconcileOutcome::Done);
        }

        if triggered || changed {
            if triggered {
                if expired(item.timestamp_annotation(RECONCILE_TIME_ANNOTATION), self.config.pickup_timeout, now) {
                    item.status.observed_generation = item.generation;
                    let message = format!("reconcile request was not picked up within {}", self.config.pickup_timeout);
                    return self.fail(&mut item, OP_PICKUP, "PickupTimeout", message);
                }
                item.status.applied_generation = None;
                self.clear_operation(&mut item)?;
            }
            item.status.phase = Some(Phase::Progressing);
            item.status.job_id = Some(uuid::Uuid::new_v4().to_string());
            item.status.phase_started_at = Some(now);
            item.status.observed_generation = item.generation;
            self.store.write_status(&item.key(), &item.status)?;
            info!(generation = item.generation, triggered, "reconcile started");
        } else {
            info!(generation = item.generation, "resuming reconcile");
        }
        Span::current().record("job", item.status.job_id.as_deref().unwrap_or_default());

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("attempt cancelled");
                Ok(ReconcileOutcome::Requeue(self.config.retry_interval))
            }
            outcome = self.deploy(&mut item) => outcome,
        }
    }

    async fn deploy(&self, item: &mut WorkItem) -> Result<ReconcileOutcome> {
        let key = item.key();
        let cfg = match ProviderConfiguration::decode(&item.spec.configuration, self.config.limits) {
            Ok(cfg) => cfg,
            Err(e) => return self.step_failed(item, OP_VALIDATE, e, Phase::Progressing),
        };
        let client = match self.connector.connect(item).await {
            Ok(client) => client,
            Err(e) => return self.step_failed(item, OP_CONNECT, e, Phase::Progressing),
        };
        let guard = self.guard_for(item, Deadlines::for_item(item, self.config.progressing_timeout));

        if item.status.applied_generation == Some(item.generation) {
            info!(generation = item.generation, "manifests already applied for this generation");
        } else {
            let opts = ApplyOptions::from_config(item.name.clone(), &cfg)
                .with_parallelism(self.config.apply_parallelism)
                .with_poll_interval(self.config.poll_interval);
            let previous = item.status.managed_resources().to_vec();
            let report = ObjectApplier::new(client.as_ref(), &guard, opts).apply(&cfg.manifests, &previous).await;
            item.status.provider_status.managed_resources = report.managed;
            if let Some(e) = report.error {
                return self.step_failed(item, OP_APPLY, e, Phase::Progressing);
            }
            item.status.applied_generation = Some(item.generation);
            self.store.write_status(&key, &item.status)?;
            info!(managed = item.status.managed_resources().len(), "manifests applied");
        }

        let managed = item.status.managed_resources().to_vec();
        let ready = ReadinessEvaluator::new(client.as_ref(), &guard)
            .with_poll_interval(self.config.poll_interval)
            .check(&cfg.readiness_checks, &managed)
            .await;
        if let Err(e) = ready {
            return self.step_failed(item, OP_READINESS, e, Phase::Progressing);
        }

        if let Some(exports) = cfg.exports.as_ref().filter(|e| !e.exports.is_empty()) {
            let values = match Exporter::new(client.as_ref(), &guard).export(exports).await {
                Ok(values) => values,
                Err(e) => return self.step_failed(item, OP_EXPORT, e, Phase::Progressing),
            };
            item.status.export_reference = Some(self.store.put_export(&key, &values)?);
        }

        item.status.phase = Some(Phase::Succeeded);
        item.status.last_error = None;
        self.store.write_status(&key, &item.status)?;
        info!("reconcile succeeded");
        Ok(ReconcileOutcome::Done)
    }

    async fn reconcile_delete(&self, mut item: WorkItem, cancel: &CancellationToken) -> Result<ReconcileOutcome> {
        if !item.has_finalizer() {
            return Ok(ReconcileOutcome::Done);
        }
        if deletion_failed(&item) {
            debug!("deletion failed earlier; waiting for a reconcile request");
            return Ok(ReconcileOutcome::Done);
        }
        if item.status.phase != Some(Phase::Deleting) || item.reconcile_requested() {
            if item.operation().is_some() {
                self.clear_operation(&mut item)?;
            }
            item.status.phase = Some(Phase::Deleting);
            item.status.job_id = Some(uuid::Uuid::new_v4().to_string());
            item.status.phase_started_at = Some(Utc::now());
            self.store.write_status(&item.key(), &item.status)?;
            info!(managed = item.status.managed_resources().len(), "deletion started");
        }
        Span::current().record("job", item.status.job_id.as_deref().unwrap_or_default());

        if item.status.managed_resources().is_empty() {
            return self.release(&mut item);
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("deletion cancelled");
                Ok(ReconcileOutcome::Requeue(self.config.retry_interval))
            }
            outcome = self.delete_managed(&mut item) => outcome,
        }
    }

    async fn delete_managed(&self, item: &mut WorkItem) -> Result<ReconcileOutcome> {
        let cfg = match ProviderConfiguration::decode(&item.spec.configuration, self.config.limits) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(error = %e, "configuration is invalid; deleting without deletion groups");
                ProviderConfiguration::default()
            }
        };
        let client = match self.connector.connect(item).await {
            Ok(client) => client,
            Err(e) => return self.step_failed(item, OP_DELETE, e, Phase::Deleting),
        };
        let mut deadlines = Deadlines::for_item(item, self.config.progressing_timeout);
        if let Some(t) = cfg.delete_timeout {
            deadlines = deadlines.with_override(Checkpoint::DeleteResources, t).with_override(Checkpoint::WaitForDeletion, t);
        }
        let guard = self.guard_for(item, deadlines);

        let managed = item.status.managed_resources().to_vec();
        let report = DeletionManager::new(client.as_ref(), &guard, item.name.clone())
            .with_groups(cfg.deletion_groups)
            .with_poll_interval(self.config.poll_interval)
            .with_parallelism(self.config.apply_parallelism)
            .delete(&managed)
            .await;
        item.status.provider_status.managed_resources = report.remaining;
        if let Some(e) = report.error {
            return self.step_failed(item, OP_DELETE, e, Phase::Deleting);
        }
        self.store.write_status(&item.key(), &item.status)?;
        self.release(item)
    }

    /// Drop the finalizer from the stored copy, keeping annotations written since pickup.
    fn release(&self, item: &mut WorkItem) -> Result<ReconcileOutcome> {
        let mut fresh = self.store.get(&item.key())?.unwrap_or_else(|| item.clone());
        fresh.remove_finalizer();
        item.remove_finalizer();
        match self.store.update_meta(&fresh)? {
            None => info!("finalizer removed; work item released"),
            Some(stored) => {
                item.annotations = stored.annotations;
                debug!("finalizer removed")
            }
        }
        Ok(ReconcileOutcome::Done)
    }

    fn guard_for(&self, item: &WorkItem, deadlines: Deadlines) -> Guard {
        Guard::new(deadlines, Arc::new(AnnotationSignal::new(self.store.clone(), item.key())))
    }

    /// Record a failed step and move the phase according to the error class.
    fn step_failed(&self, item: &mut WorkItem, operation: &str, err: DeployError, running: Phase) -> Result<ReconcileOutcome> {
        let now = Utc::now();
        let recorded = phase::record(item.status.last_error.as_ref(), operation, &err, now);
        let next = phase::after_error(err.class(), &recorded, self.config.failure_escalation, now, running);
        warn!(operation, reason = recorded.reason.as_str(), class = ?err.class(), phase = %next, error = %err, "step failed");
        item.status.last_error = Some(recorded);
        item.status.phase = Some(next);
        if err.is_interrupted() {
            self.clear_operation(item)?;
        }
        self.store.write_status(&item.key(), &item.status)?;
        if next == Phase::Failed {
            counter!("reconcile_failed_total", 1u64);
            return Ok(ReconcileOutcome::Done);
        }
        debug!(retry_in = %format_duration(self.config.retry_interval), "will retry");
        Ok(ReconcileOutcome::Requeue(self.config.retry_interval))
    }

    /// Fail the item outright with a reason of its own.
    fn fail(&self, item: &mut WorkItem, operation: &str, reason: &str, message: String) -> Result<ReconcileOutcome> {
        warn!(operation, reason, message = message.as_str(), "work item failed");
        item.status.last_error = Some(LastError::updated(item.status.last_error.as_ref(), operation, reason, &message, Utc::now()));
        item.status.phase = Some(Phase::Failed);
        self.clear_operation(item)?;
        self.store.write_status(&item.key(), &item.status)?;
        counter!("reconcile_failed_total", 1u64);
        Ok(ReconcileOutcome::Done)
    }

    /// Drop the operation annotations from the stored item, keeping anything else
    /// written since `item` was read.
    fn clear_operation(&self, item: &mut WorkItem) -> Result<()> {
        let mut fresh = self.store.get(&item.key())?.unwrap_or_else(|| item.clone());
        for k in [OPERATION_ANNOTATION, RECONCILE_TIME_ANNOTATION, ABORT_TIME_ANNOTATION] {
            fresh.annotations.remove(k);
        }
        if let Some(stored) = self.store.update_meta(&fresh)? {
            item.annotations = stored.annotations;
            item.finalizers = stored.finalizers;
        }
        Ok(())
    }
}
