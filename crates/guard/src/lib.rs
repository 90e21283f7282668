//! Skiff guard: named checkpoints bounded by phase deadlines, and the cooperative
//! interruption signal consulted before and inside long loops.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use skiff_core::{format_duration, DeployError, Timeout, WorkItem};
use tracing::{debug, warn};

/// Points in the pipeline at which the guard is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    ProcessManifests,
    ApplyManifests,
    CleanupOrphaned,
    CheckReadiness,
    ReadExports,
    DeleteResources,
    WaitForDeletion,
}

impl Checkpoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Checkpoint::ProcessManifests => "deployer: process manifests",
            Checkpoint::ApplyManifests => "deployer: apply manifests",
            Checkpoint::CleanupOrphaned => "deployer: cleanup orphaned",
            Checkpoint::CheckReadiness => "deployer: check readiness",
            Checkpoint::ReadExports => "deployer: read exports",
            Checkpoint::DeleteResources => "deployer: delete resources",
            Checkpoint::WaitForDeletion => "deployer: wait for deletion",
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cooperative abort request for the running attempt.
#[async_trait::async_trait]
pub trait InterruptionSignal: Send + Sync {
    async fn is_interrupted(&self) -> bool;
}

pub struct NoInterruption;

#[async_trait::async_trait]
impl InterruptionSignal for NoInterruption {
    async fn is_interrupted(&self) -> bool {
        false
    }
}

/// In-process signal, flipped by whoever owns it.
#[derive(Default)]
pub struct InterruptFlag(AtomicBool);

impl InterruptFlag {
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl InterruptionSignal for InterruptFlag {
    async fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Deadline bookkeeping for one work item attempt.
///
/// The effective timeout of a checkpoint is its override if one is set, else the
/// item's own progressing timeout, else the controller default. It runs from the
/// persisted phase start. A zero timeout disables the deadline.
#[derive(Debug, Clone)]
pub struct Deadlines {
    start: Option<DateTime<Utc>>,
    phase_default: Option<Timeout>,
    global_default: Timeout,
    overrides: HashMap<Checkpoint, Timeout>,
}

impl Deadlines {
    pub fn new(start: Option<DateTime<Utc>>, phase_default: Option<Timeout>, global_default: Timeout) -> Self {
        Self { start, phase_default, global_default, overrides: HashMap::new() }
    }

    /// Deadlines of `item`, running from its recorded phase start.
    pub fn for_item(item: &WorkItem, global_default: Timeout) -> Self {
        Self::new(item.status.phase_started_at, item.spec.timeout, global_default)
    }

    /// No deadline at all.
    pub fn unbounded() -> Self {
        Self::new(None, None, Timeout::default())
    }

    pub fn with_override(mut self, cp: Checkpoint, timeout: Timeout) -> Self {
        self.overrides.insert(cp, timeout);
        self
    }

    pub fn effective(&self, cp: Checkpoint) -> Timeout {
        self.overrides.get(&cp).copied().or(self.phase_default).unwrap_or(self.global_default)
    }

    /// Time left at `cp`; `Ok(None)` when the checkpoint is unbounded.
    pub fn remaining_at(&self, cp: Checkpoint, now: DateTime<Utc>) -> Result<Option<Duration>, DeployError> {
        let timeout = self.effective(cp);
        let Some(start) = self.start else { return Ok(None) };
        if timeout.is_disabled() {
            return Ok(None);
        }
        let elapsed = (now - start).to_std().unwrap_or(Duration::ZERO);
        if elapsed >= timeout.duration() {
            counter!("guard_timeout_total", 1u64);
            return Err(DeployError::Timeout {
                checkpoint: cp.as_str().to_string(),
                message: format!("timeout of {} exceeded ({} elapsed)", timeout, format_duration(elapsed)),
            });
        }
        Ok(Some(timeout.duration() - elapsed))
    }

    pub fn remaining(&self, cp: Checkpoint) -> Result<Option<Duration>, DeployError> {
        self.remaining_at(cp, Utc::now())
    }
}

/// Deadlines plus the interruption signal; passed by reference into every phase.
#[derive(Clone)]
pub struct Guard {
    deadlines: Deadlines,
    signal: Arc<dyn InterruptionSignal>,
}

impl Guard {
    pub fn new(deadlines: Deadlines, signal: Arc<dyn InterruptionSignal>) -> Self {
        Self { deadlines, signal }
    }

    /// Unbounded and never interrupted.
    pub fn relaxed() -> Self {
        Self::new(Deadlines::unbounded(), Arc::new(NoInterruption))
    }

    pub fn deadlines(&self) -> &Deadlines {
        &self.deadlines
    }

    /// Interruption first, then the deadline. Returns the time left at this checkpoint.
    pub async fn check(&self, cp: Checkpoint) -> Result<Option<Duration>, DeployError> {
        self.check_interrupted(cp).await?;
        let remaining = self.deadlines.remaining(cp).map_err(|e| {
            warn!(checkpoint = %cp, error = %e, "checkpoint deadline exceeded");
            e
        })?;
        debug!(checkpoint = %cp, remaining = ?remaining, "checkpoint passed");
        Ok(remaining)
    }

    pub async fn check_interrupted(&self, cp: Checkpoint) -> Result<(), DeployError> {
        if self.signal.is_interrupted().await {
            counter!("guard_interrupted_total", 1u64);
            warn!(checkpoint = %cp, "interrupted");
            return Err(DeployError::Interrupted { checkpoint: cp.as_str().to_string() });
        }
        Ok(())
    }
}
