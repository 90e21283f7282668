//! Skiff reconcile: the work item state machine.
//!
//! A work item moves `Progressing → Succeeded | Failed`, or through `Deleting` until
//! its finalizer is released. [`Reconciler`] runs one attempt; [`Controller`] polls
//! the store and runs attempts on a bounded worker pool.

#![forbid(unsafe_code)]

mod config;
mod controller;
pub mod phase;
mod reconciler;
mod signal;

pub use config::ControllerConfig;
pub use controller::Controller;
pub use reconciler::{needs_work, ReconcileOutcome, Reconciler};
pub use signal::{AnnotationSignal, StoreTargetLookup};
