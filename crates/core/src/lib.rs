//! Skiff core types: work items, provider configuration, status shapes and the error taxonomy.

#![forbid(unsafe_code)]

pub mod config;
pub mod duration;
pub mod error;
pub mod jsonpath;
pub mod model;

pub use config::{ManifestEntry, ManifestLimits, ProviderConfiguration, UpdateStrategy};
pub use duration::{format_duration, parse_duration, Timeout};
pub use error::{ClusterError, DeployError, DeployResult, ErrorClass};
pub use model::*;
