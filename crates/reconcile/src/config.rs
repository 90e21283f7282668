//! Controller settings read from `SKIFF_*` environment variables.

use std::time::Duration;

use anyhow::{Context, Result};
use skiff_apply::DEFAULT_PARALLELISM;
use skiff_core::{parse_duration, ManifestLimits, Timeout};

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// A reconcile trigger older than this when picked up fails the item.
    pub pickup_timeout: Timeout,
    /// An interrupt request older than this fails a still progressing item.
    pub abort_timeout: Timeout,
    /// Deadline of every checkpoint unless the item sets its own.
    pub progressing_timeout: Timeout,
    /// How long the same transient error may repeat before the item fails.
    pub failure_escalation: Duration,
    pub retry_interval: Duration,
    pub poll_interval: Duration,
    pub apply_parallelism: usize,
    pub workers: usize,
    pub limits: ManifestLimits,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            pickup_timeout: Timeout::from_secs(300),
            abort_timeout: Timeout::from_secs(300),
            progressing_timeout: Timeout::from_secs(600),
            failure_escalation: Duration::from_secs(300),
            retry_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
            apply_parallelism: DEFAULT_PARALLELISM,
            workers: 4,
            limits: ManifestLimits::default(),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Same as [`ControllerConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let d = Self::default();
        let duration = |key: &str, default: Duration| -> Result<Duration> {
            match get(key) {
                Some(raw) => parse_duration(raw.trim()).with_context(|| format!("{}={:?}", key, raw)),
                None => Ok(default),
            }
        };
        let number = |key: &str, default: usize| -> Result<usize> {
            match get(key) {
                Some(raw) => raw.trim().parse::<usize>().with_context(|| format!("{}={:?}", key, raw)),
                None => Ok(default),
            }
        };
        Ok(Self {
            pickup_timeout: Timeout(duration("SKIFF_PICKUP_TIMEOUT", d.pickup_timeout.duration())?),
            abort_timeout: Timeout(duration("SKIFF_ABORT_TIMEOUT", d.abort_timeout.duration())?),
            progressing_timeout: Timeout(duration("SKIFF_PROGRESSING_TIMEOUT", d.progressing_timeout.duration())?),
            failure_escalation: duration("SKIFF_FAILURE_ESCALATION", d.failure_escalation)?,
            retry_interval: duration("SKIFF_RETRY_INTERVAL", d.retry_interval)?,
            poll_interval: duration("SKIFF_POLL_INTERVAL", d.poll_interval)?,
            apply_parallelism: number("SKIFF_APPLY_PARALLELISM", d.apply_parallelism)?.max(1),
            workers: number("SKIFF_WORKERS", d.workers)?.max(1),
            limits: ManifestLimits {
                max_bytes: number("SKIFF_MAX_MANIFEST_BYTES", d.limits.max_bytes)?,
                max_nodes: number("SKIFF_MAX_MANIFEST_NODES", d.limits.max_nodes)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn unset_variables_keep_defaults() {
        let cfg = ControllerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.progressing_timeout, Timeout::from_secs(600));
        assert_eq!(cfg.failure_escalation, Duration::from_secs(300));
        assert_eq!(cfg.apply_parallelism, DEFAULT_PARALLELISM);
    }

    #[test]
    fn variables_override_and_bad_values_are_reported() {
        let vars: HashMap<&str, &str> =
            [("SKIFF_PICKUP_TIMEOUT", "30s"), ("SKIFF_APPLY_PARALLELISM", "0"), ("SKIFF_ABORT_TIMEOUT", "0s")].into_iter().collect();
        let cfg = ControllerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.pickup_timeout, Timeout::from_secs(30));
        assert!(cfg.abort_timeout.is_disabled());
        assert_eq!(cfg.apply_parallelism, 1);

        let err = ControllerConfig::from_lookup(|k| (k == "SKIFF_RETRY_INTERVAL").then(|| "-1s".to_string())).unwrap_err();
        assert!(format!("{:#}", err).contains("SKIFF_RETRY_INTERVAL"), "{:#}", err);
    }
}
