//! What a failed step does to the work item's phase.

use std::time::Duration;

use chrono::{DateTime, Utc};
use skiff_core::{DeployError, ErrorClass, LastError, Phase};

/// Phase after a step failed with an error of `class`, given the error just recorded.
///
/// Configuration errors, timeouts and interruptions end the attempt. A transient
/// error keeps the item in its `running` phase until the same error has been
/// repeating for `escalation`.
pub fn after_error(class: ErrorClass, recorded: &LastError, escalation: Duration, now: DateTime<Utc>, running: Phase) -> Phase {
    match class {
        ErrorClass::Configuration | ErrorClass::Timeout | ErrorClass::Interrupted => Phase::Failed,
        ErrorClass::Transient => {
            let repeating = (now - recorded.last_transition_time).to_std().unwrap_or(Duration::ZERO);
            if repeating >= escalation {
                Phase::Failed
            } else {
                running
            }
        }
    }
}

/// Record `err` raised by `operation` on top of the previous error.
pub fn record(prev: Option<&LastError>, operation: &str, err: &DeployError, now: DateTime<Utc>) -> LastError {
    LastError::updated(prev, operation, err.reason(), &err.to_string(), now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use skiff_core::{ClusterError, ObjectRef};

    fn transient() -> DeployError {
        DeployError::cluster("create", &ObjectRef::new("v1", "ConfigMap", Some("ns"), "a"), ClusterError::Transport("eof".into()))
    }

    #[test]
    fn transient_errors_escalate_after_repeating() {
        let t0 = Utc::now();
        let escalation = Duration::from_secs(300);
        let first = record(None, "Apply", &transient(), t0);
        assert_eq!(after_error(ErrorClass::Transient, &first, escalation, t0, Phase::Progressing), Phase::Progressing);

        let later = t0 + ChronoDuration::seconds(301);
        let again = record(Some(&first), "Apply", &transient(), later);
        assert_eq!(again.last_transition_time, t0);
        assert_eq!(after_error(ErrorClass::Transient, &again, escalation, later, Phase::Progressing), Phase::Failed);
    }

    #[test]
    fn a_different_error_restarts_the_clock() {
        let t0 = Utc::now();
        let first = record(None, "Apply", &transient(), t0);
        let later = t0 + ChronoDuration::seconds(301);
        let other = record(Some(&first), "Export", &transient(), later);
        assert_eq!(after_error(ErrorClass::Transient, &other, Duration::from_secs(300), later, Phase::Deleting), Phase::Deleting);
    }

    #[test]
    fn terminal_classes_fail_at_once() {
        let now = Utc::now();
        let e = record(None, "Validate", &DeployError::Configuration("x".into()), now);
        for class in [ErrorClass::Configuration, ErrorClass::Timeout, ErrorClass::Interrupted] {
            assert_eq!(after_error(class, &e, Duration::from_secs(300), now, Phase::Progressing), Phase::Failed);
        }
        assert_eq!(after_error(ErrorClass::Transient, &e, Duration::ZERO, now, Phase::Progressing), Phase::Failed);
    }
}
