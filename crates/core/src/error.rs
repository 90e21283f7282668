//! Error taxonomy of the deployment engine.

use crate::model::ObjectRef;

/// Failure talking to a target cluster.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    /// The kind is not served by the target (e.g. its CRD is gone).
    #[error("no match for kind {0}")]
    NoMatch(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("decode: {0}")]
    Decode(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    /// Not found, or the kind itself vanished: the object cannot exist anymore.
    pub fn is_gone(&self) -> bool {
        matches!(self, ClusterError::NotFound(_) | ClusterError::NoMatch(_))
    }
}

/// How the reconciler treats an error when computing the next phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorClass {
    Configuration,
    Transient,
    Interrupted,
    Timeout,
}

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("no target configured for work item")]
    NoTarget,
    #[error("target {target}: {message}")]
    Target { target: String, message: String },
    #[error("{operation} {resource}: {source}")]
    Cluster {
        operation: &'static str,
        resource: ObjectRef,
        #[source]
        source: ClusterError,
    },
    #[error("{0}")]
    Object(String),
    #[error("object {resource} is managed by work item {owner}")]
    ForeignOwner { resource: ObjectRef, owner: String },
    #[error("{} error(s) occurred: {}", .0.len(), join_messages(.0))]
    Aggregate(Vec<DeployError>),
    #[error("{resource} is not ready: {message}")]
    NotReady { resource: String, message: String },
    #[error("timeout at {checkpoint:?}: {message}")]
    Timeout { checkpoint: String, message: String },
    #[error("interrupted at {checkpoint:?}")]
    Interrupted { checkpoint: String },
    #[error("export {key:?}: {message}")]
    Export { key: String, message: String },
    #[error("status write failed: {0}")]
    Status(String),
}

fn join_messages(errs: &[DeployError]) -> String {
    errs.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

impl DeployError {
    pub fn cluster(operation: &'static str, resource: &ObjectRef, source: ClusterError) -> Self {
        DeployError::Cluster { operation, resource: resource.clone(), source }
    }

    /// Collapse a list of errors: none → `None`, one → itself, more → `Aggregate`.
    pub fn aggregate(mut errs: Vec<DeployError>) -> Option<DeployError> {
        match errs.len() {
            0 => None,
            1 => errs.pop(),
            _ => Some(DeployError::Aggregate(errs)),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            DeployError::Configuration(_) | DeployError::NoTarget => ErrorClass::Configuration,
            DeployError::Timeout { .. } => ErrorClass::Timeout,
            DeployError::Interrupted { .. } => ErrorClass::Interrupted,
            DeployError::Aggregate(errs) => {
                let classes: Vec<ErrorClass> = errs.iter().map(|e| e.class()).collect();
                if !classes.is_empty() && classes.iter().all(|c| *c == ErrorClass::Configuration) {
                    ErrorClass::Configuration
                } else {
                    classes.into_iter().filter(|c| *c != ErrorClass::Configuration).max().unwrap_or(ErrorClass::Transient)
                }
            }
            _ => ErrorClass::Transient,
        }
    }

    pub fn is_timeout(&self) -> bool { self.class() == ErrorClass::Timeout }
    pub fn is_interrupted(&self) -> bool { self.class() == ErrorClass::Interrupted }

    /// Reason recorded in `lastError.reason`.
    pub fn reason(&self) -> &'static str {
        match self {
            DeployError::Configuration(_) => "InvalidConfiguration",
            DeployError::NoTarget => "NoTarget",
            DeployError::Target { .. } => "TargetClusterClient",
            DeployError::Cluster { .. } | DeployError::Object(_) => "ClusterOperation",
            DeployError::ForeignOwner { .. } => "ForeignOwner",
            DeployError::Aggregate(_) => match self.class() {
                ErrorClass::Timeout => "ProgressingTimeout",
                ErrorClass::Interrupted => "Interrupted",
                _ => "MultipleErrors",
            },
            DeployError::NotReady { .. } => "NotReady",
            DeployError::Timeout { .. } => "ProgressingTimeout",
            DeployError::Interrupted { .. } => "Interrupted",
            DeployError::Export { .. } => "Export",
            DeployError::Status(_) => "StatusWrite",
        }
    }
}

impl From<crate::duration::DurationError> for DeployError {
    fn from(e: crate::duration::DurationError) -> Self {
        DeployError::Configuration(e.to_string())
    }
}

pub type DeployResult<T> = Result<T, DeployError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn cm() -> ObjectRef { ObjectRef::new("v1", "ConfigMap", Some("ns"), "a") }

    #[test]
    fn aggregate_collapses() {
        assert!(DeployError::aggregate(vec![]).is_none());
        let one = DeployError::aggregate(vec![DeployError::NoTarget]).unwrap();
        assert!(matches!(one, DeployError::NoTarget));
        let many = DeployError::aggregate(vec![DeployError::NoTarget, DeployError::Object("x".into())]).unwrap();
        assert!(many.to_string().starts_with("2 error(s) occurred"));
    }

    #[test]
    fn aggregate_class_prefers_timeout() {
        let e = DeployError::Aggregate(vec![
            DeployError::cluster("create", &cm(), ClusterError::Transport("eof".into())),
            DeployError::Timeout { checkpoint: "deployer: cleanup orphaned".into(), message: "late".into() },
        ]);
        assert_eq!(e.class(), ErrorClass::Timeout);
        assert_eq!(e.reason(), "ProgressingTimeout");
    }

    #[test]
    fn aggregate_of_configuration_errors_is_configuration() {
        let e = DeployError::Aggregate(vec![DeployError::Configuration("a".into()), DeployError::Configuration("b".into())]);
        assert_eq!(e.class(), ErrorClass::Configuration);
        let mixed = DeployError::Aggregate(vec![DeployError::Configuration("a".into()), DeployError::Object("b".into())]);
        assert_eq!(mixed.class(), ErrorClass::Transient);
    }

    #[test]
    fn gone_covers_no_match() {
        assert!(ClusterError::NoMatch("x".into()).is_gone());
        assert!(!ClusterError::Conflict("x".into()).is_gone());
    }
}
