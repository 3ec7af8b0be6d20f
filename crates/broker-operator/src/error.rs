//! Error types for the broker operator
//!
//! Every failure carries a retry directive ([`OperatorError::requeue`]). The
//! controllers' error policies decide requeue behaviour from that directive
//! alone and never look at messages.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Unrecognised failure reported by a broker management endpoint
    #[error("Unknown management error: {0}")]
    UnknownManagement(String),

    /// No broker replica could be reached
    #[error("No management client available: {0}")]
    NoManagementClient(String),

    /// Expected and current status values differ
    #[error("Status out of sync: expected {expected}, current {current}")]
    StatusOutOfSync { expected: String, current: String },

    /// A status key that should exist is missing
    #[error("Status out of sync: missing key {0}")]
    StatusOutOfSyncMissingKey(String),

    /// Batch apply failed on one or more targets
    #[error(transparent)]
    Apply(#[from] ApplyError),

    /// Management call exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Finalizer error
    #[error("Finalizer error: {0}")]
    FinalizerError(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Whether the caller should schedule another reconciliation
    pub fn requeue(&self) -> bool {
        match self {
            OperatorError::KubeError(_)
            | OperatorError::NoManagementClient(_)
            | OperatorError::StatusOutOfSync { .. }
            | OperatorError::StatusOutOfSyncMissingKey(_)
            | OperatorError::Timeout(_)
            | OperatorError::FinalizerError(_) => true,
            OperatorError::Apply(e) => e.requeue(),
            OperatorError::UnknownManagement(_)
            | OperatorError::InvalidConfig(_)
            | OperatorError::SerializationError(_) => false,
        }
    }

    /// Requeue delay for errors that ask for one
    pub fn requeue_delay(&self, resync: Duration) -> Option<Duration> {
        self.requeue().then_some(resync)
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            OperatorError::KubeError(_) => "kube",
            OperatorError::UnknownManagement(_) => "unknown_management",
            OperatorError::NoManagementClient(_) => "no_management_client",
            OperatorError::StatusOutOfSync { .. }
            | OperatorError::StatusOutOfSyncMissingKey(_) => "status_out_of_sync",
            OperatorError::Apply(_) => "apply",
            OperatorError::Timeout(_) => "timeout",
            OperatorError::InvalidConfig(_) => "invalid_config",
            OperatorError::SerializationError(_) => "serialization",
            OperatorError::FinalizerError(_) => "finalizer",
        }
    }
}

impl<E> From<kube::runtime::finalizer::Error<E>> for OperatorError
where
    E: Into<OperatorError> + std::error::Error + 'static,
{
    fn from(err: kube::runtime::finalizer::Error<E>) -> Self {
        use kube::runtime::finalizer::Error;
        match err {
            Error::ApplyFailed(e) | Error::CleanupFailed(e) => e.into(),
            other => OperatorError::FinalizerError(other.to_string()),
        }
    }
}

/// Failure of a batch apply, keeping the reason per target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyError {
    cause: String,
    detail: BTreeMap<String, String>,
    transient: bool,
}

impl ApplyError {
    pub fn new(cause: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
            ..Default::default()
        }
    }

    /// Record `reason` for `target`, appending to any earlier reason
    pub fn add(&mut self, target: impl Into<String>, reason: impl Into<String>) {
        let reason = reason.into();
        self.detail
            .entry(target.into())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&reason);
            })
            .or_insert(reason);
    }

    /// Record a failure that is expected to clear on its own
    pub fn add_transient(&mut self, target: impl Into<String>, reason: impl Into<String>) {
        self.transient = true;
        self.add(target, reason);
    }

    pub fn is_empty(&self) -> bool {
        self.detail.is_empty()
    }

    pub fn cause(&self) -> &str {
        &self.cause
    }

    pub fn detail(&self) -> &BTreeMap<String, String> {
        &self.detail
    }

    /// Requeue only when at least one target failed for a transient reason
    pub fn requeue(&self) -> bool {
        self.transient
    }

    /// `Err(self)` when any target failed
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ApplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Apply failed: {}", self.cause)?;
        for (target, reason) in &self.detail {
            write!(f, "; {}: {}", target, reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApplyError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::StatusOutOfSync {
            expected: "3".to_string(),
            current: "2".to_string(),
        };
        assert!(err.to_string().contains("expected 3"));
        assert!(err.to_string().contains("current 2"));
    }

    #[test]
    fn test_requeue_directive() {
        assert!(OperatorError::NoManagementClient("none".into()).requeue());
        assert!(OperatorError::StatusOutOfSyncMissingKey("size".into()).requeue());
        assert!(OperatorError::Timeout("test".into()).requeue());
        assert!(!OperatorError::UnknownManagement("boom".into()).requeue());
        assert!(!OperatorError::InvalidConfig("bad".into()).requeue());
    }

    #[test]
    fn test_requeue_delay() {
        let resync = Duration::from_secs(30);
        assert_eq!(
            OperatorError::Timeout("test".into()).requeue_delay(resync),
            Some(resync)
        );
        assert_eq!(
            OperatorError::InvalidConfig("test".into()).requeue_delay(resync),
            None
        );
    }

    #[test]
    fn test_apply_error_joins_reasons_per_target() {
        let mut err = ApplyError::new("create queue");
        err.add("broker-0", "first");
        err.add("broker-0", "second");
        err.add("broker-1", "other");

        assert_eq!(err.detail().get("broker-0").unwrap(), "first, second");
        assert_eq!(err.detail().len(), 2);
        assert!(!err.requeue());

        let rendered = err.to_string();
        assert!(rendered.contains("create queue"));
        assert!(rendered.contains("broker-1: other"));
    }

    #[test]
    fn test_apply_error_transient() {
        let mut err = ApplyError::new("create address");
        err.add("broker-0", "remote rejected");
        err.add_transient("broker-1", "pod not found");
        assert!(err.requeue());
        assert!(OperatorError::from(err).requeue());
    }

    #[test]
    fn test_apply_error_into_result() {
        assert!(ApplyError::new("noop").into_result().is_ok());

        let mut err = ApplyError::new("x");
        err.add("t", "r");
        assert!(err.into_result().is_err());
    }

    #[test]
    fn test_finalizer_error_keeps_inner_directive() {
        let inner = OperatorError::UnknownManagement("hard".into());
        let wrapped: OperatorError =
            kube::runtime::finalizer::Error::ApplyFailed(inner).into();
        assert!(matches!(wrapped, OperatorError::UnknownManagement(_)));
        assert!(!wrapped.requeue());

        let missing: OperatorError =
            kube::runtime::finalizer::Error::<OperatorError>::UnnamedObject.into();
        assert!(matches!(missing, OperatorError::FinalizerError(_)));
        assert!(missing.requeue());
    }
}
