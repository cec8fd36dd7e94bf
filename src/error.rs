//! Error types for the virt-autopilot operator

use thiserror::Error;

/// Main error type for autopilot operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Asset template rendering error
    #[error("render error: {0}")]
    Render(String),

    /// Invalid user override annotation (malformed patch, bad pointer,
    /// disallowed patch target)
    #[error("invalid override: {0}")]
    InvalidOverride(String),

    /// Refused to write a live object that lacks the ownership label
    #[error("adoption refused: {0}")]
    AdoptionRefused(String),

    /// Asset catalog validation error (startup fatal)
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Tombstone declaration validation error (startup fatal)
    #[error("tombstone error: {0}")]
    Tombstone(String),

    /// One or more assets failed to reconcile; details were logged and
    /// surfaced as events per asset
    #[error("reconciliation completed with {failures} failure(s)")]
    ReconcileFailed {
        /// Number of assets that failed
        failures: usize,
    },

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a render error with the given message
    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }

    /// Create an invalid-override error with the given message
    pub fn invalid_override(msg: impl Into<String>) -> Self {
        Self::InvalidOverride(msg.into())
    }

    /// Create an adoption-refused error with the given message
    pub fn adoption_refused(msg: impl Into<String>) -> Self {
        Self::AdoptionRefused(msg.into())
    }

    /// Create a catalog validation error with the given message
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    /// Create a tombstone validation error with the given message
    pub fn tombstone(msg: impl Into<String>) -> Self {
        Self::Tombstone(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True for errors caused by user-supplied annotations rather than the
    /// cluster or the operator itself. These skip the object instead of
    /// failing the reconciliation.
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::InvalidOverride(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_set_variant_and_message() {
        match Error::invalid_override("bad patch") {
            Error::InvalidOverride(msg) => assert_eq!(msg, "bad patch"),
            other => panic!("unexpected variant: {other:?}"),
        }

        match Error::adoption_refused("ConfigMap/default/cfg") {
            Error::AdoptionRefused(msg) => assert!(msg.contains("cfg")),
            other => panic!("unexpected variant: {other:?}"),
        }

        let err = Error::catalog("opt-in asset with no conditions");
        assert!(err.to_string().contains("catalog error"));
    }

    #[test]
    fn user_errors_are_distinguished() {
        assert!(Error::invalid_override("x").is_user_error());
        assert!(!Error::render("x").is_user_error());
        assert!(!Error::internal("x").is_user_error());
    }

    #[test]
    fn reconcile_failed_reports_count() {
        let err = Error::ReconcileFailed { failures: 3 };
        assert!(err.to_string().contains("3 failure(s)"));
    }
}
