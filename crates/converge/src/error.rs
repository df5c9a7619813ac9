//! Error taxonomy for reconciliation.
//!
//! Errors are categorized so the executor can decide what happens next:
//! a validation error aborts before anything is touched, an execution error
//! or timeout fails one resource and blocks its dependents, a missing
//! resource is only an error when something other than a drop targets it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Serializable discriminant of [`Error`], used in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The resource does not exist
    NotFound,
    /// The manifest was rejected before acting
    Validation,
    /// A prerequisite resource failed or is itself blocked
    DependencyBlocked,
    /// The underlying call failed (connectivity, permission, constraint)
    Execution,
    /// The underlying call did not finish within its bound
    Timeout,
    /// The run was interrupted before this work started
    Cancelled,
}

impl ErrorKind {
    /// Short label for human output.
    pub fn label(&self) -> &'static str {
        match self {
            Self::NotFound => "not found",
            Self::Validation => "invalid manifest",
            Self::DependencyBlocked => "blocked by dependency",
            Self::Execution => "execution error",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors raised while inspecting or applying resources.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Resource absent. Not an error during inspection.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Resource kind (e.g. "role")
        kind: String,
        /// Resource name
        name: String,
    },

    /// Normalization rejected the manifest
    #[error("invalid manifest: {0}")]
    Validation(String),

    /// A prerequisite failed
    #[error("blocked by failed dependency {0}")]
    DependencyBlocked(String),

    /// Underlying call failed
    #[error("{0}")]
    Execution(String),

    /// Underlying call exceeded its bound
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Interrupted before starting
    #[error("cancelled before start")]
    Cancelled,
}

impl Error {
    /// Build a not-found error.
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Build an execution error from any displayable cause.
    pub fn execution(cause: impl fmt::Display) -> Self {
        Self::Execution(cause.to_string())
    }

    /// Build a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Validation(_) => ErrorKind::Validation,
            Self::DependencyBlocked(_) => ErrorKind::DependencyBlocked,
            Self::Execution(_) => ErrorKind::Execution,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::not_found("role", "bob").kind(), ErrorKind::NotFound);
        assert_eq!(Error::validation("x").kind(), ErrorKind::Validation);
        assert_eq!(
            Error::Timeout(Duration::from_secs(3)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_not_found_message() {
        let err = Error::not_found("database", "app");
        assert_eq!(err.to_string(), "database 'app' not found");
    }
}
