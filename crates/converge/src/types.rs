//! Core types for reconciliation

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Minimum service disruption a change requires to take effect.
///
/// Ordered, so the aggregate impact of a resource is the maximum over
/// its changes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    /// Effective immediately
    #[default]
    None,
    /// Effective after a configuration reload
    Reload,
    /// Effective after a process restart
    Restart,
}

impl fmt::Display for ImpactLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Reload => "reload",
            Self::Restart => "restart",
        })
    }
}

/// Stable identity of a resource within one plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Resource kind (e.g. "role", "database")
    pub kind: String,
    /// Name, unique within the kind
    pub name: String,
}

impl ResourceKey {
    /// Create a key.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Per-resource reconciliation phase.
///
/// `Pending -> Inspecting -> Diffing -> (NoOp | Applying) -> Done | Failed`.
/// Any non-terminal phase may go straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Inspecting,
    Diffing,
    NoOp,
    Applying,
    Done,
    Failed,
}

impl Phase {
    /// Terminal phases end a resource's reconciliation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NoOp | Self::Done | Self::Failed)
    }

    /// Successful terminal phases.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::NoOp | Self::Done)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(&self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Pending, Inspecting) | (Inspecting, Diffing) => true,
            (Diffing, NoOp) | (Diffing, Applying) => true,
            (Applying, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Inspecting => "inspecting",
            Self::Diffing => "diffing",
            Self::NoOp => "no-op",
            Self::Applying => "applying",
            Self::Done => "done",
            Self::Failed => "failed",
        })
    }
}

/// Result of applying one atomic change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The live system was modified
    Changed,
    /// The live system already matched
    Unchanged,
    /// The change was not attempted
    Skipped { reason: String },
    /// The change failed
    Failed { kind: ErrorKind, reason: String },
}

impl Outcome {
    /// Check if the outcome represents a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// Check if the outcome represents a change
    pub fn is_change(&self) -> bool {
        matches!(self, Self::Changed)
    }

    /// Build a failed outcome from an error.
    pub fn failed(err: &crate::Error) -> Self {
        Self::Failed {
            kind: err.kind(),
            reason: err.to_string(),
        }
    }
}

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Don't make changes, just report what would happen
    pub dry_run: bool,
    /// Number of independent targets reconciled concurrently
    pub jobs: usize,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            jobs: 4,
        }
    }
}
