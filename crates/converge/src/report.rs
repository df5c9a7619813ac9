//! Structured execution report
//!
//! One entry per resource with its terminal phase, the changes attempted
//! and their outcomes. Serializable so the CLI can emit it as JSON.

use crate::diff::ChangeKind;
use crate::error::{Error, ErrorKind};
use crate::types::{ImpactLevel, Outcome, Phase, ResourceKey};
use serde::{Deserialize, Serialize};

/// Outcome of one atomic change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeReport {
    pub kind: ChangeKind,
    pub summary: String,
    pub impact: ImpactLevel,
    pub outcome: Outcome,
}

/// Failure attached to a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: ErrorKind,
    pub reason: String,
}

impl From<&Error> for FailureReport {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            reason: err.to_string(),
        }
    }
}

/// Terminal state of one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub key: ResourceKey,
    pub description: String,
    pub phase: Phase,
    /// Aggregated impact of the changes of this resource
    pub impact: ImpactLevel,
    pub changes: Vec<ChangeReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl ResourceReport {
    /// A fresh entry in the `Pending` phase.
    pub fn pending(key: ResourceKey, description: impl Into<String>) -> Self {
        Self {
            key,
            description: description.into(),
            phase: Phase::Pending,
            impact: ImpactLevel::None,
            changes: Vec::new(),
            error: None,
            notes: Vec::new(),
        }
    }

    /// Check if the resource failed (including blocked)
    pub fn is_failed(&self) -> bool {
        self.phase == Phase::Failed
    }

    /// Check if the resource was blocked by a failed prerequisite
    pub fn is_blocked(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(|e| e.kind == ErrorKind::DependencyBlocked)
    }

    /// First change whose outcome is a failure
    pub fn failing_change(&self) -> Option<&ChangeReport> {
        self.changes.iter().find(|c| c.outcome.is_failure())
    }

    /// Number of changes that modified the live system
    pub fn changed(&self) -> usize {
        self.changes.iter().filter(|c| c.outcome.is_change()).count()
    }
}

/// Aggregated report for one target (e.g. one instance)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub target: String,
    pub resources: Vec<ResourceReport>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub cancelled: bool,
}

impl Report {
    /// An empty report for a target
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    /// A report for a target rejected before any resource was touched.
    pub fn rejected(target: impl Into<String>, key: ResourceKey, err: &Error) -> Self {
        let mut entry = ResourceReport::pending(key, "manifest");
        entry.phase = Phase::Failed;
        entry.error = Some(err.into());
        Self {
            target: target.into(),
            resources: vec![entry],
            ..Self::default()
        }
    }

    /// Look up the entry for a resource
    pub fn get(&self, key: &ResourceKey) -> Option<&ResourceReport> {
        self.resources.iter().find(|r| &r.key == key)
    }

    /// Check if any resource failed
    pub fn has_failures(&self) -> bool {
        self.resources.iter().any(ResourceReport::is_failed)
    }

    /// Count resources by terminal state
    pub fn summary(&self) -> ExecuteSummary {
        let mut summary = ExecuteSummary::default();
        for r in &self.resources {
            summary.add(r);
        }
        summary
    }
}

/// Summary counts across resources
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSummary {
    /// Resources that converged through changes
    pub done: usize,
    /// Resources already converged
    pub noop: usize,
    /// Resources that failed on their own
    pub failed: usize,
    /// Resources blocked by a failed prerequisite
    pub blocked: usize,
    /// Atomic changes applied
    pub changes: usize,
}

impl ExecuteSummary {
    /// Add one resource entry
    pub fn add(&mut self, r: &ResourceReport) {
        match r.phase {
            Phase::Done => self.done += 1,
            Phase::NoOp => self.noop += 1,
            Phase::Failed if r.is_blocked() => self.blocked += 1,
            Phase::Failed => self.failed += 1,
            _ => {}
        }
        self.changes += r.changed();
    }

    /// Merge another summary
    pub fn merge(&mut self, other: &Self) {
        self.done += other.done;
        self.noop += other.noop;
        self.failed += other.failed;
        self.blocked += other.blocked;
        self.changes += other.changes;
    }

    /// Check if everything converged
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.blocked == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(phase: Phase, error: Option<ErrorKind>) -> ResourceReport {
        let mut r = ResourceReport::pending(ResourceKey::new("role", "x"), "Role x");
        r.phase = phase;
        r.error = error.map(|kind| FailureReport {
            kind,
            reason: String::new(),
        });
        r
    }

    #[test]
    fn test_summary_counts_blocked_separately() {
        let mut report = Report::new("16/main");
        report.resources.push(entry(Phase::Done, None));
        report.resources.push(entry(Phase::NoOp, None));
        report
            .resources
            .push(entry(Phase::Failed, Some(ErrorKind::Execution)));
        report
            .resources
            .push(entry(Phase::Failed, Some(ErrorKind::DependencyBlocked)));

        let summary = report.summary();
        assert_eq!(summary.done, 1);
        assert_eq!(summary.noop, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.blocked, 1);
        assert!(!summary.is_success());
        assert!(report.has_failures());
    }

    #[test]
    fn test_json_shape() {
        let mut r = entry(Phase::Done, None);
        r.changes.push(ChangeReport {
            kind: ChangeKind::Create,
            summary: "create role".into(),
            impact: ImpactLevel::None,
            outcome: Outcome::Changed,
        });
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["phase"], "done");
        assert_eq!(json["changes"][0]["outcome"]["status"], "changed");
        assert!(json.get("error").is_none());
    }
}
