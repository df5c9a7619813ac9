//! Change sets produced by comparing desired and actual documents

use crate::types::ImpactLevel;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What an atomic change does to its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Bring the resource into existence
    Create,
    /// Set or reset one aspect of an existing resource
    Alter,
    /// Remove the resource
    Drop,
}

impl ChangeKind {
    /// Diff-style symbol
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Alter => "~",
            Self::Drop => "-",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Alter => "alter",
            Self::Drop => "drop",
        })
    }
}

/// One atomic change, carrying the resource-specific action to perform.
#[derive(Debug, Clone, PartialEq)]
pub struct Change<A> {
    pub kind: ChangeKind,
    /// Human-readable summary, e.g. "set connection_limit: none -> 10"
    pub summary: String,
    pub impact: ImpactLevel,
    pub action: A,
}

impl<A> Change<A> {
    /// A change with no service impact.
    pub fn new(kind: ChangeKind, summary: impl Into<String>, action: A) -> Self {
        Self {
            kind,
            summary: summary.into(),
            impact: ImpactLevel::None,
            action,
        }
    }

    /// Tag the change with the impact it requires.
    pub fn with_impact(mut self, impact: ImpactLevel) -> Self {
        self.impact = impact;
        self
    }
}

/// Ordered list of atomic changes for one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet<A> {
    changes: Vec<Change<A>>,
}

impl<A> ChangeSet<A> {
    /// Create an empty change set
    pub fn new() -> Self {
        Self {
            changes: Vec::new(),
        }
    }

    /// Append a change, keeping insertion order.
    pub fn push(&mut self, change: Change<A>) {
        self.changes.push(change);
    }

    /// Append all changes from another set.
    pub fn extend(&mut self, other: ChangeSet<A>) {
        self.changes.extend(other.changes);
    }

    /// The no-op marker: nothing needs to be applied.
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of changes
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Check if there are no changes
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Maximum impact level across all changes.
    pub fn max_impact(&self) -> ImpactLevel {
        self.changes
            .iter()
            .map(|c| c.impact)
            .max()
            .unwrap_or_default()
    }

    /// Iterate over changes in order
    pub fn iter(&self) -> std::slice::Iter<'_, Change<A>> {
        self.changes.iter()
    }

    /// Borrow the changes
    pub fn as_slice(&self) -> &[Change<A>] {
        &self.changes
    }
}

impl<A> Default for ChangeSet<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> From<Vec<Change<A>>> for ChangeSet<A> {
    fn from(changes: Vec<Change<A>>) -> Self {
        Self { changes }
    }
}

impl<A> IntoIterator for ChangeSet<A> {
    type Item = Change<A>;
    type IntoIter = std::vec::IntoIter<Change<A>>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.into_iter()
    }
}

impl<'a, A> IntoIterator for &'a ChangeSet<A> {
    type Item = &'a Change<A>;
    type IntoIter = std::slice::Iter<'a, Change<A>>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

/// Diff summary statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub creates: usize,
    pub alters: usize,
    pub drops: usize,
}

impl DiffSummary {
    /// Count changes of a set
    pub fn add<A>(&mut self, changes: &ChangeSet<A>) {
        for change in changes {
            match change.kind {
                ChangeKind::Create => self.creates += 1,
                ChangeKind::Alter => self.alters += 1,
                ChangeKind::Drop => self.drops += 1,
            }
        }
    }

    /// Total number of changes
    pub fn total(&self) -> usize {
        self.creates + self.alters + self.drops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_set_is_noop() {
        let set: ChangeSet<()> = ChangeSet::new();
        assert!(set.is_noop());
        assert_eq!(set.max_impact(), ImpactLevel::None);
    }

    #[test]
    fn test_max_impact() {
        let mut set = ChangeSet::new();
        set.push(Change::new(ChangeKind::Alter, "a", ()).with_impact(ImpactLevel::Reload));
        set.push(Change::new(ChangeKind::Alter, "b", ()).with_impact(ImpactLevel::Restart));
        set.push(Change::new(ChangeKind::Alter, "c", ()));
        assert_eq!(set.max_impact(), ImpactLevel::Restart);
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_summary_counts() {
        let set: ChangeSet<()> = vec![
            Change::new(ChangeKind::Create, "x", ()),
            Change::new(ChangeKind::Alter, "y", ()),
            Change::new(ChangeKind::Alter, "z", ()),
        ]
        .into();
        let mut summary = DiffSummary::default();
        summary.add(&set);
        assert_eq!(summary.creates, 1);
        assert_eq!(summary.alters, 2);
        assert_eq!(summary.total(), 3);
    }
}
