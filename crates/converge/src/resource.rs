//! Resource trait for reconciliation
//!
//! A Resource pairs a desired document with the means to inspect the
//! matching actual document, diff the two and apply atomic changes.
//! The context type `C` carries whatever collaborators the resource needs
//! (database session, service manager, filesystem access).

use crate::diff::{Change, ChangeSet};
use crate::error::Result;
use crate::types::{ImpactLevel, Outcome, ResourceKey};

/// Core trait for reconciled resources
///
/// # Example
///
/// ```
/// use converge::{Change, ChangeKind, ChangeSet, Outcome, Resource, ResourceKey, Result};
///
/// #[derive(Debug)]
/// struct Marker { name: String }
///
/// struct Host { markers: Vec<String> }
///
/// impl Resource<Host> for Marker {
///     type Actual = ();
///     type Action = ();
///
///     fn key(&self) -> ResourceKey { ResourceKey::new("marker", &self.name) }
///     fn description(&self) -> String { format!("Marker {}", self.name) }
///
///     fn inspect(&self, host: &mut Host) -> Result<Option<()>> {
///         Ok(host.markers.contains(&self.name).then_some(()))
///     }
///
///     fn diff(&self, actual: Option<&()>) -> ChangeSet<()> {
///         let mut changes = ChangeSet::new();
///         if actual.is_none() {
///             changes.push(Change::new(ChangeKind::Create, "create marker", ()));
///         }
///         changes
///     }
///
///     fn apply(&self, _change: &Change<()>, host: &mut Host) -> Result<Outcome> {
///         host.markers.push(self.name.clone());
///         Ok(Outcome::Changed)
///     }
/// }
/// ```
pub trait Resource<C: ?Sized> {
    /// Inspected document shape
    type Actual;
    /// Resource-specific payload of an atomic change
    type Action;

    /// Unique identifier for this resource within a plan
    fn key(&self) -> ResourceKey;

    /// Human-readable description
    fn description(&self) -> String;

    /// Read the actual document.
    ///
    /// Returns `Ok(None)` when the resource does not exist; errors are
    /// reserved for connectivity or permission failures. Must not mutate.
    fn inspect(&self, ctx: &mut C) -> Result<Option<Self::Actual>>;

    /// Compare the desired document with the actual one.
    ///
    /// Pure: an empty change set means the resource already converged.
    fn diff(&self, actual: Option<&Self::Actual>) -> ChangeSet<Self::Action>;

    /// Apply exactly one atomic change through one collaborator call.
    fn apply(&self, change: &Change<Self::Action>, ctx: &mut C) -> Result<Outcome>;

    /// Act on the aggregated impact once every change of this resource
    /// succeeded (e.g. reload or restart a service).
    ///
    /// Returns an optional note for the report.
    fn settle(
        &self,
        _impact: ImpactLevel,
        _actual: Option<&Self::Actual>,
        _ctx: &mut C,
    ) -> Result<Option<String>> {
        Ok(None)
    }
}
