//! # Converge
//!
//! A framework for reconciling live systems with desired-state documents.
//!
//! ## Core Concepts
//!
//! - **Resource**: something that can be inspected, diffed and changed
//!   one atomic step at a time
//! - **Field**: a tri-state manifest field telling "unspecified" apart
//!   from "explicitly cleared"
//! - **ChangeSet**: ordered atomic changes, each tagged with its impact
//! - **ExecutionPlan**: resources in dependency order (stable topological
//!   sort over hard and ordering-only edges)
//! - **Executor**: runs a plan sequentially through the per-resource state
//!   machine and aggregates a [`Report`]
//!
//! ## Provider Traits
//!
//! - [`ProgressCallback`]: receives phase and change updates
//! - [`ConfirmCallback`]: handles user confirmations
//!
//! This allows the crate to be used without hard dependencies on
//! specific UI frameworks.

pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod field;
pub mod planner;
pub mod report;
pub mod resource;
pub mod types;

// Re-export main types at crate root
pub use context::{AutoConfirm, AutoDecline, CancelToken, ConfirmCallback, NoProgress, ProgressCallback};
pub use diff::{Change, ChangeKind, ChangeSet, DiffSummary};
pub use error::{Error, ErrorKind, Result};
pub use executor::{execute, run_parallel};
pub use field::{Field, FieldChange, compare};
pub use planner::{Dependency, ExecutionPlan, PlanBuilder, PlanError, PlanStep};
pub use report::{ChangeReport, ExecuteSummary, FailureReport, Report, ResourceReport};
pub use resource::Resource;
pub use types::{ExecuteOptions, ImpactLevel, Outcome, Phase, ResourceKey};
