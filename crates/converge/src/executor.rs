//! Execution engine - drives each resource of a plan through its phases
//!
//! A plan for one target runs strictly sequentially in plan order.
//! Independent targets can be reconciled concurrently with
//! [`run_parallel`], each on its own worker.

use crate::context::{CancelToken, ProgressCallback};
use crate::diff::ChangeKind;
use crate::error::{Error, ErrorKind};
use crate::planner::ExecutionPlan;
use crate::report::{ChangeReport, FailureReport, Report, ResourceReport};
use crate::resource::Resource;
use crate::types::{ExecuteOptions, ImpactLevel, Outcome, Phase};
use rayon::prelude::*;

/// Execute a plan against a context.
///
/// Never fails as a whole: every problem ends up in the report entry of
/// the resource it belongs to, and resources whose hard prerequisites
/// failed are reported as blocked without being inspected.
pub fn execute<R, C, P>(
    target: &str,
    plan: ExecutionPlan<R>,
    ctx: &mut C,
    opts: &ExecuteOptions,
    progress: &mut P,
    cancel: &CancelToken,
) -> Report
where
    R: Resource<C>,
    C: ?Sized,
    P: ProgressCallback + ?Sized,
{
    let mut report = Report::new(target);
    report.dry_run = opts.dry_run;
    progress.on_plan_start(target, plan.len());

    for step in plan.into_steps() {
        let resource = step.resource;
        let mut entry = ResourceReport::pending(resource.key(), resource.description());

        let blocker = step
            .depends_on
            .iter()
            .filter_map(|&i| report.resources.get(i))
            .find(|r| r.is_failed())
            .map(|r| r.key.to_string());

        if let Some(blocker) = blocker {
            let err = Error::DependencyBlocked(blocker);
            log::warn!("{}: {}", entry.key, err);
            fail(&mut entry, &err, progress);
        } else if cancel.is_cancelled() {
            report.cancelled = true;
            fail(&mut entry, &Error::Cancelled, progress);
        } else {
            run_resource(&resource, &mut entry, ctx, opts, progress, cancel);
            if entry.error.as_ref().is_some_and(|e| e.kind == ErrorKind::Cancelled) {
                report.cancelled = true;
            }
        }

        report.resources.push(entry);
    }

    progress.on_plan_complete(target);
    report
}

fn run_resource<R, C, P>(
    resource: &R,
    entry: &mut ResourceReport,
    ctx: &mut C,
    opts: &ExecuteOptions,
    progress: &mut P,
    cancel: &CancelToken,
) where
    R: Resource<C>,
    C: ?Sized,
    P: ProgressCallback + ?Sized,
{
    advance(entry, Phase::Inspecting, progress);
    let actual = match resource.inspect(ctx) {
        Ok(actual) => actual,
        Err(err) => {
            log::warn!("{}: inspection failed: {}", entry.key, err);
            fail(entry, &err, progress);
            return;
        }
    };

    advance(entry, Phase::Diffing, progress);
    let changes = resource.diff(actual.as_ref());
    if changes.is_noop() {
        advance(entry, Phase::NoOp, progress);
        return;
    }

    advance(entry, Phase::Applying, progress);
    entry.impact = changes.max_impact();

    let mut failure: Option<Error> = None;
    for change in &changes {
        let outcome = if let Some(err) = &failure {
            Outcome::Skipped {
                reason: match err {
                    Error::Cancelled => "cancelled".to_string(),
                    _ => "previous change failed".to_string(),
                },
            }
        } else if cancel.is_cancelled() {
            failure = Some(Error::Cancelled);
            Outcome::Skipped {
                reason: "cancelled".to_string(),
            }
        } else if opts.dry_run {
            Outcome::Skipped {
                reason: "dry run".to_string(),
            }
        } else {
            match resource.apply(change, ctx) {
                Ok(outcome) => outcome,
                Err(Error::NotFound { .. }) if change.kind == ChangeKind::Drop => {
                    Outcome::Unchanged
                }
                Err(Error::NotFound { kind, name }) => {
                    let err = Error::Execution(match change.kind {
                        ChangeKind::Create => {
                            format!("{kind} '{name}' references an object that does not exist")
                        }
                        _ => format!("{kind} '{name}' disappeared"),
                    });
                    let outcome = Outcome::failed(&err);
                    failure = Some(err);
                    outcome
                }
                Err(err) => {
                    let outcome = Outcome::failed(&err);
                    failure = Some(err);
                    outcome
                }
            }
        };

        match &outcome {
            Outcome::Changed => log::info!("{}: {}", entry.key, change.summary),
            Outcome::Failed { reason, .. } => {
                log::warn!("{}: {} failed: {}", entry.key, change.summary, reason);
            }
            _ => log::debug!("{}: {} ({:?})", entry.key, change.summary, outcome),
        }
        progress.on_change(&entry.key, &change.summary, &outcome);
        entry.changes.push(ChangeReport {
            kind: change.kind,
            summary: change.summary.clone(),
            impact: change.impact,
            outcome,
        });
    }

    if let Some(err) = failure {
        fail(entry, &err, progress);
        return;
    }

    if opts.dry_run {
        if entry.impact > ImpactLevel::None {
            entry.notes.push(format!("{} required", entry.impact));
        }
    } else {
        match resource.settle(entry.impact, actual.as_ref(), ctx) {
            Ok(Some(note)) => entry.notes.push(note),
            Ok(None) => {}
            Err(err) => {
                log::warn!("{}: {}", entry.key, err);
                fail(entry, &err, progress);
                return;
            }
        }
    }

    advance(entry, Phase::Done, progress);
}

fn advance<P: ProgressCallback + ?Sized>(entry: &mut ResourceReport, next: Phase, progress: &mut P) {
    debug_assert!(
        entry.phase.can_advance_to(next),
        "illegal transition {} -> {}",
        entry.phase,
        next
    );
    log::debug!("{}: {} -> {}", entry.key, entry.phase, next);
    entry.phase = next;
    progress.on_phase(&entry.key, next);
}

fn fail<P: ProgressCallback + ?Sized>(entry: &mut ResourceReport, err: &Error, progress: &mut P) {
    entry.error = Some(FailureReport::from(err));
    advance(entry, Phase::Failed, progress);
}

/// Run independent jobs on a bounded worker pool, keeping input order.
///
/// Falls back to sequential execution if the pool cannot be created.
pub fn run_parallel<T, O, F>(items: Vec<T>, jobs: usize, f: F) -> Vec<O>
where
    T: Send,
    O: Send,
    F: Fn(T) -> O + Sync + Send,
{
    if jobs <= 1 || items.len() <= 1 {
        return items.into_iter().map(f).collect();
    }

    match rayon::ThreadPoolBuilder::new().num_threads(jobs).build() {
        Ok(pool) => pool.install(|| items.into_par_iter().map(&f).collect()),
        Err(e) => {
            log::warn!("Failed to create thread pool, running sequentially: {}", e);
            items.into_iter().map(f).collect()
        }
    }
}
