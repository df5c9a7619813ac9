//! Report rendering for the terminal and for machines

use anyhow::{Context as AnyhowContext, Result};
use colored::{ColoredString, Colorize};
use converge::{ChangeKind, ChangeReport, ExecuteSummary, Outcome, Phase, Report, ResourceReport};

/// Output format of reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    Text,
    Json,
}

/// Render reports in the requested format.
pub fn reports(reports: &[Report], format: Format, verbose: bool) -> Result<String> {
    match format {
        Format::Json => {
            serde_json::to_string_pretty(reports).context("Failed to serialize reports")
        }
        Format::Text => {
            let mut out = String::new();
            for report in reports {
                out.push_str(&text(report, verbose));
                out.push('\n');
            }
            if reports.len() > 1 {
                out.push_str(&totals(reports));
            }
            Ok(out)
        }
    }
}

/// Summary over every report
pub fn total_summary(reports: &[Report]) -> ExecuteSummary {
    let mut total = ExecuteSummary::default();
    for report in reports {
        total.merge(&report.summary());
    }
    total
}

fn totals(reports: &[Report]) -> String {
    let dry_run = reports.iter().all(|r| r.dry_run);
    let mut total = ExecuteSummary::default();
    for report in reports {
        total.merge(&summary(report));
    }
    format!("{} {}\n", "Total:".bold(), summary_line(&total, dry_run))
}

/// Summary of a report; a dry run counts planned instead of applied changes.
fn summary(report: &Report) -> ExecuteSummary {
    let mut summary = report.summary();
    if report.dry_run {
        summary.changes = report.resources.iter().map(|r| r.changes.len()).sum();
    }
    summary
}

fn summary_line(summary: &ExecuteSummary, dry_run: bool) -> String {
    let (done, changes) = if dry_run {
        ("to change", "changes planned")
    } else {
        ("converged", "changes applied")
    };
    let mut parts = vec![
        format!("{} {done}", summary.done).green().to_string(),
        format!("{} unchanged", summary.noop).dimmed().to_string(),
    ];
    if summary.failed > 0 {
        parts.push(format!("{} failed", summary.failed).red().to_string());
    }
    if summary.blocked > 0 {
        parts.push(format!("{} blocked", summary.blocked).yellow().to_string());
    }
    parts.push(format!("{} {changes}", summary.changes));
    parts.join(", ")
}

/// Human readable rendering of one report.
pub fn text(report: &Report, verbose: bool) -> String {
    let mut out = String::new();
    let mut title = report.target.bold().to_string();
    if report.dry_run {
        title.push_str(&format!(" {}", "(dry run)".yellow()));
    }
    if report.cancelled {
        title.push_str(&format!(" {}", "(interrupted)".red()));
    }
    out.push_str(&title);
    out.push('\n');

    for resource in &report.resources {
        out.push_str(&resource_line(resource));
        if resource.phase == Phase::NoOp && !verbose {
            continue;
        }
        for change in &resource.changes {
            out.push_str(&change_line(change, report.dry_run));
        }
        for note in &resource.notes {
            out.push_str(&format!("      {}\n", note.dimmed()));
        }
    }
    out.push_str(&format!("  {}\n", summary_line(&summary(report), report.dry_run)));
    out
}

fn resource_line(resource: &ResourceReport) -> String {
    let (icon, detail): (ColoredString, String) = match resource.phase {
        Phase::Done => ("✓".green(), String::new()),
        Phase::NoOp => ("○".dimmed(), "up to date".dimmed().to_string()),
        Phase::Failed if resource.is_blocked() => (
            "⊘".yellow(),
            resource
                .error
                .as_ref()
                .map(|e| e.reason.dimmed().to_string())
                .unwrap_or_default(),
        ),
        Phase::Failed => (
            "✗".red(),
            resource
                .error
                .as_ref()
                .map(|e| format!("{}: {}", e.kind, e.reason).red().to_string())
                .unwrap_or_default(),
        ),
        other => ("…".dimmed(), other.to_string()),
    };
    let mut line = format!("  {} {}", icon, resource.key.to_string().bold());
    if resource.impact > converge::ImpactLevel::None {
        line.push_str(&format!(" {}", format!("[{}]", resource.impact).cyan()));
    }
    if !detail.is_empty() {
        line.push_str(&format!(" {detail}"));
    }
    line.push('\n');
    line
}

fn change_line(change: &ChangeReport, dry_run: bool) -> String {
    let sign = match change.kind {
        ChangeKind::Create => "+".green(),
        ChangeKind::Alter => "~".yellow(),
        ChangeKind::Drop => "-".red(),
    };
    let status = match &change.outcome {
        Outcome::Changed => String::new(),
        Outcome::Unchanged => format!(" {}", "(already in place)".dimmed()),
        Outcome::Skipped { .. } if dry_run => String::new(),
        Outcome::Skipped { reason } => format!(" {}", format!("(skipped: {reason})").dimmed()),
        Outcome::Failed { reason, .. } => format!(" {}", format!("failed: {reason}").red()),
    };
    format!("      {} {}{}\n", sign, change.summary, status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge::{Error, ErrorKind, FailureReport, ImpactLevel, ResourceKey};

    fn plain() {
        colored::control::set_override(false);
    }

    fn change(kind: ChangeKind, summary: &str, outcome: Outcome) -> ChangeReport {
        ChangeReport {
            kind,
            summary: summary.to_string(),
            impact: ImpactLevel::None,
            outcome,
        }
    }

    fn report() -> Report {
        let mut report = Report::new("16/main");
        let mut role = ResourceReport::pending(ResourceKey::new("role", "bob"), "role bob");
        role.phase = Phase::Done;
        role.changes
            .push(change(ChangeKind::Create, "create role bob", Outcome::Changed));
        report.resources.push(role);

        let mut db = ResourceReport::pending(ResourceKey::new("database", "app"), "database app");
        db.phase = Phase::Failed;
        db.error = Some(FailureReport::from(&Error::DependencyBlocked(
            "role:bob".into(),
        )));
        report.resources.push(db);

        let mut inst = ResourceReport::pending(ResourceKey::new("instance", "16/main"), "");
        inst.phase = Phase::NoOp;
        report.resources.push(inst);
        report
    }

    #[test]
    fn test_text_marks_each_phase() {
        plain();
        let out = text(&report(), false);
        assert!(out.starts_with("16/main\n"));
        assert!(out.contains("✓ role:bob"));
        assert!(out.contains("+ create role bob"));
        assert!(out.contains("⊘ database:app"));
        assert!(out.contains("○ instance:16/main up to date"));
        assert!(out.contains("1 converged, 1 unchanged, 1 blocked, 1 changes applied"));
    }

    #[test]
    fn test_failure_shows_kind_and_reason() {
        plain();
        let mut report = Report::new("16/main");
        let mut role = ResourceReport::pending(ResourceKey::new("role", "bob"), "");
        role.phase = Phase::Failed;
        role.error = Some(FailureReport {
            kind: ErrorKind::Execution,
            reason: "permission denied".into(),
        });
        role.changes.push(change(
            ChangeKind::Create,
            "create role bob",
            Outcome::Failed {
                kind: ErrorKind::Execution,
                reason: "permission denied".into(),
            },
        ));
        report.resources.push(role);

        let out = text(&report, false);
        assert!(out.contains("✗ role:bob execution error: permission denied"));
        assert!(out.contains("failed: permission denied"));
    }

    #[test]
    fn test_dry_run_counts_planned_changes() {
        plain();
        let mut report = report();
        report.dry_run = true;
        report.resources[0].changes[0].outcome = Outcome::Skipped {
            reason: "dry run".into(),
        };
        let out = text(&report, false);
        assert!(out.contains("(dry run)"));
        assert!(!out.contains("skipped"));
        assert!(out.contains("1 changes planned"));
    }

    #[test]
    fn test_json_is_a_list_of_reports() {
        let out = reports(&[report()], Format::Json, false).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value[0]["target"], "16/main");
        assert_eq!(value[0]["resources"][1]["error"]["kind"], "dependency_blocked");
    }
}
