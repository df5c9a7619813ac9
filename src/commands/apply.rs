//! `apply` and `diff`: reconcile instance manifests

use anyhow::{Result, bail};
use converge::ExecuteOptions;

use crate::Context;
use crate::cli::{ApplyArgs, DiffArgs};
use crate::engine::{self, Confirmation, EngineOptions, SystemHost};
use crate::model::{InstanceManifest, load_manifest};
use crate::render::{self, Format};
use crate::signal;
use crate::ui;

pub fn apply(ctx: &Context, args: ApplyArgs) -> Result<()> {
    let opts = EngineOptions {
        execute: ExecuteOptions {
            dry_run: args.dry_run,
            jobs: args.jobs.unwrap_or(ctx.settings.engine.jobs),
        },
        confirmation: if args.yes {
            Confirmation::Assume
        } else {
            Confirmation::Interactive
        },
        progress: args.format == Format::Text && !ctx.quiet,
    };
    run(ctx, &args.manifests, &opts, args.format)
}

pub fn diff(ctx: &Context, args: DiffArgs) -> Result<()> {
    let opts = EngineOptions {
        execute: ExecuteOptions {
            dry_run: true,
            jobs: args.jobs.unwrap_or(ctx.settings.engine.jobs),
        },
        confirmation: Confirmation::Decline,
        progress: args.format == Format::Text && !ctx.quiet,
    };
    run(ctx, &args.manifests, &opts, args.format)
}

fn load_all(paths: &[std::path::PathBuf]) -> Result<Vec<InstanceManifest>> {
    let manifests = paths
        .iter()
        .map(|p| load_manifest(p))
        .collect::<Result<Vec<_>>>()?;
    for (i, m) in manifests.iter().enumerate() {
        if manifests[..i]
            .iter()
            .any(|o| o.name == m.name && o.version == m.version)
        {
            bail!("Instance {} is described by more than one manifest", m.label());
        }
    }
    Ok(manifests)
}

fn run(
    ctx: &Context,
    paths: &[std::path::PathBuf],
    opts: &EngineOptions,
    format: Format,
) -> Result<()> {
    let manifests = load_all(paths)?;
    log::info!(
        "Reconciling {} instance(s) with {} job(s){}",
        manifests.len(),
        opts.execute.jobs,
        if opts.execute.dry_run { " (dry run)" } else { "" }
    );

    if opts.execute.dry_run && format == Format::Text && !ctx.quiet {
        ui::warn("Dry run - no changes will be made");
        println!();
    }

    let cancel = signal::install();
    let reports = engine::reconcile_all(&SystemHost, &ctx.settings, &manifests, opts, &cancel);
    print!("{}", render::reports(&reports, format, ctx.verbose > 0)?);

    if reports.iter().any(|r| r.cancelled) {
        bail!("Interrupted");
    }
    let total = render::total_summary(&reports);
    if !total.is_success() {
        bail!(
            "{} resource(s) failed, {} blocked",
            total.failed,
            total.blocked
        );
    }
    if format == Format::Text && !ctx.quiet && !opts.execute.dry_run {
        ui::success("All instances converged");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_duplicate_instances_are_rejected() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.yaml");
        let b = dir.path().join("b.json");
        fs::write(&a, "name: main\nversion: \"16\"\n").unwrap();
        fs::write(&b, r#"{"name": "main", "version": "16"}"#).unwrap();

        let err = load_all(&[a.clone(), b]).unwrap_err();
        assert!(err.to_string().contains("more than one manifest"));
        assert_eq!(load_all(&[a]).unwrap().len(), 1);
    }
}
