mod catalog;
mod cli;
mod commands;
mod conf;
mod control;
mod engine;
mod lock;
mod model;
mod normalize;
mod pgpass;
mod render;
mod runner;
mod service;
mod settings;
mod signal;
mod ui;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use settings::Settings;
use std::io;
use std::path::PathBuf;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub settings: Settings,
    /// File the settings were read from, if any
    pub settings_path: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    if let Command::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "pgconverge", &mut io::stdout());
        return Ok(());
    }

    let (settings, settings_path) = Settings::load(cli.settings.as_deref())?;
    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        settings,
        settings_path,
    };

    match cli.command {
        Command::Apply(args) => commands::apply::apply(&ctx, args),
        Command::Diff(args) => commands::apply::diff(&ctx, args),
        Command::Inspect(args) => commands::inspect::run(&ctx, args),
        Command::Settings => commands::settings::run(&ctx),
        Command::Completions { .. } => Ok(()),
    }
}
