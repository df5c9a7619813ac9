use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

use crate::render::Format;
use crate::settings::ENV_SETTINGS;

#[derive(Parser, Debug)]
#[command(name = "pgconverge")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Converge PostgreSQL instances to their manifests", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Site settings file
    #[arg(long, global = true, env = ENV_SETTINGS, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Make instances match their manifests
    Apply(ApplyArgs),

    /// Show what apply would change, without changing anything
    Diff(DiffArgs),

    /// Show the live state of an instance, a role or a database
    Inspect(InspectArgs),

    /// Print the resolved site settings
    Settings,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Apply / Diff
// ============================================================================

#[derive(Args, Debug)]
pub struct ApplyArgs {
    /// Instance manifests (YAML, JSON or TOML)
    #[arg(required = true, value_name = "MANIFEST")]
    pub manifests: Vec<PathBuf>,

    /// Dry run - show what would be done
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Instances reconciled in parallel (default: engine.jobs)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Answer yes to confirmations (instance drops, restarts)
    #[arg(short, long)]
    pub yes: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: Format,
}

#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Instance manifests (YAML, JSON or TOML)
    #[arg(required = true, value_name = "MANIFEST")]
    pub manifests: Vec<PathBuf>,

    /// Instances inspected in parallel (default: engine.jobs)
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: Format,
}

// ============================================================================
// Inspect
// ============================================================================

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Instance name
    pub instance: String,

    /// PostgreSQL major version (default: the only one found, or the site default)
    #[arg(long, value_name = "VERSION")]
    pub pg_version: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: Format,

    #[command(subcommand)]
    pub object: Option<InspectObject>,
}

#[derive(Subcommand, Debug)]
pub enum InspectObject {
    /// A role of the instance
    Role {
        /// Role name
        name: String,
    },
    /// A database of the instance, with its extensions and grants
    Database {
        /// Database name
        name: String,
    },
}
