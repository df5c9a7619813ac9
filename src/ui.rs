//! Terminal output helpers
//!
//! Messages go to stdout, errors and interactive widgets to stderr so that
//! JSON output stays clean.

use colored::Colorize;
use converge::{ConfirmCallback, Outcome, Phase, ProgressCallback, ResourceKey};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

/// Serializes prompts and spinners of instances reconciled concurrently
static TERMINAL: Mutex<()> = Mutex::new(());

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

// ============================================================================
// Confirmation
// ============================================================================

/// Asks on the terminal. Declines when no terminal is attached.
pub struct PromptConfirm;

impl ConfirmCallback for PromptConfirm {
    fn confirm(&mut self, prompt: &str) -> bool {
        if !console::Term::stderr().is_term() {
            log::warn!("{prompt} (no terminal, declined)");
            return false;
        }
        let Ok(_guard) = TERMINAL.lock() else {
            return false;
        };
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .unwrap_or(false)
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Spinner showing the resource being reconciled
pub struct SpinnerProgress {
    bar: Option<ProgressBar>,
    target: String,
}

impl SpinnerProgress {
    pub fn new() -> Self {
        Self {
            bar: None,
            target: String::new(),
        }
    }
}

impl Default for SpinnerProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCallback for SpinnerProgress {
    fn on_plan_start(&mut self, target: &str, steps: usize) {
        self.target = target.to_string();
        if !console::Term::stderr().is_term() {
            return;
        }
        let bar = ProgressBar::new(steps as u64);
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {prefix:.bold} [{pos}/{len}] {msg}") {
            bar.set_style(style);
        }
        bar.set_prefix(target.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        self.bar = Some(bar);
    }

    fn on_phase(&mut self, key: &ResourceKey, phase: Phase) {
        let Some(bar) = &self.bar else {
            return;
        };
        if phase.is_terminal() {
            bar.inc(1);
        } else {
            bar.set_message(format!("{key} ({phase})"));
        }
    }

    fn on_change(&mut self, key: &ResourceKey, summary: &str, outcome: &Outcome) {
        match outcome {
            Outcome::Failed { reason, .. } => {
                log::debug!("{}: {key}: {summary} failed: {reason}", self.target);
            }
            _ => log::debug!("{}: {key}: {summary}", self.target),
        }
    }

    fn on_plan_complete(&mut self, _target: &str) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
