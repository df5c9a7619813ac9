//! Callbacks and cancellation
//!
//! These traits allow the crate to be used without depending on a
//! specific terminal UI or prompt implementation.

use crate::types::{Outcome, Phase, ResourceKey};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Progress callback for execution operations
///
/// Implement this trait to receive progress updates during execution.
pub trait ProgressCallback: Send {
    /// Called when a plan starts
    fn on_plan_start(&mut self, target: &str, steps: usize);

    /// Called when a resource moves to a new phase
    fn on_phase(&mut self, key: &ResourceKey, phase: Phase);

    /// Called after each atomic change
    fn on_change(&mut self, key: &ResourceKey, summary: &str, outcome: &Outcome);

    /// Called when the plan completes
    fn on_plan_complete(&mut self, target: &str);
}

/// Confirmation callback for user interaction
pub trait ConfirmCallback: Send {
    /// Ask the user to confirm an action
    ///
    /// # Returns
    /// `true` if the user confirmed, `false` otherwise
    fn confirm(&mut self, prompt: &str) -> bool;
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_plan_start(&mut self, _target: &str, _steps: usize) {}
    fn on_phase(&mut self, _key: &ResourceKey, _phase: Phase) {}
    fn on_change(&mut self, _key: &ResourceKey, _summary: &str, _outcome: &Outcome) {}
    fn on_plan_complete(&mut self, _target: &str) {}
}

/// Auto-confirm callback (always returns true)
pub struct AutoConfirm;

impl ConfirmCallback for AutoConfirm {
    fn confirm(&mut self, _prompt: &str) -> bool {
        true
    }
}

/// Auto-decline callback (always returns false)
pub struct AutoDecline;

impl ConfirmCallback for AutoDecline {
    fn confirm(&mut self, _prompt: &str) -> bool {
        false
    }
}

/// Shared cancellation flag.
///
/// The executor checks it before starting each atomic change; a change
/// already in flight always runs to completion or timeout.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create an untriggered token
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing flag (e.g. one set from a signal handler).
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_shared_between_clones() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }
}
