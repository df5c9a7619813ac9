//! Interrupt handling
//!
//! SIGINT and SIGTERM set a process-wide flag. The executor checks it
//! before each atomic change, so a change in flight always completes.

use converge::CancelToken;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

fn flag() -> &'static Arc<AtomicBool> {
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

extern "C" fn on_signal(_signum: libc::c_int) {
    // Only an atomic store: nothing else is async-signal-safe here.
    if let Some(flag) = FLAG.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// Install the handlers and return a token observing them.
pub fn install() -> CancelToken {
    let flag = flag().clone();
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    for signum in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only performs an atomic store
        let previous = unsafe { libc::signal(signum, handler) };
        if previous == libc::SIG_ERR {
            log::warn!("Could not install handler for signal {}", signum);
        }
    }
    CancelToken::from_flag(flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_cancels_token() {
        let token = install();
        assert!(!token.is_cancelled());

        // SAFETY: raising a signal whose handler we just installed
        unsafe {
            libc::raise(libc::SIGTERM);
        }
        assert!(token.is_cancelled());
        flag().store(false, Ordering::SeqCst);
    }
}
