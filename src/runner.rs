//! Bounded process execution
//!
//! Every call to an external program (psql, systemctl, pg_ctl, initdb)
//! goes through [`run_with_timeout`]. The child is killed once the bound
//! elapses so no reconciliation step can hang forever. Children run in
//! their own process group: a terminal interrupt only reaches us, and the
//! change in flight runs to completion or to its timeout.

use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} failed ({status}): {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
}

impl RunError {
    /// The bound that elapsed, for timeouts
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Self::Timeout { timeout, .. } => Some(*timeout),
            _ => None,
        }
    }
}

/// Captured output of a successful command
#[derive(Debug, Clone, Default)]
pub struct Captured {
    pub stdout: String,
    pub stderr: String,
}

/// Run a command, optionally feeding stdin, and capture its output.
///
/// A non-zero exit status is an error carrying stderr.
pub fn run_with_timeout(
    cmd: &mut Command,
    stdin: Option<&str>,
    timeout: Duration,
) -> Result<Captured, RunError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    log::trace!("Running {:?}", cmd);

    let mut child = cmd
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|source| RunError::Spawn {
            program: program.clone(),
            source,
        })?;

    // Feed stdin and drain pipes from helper threads so a chatty child
    // cannot block on a full pipe while we wait for it.
    let writer = stdin.and_then(|input| {
        let mut pipe = child.stdin.take()?;
        let input = input.to_string();
        Some(thread::spawn(move || {
            let _ = pipe.write_all(input.as_bytes());
        }))
    });
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = wait(&mut child, timeout);
    if let Some(writer) = writer {
        let _ = writer.join();
    }
    let stdout = stdout.join().unwrap_or_default();
    let stderr = stderr.join().unwrap_or_default();

    match status {
        None => Err(RunError::Timeout { program, timeout }),
        Some(status) if status.success() => Ok(Captured { stdout, stderr }),
        Some(status) => Err(RunError::Failed {
            program,
            status: status.to_string(),
            stderr: stderr.trim().to_string(),
        }),
    }
}

/// Run a command and return whether it exited successfully.
///
/// Used for probes such as `systemctl is-active`, where a non-zero exit
/// status is an answer rather than a failure.
pub fn probe(cmd: &mut Command, timeout: Duration) -> Result<bool, RunError> {
    match run_with_timeout(cmd, None, timeout) {
        Ok(_) => Ok(true),
        Err(RunError::Failed { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    })
}

/// Wait for the child, killing it once the deadline passes.
fn wait(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() >= deadline => {
                log::warn!("Killing process {} after {:?}", child.id(), timeout);
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                log::warn!("Failed to wait for process {}: {}", child.id(), e);
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captures_stdout() {
        let out = run_with_timeout(
            Command::new("sh").args(["-c", "echo hello"]),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_feeds_stdin() {
        let out = run_with_timeout(&mut Command::new("cat"), Some("piped"), Duration::from_secs(5))
            .unwrap();
        assert_eq!(out.stdout, "piped");
    }

    #[test]
    fn test_failure_carries_stderr() {
        let err = run_with_timeout(
            Command::new("sh").args(["-c", "echo nope >&2; exit 3"]),
            None,
            Duration::from_secs(5),
        )
        .unwrap_err();
        match err {
            RunError::Failed { stderr, .. } => assert_eq!(stderr, "nope"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_timeout_kills_child() {
        let started = Instant::now();
        let err = run_with_timeout(
            Command::new("sleep").arg("10"),
            None,
            Duration::from_millis(100),
        )
        .unwrap_err();
        assert!(err.timeout().is_some());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_child_has_its_own_process_group() {
        let out = run_with_timeout(
            Command::new("cat").arg("/proc/self/stat"),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        // pid (comm) state ppid pgrp ...
        let (pid, rest) = out.stdout.split_once(" (").unwrap();
        let fields: Vec<&str> = rest.rsplit_once(") ").unwrap().1.split(' ').collect();
        let pgrp: i32 = fields[2].parse().unwrap();
        assert_eq!(pgrp, pid.parse::<i32>().unwrap());
        assert_ne!(pgrp, unsafe { libc::getpgrp() });
    }

    #[test]
    fn test_probe() {
        assert!(probe(&mut Command::new("true"), Duration::from_secs(5)).unwrap());
        assert!(!probe(&mut Command::new("false"), Duration::from_secs(5)).unwrap());
        assert!(probe(&mut Command::new("/nonexistent/binary"), Duration::from_secs(5)).is_err());
    }
}
