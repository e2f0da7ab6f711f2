//! Child process spawn, kill escalation, and zombie reclamation.
//!
//! Termination escalates SIGTERM → SIGKILL with fixed grace periods. A child
//! that survives both is parked on a bounded undead list and reaped later by
//! non-blocking waits; once the list is full, cleanup for further survivors
//! is abandoned rather than growing without bound.

use std::io::{BufReader, BufWriter};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::DelegateSpec;

use super::DelegateError;

/// Maximum number of unreclaimed children tracked for deferred reaping.
pub(crate) const UNDEAD_CAPACITY: usize = 5;

const WAIT_POLL: Duration = Duration::from_millis(50);

/// A freshly spawned delegate with its three pipe ends.
pub(crate) struct SpawnedChild {
    pub child: Child,
    pub stdin: BufWriter<ChildStdin>,
    pub stdout: BufReader<ChildStdout>,
    pub stderr: ChildStderr,
}

/// Spawn the delegate with all three stdio streams piped.
pub(crate) fn spawn_delegate(spec: &DelegateSpec) -> Result<SpawnedChild, DelegateError> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(DelegateError::SpawnFailed)?;

    let stdin = take_pipe(child.stdin.take(), "stdin")?;
    let stdout = take_pipe(child.stdout.take(), "stdout")?;
    let stderr = take_pipe(child.stderr.take(), "stderr")?;

    Ok(SpawnedChild {
        child,
        stdin: BufWriter::new(stdin),
        stdout: BufReader::new(stdout),
        stderr,
    })
}

fn take_pipe<T>(pipe: Option<T>, name: &str) -> Result<T, DelegateError> {
    pipe.ok_or_else(|| {
        DelegateError::SpawnFailed(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!("missing {name} pipe on spawned delegate"),
        ))
    })
}

#[cfg(unix)]
fn signal_term(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM delivery failed");
    }
}

#[cfg(not(unix))]
fn signal_term(_pid: u32) {}

/// Poll `try_wait` until the child exits or the grace period lapses.
/// Returns true once the child is gone.
fn wait_with_deadline(child: &mut Child, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {}
            // A failed wait means the handle is unusable; stop tracking it.
            Err(e) => {
                debug!(pid = child.id(), error = %e, "wait on delegate failed");
                return true;
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(WAIT_POLL.min(deadline - now));
    }
}

/// Graceful-then-forceful termination. Returns the child back when it
/// survived SIGKILL and must be deferred to the undead list.
pub(crate) fn escalate_kill(
    mut child: Child,
    term_grace: Duration,
    kill_grace: Duration,
) -> Option<Child> {
    let pid = child.id();
    if matches!(child.try_wait(), Ok(Some(_))) {
        return None;
    }

    signal_term(pid);
    if wait_with_deadline(&mut child, term_grace) {
        info!(pid, "delegate exited after SIGTERM");
        return None;
    }

    warn!(pid, "delegate ignored SIGTERM; sending SIGKILL");
    if let Err(e) = child.kill() {
        debug!(pid, error = %e, "SIGKILL delivery failed");
    }
    if wait_with_deadline(&mut child, kill_grace) {
        info!(pid, "delegate exited after SIGKILL");
        return None;
    }

    // Final non-blocking reap before giving up on this attempt.
    match child.try_wait() {
        Ok(Some(_)) => None,
        _ => Some(child),
    }
}

/// Reap previously-undead children via non-blocking waits.
pub(crate) fn reap_undead(undead: &Mutex<Vec<Child>>) {
    let mut list = undead.lock();
    list.retain_mut(|child| match child.try_wait() {
        Ok(Some(status)) => {
            info!(pid = child.id(), %status, "reclaimed undead delegate");
            false
        }
        Ok(None) => true,
        Err(e) => {
            debug!(pid = child.id(), error = %e, "dropping unwaitable undead entry");
            false
        }
    });
}

/// Park a SIGKILL survivor for deferred reclamation, or abandon it when the
/// list is already at capacity.
pub(crate) fn park_undead(undead: &Mutex<Vec<Child>>, child: Child) {
    let mut list = undead.lock();
    if list.len() >= UNDEAD_CAPACITY {
        error!(
            pid = child.id(),
            capacity = UNDEAD_CAPACITY,
            "undead list full; abandoning cleanup for delegate"
        );
        return;
    }
    warn!(pid = child.id(), "delegate survived SIGKILL; deferring reclamation");
    list.push(child);
}
