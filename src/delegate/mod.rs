//! Subprocess supervisor: keeps a single delegate child alive and relays
//! framed messages between it and the surrounding agent.
//!
//! Three OS threads move data: the write loop drains the inbox into the
//! child's stdin, the read loop turns the child's stdout frames into outbox
//! messages, and the error loop logs the child's stderr lines. All three
//! coordinate on the child state machine
//! `NO_CHILD → RUNNING → NO_CHILD` with a terminal, irreversible
//! `SHUTTING_DOWN`.

mod child;
mod line_buffer;

use std::io::{Read, Write};
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{
    DelegateConfigSource, DEFAULT_KILL_GRACE, DEFAULT_RESPAWN_DELAY, DEFAULT_TERM_GRACE,
};
use crate::protocol::{encode_frame_into, read_frame, FrameError, Message};
use crate::queue::MessageQueue;

use line_buffer::LineBuffer;

#[derive(Error, Debug)]
pub enum DelegateError {
    #[error("no delegate subprocess configured")]
    Unconfigured,

    #[error("failed to spawn delegate: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

/// Supervisor tunables. The grace periods and respawn delay default to the
/// protocol-fixed values; tests shrink them.
#[derive(Debug, Clone)]
pub struct DelegatorConfig {
    /// Max messages dequeued per written batch.
    pub write_batch_count: usize,
    /// Max payload bytes dequeued per written batch.
    pub write_batch_bytes: usize,
    /// Delay between spawn attempts when the child cannot be started.
    pub respawn_delay: Duration,
    /// Grace period after SIGTERM.
    pub term_grace: Duration,
    /// Grace period after SIGKILL.
    pub kill_grace: Duration,
}

impl Default for DelegatorConfig {
    fn default() -> Self {
        Self {
            write_batch_count: 16,
            write_batch_bytes: 256 * 1024,
            respawn_delay: DEFAULT_RESPAWN_DELAY,
            term_grace: DEFAULT_TERM_GRACE,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

/// Child process lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildState {
    NoChild,
    Running(u32),
    ShuttingDown,
}

struct StateInner {
    state: ChildState,
    /// Owned handle for the running child, taken by whoever kills it.
    child: Option<Child>,
    /// Bumped on every successful spawn. Streams are tagged with it so a
    /// kill triggered by one child's failure can never tear down a newer
    /// child, and the condvar broadcast cannot lose wakeups across respawns.
    generation: u64,
}

/// A pipe end tagged with the spawn generation it belongs to.
struct Slot<T> {
    generation: u64,
    stream: T,
}

struct Shared {
    config: DelegatorConfig,
    source: Arc<dyn DelegateConfigSource>,
    inbox: Arc<MessageQueue>,
    outbox: Arc<MessageQueue>,
    /// Lock order: `state` before any stream slot. Spawn installs streams and
    /// kill clears them while holding `state`, so the slots always belong to
    /// the current generation.
    state: Mutex<StateInner>,
    /// Broadcast on spawn and on shutdown.
    spawned: Condvar,
    stdin: Mutex<Option<Slot<std::io::BufWriter<std::process::ChildStdin>>>>,
    stdout: Mutex<Option<Slot<std::io::BufReader<std::process::ChildStdout>>>>,
    stderr: Mutex<Option<Slot<std::process::ChildStderr>>>,
    undead: Mutex<Vec<Child>>,
    shutting_down: AtomicBool,
}

impl Shared {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn is_running(&self) -> bool {
        matches!(self.state.lock().state, ChildState::Running(_))
    }

    fn child_pid(&self) -> Option<u32> {
        match self.state.lock().state {
            ChildState::Running(pid) => Some(pid),
            _ => None,
        }
    }

    /// Block until a child with a generation newer than `seen` is running.
    /// Returns its generation, or `None` once shutdown begins.
    fn wait_for_spawn(&self, seen: u64) -> Option<u64> {
        let mut st = self.state.lock();
        loop {
            match st.state {
                ChildState::ShuttingDown => return None,
                ChildState::Running(_) if st.generation > seen => return Some(st.generation),
                _ => self.spawned.wait(&mut st),
            }
        }
    }

    /// Shutdown-aware sleep, sliced so the delay never stalls teardown.
    fn sleep_interruptible(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.is_shutting_down() {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(25)));
        }
    }
}

/// Owns the delegate child process and the three relay threads.
pub struct SubprocessDelegator {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl SubprocessDelegator {
    pub fn new(
        config: DelegatorConfig,
        source: Arc<dyn DelegateConfigSource>,
        inbox: Arc<MessageQueue>,
        outbox: Arc<MessageQueue>,
    ) -> Self {
        let shared = Arc::new(Shared {
            config,
            source,
            inbox,
            outbox,
            state: Mutex::new(StateInner {
                state: ChildState::NoChild,
                child: None,
                generation: 0,
            }),
            spawned: Condvar::new(),
            stdin: Mutex::new(None),
            stdout: Mutex::new(None),
            stderr: Mutex::new(None),
            undead: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        });
        Self { shared, threads: Vec::new() }
    }

    /// Start the write/read/error loops. Call once.
    pub fn start(&mut self) {
        if !self.threads.is_empty() {
            return;
        }
        let loops: [(&str, fn(Arc<Shared>)); 3] = [
            ("relay-write", write_loop),
            ("relay-read", read_loop),
            ("relay-stderr", error_loop),
        ];
        for (name, body) in loops {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(name.to_string())
                .spawn(move || body(shared))
                .expect("failed to spawn relay thread");
            self.threads.push(handle);
        }
    }

    /// Spawn the delegate child. Idempotent no-op while a child is running
    /// or shutdown is in progress.
    pub fn start_child_process(&self) -> Result<(), DelegateError> {
        start_child_process(&self.shared)
    }

    /// Terminate the delegate child with SIGTERM → SIGKILL escalation and
    /// reclaim any previously-undead children.
    pub fn kill_child_process(&self) {
        kill_child_process(&self.shared, None);
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.shared.child_pid()
    }

    /// Irreversible teardown: kill the child, release every blocked loop,
    /// and join the threads. Safe to call more than once.
    pub fn shutdown(&mut self) {
        self.shared.shutting_down.store(true, Ordering::Release);
        {
            let mut st = self.shared.state.lock();
            st.state = ChildState::ShuttingDown;
        }
        kill_child_process(&self.shared, None);
        // Release loops blocked waiting for a child, then the write loop's
        // blocking dequeue.
        self.shared.spawned.notify_all();
        self.shared.inbox.add_priority_message(Message::noop());
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SubprocessDelegator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn start_child_process(shared: &Shared) -> Result<(), DelegateError> {
    {
        let st = shared.state.lock();
        match st.state {
            ChildState::Running(_) | ChildState::ShuttingDown => return Ok(()),
            ChildState::NoChild => {}
        }
        // Release the state lock before spawning: readers of the state must
        // never wait behind process creation.
    }

    let Some(spec) = shared.source.delegate_spec() else {
        warn!("no delegate subprocess configured; spawn skipped");
        return Err(DelegateError::Unconfigured);
    };

    let spawned = match child::spawn_delegate(&spec) {
        Ok(s) => s,
        Err(e) => {
            warn!(program = %spec.program.display(), error = %e, "delegate spawn failed");
            return Err(e);
        }
    };
    let pid = spawned.child.id();

    let mut st = shared.state.lock();
    match st.state {
        ChildState::NoChild => {
            st.generation += 1;
            let generation = st.generation;
            *shared.stdin.lock() = Some(Slot { generation, stream: spawned.stdin });
            *shared.stdout.lock() = Some(Slot { generation, stream: spawned.stdout });
            *shared.stderr.lock() = Some(Slot { generation, stream: spawned.stderr });
            st.child = Some(spawned.child);
            st.state = ChildState::Running(pid);
            drop(st);
            shared.spawned.notify_all();
            info!(pid, program = %spec.program.display(), "delegate spawned");
            Ok(())
        }
        // Lost a spawn race, or shutdown began meanwhile: do not adopt the
        // surplus child.
        _ => {
            drop(st);
            debug!(pid, "discarding surplus delegate spawn");
            if let Some(survivor) =
                child::escalate_kill(spawned.child, Duration::ZERO, shared.config.kill_grace)
            {
                child::park_undead(&shared.undead, survivor);
            }
            Ok(())
        }
    }
}

/// Kill the current child. `failed_generation` scopes the request to the
/// child whose stream failed: when a newer child has already replaced it,
/// the kill is a no-op so stale failures cannot tear down a healthy child.
///
/// The child handle and all three stream slots are taken inside one state
/// critical section; the escalation itself runs outside any lock, and a
/// concurrent spawn that completes during it installs streams the escalation
/// never touches.
fn kill_child_process(shared: &Shared, failed_generation: Option<u64>) {
    child::reap_undead(&shared.undead);

    let taken = {
        let mut st = shared.state.lock();
        if let Some(generation) = failed_generation {
            if st.generation != generation {
                debug!(
                    failed = generation,
                    current = st.generation,
                    "ignoring kill for superseded delegate"
                );
                return;
            }
        }
        let child = st.child.take();
        if matches!(st.state, ChildState::Running(_)) {
            st.state = ChildState::NoChild;
        }
        *shared.stdin.lock() = None;
        *shared.stdout.lock() = None;
        *shared.stderr.lock() = None;
        child
    };
    let Some(child) = taken else { return };
    let pid = child.id();

    if let Some(survivor) =
        child::escalate_kill(child, shared.config.term_grace, shared.config.kill_grace)
    {
        child::park_undead(&shared.undead, survivor);
    } else {
        info!(pid, "delegate terminated");
    }
}

/// Drain the inbox and write framed batches to the child's stdin. Each batch
/// is written contiguously and flushed once.
fn write_loop(shared: Arc<Shared>) {
    loop {
        let batch = shared.inbox.get_messages(
            shared.config.write_batch_count,
            shared.config.write_batch_bytes,
            true,
        );
        if shared.is_shutting_down() {
            return;
        }

        let mut frames = Vec::new();
        let mut framed = 0usize;
        for message in &batch {
            if message.is_noop() {
                continue;
            }
            match encode_frame_into(&mut frames, message) {
                Ok(()) => framed += 1,
                Err(e) => warn!(name = %message.name, error = %e, "dropping unencodable message"),
            }
        }
        if frames.is_empty() {
            continue;
        }

        // Keep retrying the spawn with a fixed delay until a child is up or
        // shutdown is observed.
        while !shared.is_running() {
            if shared.is_shutting_down() {
                return;
            }
            let _ = start_child_process(&shared);
            if shared.is_running() {
                break;
            }
            shared.sleep_interruptible(shared.config.respawn_delay);
        }
        if shared.is_shutting_down() {
            return;
        }

        // Take the writer out of its slot so no lock is held across pipe I/O.
        let Some(taken) = shared.stdin.lock().take() else {
            warn!(dropped = framed, "delegate stdin unavailable; batch dropped");
            continue;
        };
        let generation = taken.generation;
        let mut writer = taken.stream;
        match writer.write_all(&frames).and_then(|()| writer.flush()) {
            Ok(()) => {
                // Put the writer back only while its child is still current.
                let st = shared.state.lock();
                if st.generation == generation && matches!(st.state, ChildState::Running(_)) {
                    let mut slot = shared.stdin.lock();
                    if slot.is_none() {
                        *slot = Some(Slot { generation, stream: writer });
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "write to delegate failed; restarting child");
                drop(writer);
                kill_child_process(&shared, Some(generation));
            }
        }
    }
}

/// Parse frames from the child's stdout and push them to the outbox. Any
/// oversized or unparsable frame is corruption: the child is restarted and
/// the loop continues with the next spawn.
fn read_loop(shared: Arc<Shared>) {
    let mut seen = 0u64;
    loop {
        let Some(spawn_generation) = shared.wait_for_spawn(seen) else {
            return;
        };
        seen = spawn_generation;
        let Some(taken) = shared.stdout.lock().take() else {
            // Killed between the wakeup and the take; the next iteration
            // blocks on the spawn broadcast until a newer child exists.
            continue;
        };
        // The slot may already hold a newer child's reader.
        let generation = taken.generation;
        seen = seen.max(generation);
        let mut reader = taken.stream;

        loop {
            match read_frame(&mut reader) {
                Ok(Some(message)) => shared.outbox.add_message(message),
                Ok(None) => {
                    if !shared.is_shutting_down() {
                        warn!("delegate closed stdout; restarting child");
                        kill_child_process(&shared, Some(generation));
                    }
                    break;
                }
                Err(e) => {
                    if shared.is_shutting_down() {
                        break;
                    }
                    match &e {
                        FrameError::Oversized { len, max } => {
                            error!(len, max, "oversized frame from delegate; restarting child");
                        }
                        _ => error!(error = %e, "corrupt frame from delegate; restarting child"),
                    }
                    kill_child_process(&shared, Some(generation));
                    break;
                }
            }
        }
        // The taken reader is dropped here; a respawn installs a fresh one.
    }
}

/// Log the child's stderr, one diagnostic line at a time.
fn error_loop(shared: Arc<Shared>) {
    let mut seen = 0u64;
    loop {
        let Some(spawn_generation) = shared.wait_for_spawn(seen) else {
            return;
        };
        seen = spawn_generation;
        let Some(taken) = shared.stderr.lock().take() else {
            continue;
        };
        seen = seen.max(taken.generation);
        let mut stderr = taken.stream;
        let pid = shared.child_pid().unwrap_or_default();

        let mut lines = LineBuffer::new();
        let mut buf = [0u8; 4096];
        loop {
            match stderr.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for line in lines.push(&buf[..n]) {
                        warn!(pid, "delegate stderr: {line}");
                    }
                }
                Err(e) => {
                    if !shared.is_shutting_down() {
                        debug!(pid, error = %e, "delegate stderr read failed");
                    }
                    break;
                }
            }
        }
        if let Some(rest) = lines.take_remainder() {
            warn!(pid, "delegate stderr: {rest}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DelegateSpec, StaticDelegateSource};
    use crate::queue::QueueConfig;
    use std::path::PathBuf;

    fn cat_delegator() -> SubprocessDelegator {
        let spec = DelegateSpec {
            program: PathBuf::from("/bin/cat"),
            args: vec![],
            env: vec![],
        };
        SubprocessDelegator::new(
            DelegatorConfig {
                term_grace: Duration::from_secs(2),
                kill_grace: Duration::from_secs(1),
                ..DelegatorConfig::default()
            },
            Arc::new(StaticDelegateSource(spec)),
            Arc::new(MessageQueue::new(QueueConfig::default())),
            Arc::new(MessageQueue::new(QueueConfig::default())),
        )
    }

    #[cfg(unix)]
    #[test]
    fn test_stale_generation_kill_is_a_noop() {
        let delegator = cat_delegator();
        let shared = &delegator.shared;

        start_child_process(shared).unwrap();
        let pid = shared.child_pid().unwrap();
        let generation = shared.state.lock().generation;

        // A failure report from a generation that no longer exists must not
        // touch the current child or its streams.
        kill_child_process(shared, Some(generation - 1));
        assert_eq!(shared.child_pid(), Some(pid));
        assert!(shared.stdin.lock().is_some());
        assert!(shared.stdout.lock().is_some());
        assert!(shared.stderr.lock().is_some());

        // The matching generation does kill it.
        kill_child_process(shared, Some(generation));
        assert!(!shared.is_running());
        assert!(shared.stdin.lock().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_respawn_bumps_generation_and_installs_fresh_streams() {
        let delegator = cat_delegator();
        let shared = &delegator.shared;

        start_child_process(shared).unwrap();
        let first = shared.state.lock().generation;
        kill_child_process(shared, None);
        assert!(shared.stdout.lock().is_none());

        start_child_process(shared).unwrap();
        let st = shared.state.lock();
        assert_eq!(st.generation, first + 1);
        drop(st);
        let slot = shared.stdout.lock();
        assert_eq!(slot.as_ref().map(|s| s.generation), Some(first + 1));
        drop(slot);

        kill_child_process(shared, None);
    }
}
