//! Managed server subprocesses: state machine, crash budget, stdin
//! discipline, and process-group shutdown.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use mcpl_core::config::ServerConfig;

use crate::daemon::serialize::SerializeQueue;
use crate::error::DaemonError;

/// Crashes tolerated within [`CRASH_WINDOW`] before a server is failed.
pub(crate) const MAX_CRASHES: usize = 3;

/// Sliding window over which unexpected exits are counted.
pub(crate) const CRASH_WINDOW: Duration = Duration::from_secs(60);

/// Deadline for a single stdin write; on expiry the pipe is closed.
pub(crate) const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period between SIGTERM and SIGKILL on graceful stop.
pub(crate) const STOP_GRACE: Duration = Duration::from_secs(10);

/// Lifecycle state of a managed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Initializing,
    Ready,
    Draining,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Stopped => "STOPPED",
            ServerState::Starting => "STARTING",
            ServerState::Initializing => "INITIALIZING",
            ServerState::Ready => "READY",
            ServerState::Draining => "DRAINING",
        };
        f.write_str(s)
    }
}

/// The allowed state-machine edges. Everything else is a bug.
pub(crate) fn is_valid_transition(from: ServerState, to: ServerState) -> bool {
    use ServerState::*;
    matches!(
        (from, to),
        (Stopped, Starting)
            | (Starting, Initializing)
            | (Starting, Stopped)
            | (Initializing, Ready)
            | (Initializing, Stopped)
            | (Ready, Draining)
            | (Draining, Stopped)
            | (Draining, Ready)
    )
}

/// Pipes and process handle produced by a successful spawn.
///
/// The caller wires these up: the dispatcher takes stdout, the log drain
/// takes stderr, and the monitor task owns the child and reports its exit
/// through `exited_tx`.
#[derive(Debug)]
pub(crate) struct StartHandles {
    pub child: Child,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub exited_tx: watch::Sender<bool>,
}

/// One configured, daemon-owned MCP server.
///
/// Created at daemon startup (or on config reload) and destroyed only at
/// daemon shutdown; sessions come and go around it. The stdout reader and
/// stderr drainer own their pipe halves; this struct keeps only the stdin
/// write end and the process-group id.
pub struct ManagedServer {
    name: String,
    config: ServerConfig,
    state: Mutex<ServerState>,
    started_at: Mutex<Option<Instant>>,
    connections: Mutex<HashSet<String>>,
    crashes: Mutex<Vec<Instant>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pgid: Mutex<Option<i32>>,
    exited: Mutex<Option<watch::Receiver<bool>>>,
    serialize_queue: Option<SerializeQueue>,
    waiters: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    queue_worker: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedServer {
    pub fn new(name: &str, config: ServerConfig) -> Self {
        let serialize_queue = config.serialize.then(SerializeQueue::new);
        ManagedServer {
            name: name.to_string(),
            config,
            state: Mutex::new(ServerState::Stopped),
            started_at: Mutex::new(None),
            connections: Mutex::new(HashSet::new()),
            crashes: Mutex::new(Vec::new()),
            stdin: tokio::sync::Mutex::new(None),
            pgid: Mutex::new(None),
            exited: Mutex::new(None),
            serialize_queue,
            waiters: Mutex::new(HashMap::new()),
            queue_worker: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock().expect("server state lock poisoned")
    }

    pub(crate) fn serialize_queue(&self) -> Option<&SerializeQueue> {
        self.serialize_queue.as_ref()
    }

    /// Move to `to`, enforcing the transition table.
    pub fn transition_to(&self, to: ServerState) -> Result<(), DaemonError> {
        let mut state = self.state.lock().expect("server state lock poisoned");
        if !is_valid_transition(*state, to) {
            return Err(DaemonError::InvalidTransition {
                server: self.name.clone(),
                from: *state,
                to,
            });
        }
        *state = to;
        if to == ServerState::Starting {
            *self.started_at.lock().expect("started_at lock poisoned") = Some(Instant::now());
        }
        Ok(())
    }

    /// Atomically claim the start: STOPPED→STARTING.
    ///
    /// `Ok(false)` means another session won the race and the server is
    /// already starting or running. A failed server refuses outright.
    pub fn begin_start(&self) -> Result<bool, DaemonError> {
        if self.is_failed() {
            return Err(DaemonError::ServerFailed {
                server: self.name.clone(),
            });
        }
        let mut state = self.state.lock().expect("server state lock poisoned");
        if *state != ServerState::Stopped {
            return Ok(false);
        }
        *state = ServerState::Starting;
        *self.started_at.lock().expect("started_at lock poisoned") = Some(Instant::now());
        Ok(true)
    }

    /// Unconditionally mark STOPPED. Crash recovery uses this because the
    /// process can die in any state.
    pub fn force_stop(&self) {
        *self.state.lock().expect("server state lock poisoned") = ServerState::Stopped;
    }

    pub fn add_connection(&self, session_id: &str) {
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .insert(session_id.to_string());
    }

    pub fn remove_connection(&self, session_id: &str) {
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .remove(session_id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .expect("connections lock poisoned")
            .len()
    }

    // ── Crash budget ─────────────────────────────────────────────────────

    pub fn record_crash(&self) {
        let mut crashes = self.crashes.lock().expect("crashes lock poisoned");
        let now = Instant::now();
        crashes.push(now);
        crashes.retain(|t| now.duration_since(*t) < CRASH_WINDOW);
    }

    pub fn is_failed(&self) -> bool {
        let crashes = self.crashes.lock().expect("crashes lock poisoned");
        let recent = crashes
            .iter()
            .filter(|t| t.elapsed() < CRASH_WINDOW)
            .count();
        recent >= MAX_CRASHES
    }

    /// Crashes currently inside the sliding window.
    pub fn crash_count(&self) -> usize {
        self.crashes
            .lock()
            .expect("crashes lock poisoned")
            .iter()
            .filter(|t| t.elapsed() < CRASH_WINDOW)
            .count()
    }

    /// Clear the crash window so starts are accepted again. Driven by the
    /// external admin surface; the daemon never calls it on its own.
    pub fn reset_crashes(&self) {
        self.crashes.lock().expect("crashes lock poisoned").clear();
    }

    // ── Process lifecycle ────────────────────────────────────────────────

    /// Spawn the subprocess in its own process group with `env` applied on
    /// top of the daemon's environment.
    ///
    /// The caller is responsible for the surrounding state transitions and
    /// for driving the returned handles.
    pub(crate) async fn start(
        &self,
        env: HashMap<String, String>,
    ) -> Result<StartHandles, DaemonError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);
        for (k, v) in env {
            cmd.env(k, v);
        }

        let spawn_err = |reason: String| DaemonError::SpawnFailed {
            server: self.name.clone(),
            reason,
        };

        let mut child = cmd.spawn().map_err(|e| spawn_err(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_err("child exited before pid was read".to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err("failed to capture stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_err("failed to capture stderr".to_string()))?;

        let (exited_tx, exited_rx) = watch::channel(false);

        *self.stdin.lock().await = Some(stdin);
        *self.pgid.lock().expect("pgid lock poisoned") = Some(pid as i32);
        *self.exited.lock().expect("exited lock poisoned") = Some(exited_rx);

        Ok(StartHandles {
            child,
            stdout,
            stderr,
            exited_tx,
        })
    }

    /// Graceful stop: SIGTERM the process group, wait [`STOP_GRACE`], then
    /// SIGKILL. No-op when nothing is running.
    pub async fn stop(&self) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let pgid = self.pgid.lock().expect("pgid lock poisoned").take();
        let Some(pgid) = pgid else {
            return;
        };
        let exited = self.exited.lock().expect("exited lock poisoned").take();

        if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGTERM) {
            tracing::warn!(server = %self.name, pgid, error = %e, "killpg SIGTERM failed");
        }

        if let Some(mut rx) = exited {
            let already = *rx.borrow();
            if !already
                && tokio::time::timeout(STOP_GRACE, rx.changed())
                    .await
                    .is_err()
            {
                tracing::warn!(server = %self.name, pgid, "did not exit after SIGTERM, sending SIGKILL");
                if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                    tracing::warn!(server = %self.name, pgid, error = %e, "killpg SIGKILL failed");
                }
                let _ = rx.changed().await;
            }
        }

        self.stdin.lock().await.take();
    }

    /// Record that the monitor observed the process exit.
    pub(crate) async fn mark_exited(&self) {
        self.pgid.lock().expect("pgid lock poisoned").take();
        self.stdin.lock().await.take();
    }

    // ── Stdin write discipline ───────────────────────────────────────────

    /// Write one message line (`\n`-terminated) to the server's stdin.
    ///
    /// Writes are serialized by the stdin lock. A write that misses
    /// [`STDIN_WRITE_TIMEOUT`] (child stuck not reading) closes the pipe and
    /// errors so the caller can abandon the request instead of queueing
    /// behind it forever.
    pub async fn write_to_stdin(&self, line: &str) -> Result<(), DaemonError> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(DaemonError::StdinUnavailable {
                server: self.name.clone(),
            });
        };

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        let write = async {
            stdin.write_all(&buf).await?;
            stdin.flush().await
        };
        match tokio::time::timeout(STDIN_WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                guard.take();
                Err(DaemonError::Io(e))
            }
            Err(_) => {
                guard.take();
                Err(DaemonError::StdinWriteTimeout {
                    server: self.name.clone(),
                })
            }
        }
    }

    // ── Serialization waiters ────────────────────────────────────────────

    /// Register a completion signal for an in-flight serialized request.
    pub(crate) fn register_waiter(&self, global_id: u64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("waiters lock poisoned")
            .insert(global_id, tx);
        rx
    }

    /// Fire the waiter for `global_id`, if any. Called whenever a response
    /// is observed, even one that failed routing, so the queue advances.
    pub(crate) fn signal_serialize_waiter(&self, global_id: u64) {
        let tx = self
            .waiters
            .lock()
            .expect("waiters lock poisoned")
            .remove(&global_id);
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    /// Drop a waiter without firing it (entry cancelled or write failed).
    pub(crate) fn take_waiter(&self, global_id: u64) {
        self.waiters
            .lock()
            .expect("waiters lock poisoned")
            .remove(&global_id);
    }

    /// Release every pending waiter. Used on crash and shutdown so the
    /// queue worker can never deadlock on a response that will not come.
    pub(crate) fn drain_waiters(&self) {
        self.waiters.lock().expect("waiters lock poisoned").clear();
    }

    pub(crate) fn set_queue_worker(&self, handle: JoinHandle<()>) {
        *self
            .queue_worker
            .lock()
            .expect("queue worker lock poisoned") = Some(handle);
    }

    pub(crate) fn has_queue_worker(&self) -> bool {
        self.queue_worker
            .lock()
            .expect("queue worker lock poisoned")
            .is_some()
    }

    /// Close the serialization queue, release its waiters, and wait for the
    /// worker to drain.
    pub(crate) async fn close_serialize_queue(&self) {
        let Some(queue) = &self.serialize_queue else {
            return;
        };
        queue.close();
        self.drain_waiters();
        let handle = self
            .queue_worker
            .lock()
            .expect("queue worker lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Drain a server's stderr into the log, one line per record.
pub(crate) async fn drain_stderr(name: String, stderr: ChildStderr) {
    use tokio::io::AsyncBufReadExt;

    let mut lines = tokio::io::BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(server = %name, "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "stderr read failed");
                break;
            }
        }
    }
}
