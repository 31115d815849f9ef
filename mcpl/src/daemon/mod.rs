//! The daemon: Unix-socket listener, handshake, session registry, config
//! hot-reload, and graceful shutdown.

mod dispatcher;
pub mod idle;
mod io;
mod serialize;
pub mod server;
pub mod session;
mod session_loop;

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use mcpl_core::config::{atomic_write_file, ensure_dir, resolve_env, Config};
use mcpl_core::handshake::{self, ConnectRequest, ConnectResponse, RejectCode};
use mcpl_core::jsonrpc::{raw_u64, IdMapper, Message, MAPPING_TTL};
use mcpl_core::mcp::{InitCache, SubscriptionTracker};

use crate::error::DaemonError;

use dispatcher::RootsAggregator;
use idle::IdleTracker;
use io::MessageReader;
use server::{ManagedServer, ServerState};
use session::Session;

/// Idle clock used when the config does not set `idle_timeout`.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How often stale ID mappings are garbage-collected.
const MAPPER_GC_INTERVAL: Duration = Duration::from_secs(600);

/// How long the liveness probe waits for an existing listener to answer.
const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Shared daemon state. All registries live behind one coarse lock taken
/// only for brief critical sections, never across I/O.
pub(crate) struct Registry {
    pub sessions: HashMap<String, Arc<Session>>,
    pub servers: HashMap<String, Arc<ManagedServer>>,
    /// progressToken → sessionID.
    pub progress_tokens: HashMap<String, String>,
    /// globalID → serverName for in-flight `initialize` requests.
    pub pending_init: HashMap<u64, String>,
    /// fan-out ID → aggregator for daemon-synthesized `roots/list` probes.
    pub pending_fanout: HashMap<u64, Arc<RootsAggregator>>,
}

impl Registry {
    fn sessions_for_server(&self, server_name: &str) -> Vec<Arc<Session>> {
        self.sessions
            .values()
            .filter(|s| s.server_name() == server_name)
            .cloned()
            .collect()
    }
}

pub(crate) struct DaemonInner {
    config_path: PathBuf,
    socket_path: PathBuf,
    pid_path: Option<PathBuf>,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) id_mapper: IdMapper,
    pub(crate) init_cache: InitCache,
    pub(crate) subscriptions: SubscriptionTracker,
    idle: IdleTracker,
    shutdown: watch::Sender<bool>,
}

impl DaemonInner {
    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

/// The mcpl daemon. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Daemon {
    inner: Arc<DaemonInner>,
}

impl Daemon {
    /// Build a daemon from a loaded config.
    ///
    /// `pid_path` is written on startup and removed on shutdown when given;
    /// the CLI passes the standard location, tests pass scratch paths.
    pub fn new(
        cfg: &Config,
        config_path: PathBuf,
        socket_path: PathBuf,
        pid_path: Option<PathBuf>,
    ) -> Self {
        let servers = cfg
            .servers
            .iter()
            .filter(|(_, scfg)| scfg.is_managed())
            .map(|(name, scfg)| {
                (
                    name.clone(),
                    Arc::new(ManagedServer::new(name, scfg.clone())),
                )
            })
            .collect();

        let idle_timeout = cfg
            .idle_timeout()
            .ok()
            .flatten()
            .unwrap_or(DEFAULT_IDLE_TIMEOUT);

        let (shutdown, _) = watch::channel(false);

        Daemon {
            inner: Arc::new(DaemonInner {
                config_path,
                socket_path,
                pid_path,
                registry: Mutex::new(Registry {
                    sessions: HashMap::new(),
                    servers,
                    progress_tokens: HashMap::new(),
                    pending_init: HashMap::new(),
                    pending_fanout: HashMap::new(),
                }),
                id_mapper: IdMapper::new(),
                init_cache: InitCache::new(),
                subscriptions: SubscriptionTracker::new(),
                idle: IdleTracker::new(idle_timeout),
                shutdown,
            }),
        }
    }

    /// Request shutdown, as SIGTERM would.
    pub fn trigger_shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    /// The managed server handle for `name`, if registered.
    pub fn server(&self, name: &str) -> Option<Arc<ManagedServer>> {
        self.inner
            .registry
            .lock()
            .expect("registry lock poisoned")
            .servers
            .get(name)
            .cloned()
    }

    /// Bind the socket and serve until SIGTERM (or
    /// [`trigger_shutdown`](Self::trigger_shutdown)).
    pub async fn run(&self) -> Result<(), DaemonError> {
        let inner = &self.inner;
        let socket_path = &inner.socket_path;
        let socket_dir = socket_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        ensure_dir(&socket_dir, 0o700)?;
        let dir_mode = fs::metadata(&socket_dir)
            .map_err(DaemonError::Io)?
            .permissions()
            .mode()
            & 0o777;
        if dir_mode & 0o077 != 0 {
            return Err(DaemonError::InsecureSocketDir {
                path: socket_dir,
                mode: dir_mode,
            });
        }

        // A connectable socket means a live daemon; a stale path is removed.
        if let Ok(Ok(_conn)) =
            tokio::time::timeout(PROBE_TIMEOUT, UnixStream::connect(socket_path)).await
        {
            return Err(DaemonError::AlreadyRunning {
                path: socket_path.clone(),
            });
        }
        let _ = fs::remove_file(socket_path);

        let listener = UnixListener::bind(socket_path).map_err(DaemonError::Io)?;
        fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600))
            .map_err(DaemonError::Io)?;

        if let Some(pid_path) = &inner.pid_path {
            let pid_line = format!("{}\n", std::process::id());
            atomic_write_file(pid_path, pid_line.as_bytes(), 0o600)?;
        }

        self.spawn_signal_handlers()?;
        self.spawn_mapper_gc();

        tracing::info!(socket = %socket_path.display(), "daemon started");

        let mut shutdown_rx = inner.shutdown_rx();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let daemon = self.clone();
                        tokio::spawn(async move {
                            daemon.handle_connection(stream).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn spawn_signal_handlers(&self) -> Result<(), DaemonError> {
        use tokio::signal::unix::{signal, SignalKind};

        // SIGTERM is the only shutdown trigger.
        let mut sigterm = signal(SignalKind::terminate()).map_err(DaemonError::Io)?;
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            if sigterm.recv().await.is_some() {
                tracing::info!("SIGTERM received, shutting down");
                let _ = shutdown.send(true);
            }
        });

        // A host editor's SIGINT/SIGHUP must not take the daemon down with
        // it. SIGPIPE is already ignored by the runtime.
        let mut sigint = signal(SignalKind::interrupt()).map_err(DaemonError::Io)?;
        let mut sighup = signal(SignalKind::hangup()).map_err(DaemonError::Io)?;
        let mut shutdown_rx = self.inner.shutdown_rx();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sigint.recv() => tracing::debug!("ignoring SIGINT"),
                    _ = sighup.recv() => tracing::debug!("ignoring SIGHUP"),
                    _ = shutdown_rx.changed() => return,
                }
            }
        });

        Ok(())
    }

    fn spawn_mapper_gc(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = inner.shutdown_rx();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAPPER_GC_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = inner.id_mapper.gc(MAPPING_TTL);
                        if removed > 0 {
                            tracing::debug!(removed, "garbage-collected stale id mappings");
                        }
                    }
                    _ = shutdown_rx.changed() => return,
                }
            }
        });
    }

    // ── Connection handling ──────────────────────────────────────────────

    async fn handle_connection(&self, stream: UnixStream) {
        let inner = &self.inner;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = MessageReader::new(BufReader::new(read_half));

        let line = match reader.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(_) => {
                write_handshake(
                    &mut write_half,
                    &ConnectResponse::error(RejectCode::InvalidRequest, "unreadable handshake"),
                )
                .await;
                return;
            }
        };

        let req: ConnectRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(_) => {
                write_handshake(
                    &mut write_half,
                    &ConnectResponse::error(RejectCode::InvalidRequest, "invalid handshake JSON"),
                )
                .await;
                return;
            }
        };

        if let Err(e) = handshake::validate(&req) {
            write_handshake(&mut write_half, &ConnectResponse::error(e.code(), e.to_string()))
                .await;
            return;
        }

        // Users add servers without bouncing the daemon.
        self.reload_config();

        let server = {
            let registry = inner.registry.lock().expect("registry lock poisoned");
            registry.servers.get(&req.server).cloned()
        };
        let Some(server) = server else {
            write_handshake(
                &mut write_half,
                &ConnectResponse::error(
                    RejectCode::UnknownServer,
                    format!("server {:?} not found in config", req.server),
                ),
            )
            .await;
            return;
        };

        let session = Arc::new(Session::new(write_half, &req.server));
        {
            let mut registry = inner.registry.lock().expect("registry lock poisoned");
            registry
                .sessions
                .insert(session.id().to_string(), Arc::clone(&session));
        }
        server.add_connection(session.id());
        inner.idle.connection_added();

        // First session auto-starts the server.
        if let Err(e) = self.ensure_server_running(&server).await {
            self.remove_session(&session, &server).await;
            let resp = ConnectResponse::error(
                RejectCode::StartFailed,
                format!("failed to start server {:?}: {e}", req.server),
            );
            if let Ok(line) = serde_json::to_string(&resp) {
                let _ = session.write_line(&line).await;
            }
            return;
        }

        if let Ok(line) = serde_json::to_string(&ConnectResponse::connected()) {
            if session.write_line(&line).await.is_err() {
                self.remove_session(&session, &server).await;
                return;
            }
        }

        tracing::info!(
            session = %session.id(),
            server = %req.server,
            "session connected"
        );

        session_loop::run_session_loop(
            Arc::clone(inner),
            Arc::clone(&session),
            Arc::clone(&server),
            reader,
        )
        .await;

        self.remove_session(&session, &server).await;
        tracing::info!(
            session = %session.id(),
            server = %req.server,
            "session disconnected"
        );
    }

    /// Deregister a session and release everything it owned: progress
    /// tokens, subscriptions (sending the server an unsubscribe for URIs it
    /// was the last subscriber to), and the idle clock.
    async fn remove_session(&self, session: &Arc<Session>, server: &Arc<ManagedServer>) {
        let inner = &self.inner;
        server.remove_connection(session.id());
        {
            let mut registry = inner.registry.lock().expect("registry lock poisoned");
            registry.sessions.remove(session.id());
            registry.progress_tokens.retain(|_, sid| sid != session.id());
        }

        let orphaned = inner.subscriptions.remove_session(session.id());
        for uri in orphaned {
            let params = match serde_json::value::to_raw_value(&serde_json::json!({ "uri": uri }))
            {
                Ok(params) => params,
                Err(e) => {
                    tracing::warn!(error = %e, "encode unsubscribe params");
                    continue;
                }
            };
            let msg = Message::request(
                raw_u64(inner.id_mapper.next_id()),
                "resources/unsubscribe",
                Some(params),
            );
            match msg.serialize() {
                Ok(line) => {
                    if let Err(e) = server.write_to_stdin(&line).await {
                        tracing::warn!(server = %server.name(), error = %e, "send orphan unsubscribe");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "serialize orphan unsubscribe"),
            }
        }

        inner.idle.connection_removed();
    }

    // ── Server lifecycle ─────────────────────────────────────────────────

    /// Start `server` if it is stopped: resolve env, spawn, wire up the
    /// stderr drain, stdout dispatcher, process monitor, and (for
    /// serialized servers) the queue worker.
    async fn ensure_server_running(&self, server: &Arc<ManagedServer>) -> Result<(), DaemonError> {
        if !server.begin_start()? {
            return Ok(()); // already starting or running
        }

        let resolved_env = resolve_env(&server.config().env);
        let handles = match server.start(resolved_env).await {
            Ok(handles) => handles,
            Err(e) => {
                server.force_stop();
                return Err(e);
            }
        };

        tracing::info!(server = %server.name(), "server started");

        tokio::spawn(server::drain_stderr(
            server.name().to_string(),
            handles.stderr,
        ));
        tokio::spawn(dispatcher::run_dispatcher(
            Arc::clone(&self.inner),
            Arc::clone(server),
            handles.stdout,
        ));

        // Monitor: crash bookkeeping on unexpected exit.
        {
            let inner = Arc::clone(&self.inner);
            let server = Arc::clone(server);
            let mut child = handles.child;
            let exited_tx = handles.exited_tx;
            tokio::spawn(async move {
                let status = child.wait().await;
                let _ = exited_tx.send(true);
                server.mark_exited().await;

                let state = server.state();
                if state != ServerState::Stopped {
                    tracing::warn!(
                        server = %server.name(),
                        state = %state,
                        status = ?status.ok(),
                        "server exited unexpectedly"
                    );
                    server.record_crash();
                    server.force_stop();
                    // Unblock the serialize worker and forget initializes
                    // that will never be answered.
                    server.drain_waiters();
                    let mut registry = inner.registry.lock().expect("registry lock poisoned");
                    registry.pending_init.retain(|_, name| name != server.name());
                }
            });
        }

        if server.serialize_queue().is_some() && !server.has_queue_worker() {
            let handle = tokio::spawn(serialize::run_queue_worker(Arc::clone(server)));
            server.set_queue_worker(handle);
        }

        server.transition_to(ServerState::Initializing)?;
        server.transition_to(ServerState::Ready)?;
        Ok(())
    }

    /// Re-read the config file and register newly-added managed servers.
    ///
    /// Existing entries are deliberately left untouched (edits to a running
    /// server require a restart) and removed entries persist until daemon
    /// shutdown. Reload failures keep the previous config.
    fn reload_config(&self) {
        let inner = &self.inner;
        let cfg = match mcpl_core::config::load(&inner.config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!(error = %e, "config reload failed, keeping previous config");
                return;
            }
        };

        let mut registry = inner.registry.lock().expect("registry lock poisoned");
        for (name, scfg) in &cfg.servers {
            if scfg.is_managed() && !registry.servers.contains_key(name) {
                registry
                    .servers
                    .insert(name.clone(), Arc::new(ManagedServer::new(name, scfg.clone())));
                tracing::info!(server = %name, "config reload: added server");
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    async fn shutdown(&self) {
        let inner = &self.inner;
        tracing::info!(
            idle_secs = inner.idle.idle_duration().as_secs(),
            "shutting down"
        );

        // Dropping the sessions closes their write halves; the read loops
        // observe the shutdown signal and exit.
        let servers: Vec<Arc<ManagedServer>> = {
            let mut registry = inner.registry.lock().expect("registry lock poisoned");
            registry.sessions.clear();
            registry.pending_init.clear();
            registry.pending_fanout.clear();
            registry.servers.values().cloned().collect()
        };

        for server in &servers {
            server.close_serialize_queue().await;
        }
        for server in &servers {
            if server.state() != ServerState::Stopped {
                server.force_stop();
            }
            server.stop().await;
        }

        let _ = fs::remove_file(&inner.socket_path);
        if let Some(pid_path) = &inner.pid_path {
            let _ = fs::remove_file(pid_path);
        }
    }
}

async fn write_handshake(write_half: &mut tokio::net::unix::OwnedWriteHalf, resp: &ConnectResponse) {
    let Ok(mut line) = serde_json::to_string(resp) else {
        return;
    };
    line.push('\n');
    let _ = write_half.write_all(line.as_bytes()).await;
    let _ = write_half.flush().await;
}
