//! Server-facing dispatcher: reads a server's stdout and routes each message
//! to the right session(s), or answers it daemon-side.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::value::RawValue;
use tokio::io::BufReader;
use tokio::process::ChildStdout;

use mcpl_core::error::FramingError;
use mcpl_core::jsonrpc::{parse_global_id, raw_u64, Message};
use mcpl_core::mcp::{
    classify_server_message, extract_progress_notification_token, extract_resource_uri,
    MessageClass,
};

use crate::daemon::io::MessageReader;
use crate::daemon::server::ManagedServer;
use crate::daemon::session::Session;
use crate::daemon::DaemonInner;

/// How long a `roots/list` fan-out waits for stragglers before answering
/// the server with whatever has arrived.
pub(crate) const FANOUT_TIMEOUT: Duration = Duration::from_secs(5);

fn raw_literal(s: &'static str) -> Box<RawValue> {
    RawValue::from_string(s.to_string()).expect("literal is valid JSON")
}

// ─────────────────────────────────────────────────────────────────────────────
// Roots Fan-out Aggregator
// ─────────────────────────────────────────────────────────────────────────────

/// Collects `roots/list` answers from the capable sessions and merges them
/// into one response for the server.
///
/// Two paths reach [`finalize`](Self::finalize): the last session answering,
/// and the [`FANOUT_TIMEOUT`] safety timer. The `done` flag makes finalize
/// idempotent, so whichever comes second is a no-op.
pub(crate) struct RootsAggregator {
    server: Arc<ManagedServer>,
    server_id: Box<RawValue>,
    state: Mutex<AggregatorState>,
}

struct AggregatorState {
    remaining: usize,
    fanout_ids: Vec<u64>,
    roots: Vec<Box<RawValue>>,
    done: bool,
}

#[derive(serde::Deserialize)]
struct RootsResult {
    #[serde(default)]
    roots: Vec<Box<RawValue>>,
}

impl RootsAggregator {
    pub(crate) fn new(
        server: Arc<ManagedServer>,
        server_id: Box<RawValue>,
        remaining: usize,
    ) -> Self {
        RootsAggregator {
            server,
            server_id,
            state: Mutex::new(AggregatorState {
                remaining,
                fanout_ids: Vec::new(),
                roots: Vec::new(),
                done: false,
            }),
        }
    }

    pub(crate) fn add_fanout_id(&self, id: u64) {
        self.state
            .lock()
            .expect("aggregator lock poisoned")
            .fanout_ids
            .push(id);
    }

    /// Merge one session's `result.roots`. Returns true when every capable
    /// session has answered.
    pub(crate) fn collect(&self, result: Option<&RawValue>) -> bool {
        let mut state = self.state.lock().expect("aggregator lock poisoned");
        if state.done {
            return false;
        }
        if let Some(result) = result {
            if let Ok(parsed) = serde_json::from_str::<RootsResult>(result.get()) {
                state.roots.extend(parsed.roots);
            }
        }
        state.remaining = state.remaining.saturating_sub(1);
        state.remaining == 0
    }

    /// Deduplicate by `uri` and answer the server. Idempotent.
    pub(crate) async fn finalize(&self, daemon: &DaemonInner) {
        let (roots, fanout_ids) = {
            let mut state = self.state.lock().expect("aggregator lock poisoned");
            if state.done {
                return;
            }
            state.done = true;
            (
                std::mem::take(&mut state.roots),
                std::mem::take(&mut state.fanout_ids),
            )
        };

        // Sessions that never answered leave entries behind; drop them so
        // the registry doesn't accumulate dead aggregators.
        {
            let mut registry = daemon.registry.lock().expect("registry lock poisoned");
            for id in fanout_ids {
                registry.pending_fanout.remove(&id);
            }
        }

        let mut seen = std::collections::HashSet::new();
        let mut unique = Vec::with_capacity(roots.len());
        for root in roots {
            let uri = serde_json::from_str::<serde_json::Value>(root.get())
                .ok()
                .and_then(|v| v.get("uri").and_then(|u| u.as_str()).map(String::from))
                .unwrap_or_default();
            if seen.insert(uri) {
                unique.push(root);
            }
        }

        let result = match build_roots_result(&unique) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(server = %self.server.name(), error = %e, "encode roots result");
                return;
            }
        };
        let resp = Message::response(self.server_id.clone(), result);
        match resp.serialize() {
            Ok(line) => {
                if let Err(e) = self.server.write_to_stdin(&line).await {
                    tracing::warn!(server = %self.server.name(), error = %e, "write roots response");
                }
            }
            Err(e) => {
                tracing::warn!(server = %self.server.name(), error = %e, "serialize roots response")
            }
        }
    }
}

fn build_roots_result(roots: &[Box<RawValue>]) -> Result<Box<RawValue>, serde_json::Error> {
    #[derive(serde::Serialize)]
    struct RootsPayload<'a> {
        roots: &'a [Box<RawValue>],
    }
    serde_json::value::to_raw_value(&RootsPayload { roots })
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Read a server's stdout until EOF, dispatching every line.
///
/// Started once per server start; exits when the pipe closes (crash or
/// stop). Crash bookkeeping lives with the process monitor, not here.
pub(crate) async fn run_dispatcher(
    daemon: Arc<DaemonInner>,
    server: Arc<ManagedServer>,
    stdout: ChildStdout,
) {
    let mut reader = MessageReader::new(BufReader::new(stdout));
    loop {
        let msg = match reader.next_message().await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(FramingError::Io(e)) => {
                tracing::warn!(server = %server.name(), error = %e, "server stdout read failed");
                break;
            }
            Err(e) => {
                tracing::warn!(server = %server.name(), error = %e, "dropping message from server");
                continue;
            }
        };
        dispatch_server_message(&daemon, &server, msg).await;
    }
    tracing::info!(server = %server.name(), "server reader exited");
}

async fn dispatch_server_message(
    daemon: &Arc<DaemonInner>,
    server: &Arc<ManagedServer>,
    msg: Message,
) {
    match classify_server_message(&msg) {
        MessageClass::Response => dispatch_response(daemon, server, msg).await,
        MessageClass::Progress => dispatch_progress(daemon, msg).await,
        MessageClass::ResourceUpdated => dispatch_resource_update(daemon, msg).await,
        MessageClass::Broadcast => broadcast_to_sessions(daemon, server, msg).await,
        MessageClass::Ping => respond_to_ping(server, msg).await,
        MessageClass::ServerRequest => handle_server_request(daemon, server, msg).await,
    }
}

/// Route a response back to the session that sent the request.
///
/// Initialize responses are captured into the cache first (under the global
/// ID the daemon assigned, recorded in `pending_init`). The serialize waiter
/// fires unconditionally, even when routing fails, so the queue advances.
async fn dispatch_response(daemon: &Arc<DaemonInner>, server: &Arc<ManagedServer>, mut msg: Message) {
    let Some(global_id) = msg.id.as_deref().and_then(parse_global_id) else {
        tracing::warn!(server = %server.name(), "response with non-global id, dropping");
        return;
    };

    let pending_server = {
        let mut registry = daemon.registry.lock().expect("registry lock poisoned");
        registry.pending_init.remove(&global_id)
    };
    if let Some(server_name) = pending_server {
        if let Some(result) = &msg.result {
            daemon.init_cache.store(&server_name, result.clone());
            tracing::info!(server = %server_name, "cached initialize response");
        }
    }

    match daemon.id_mapper.unmap(global_id) {
        Some(mapping) => {
            msg.set_id(mapping.original_id);
            let session = {
                let registry = daemon.registry.lock().expect("registry lock poisoned");
                registry.sessions.get(&mapping.session_id).cloned()
            };
            match session {
                Some(session) => write_to_session(&session, &msg).await,
                None => tracing::debug!(
                    session = %mapping.session_id,
                    "response for disconnected session, dropping"
                ),
            }
        }
        None => {
            tracing::warn!(server = %server.name(), global_id, "response with no mapping, dropping")
        }
    }

    server.signal_serialize_waiter(global_id);
}

async fn dispatch_progress(daemon: &Arc<DaemonInner>, msg: Message) {
    let Some(token) = extract_progress_notification_token(&msg) else {
        return;
    };
    let session = {
        let registry = daemon.registry.lock().expect("registry lock poisoned");
        registry
            .progress_tokens
            .get(&token)
            .and_then(|sid| registry.sessions.get(sid))
            .cloned()
    };
    if let Some(session) = session {
        write_to_session(&session, &msg).await;
    }
}

async fn dispatch_resource_update(daemon: &Arc<DaemonInner>, msg: Message) {
    let Some(uri) = extract_resource_uri(&msg) else {
        return;
    };
    let subscribers = daemon.subscriptions.subscribers(&uri);
    // Snapshot under the lock, write outside it.
    let sessions: Vec<Arc<Session>> = {
        let registry = daemon.registry.lock().expect("registry lock poisoned");
        subscribers
            .iter()
            .filter_map(|sid| registry.sessions.get(sid).cloned())
            .collect()
    };
    for session in sessions {
        write_to_session(&session, &msg).await;
    }
}

async fn broadcast_to_sessions(daemon: &Arc<DaemonInner>, server: &Arc<ManagedServer>, msg: Message) {
    let sessions = {
        let registry = daemon.registry.lock().expect("registry lock poisoned");
        registry.sessions_for_server(server.name())
    };
    for session in sessions {
        write_to_session(&session, &msg).await;
    }
}

/// Keepalive: answered daemon-side with the server's own ID, invisible to
/// sessions.
async fn respond_to_ping(server: &Arc<ManagedServer>, msg: Message) {
    let Some(id) = msg.id.clone() else {
        return;
    };
    let pong = Message::response(id, raw_literal("{}"));
    if let Err(e) = write_to_server(server, &pong).await {
        tracing::warn!(server = %server.name(), error = %e, "write ping response");
    }
}

async fn handle_server_request(
    daemon: &Arc<DaemonInner>,
    server: &Arc<ManagedServer>,
    msg: Message,
) {
    match msg.method() {
        "roots/list" => handle_roots_list(daemon, server, msg).await,
        "sampling/createMessage" => handle_sampling(daemon, server, msg).await,
        method => {
            tracing::warn!(server = %server.name(), method, "unknown server request");
            let Some(id) = msg.id.clone() else { return };
            let resp = Message::error_response(
                id,
                raw_literal(r#"{"code":-32601,"message":"method not found"}"#),
            );
            if let Err(e) = write_to_server(server, &resp).await {
                tracing::warn!(server = %server.name(), error = %e, "write error response");
            }
        }
    }
}

/// Fan `roots/list` out to every session that declared the `roots`
/// capability and aggregate their answers.
async fn handle_roots_list(daemon: &Arc<DaemonInner>, server: &Arc<ManagedServer>, msg: Message) {
    let Some(server_id) = msg.id.clone() else {
        return;
    };

    let capable: Vec<Arc<Session>> = {
        let registry = daemon.registry.lock().expect("registry lock poisoned");
        registry
            .sessions_for_server(server.name())
            .into_iter()
            .filter(|s| s.capabilities().roots)
            .collect()
    };

    if capable.is_empty() {
        let resp = Message::response(server_id, raw_literal(r#"{"roots":[]}"#));
        if let Err(e) = write_to_server(server, &resp).await {
            tracing::warn!(server = %server.name(), error = %e, "write empty roots response");
        }
        return;
    }

    let agg = Arc::new(RootsAggregator::new(
        Arc::clone(server),
        server_id,
        capable.len(),
    ));

    // Allocate fan-out IDs and publish the aggregator under the lock, then
    // write to the sessions outside it.
    let mut outgoing = Vec::with_capacity(capable.len());
    {
        let mut registry = daemon.registry.lock().expect("registry lock poisoned");
        for session in capable {
            let fanout_id = daemon.id_mapper.next_id();
            registry.pending_fanout.insert(fanout_id, Arc::clone(&agg));
            agg.add_fanout_id(fanout_id);
            outgoing.push((session, fanout_id));
        }
    }
    for (session, fanout_id) in outgoing {
        let probe = Message::request(raw_u64(fanout_id), "roots/list", None);
        write_to_session(&session, &probe).await;
    }

    // Safety net: a slow or dead session must not stall the server.
    let daemon = Arc::clone(daemon);
    tokio::spawn(async move {
        tokio::time::sleep(FANOUT_TIMEOUT).await;
        agg.finalize(&daemon).await;
    });
}

/// Route `sampling/createMessage` to one capable session, envelope
/// untouched; its response returns via the normal response path.
async fn handle_sampling(daemon: &Arc<DaemonInner>, server: &Arc<ManagedServer>, msg: Message) {
    let target = {
        let registry = daemon.registry.lock().expect("registry lock poisoned");
        registry
            .sessions_for_server(server.name())
            .into_iter()
            .find(|s| s.capabilities().sampling)
    };

    match target {
        Some(session) => write_to_session(&session, &msg).await,
        None => {
            let Some(id) = msg.id.clone() else { return };
            let resp = Message::error_response(
                id,
                raw_literal(r#"{"code":-32601,"message":"no connected client supports sampling"}"#),
            );
            if let Err(e) = write_to_server(server, &resp).await {
                tracing::warn!(server = %server.name(), error = %e, "write sampling error");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Write Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Session write failures are non-fatal: log and drop, the session's own
/// read loop notices the disconnect.
async fn write_to_session(session: &Arc<Session>, msg: &Message) {
    match msg.serialize() {
        Ok(line) => {
            if let Err(e) = session.write_line(&line).await {
                tracing::warn!(session = %session.id(), error = %e, "session write failed");
            }
        }
        Err(e) => tracing::warn!(session = %session.id(), error = %e, "serialize message"),
    }
}

async fn write_to_server(
    server: &Arc<ManagedServer>,
    msg: &Message,
) -> Result<(), crate::error::DaemonError> {
    let line = msg.serialize()?;
    server.write_to_stdin(&line).await
}
