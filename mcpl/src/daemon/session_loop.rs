//! Shim-facing per-session processing.
//!
//! Each line a session sends is parsed, intercepted where the daemon owns
//! the semantics (initialize cache, subscription refcounts, cancellation
//! remap, fan-out answers), and otherwise ID-rewritten and forwarded to the
//! session's server.

use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::unix::OwnedReadHalf;

use mcpl_core::error::FramingError;
use mcpl_core::jsonrpc::{parse_global_id, raw_u64, Message};
use mcpl_core::mcp::{
    extract_progress_token, extract_resource_uri, parse_client_capabilities,
    rewrite_initialize_capabilities,
};

use crate::daemon::io::MessageReader;
use crate::daemon::server::ManagedServer;
use crate::daemon::session::Session;
use crate::daemon::DaemonInner;
use crate::error::DaemonError;

/// Read loop for one session; returns when the shim disconnects or the
/// daemon shuts down. Cleanup happens in the caller.
pub(crate) async fn run_session_loop(
    daemon: Arc<DaemonInner>,
    session: Arc<Session>,
    server: Arc<ManagedServer>,
    mut reader: MessageReader<BufReader<OwnedReadHalf>>,
) {
    let mut shutdown_rx = daemon.shutdown_rx();
    loop {
        let msg = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return,
            result = reader.next_message() => match result {
                Ok(Some(msg)) => msg,
                Ok(None) => return, // shim disconnected
                Err(FramingError::Io(e)) => {
                    tracing::debug!(session = %session.id(), error = %e, "session read failed");
                    return;
                }
                Err(e) => {
                    tracing::warn!(session = %session.id(), error = %e, "dropping message from shim");
                    continue;
                }
            },
        };

        if let Err(e) = process_message(&daemon, &session, &server, msg).await {
            tracing::warn!(
                session = %session.id(),
                server = %server.name(),
                error = %e,
                "failed to process message"
            );
        }
    }
}

/// Apply the interception rules to one inbound message; the first matching
/// rule that fully handles the line stops processing.
async fn process_message(
    daemon: &Arc<DaemonInner>,
    session: &Arc<Session>,
    server: &Arc<ManagedServer>,
    mut msg: Message,
) -> Result<(), DaemonError> {
    // The session answering a request the daemon sent on the server's
    // behalf (roots/list fan-out). Anything else that looks like a response
    // belongs to the server (e.g. sampling/createMessage answers).
    if msg.is_response() {
        if let Some(fanout_id) = msg.id.as_deref().and_then(parse_global_id) {
            let aggregator = {
                let mut registry = daemon.registry.lock().expect("registry lock poisoned");
                registry.pending_fanout.remove(&fanout_id)
            };
            if let Some(aggregator) = aggregator {
                if aggregator.collect(msg.result.as_deref()) {
                    aggregator.finalize(daemon).await;
                }
                return Ok(());
            }
        }
        let line = msg.serialize()?;
        return server.write_to_stdin(&line).await;
    }

    let is_initialize = msg.is_request() && msg.method() == "initialize";
    if is_initialize {
        // Capabilities are recorded whether or not the init is served from
        // cache; fan-out targeting depends on them.
        let caps = parse_client_capabilities(msg.params.as_deref());
        session.set_capabilities(caps);
        tracing::debug!(
            session = %session.id(),
            roots = caps.roots,
            sampling = caps.sampling,
            "session capabilities"
        );

        if let Some(cached) = daemon.init_cache.get(session.server_name()) {
            if let Some(id) = msg.id.clone() {
                let resp = Message::response(id, cached);
                session.write_line(&resp.serialize()?).await?;
            }
            return Ok(());
        }
        // First session for this server: the one initialize the server ever
        // sees must advertise everything any later client could need.
        rewrite_initialize_capabilities(&mut msg)?;
    }

    if msg.is_notification()
        && matches!(msg.method(), "initialized" | "notifications/initialized")
        && daemon.init_cache.contains(session.server_name())
    {
        // The server is already initialized; later sessions' notifications
        // must not re-fire it.
        return Ok(());
    }

    if msg.is_request() {
        if let Some(token) = extract_progress_token(&msg) {
            let mut registry = daemon.registry.lock().expect("registry lock poisoned");
            registry
                .progress_tokens
                .insert(token, session.id().to_string());
        }
    }

    if msg.is_request() && msg.method() == "resources/subscribe" {
        if let Some(uri) = extract_resource_uri(&msg) {
            let count = daemon.subscriptions.subscribe(&uri, session.id());
            if count > 1 {
                // The server is already subscribed; answer locally.
                return reply_empty_result(session, &msg).await;
            }
        }
    }
    if msg.is_request() && msg.method() == "resources/unsubscribe" {
        if let Some(uri) = extract_resource_uri(&msg) {
            let remaining = daemon.subscriptions.unsubscribe(&uri, session.id());
            if remaining > 0 {
                // Other sessions still need the subscription.
                return reply_empty_result(session, &msg).await;
            }
        }
    }

    if msg.is_notification() && msg.method() == "notifications/cancelled" {
        return forward_cancellation(daemon, session, server, msg).await;
    }

    // Generic path: rewrite the ID, remember initialize responses to cache,
    // and hand the line to the server (through the queue when serialized).
    let mut global_id = None;
    if msg.is_request() {
        if let Some(original_id) = msg.id.clone() {
            let gid = daemon.id_mapper.map(original_id, session.id());
            msg.set_id(raw_u64(gid));
            global_id = Some(gid);
            if is_initialize {
                let mut registry = daemon.registry.lock().expect("registry lock poisoned");
                registry
                    .pending_init
                    .insert(gid, session.server_name().to_string());
            }
        }
    }

    let line = msg.serialize()?;
    match (server.serialize_queue(), global_id) {
        (Some(queue), Some(gid)) => {
            let waiter = server.register_waiter(gid);
            if !queue.enqueue(gid, line, waiter) {
                server.take_waiter(gid);
                tracing::warn!(
                    server = %server.name(),
                    global_id = gid,
                    "serialize queue closed, dropping request"
                );
            }
            Ok(())
        }
        // Notifications bypass the queue even on serialized servers.
        _ => server.write_to_stdin(&line).await,
    }
}

async fn reply_empty_result(session: &Arc<Session>, msg: &Message) -> Result<(), DaemonError> {
    let Some(id) = msg.id.clone() else {
        return Ok(());
    };
    let result = serde_json::value::to_raw_value(&serde_json::json!({}))?;
    let resp = Message::response(id, result);
    session.write_line(&resp.serialize()?).await?;
    Ok(())
}

/// Rewrite `params.requestId` from the session's ID space to the global
/// one, cancel the queued entry if the request has not started executing,
/// and forward. Forwarded unchanged when no mapping exists (the response
/// already went back).
async fn forward_cancellation(
    daemon: &Arc<DaemonInner>,
    session: &Arc<Session>,
    server: &Arc<ManagedServer>,
    mut msg: Message,
) -> Result<(), DaemonError> {
    let parsed: Option<serde_json::Value> = msg
        .params
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw.get()).ok());

    let mut global_id = None;
    if let Some(mut params) = parsed {
        if let Some(request_id) = params.get("requestId").cloned() {
            if let Ok(raw_request_id) = serde_json::value::to_raw_value(&request_id) {
                if let Some(gid) = daemon.id_mapper.find_mapped(&raw_request_id, session.id()) {
                    params["requestId"] = serde_json::json!(gid);
                    msg.params = Some(serde_json::value::to_raw_value(&params)?);
                    global_id = Some(gid);
                }
            }
        }
    }

    if let (Some(gid), Some(queue)) = (global_id, server.serialize_queue()) {
        if queue.cancel(gid) {
            tracing::debug!(
                server = %server.name(),
                global_id = gid,
                "cancelled queued request"
            );
        }
    }

    let line = msg.serialize()?;
    server.write_to_stdin(&line).await
}
