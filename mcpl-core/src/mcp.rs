//! MCP-aware routing helpers layered over the JSON-RPC envelope.
//!
//! The daemon never implements MCP itself; it only recognizes the handful of
//! methods whose routing differs from plain forwarding: `initialize` and its
//! cache, `resources/subscribe` refcounting, progress tokens, and the
//! server-originated request/notification families.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};

use serde_json::value::RawValue;

use crate::jsonrpc::Message;

/// Routing class of a server-originated message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Response to a request the daemon forwarded; route by global ID.
    Response,
    /// `notifications/progress`; route by `params.progressToken`.
    Progress,
    /// `notifications/resources/updated`; route to the URI's subscribers.
    ResourceUpdated,
    /// Any other notification; deliver to every session of this server.
    Broadcast,
    /// `ping` request; the daemon answers it directly.
    Ping,
    /// `roots/list` / `sampling/createMessage`; needs a capable client.
    ServerRequest,
}

/// Classify a message read from a server's stdout.
pub fn classify_server_message(msg: &Message) -> MessageClass {
    if msg.is_response() {
        return MessageClass::Response;
    }
    match msg.method() {
        "notifications/progress" => MessageClass::Progress,
        "notifications/resources/updated" => MessageClass::ResourceUpdated,
        "ping" => MessageClass::Ping,
        "roots/list" | "sampling/createMessage" => MessageClass::ServerRequest,
        // Unknown requests still need an answer (method-not-found); unknown
        // notifications fan out to the server's sessions untouched.
        _ if msg.is_request() => MessageClass::ServerRequest,
        _ => MessageClass::Broadcast,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Initialize Cache
// ─────────────────────────────────────────────────────────────────────────────

/// Per-server memo of the first `initialize` result.
///
/// Stored when the first session's `initialize` response arrives; replayed to
/// every later session so a shared server is initialized exactly once.
/// Session churn never invalidates it; only a daemon restart does.
#[derive(Debug, Default)]
pub struct InitCache {
    cached: RwLock<HashMap<String, Box<RawValue>>>,
}

impl InitCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, server_name: &str, result: Box<RawValue>) {
        self.cached
            .write()
            .expect("init cache lock poisoned")
            .insert(server_name.to_string(), result);
    }

    pub fn get(&self, server_name: &str) -> Option<Box<RawValue>> {
        self.cached
            .read()
            .expect("init cache lock poisoned")
            .get(server_name)
            .cloned()
    }

    pub fn contains(&self, server_name: &str) -> bool {
        self.cached
            .read()
            .expect("init cache lock poisoned")
            .contains_key(server_name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscription Tracker
// ─────────────────────────────────────────────────────────────────────────────

/// Reference-counted resource subscriptions: `uri → {session}`.
///
/// The daemon forwards `resources/subscribe` to the server only for the first
/// subscriber of a URI, and `resources/unsubscribe` only when the last one
/// leaves, so the server's view stays binary while sessions churn.
#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    subscriptions: Mutex<HashMap<String, HashSet<String>>>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription; returns the URI's subscriber count afterwards.
    pub fn subscribe(&self, uri: &str, session_id: &str) -> usize {
        let mut subs = self.subscriptions.lock().expect("subscription lock poisoned");
        let sessions = subs.entry(uri.to_string()).or_default();
        sessions.insert(session_id.to_string());
        sessions.len()
    }

    /// Drop a subscription; returns the URI's remaining subscriber count.
    pub fn unsubscribe(&self, uri: &str, session_id: &str) -> usize {
        let mut subs = self.subscriptions.lock().expect("subscription lock poisoned");
        let Some(sessions) = subs.get_mut(uri) else {
            return 0;
        };
        sessions.remove(session_id);
        let remaining = sessions.len();
        if remaining == 0 {
            subs.remove(uri);
        }
        remaining
    }

    /// All sessions subscribed to a URI, sorted for determinism.
    pub fn subscribers(&self, uri: &str) -> Vec<String> {
        let subs = self.subscriptions.lock().expect("subscription lock poisoned");
        let mut out: Vec<String> = subs
            .get(uri)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Remove a session from every URI. Returns the URIs it was the last
    /// subscriber to; those need an unsubscribe sent to the server.
    pub fn remove_session(&self, session_id: &str) -> Vec<String> {
        let mut subs = self.subscriptions.lock().expect("subscription lock poisoned");
        let mut orphaned = Vec::new();
        subs.retain(|uri, sessions| {
            if sessions.remove(session_id) && sessions.is_empty() {
                orphaned.push(uri.clone());
                return false;
            }
            true
        });
        orphaned.sort();
        orphaned
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Param Extraction
// ─────────────────────────────────────────────────────────────────────────────

/// Normalize a raw progress token to its table key.
///
/// Integer tokens are rendered to decimal; to the daemon a token is an opaque
/// routing key, so `7` and `"7"` may share a key without ambiguity.
fn token_key(token: &serde_json::Value) -> Option<String> {
    match token {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => n.as_i64().map(|i| i.to_string()),
        _ => None,
    }
}

/// The `params._meta.progressToken` of a request, if any.
pub fn extract_progress_token(msg: &Message) -> Option<String> {
    let params: serde_json::Value = serde_json::from_str(msg.params.as_ref()?.get()).ok()?;
    token_key(params.get("_meta")?.get("progressToken")?)
}

/// The `params.progressToken` of a `notifications/progress`, if any.
pub fn extract_progress_notification_token(msg: &Message) -> Option<String> {
    let params: serde_json::Value = serde_json::from_str(msg.params.as_ref()?.get()).ok()?;
    token_key(params.get("progressToken")?)
}

/// The `params.uri` of a resource subscribe/unsubscribe/updated message.
pub fn extract_resource_uri(msg: &Message) -> Option<String> {
    let params: serde_json::Value = serde_json::from_str(msg.params.as_ref()?.get()).ok()?;
    match params.get("uri")? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client Capabilities
// ─────────────────────────────────────────────────────────────────────────────

/// Which optional client-side features a session negotiated.
///
/// Derived from the presence of keys in `initialize.params.capabilities`;
/// the daemon uses these to select targets for server-originated requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientCapabilities {
    pub roots: bool,
    pub sampling: bool,
}

/// Parse a session's capabilities from its `initialize` params.
pub fn parse_client_capabilities(params: Option<&RawValue>) -> ClientCapabilities {
    let Some(params) = params else {
        return ClientCapabilities::default();
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(params.get()) else {
        return ClientCapabilities::default();
    };
    let Some(caps) = value.get("capabilities") else {
        return ClientCapabilities::default();
    };
    ClientCapabilities {
        roots: caps.get("roots").is_some(),
        sampling: caps.get("sampling").is_some(),
    }
}

/// Rewrite an `initialize` request's capabilities to the maximal set.
///
/// The first session's `initialize` is the only one the server ever sees, so
/// it must enable every feature any later client might use:
/// `{"roots":{"listChanged":true},"sampling":{}}`. Other params are kept.
pub fn rewrite_initialize_capabilities(msg: &mut Message) -> Result<(), serde_json::Error> {
    let mut params: serde_json::Value = match msg.params.as_ref() {
        Some(raw) => serde_json::from_str(raw.get())?,
        None => serde_json::json!({}),
    };
    if !params.is_object() {
        params = serde_json::json!({});
    }
    params["capabilities"] = serde_json::json!({
        "roots": {"listChanged": true},
        "sampling": {},
    });
    msg.params = Some(serde_json::value::to_raw_value(&params)?);
    Ok(())
}
