//! JSON-RPC 2.0 envelope with raw bodies, and the global ID mapper.
//!
//! The daemon forwards messages between shims and server subprocesses without
//! ever owning their payloads: `id`, `params`, `result`, and `error` are kept
//! as [`RawValue`] so the original bytes survive the round trip. Only the
//! envelope fields the daemon routes on (`id` presence, `method`) are
//! interpreted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::FramingError;
use crate::MAX_LINE_BYTES;

/// The only JSON-RPC version the daemon speaks.
pub const JSONRPC_VERSION: &str = "2.0";

/// How long an unanswered request mapping is retained before GC reclaims it.
pub const MAPPING_TTL: Duration = Duration::from_secs(3600);

// ─────────────────────────────────────────────────────────────────────────────
// Message Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// A JSON-RPC 2.0 message: request, response, or notification.
///
/// Classification is by field presence: a request has both `id` and `method`,
/// a response has `id` without `method`, a notification has `method` without
/// `id`. Body fields are raw so re-serializing a parsed message reproduces
/// their bytes exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Box<RawValue>>,
}

impl Message {
    /// A request expecting a response: has both `id` and `method`.
    pub fn is_request(&self) -> bool {
        self.id.is_some() && self.method.is_some()
    }

    /// A response to a previous request: has `id` but no `method`.
    pub fn is_response(&self) -> bool {
        self.id.is_some() && self.method.is_none()
    }

    /// A fire-and-forget notification: has `method` but no `id`.
    pub fn is_notification(&self) -> bool {
        self.id.is_none() && self.method.is_some()
    }

    /// The method name, or `""` for responses.
    pub fn method(&self) -> &str {
        self.method.as_deref().unwrap_or("")
    }

    pub fn set_id(&mut self, id: Box<RawValue>) {
        self.id = Some(id);
    }

    /// Serialize to a single NDJSON line (no trailing newline).
    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Build a response carrying a raw `result` body.
    pub fn response(id: Box<RawValue>, result: Box<RawValue>) -> Message {
        Message {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// Build a response carrying a raw `error` body.
    pub fn error_response(id: Box<RawValue>, error: Box<RawValue>) -> Message {
        Message {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    /// Build a request.
    pub fn request(id: Box<RawValue>, method: &str, params: Option<Box<RawValue>>) -> Message {
        Message {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: Some(method.to_string()),
            params,
            result: None,
            error: None,
        }
    }
}

/// Parse a single NDJSON line into a [`Message`].
///
/// Validates the size cap, the `jsonrpc` version, and that the message is
/// classifiable (at least one of `id`, `method`).
pub fn parse_message(line: &str) -> Result<Message, FramingError> {
    if line.len() > MAX_LINE_BYTES {
        return Err(FramingError::MessageTooLarge {
            max_bytes: MAX_LINE_BYTES,
        });
    }

    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(FramingError::MalformedJson {
            reason: "empty message".to_string(),
        });
    }

    let msg: Message =
        serde_json::from_str(trimmed).map_err(|e| FramingError::MalformedJson {
            reason: e.to_string(),
        })?;

    if msg.jsonrpc != JSONRPC_VERSION {
        return Err(FramingError::InvalidVersion);
    }
    if msg.id.is_none() && msg.method.is_none() {
        return Err(FramingError::Unclassifiable);
    }

    Ok(msg)
}

/// Wrap a `u64` as a raw JSON integer.
pub fn raw_u64(n: u64) -> Box<RawValue> {
    RawValue::from_string(n.to_string()).expect("an integer is valid JSON")
}

/// Parse a raw `id` as the daemon's integer global ID, if it is one.
pub fn parse_global_id(id: &RawValue) -> Option<u64> {
    serde_json::from_str(id.get()).ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// ID Mapper
// ─────────────────────────────────────────────────────────────────────────────

/// One recorded rewrite: which session asked, under which original ID.
#[derive(Debug)]
pub struct IdMapping {
    pub original_id: Box<RawValue>,
    pub session_id: String,
    pub created_at: Instant,
}

/// Allocates globally unique request IDs and remembers how to undo the
/// rewrite when the response comes back.
///
/// ID issue is a lock-free atomic increment; the mapping table is touched
/// under a separate short-lived lock. Concurrent callers get distinct IDs,
/// but table insertions are not strictly ordered by ID.
#[derive(Debug, Default)]
pub struct IdMapper {
    counter: AtomicU64,
    mappings: Mutex<HashMap<u64, IdMapping>>,
}

impl IdMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a global ID and record the mapping back to the session.
    pub fn map(&self, original_id: Box<RawValue>, session_id: &str) -> u64 {
        let global_id = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let mapping = IdMapping {
            original_id,
            session_id: session_id.to_string(),
            created_at: Instant::now(),
        };
        self.mappings
            .lock()
            .expect("id mapper lock poisoned")
            .insert(global_id, mapping);
        global_id
    }

    /// Allocate a global ID without recording a mapping.
    ///
    /// Used for daemon-originated requests (orphan `resources/unsubscribe`,
    /// fan-out probes) whose responses the daemon consumes itself.
    pub fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Retrieve and remove the mapping for a global ID.
    pub fn unmap(&self, global_id: u64) -> Option<IdMapping> {
        self.mappings
            .lock()
            .expect("id mapper lock poisoned")
            .remove(&global_id)
    }

    /// Reverse lookup: the live global ID for a session's original request ID.
    ///
    /// Used to rewrite `notifications/cancelled`, whose `params.requestId`
    /// names the session-side ID. Compares IDs as JSON values so `1` and
    /// ` 1 ` match while `1` and `"1"` do not.
    pub fn find_mapped(&self, original_id: &RawValue, session_id: &str) -> Option<u64> {
        let wanted: serde_json::Value = serde_json::from_str(original_id.get()).ok()?;
        let mappings = self.mappings.lock().expect("id mapper lock poisoned");
        for (global_id, mapping) in mappings.iter() {
            if mapping.session_id != session_id {
                continue;
            }
            if let Ok(have) = serde_json::from_str::<serde_json::Value>(mapping.original_id.get())
            {
                if have == wanted {
                    return Some(*global_id);
                }
            }
        }
        None
    }

    /// Drop mappings older than `max_age`. Returns how many were removed.
    ///
    /// Bounds memory when a server never answers; the TTL is generous
    /// ([`MAPPING_TTL`]) so slow servers are unaffected.
    pub fn gc(&self, max_age: Duration) -> usize {
        let mut mappings = self.mappings.lock().expect("id mapper lock poisoned");
        let before = mappings.len();
        mappings.retain(|_, m| m.created_at.elapsed() < max_age);
        before - mappings.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.mappings.lock().expect("id mapper lock poisoned").len()
    }
}
