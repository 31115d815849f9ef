//! Scriptable mock MCP server for integration tests.
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout:
//!
//! - `initialize` → a canned result
//! - `tools/list` → `{"tools":[]}`
//! - `resources/subscribe` / `resources/unsubscribe` / `ping` → `{}`
//! - `mock/ignore` → logged, never answered
//! - `mock/emit` (request or notification) → writes `params.line` verbatim
//!   to stdout, letting a test make the server originate any message
//!   (`roots/list`, progress, broadcasts, `ping`, …); requests are also
//!   acked with `{}`
//! - any other request → `{"ok":true}`
//!
//! When `MCPL_MOCK_LOG` is set, every received line is appended to that
//! file so tests can assert exactly-once delivery.

use std::fs::OpenOptions;
use std::io::{BufRead, Write};

use serde_json::{json, Value};

fn main() {
    let log_path = std::env::var_os("MCPL_MOCK_LOG");
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        if let Some(path) = &log_path {
            if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(path) {
                let _ = writeln!(f, "{line}");
            }
        }

        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let method = msg.get("method").and_then(|m| m.as_str());
        let id = msg.get("id").cloned();

        if method == Some("mock/emit") {
            if let Some(emit) = msg.pointer("/params/line") {
                write_line(&stdout, emit);
            }
            if let Some(id) = id {
                write_line(&stdout, &json!({"jsonrpc": "2.0", "id": id, "result": {}}));
            }
            continue;
        }

        let (Some(method), Some(id)) = (method, id) else {
            continue; // notification or response: nothing to say
        };

        // A request that is logged but never answered, for tests that need
        // an in-flight request to stay pending.
        if method == "mock/ignore" {
            continue;
        }

        let result = match method {
            "initialize" => json!({
                "protocolVersion": "2024-11-05",
                "serverInfo": {"name": "mock", "version": "1"},
                "capabilities": {"tools": {}},
            }),
            "tools/list" => json!({"tools": []}),
            "resources/subscribe" | "resources/unsubscribe" | "ping" => json!({}),
            _ => json!({"ok": true}),
        };
        write_line(&stdout, &json!({"jsonrpc": "2.0", "id": id, "result": result}));
    }
}

fn write_line(stdout: &std::io::Stdout, value: &Value) {
    let mut out = stdout.lock();
    let _ = writeln!(out, "{value}");
    let _ = out.flush();
}
