//! End-to-end tests: a real daemon on a real Unix socket, with the
//! `mock_server` workspace binary as the managed subprocess.
//!
//! The mock appends every line it receives to `MCPL_MOCK_LOG`, which is how
//! these tests assert exactly-once delivery to the server. These tests
//! spawn Unix subprocesses and rely on Unix socket semantics.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use mcpl::daemon::Daemon;
use mcpl_core::config::{atomic_write_file, load};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

struct TestDaemon {
    daemon: Daemon,
    dir: TempDir,
    socket_path: PathBuf,
    pid_path: PathBuf,
    mock_log: PathBuf,
}

impl TestDaemon {
    /// Start a daemon in a scratch dir with the given `servers` config
    /// block (mock log env is appended to every entry).
    async fn start(servers: Value) -> TestDaemon {
        let dir = tempfile::Builder::new()
            .permissions(std::fs::Permissions::from_mode(0o700))
            .tempdir()
            .expect("create tempdir");
        let socket_path = dir.path().join("mcpl.sock");
        let pid_path = dir.path().join("mcpl.pid");
        let config_path = dir.path().join("config.json");
        let mock_log = dir.path().join("mock.log");

        let mut servers = servers;
        for (_, entry) in servers.as_object_mut().expect("servers object").iter_mut() {
            entry["env"]["MCPL_MOCK_LOG"] = json!(mock_log.to_str().expect("utf-8 path"));
        }
        let config = json!({ "servers": servers });
        atomic_write_file(
            &config_path,
            serde_json::to_string_pretty(&config)
                .expect("encode config")
                .as_bytes(),
            0o600,
        )
        .expect("write config");

        let cfg = load(&config_path).expect("load config");
        let daemon = Daemon::new(&cfg, config_path, socket_path.clone(), Some(pid_path.clone()));

        let runner = daemon.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.run().await {
                eprintln!("daemon exited with error: {e}");
            }
        });

        // Wait for the listener to come up.
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            if UnixStream::connect(&socket_path).await.is_ok() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "daemon did not start listening"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        TestDaemon {
            daemon,
            dir,
            socket_path,
            pid_path,
            mock_log,
        }
    }

    async fn start_with_mock() -> TestDaemon {
        Self::start(json!({
            "mock": { "command": mock_server_bin() },
        }))
        .await
    }

    /// Lines the mock server has received so far.
    fn mock_log_lines(&self) -> Vec<Value> {
        let Ok(data) = std::fs::read_to_string(&self.mock_log) else {
            return Vec::new();
        };
        data.lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    /// Poll the mock log until `pred` is satisfied.
    async fn wait_for_log<F: Fn(&[Value]) -> bool>(&self, pred: F) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        loop {
            let lines = self.mock_log_lines();
            if pred(&lines) {
                return lines;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "mock log predicate not satisfied; log: {lines:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

fn mock_server_bin() -> &'static str {
    env!("CARGO_BIN_EXE_mock_server")
}

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    /// Connect and complete the handshake for `server`.
    async fn connect(td: &TestDaemon, server: &str) -> TestClient {
        let mut client = Self::connect_raw(td).await;
        client
            .send_raw(&json!({"mcpl": 1, "type": "connect", "server": server}).to_string())
            .await;
        let resp = client.recv().await;
        assert_eq!(resp["type"], "connected", "handshake failed: {resp}");
        assert_eq!(resp["status"], "ready");
        client
    }

    async fn connect_raw(td: &TestDaemon) -> TestClient {
        let stream = UnixStream::connect(&td.socket_path)
            .await
            .expect("connect to daemon");
        let (read_half, writer) = stream.into_split();
        TestClient {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("write to daemon");
        self.writer.flush().await.expect("flush");
    }

    async fn send(&mut self, msg: Value) {
        self.send_raw(&msg.to_string()).await;
    }

    async fn recv(&mut self) -> Value {
        let mut line = String::new();
        let n = tokio::time::timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for daemon")
            .expect("read from daemon");
        assert!(n > 0, "daemon closed the connection");
        serde_json::from_str(&line).expect("daemon sent invalid JSON")
    }

    /// Receive until a message satisfies `pred`, discarding others.
    async fn recv_matching<F: Fn(&Value) -> bool>(&mut self, pred: F) -> Value {
        for _ in 0..16 {
            let msg = self.recv().await;
            if pred(&msg) {
                return msg;
            }
        }
        panic!("no matching message within 16 reads");
    }

    /// True EOF: the daemon closed this connection.
    async fn recv_eof(&mut self) {
        let mut line = String::new();
        let n = tokio::time::timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for EOF")
            .expect("read from daemon");
        assert_eq!(n, 0, "expected EOF, got: {line}");
    }

    async fn initialize(&mut self, id: Value, capabilities: Value) -> Value {
        self.send(json!({
            "jsonrpc": "2.0",
            "id": id.clone(),
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": capabilities,
                "clientInfo": {"name": "t", "version": "1"},
            },
        }))
        .await;
        let resp = self.recv().await;
        assert_eq!(resp["id"], id);
        resp
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

/// S1: handshake and initialize, single session.
#[tokio::test(flavor = "multi_thread")]
async fn test_handshake_and_initialize() {
    let td = TestDaemon::start_with_mock().await;
    let mut client = TestClient::connect(&td, "mock").await;

    let resp = client.initialize(json!(1), json!({})).await;
    assert_eq!(resp["result"]["serverInfo"]["name"], "mock");
    assert_eq!(resp["result"]["protocolVersion"], "2024-11-05");
}

/// S2: the init cache makes the server see exactly one initialize across
/// two sessions, each keeping its own request ID.
#[tokio::test(flavor = "multi_thread")]
async fn test_init_cache_across_sessions() {
    let td = TestDaemon::start_with_mock().await;

    let mut a = TestClient::connect(&td, "mock").await;
    let resp_a = a.initialize(json!(1), json!({})).await;

    let mut b = TestClient::connect(&td, "mock").await;
    let resp_b = b.initialize(json!(42), json!({})).await;

    assert_eq!(resp_a["result"], resp_b["result"]);

    let log = td.mock_log_lines();
    let inits: Vec<_> = log
        .iter()
        .filter(|m| m["method"] == "initialize")
        .collect();
    assert_eq!(inits.len(), 1, "server must see exactly one initialize");

    // The forwarded initialize advertises the maximal capability set.
    assert_eq!(inits[0]["params"]["capabilities"]["roots"]["listChanged"], true);
    assert!(inits[0]["params"]["capabilities"]["sampling"].is_object());
}

/// Once the init result is cached, `initialized` notifications are dropped
/// so the server is never re-initialized.
#[tokio::test(flavor = "multi_thread")]
async fn test_initialized_dropped_after_cache() {
    let td = TestDaemon::start_with_mock().await;

    let mut a = TestClient::connect(&td, "mock").await;
    a.initialize(json!(1), json!({})).await;
    // The response has been routed, so the cache is populated.
    a.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .await;

    let mut b = TestClient::connect(&td, "mock").await;
    b.initialize(json!(2), json!({})).await;
    b.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .await;

    // Force a full round trip so any forwarded notification would have
    // landed in the log by now.
    b.send(json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list"}))
        .await;
    assert_eq!(b.recv().await["id"], 3);

    let log = td.mock_log_lines();
    let inits = log
        .iter()
        .filter(|m| {
            m["method"] == "initialized" || m["method"] == "notifications/initialized"
        })
        .count();
    assert_eq!(inits, 0, "initialized must not reach an initialized server");
}

/// S3: two sessions using the same request ID each get their own response.
#[tokio::test(flavor = "multi_thread")]
async fn test_id_collision_between_sessions() {
    let td = TestDaemon::start_with_mock().await;
    let mut a = TestClient::connect(&td, "mock").await;
    let mut b = TestClient::connect(&td, "mock").await;

    a.send(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .await;
    b.send(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .await;

    let resp_a = a.recv().await;
    let resp_b = b.recv().await;
    assert_eq!(resp_a["id"], 2);
    assert_eq!(resp_b["id"], 2);
    assert!(resp_a["result"]["tools"].is_array());
    assert!(resp_b["result"]["tools"].is_array());

    // On the wire to the server, the two requests had distinct IDs.
    let log = td
        .wait_for_log(|log| log.iter().filter(|m| m["method"] == "tools/list").count() == 2)
        .await;
    let ids: Vec<_> = log
        .iter()
        .filter(|m| m["method"] == "tools/list")
        .map(|m| m["id"].clone())
        .collect();
    assert_ne!(ids[0], ids[1], "server saw colliding ids: {ids:?}");
}

/// S4: refcounted subscriptions: one subscribe on first subscriber, one
/// unsubscribe when the last leaves.
#[tokio::test(flavor = "multi_thread")]
async fn test_subscription_refcount() {
    let td = TestDaemon::start_with_mock().await;
    let mut a = TestClient::connect(&td, "mock").await;
    let mut b = TestClient::connect(&td, "mock").await;

    let subscribe = |id: i64| {
        json!({
            "jsonrpc": "2.0", "id": id, "method": "resources/subscribe",
            "params": {"uri": "file:///x"},
        })
    };
    let unsubscribe = |id: i64| {
        json!({
            "jsonrpc": "2.0", "id": id, "method": "resources/unsubscribe",
            "params": {"uri": "file:///x"},
        })
    };

    a.send(subscribe(10)).await;
    let resp = a.recv().await;
    assert_eq!(resp["id"], 10);

    b.send(subscribe(20)).await;
    let resp = b.recv().await;
    assert_eq!(resp["id"], 20);
    assert_eq!(resp["result"], json!({}));

    // A leaves: the server must hear nothing.
    a.send(unsubscribe(11)).await;
    let resp = a.recv().await;
    assert_eq!(resp["id"], 11);
    assert_eq!(resp["result"], json!({}));

    // B leaves last: exactly one unsubscribe reaches the server.
    b.send(unsubscribe(21)).await;
    let resp = b.recv().await;
    assert_eq!(resp["id"], 21);

    let log = td
        .wait_for_log(|log| log.iter().any(|m| m["method"] == "resources/unsubscribe"))
        .await;
    let subs = log
        .iter()
        .filter(|m| m["method"] == "resources/subscribe")
        .count();
    let unsubs = log
        .iter()
        .filter(|m| m["method"] == "resources/unsubscribe")
        .count();
    assert_eq!(subs, 1, "server must see exactly one subscribe");
    assert_eq!(unsubs, 1, "server must see exactly one unsubscribe");
}

/// S4 variant: disconnecting as the last subscriber fires the unsubscribe.
#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_unsubscribes_orphans() {
    let td = TestDaemon::start_with_mock().await;
    let mut a = TestClient::connect(&td, "mock").await;

    a.send(json!({
        "jsonrpc": "2.0", "id": 1, "method": "resources/subscribe",
        "params": {"uri": "file:///orphan"},
    }))
    .await;
    let _ = a.recv().await;

    drop(a);

    let log = td
        .wait_for_log(|log| log.iter().any(|m| m["method"] == "resources/unsubscribe"))
        .await;
    let unsub = log
        .iter()
        .find(|m| m["method"] == "resources/unsubscribe")
        .expect("unsubscribe in log");
    assert_eq!(unsub["params"]["uri"], "file:///orphan");
}

/// S5: roots/list fan-out with merge and dedup by uri.
#[tokio::test(flavor = "multi_thread")]
async fn test_roots_list_fanout() {
    let td = TestDaemon::start_with_mock().await;

    let mut a = TestClient::connect(&td, "mock").await;
    a.initialize(json!(1), json!({"roots": {"listChanged": true}}))
        .await;
    let mut b = TestClient::connect(&td, "mock").await;
    b.initialize(json!(2), json!({"roots": {"listChanged": true}}))
        .await;

    // Make the server originate a roots/list request with id 5.
    a.send(json!({
        "jsonrpc": "2.0", "id": 100, "method": "mock/emit",
        "params": {"line": {"jsonrpc": "2.0", "id": 5, "method": "roots/list"}},
    }))
    .await;

    let req_a = a
        .recv_matching(|m| m["method"] == "roots/list")
        .await;
    let req_b = b
        .recv_matching(|m| m["method"] == "roots/list")
        .await;
    assert_ne!(req_a["id"], req_b["id"], "fan-out ids must be distinct");

    a.send(json!({
        "jsonrpc": "2.0", "id": req_a["id"],
        "result": {"roots": [{"uri": "file:///a"}]},
    }))
    .await;
    b.send(json!({
        "jsonrpc": "2.0", "id": req_b["id"],
        "result": {"roots": [{"uri": "file:///a"}, {"uri": "file:///b"}]},
    }))
    .await;

    // The server receives one merged, deduplicated response under id 5.
    let log = td
        .wait_for_log(|log| log.iter().any(|m| m["id"] == 5 && m.get("result").is_some()))
        .await;
    let resp = log
        .iter()
        .find(|m| m["id"] == 5 && m.get("result").is_some())
        .expect("merged response");
    let roots = resp["result"]["roots"].as_array().expect("roots array");
    let mut uris: Vec<&str> = roots
        .iter()
        .filter_map(|r| r["uri"].as_str())
        .collect();
    uris.sort_unstable();
    assert_eq!(uris, vec!["file:///a", "file:///b"]);
}

/// Capability gating: a session without `roots` is never probed.
#[tokio::test(flavor = "multi_thread")]
async fn test_fanout_skips_incapable_sessions() {
    let td = TestDaemon::start_with_mock().await;

    let mut a = TestClient::connect(&td, "mock").await;
    a.initialize(json!(1), json!({"roots": {}})).await;
    let mut b = TestClient::connect(&td, "mock").await;
    b.initialize(json!(2), json!({})).await; // no roots capability

    a.send(json!({
        "jsonrpc": "2.0", "id": 100, "method": "mock/emit",
        "params": {"line": {"jsonrpc": "2.0", "id": 6, "method": "roots/list"}},
    }))
    .await;

    let req_a = a.recv_matching(|m| m["method"] == "roots/list").await;
    a.send(json!({
        "jsonrpc": "2.0", "id": req_a["id"],
        "result": {"roots": [{"uri": "file:///only-a"}]},
    }))
    .await;

    let log = td
        .wait_for_log(|log| log.iter().any(|m| m["id"] == 6 && m.get("result").is_some()))
        .await;
    let resp = log
        .iter()
        .find(|m| m["id"] == 6 && m.get("result").is_some())
        .expect("merged response");
    assert_eq!(resp["result"]["roots"], json!([{"uri": "file:///only-a"}]));

    // B saw the broadcastable traffic only, never a roots/list request.
    b.send(json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list"}))
        .await;
    let resp = b.recv().await;
    assert_eq!(resp["id"], 3, "unexpected message for b instead of response");
}

/// With no roots-capable session, the server gets an empty list at once.
#[tokio::test(flavor = "multi_thread")]
async fn test_fanout_without_capable_sessions() {
    let td = TestDaemon::start_with_mock().await;
    let mut a = TestClient::connect(&td, "mock").await;
    a.initialize(json!(1), json!({})).await;

    a.send(json!({
        "jsonrpc": "2.0", "id": 100, "method": "mock/emit",
        "params": {"line": {"jsonrpc": "2.0", "id": 7, "method": "roots/list"}},
    }))
    .await;

    let log = td
        .wait_for_log(|log| log.iter().any(|m| m["id"] == 7 && m.get("result").is_some()))
        .await;
    let resp = log
        .iter()
        .find(|m| m["id"] == 7 && m.get("result").is_some())
        .expect("empty roots response");
    assert_eq!(resp["result"]["roots"], json!([]));
}

/// Sampling requests go to one capable session, envelope untouched.
#[tokio::test(flavor = "multi_thread")]
async fn test_sampling_routed_to_capable_session() {
    let td = TestDaemon::start_with_mock().await;

    let mut a = TestClient::connect(&td, "mock").await;
    a.initialize(json!(1), json!({"sampling": {}})).await;

    a.send(json!({
        "jsonrpc": "2.0", "id": 100, "method": "mock/emit",
        "params": {"line": {
            "jsonrpc": "2.0", "id": 9, "method": "sampling/createMessage",
            "params": {"maxTokens": 8},
        }},
    }))
    .await;

    let req = a
        .recv_matching(|m| m["method"] == "sampling/createMessage")
        .await;
    // Server's own id preserved end-to-end.
    assert_eq!(req["id"], 9);
    assert_eq!(req["params"]["maxTokens"], 8);

    a.send(json!({
        "jsonrpc": "2.0", "id": 9, "result": {"role": "assistant"},
    }))
    .await;

    let log = td
        .wait_for_log(|log| log.iter().any(|m| m["id"] == 9 && m.get("result").is_some()))
        .await;
    let resp = log
        .iter()
        .find(|m| m["id"] == 9 && m.get("result").is_some())
        .expect("sampling response to server");
    assert_eq!(resp["result"]["role"], "assistant");
}

/// Without a sampling-capable session, the server gets a -32601 error.
#[tokio::test(flavor = "multi_thread")]
async fn test_sampling_without_capable_session() {
    let td = TestDaemon::start_with_mock().await;
    let mut a = TestClient::connect(&td, "mock").await;
    a.initialize(json!(1), json!({})).await;

    a.send(json!({
        "jsonrpc": "2.0", "id": 100, "method": "mock/emit",
        "params": {"line": {"jsonrpc": "2.0", "id": 11, "method": "sampling/createMessage"}},
    }))
    .await;

    let log = td
        .wait_for_log(|log| log.iter().any(|m| m["id"] == 11 && m.get("error").is_some()))
        .await;
    let resp = log
        .iter()
        .find(|m| m["id"] == 11 && m.get("error").is_some())
        .expect("error response to server");
    assert_eq!(resp["error"]["code"], -32601);
}

/// S6: handshake error taxonomy.
#[tokio::test(flavor = "multi_thread")]
async fn test_handshake_errors() {
    let td = TestDaemon::start_with_mock().await;

    // Version mismatch.
    let mut c = TestClient::connect_raw(&td).await;
    c.send_raw(r#"{"mcpl":99,"type":"connect","server":"x"}"#).await;
    let resp = c.recv().await;
    assert_eq!(resp["type"], "error");
    assert_eq!(resp["code"], "protocol_error");
    c.recv_eof().await;

    // Invalid JSON on the first line.
    let mut c = TestClient::connect_raw(&td).await;
    c.send_raw("this is not json").await;
    let resp = c.recv().await;
    assert_eq!(resp["code"], "invalid_request");
    c.recv_eof().await;

    // Wrong type field.
    let mut c = TestClient::connect_raw(&td).await;
    c.send_raw(r#"{"mcpl":1,"type":"hello","server":"x"}"#).await;
    let resp = c.recv().await;
    assert_eq!(resp["code"], "invalid_request");
    c.recv_eof().await;

    // Unknown server name.
    let mut c = TestClient::connect_raw(&td).await;
    c.send_raw(r#"{"mcpl":1,"type":"connect","server":"nope"}"#).await;
    let resp = c.recv().await;
    assert_eq!(resp["code"], "unknown_server");
    c.recv_eof().await;
}

/// An unmanaged config entry is invisible to the daemon.
#[tokio::test(flavor = "multi_thread")]
async fn test_unmanaged_server_rejected() {
    let td = TestDaemon::start(json!({
        "mock": { "command": mock_server_bin() },
        "external": { "command": mock_server_bin(), "managed": false },
    }))
    .await;

    let mut c = TestClient::connect_raw(&td).await;
    c.send_raw(r#"{"mcpl":1,"type":"connect","server":"external"}"#).await;
    let resp = c.recv().await;
    assert_eq!(resp["code"], "unknown_server");
}

/// Spawn failure surfaces as start_failed on the handshake.
#[tokio::test(flavor = "multi_thread")]
async fn test_start_failed() {
    let td = TestDaemon::start(json!({
        "broken": { "command": "/nonexistent/mcpl-no-such-binary" },
    }))
    .await;

    let mut c = TestClient::connect_raw(&td).await;
    c.send_raw(r#"{"mcpl":1,"type":"connect","server":"broken"}"#).await;
    let resp = c.recv().await;
    assert_eq!(resp["type"], "error");
    assert_eq!(resp["code"], "start_failed");
}

/// Crash budget: three quick exits fail the server until reset.
#[tokio::test(flavor = "multi_thread")]
async fn test_crash_budget_and_reset() {
    let td = TestDaemon::start(json!({
        "crashy": { "command": "/bin/false" },
    }))
    .await;
    let server = td.daemon.server("crashy").expect("server registered");

    for round in 1..=3u32 {
        // The spawn itself succeeds; the process exits immediately after.
        // Don't assert the handshake outcome, only that the crash lands.
        let mut c = TestClient::connect_raw(&td).await;
        c.send_raw(r#"{"mcpl":1,"type":"connect","server":"crashy"}"#).await;
        let _ = c.recv().await;

        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        while server.crash_count() < round as usize {
            assert!(
                tokio::time::Instant::now() < deadline,
                "crash {round} not recorded"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
    assert!(server.is_failed());

    // Budget exhausted: start attempts are refused outright.
    let mut c = TestClient::connect_raw(&td).await;
    c.send_raw(r#"{"mcpl":1,"type":"connect","server":"crashy"}"#).await;
    let resp = c.recv().await;
    assert_eq!(resp["code"], "start_failed");
    assert!(
        resp["message"]
            .as_str()
            .expect("message")
            .contains("has failed"),
        "refusal must come from the crash budget: {resp}"
    );

    // The admin reset re-arms it: the next connect spawns again.
    server.reset_crashes();
    assert!(!server.is_failed());
    let before = server.crash_count();
    let mut c = TestClient::connect_raw(&td).await;
    c.send_raw(r#"{"mcpl":1,"type":"connect","server":"crashy"}"#).await;
    let _ = c.recv().await;
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while server.crash_count() <= before {
        assert!(
            tokio::time::Instant::now() < deadline,
            "post-reset start did not spawn"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Broadcast notifications reach every session of the server.
#[tokio::test(flavor = "multi_thread")]
async fn test_broadcast_notifications() {
    let td = TestDaemon::start_with_mock().await;
    let mut a = TestClient::connect(&td, "mock").await;
    let mut b = TestClient::connect(&td, "mock").await;

    a.send(json!({
        "jsonrpc": "2.0", "id": 100, "method": "mock/emit",
        "params": {"line": {"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}},
    }))
    .await;

    let note_a = a
        .recv_matching(|m| m["method"] == "notifications/tools/list_changed")
        .await;
    let note_b = b
        .recv_matching(|m| m["method"] == "notifications/tools/list_changed")
        .await;
    assert!(note_a.get("id").is_none());
    assert!(note_b.get("id").is_none());
}

/// Progress notifications are routed by token to the requesting session.
#[tokio::test(flavor = "multi_thread")]
async fn test_progress_token_routing() {
    let td = TestDaemon::start_with_mock().await;
    let mut a = TestClient::connect(&td, "mock").await;
    let mut b = TestClient::connect(&td, "mock").await;

    // A's request carries the token; the response establishes it arrived.
    a.send(json!({
        "jsonrpc": "2.0", "id": 1, "method": "tools/call",
        "params": {"name": "t", "_meta": {"progressToken": "tok-a"}},
    }))
    .await;
    let resp = a.recv().await;
    assert_eq!(resp["id"], 1);

    // The server emits progress for that token (emitted via B to prove the
    // notification is routed by token, not by emitter).
    b.send(json!({
        "jsonrpc": "2.0", "id": 2, "method": "mock/emit",
        "params": {"line": {
            "jsonrpc": "2.0", "method": "notifications/progress",
            "params": {"progressToken": "tok-a", "progress": 50},
        }},
    }))
    .await;

    let progress = a
        .recv_matching(|m| m["method"] == "notifications/progress")
        .await;
    assert_eq!(progress["params"]["progressToken"], "tok-a");
    assert_eq!(progress["params"]["progress"], 50);
}

/// Integer progress tokens route the same as strings.
#[tokio::test(flavor = "multi_thread")]
async fn test_progress_token_integer() {
    let td = TestDaemon::start_with_mock().await;
    let mut a = TestClient::connect(&td, "mock").await;

    a.send(json!({
        "jsonrpc": "2.0", "id": 1, "method": "tools/call",
        "params": {"name": "t", "_meta": {"progressToken": 7}},
    }))
    .await;
    let _ = a.recv().await;

    a.send(json!({
        "jsonrpc": "2.0", "id": 2, "method": "mock/emit",
        "params": {"line": {
            "jsonrpc": "2.0", "method": "notifications/progress",
            "params": {"progressToken": 7, "progress": 1},
        }},
    }))
    .await;

    let progress = a
        .recv_matching(|m| m["method"] == "notifications/progress")
        .await;
    assert_eq!(progress["params"]["progressToken"], 7);
}

/// Server-originated ping is answered by the daemon; sessions never see it.
#[tokio::test(flavor = "multi_thread")]
async fn test_ping_answered_daemon_side() {
    let td = TestDaemon::start_with_mock().await;
    let mut a = TestClient::connect(&td, "mock").await;

    a.send(json!({
        "jsonrpc": "2.0", "id": 1, "method": "mock/emit",
        "params": {"line": {"jsonrpc": "2.0", "id": 777, "method": "ping"}},
    }))
    .await;
    // A sees only its own emit ack.
    let ack = a.recv().await;
    assert_eq!(ack["id"], 1);

    // The daemon's pong landed on the server's stdin (and thus in the log).
    let log = td
        .wait_for_log(|log| {
            log.iter()
                .any(|m| m["id"] == 777 && m["result"] == json!({}))
        })
        .await;
    assert!(log.iter().any(|m| m["id"] == 777));
}

/// Unknown server-originated requests get a method-not-found error.
#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_server_request() {
    let td = TestDaemon::start_with_mock().await;
    let mut a = TestClient::connect(&td, "mock").await;

    a.send(json!({
        "jsonrpc": "2.0", "id": 1, "method": "mock/emit",
        "params": {"line": {"jsonrpc": "2.0", "id": 13, "method": "elicitation/create"}},
    }))
    .await;

    let log = td
        .wait_for_log(|log| log.iter().any(|m| m["id"] == 13 && m.get("error").is_some()))
        .await;
    let resp = log
        .iter()
        .find(|m| m["id"] == 13 && m.get("error").is_some())
        .expect("error response");
    assert_eq!(resp["error"]["code"], -32601);
}

/// Cancellation is remapped to the ID the server actually saw.
#[tokio::test(flavor = "multi_thread")]
async fn test_cancellation_remap() {
    let td = TestDaemon::start_with_mock().await;
    let mut a = TestClient::connect(&td, "mock").await;

    // mock/ignore is never answered, so the mapping stays live.
    a.send(json!({"jsonrpc": "2.0", "id": 9, "method": "mock/ignore"}))
        .await;
    let log = td
        .wait_for_log(|log| log.iter().any(|m| m["method"] == "mock/ignore"))
        .await;
    let global_id = log
        .iter()
        .find(|m| m["method"] == "mock/ignore")
        .expect("ignored request")["id"]
        .clone();

    a.send(json!({
        "jsonrpc": "2.0", "method": "notifications/cancelled",
        "params": {"requestId": 9},
    }))
    .await;

    let log = td
        .wait_for_log(|log| log.iter().any(|m| m["method"] == "notifications/cancelled"))
        .await;
    let cancel = log
        .iter()
        .find(|m| m["method"] == "notifications/cancelled")
        .expect("cancellation");
    assert_eq!(
        cancel["params"]["requestId"], global_id,
        "requestId must be rewritten to the forwarded id"
    );
}

/// A serialized server still answers everything (queue drains in order).
#[tokio::test(flavor = "multi_thread")]
async fn test_serialized_server_end_to_end() {
    let td = TestDaemon::start(json!({
        "mock": { "command": mock_server_bin(), "serialize": true },
    }))
    .await;

    let mut a = TestClient::connect(&td, "mock").await;
    let mut b = TestClient::connect(&td, "mock").await;
    a.initialize(json!(1), json!({})).await;

    // Fire several requests without waiting for responses.
    a.send(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}))
        .await;
    a.send(json!({"jsonrpc": "2.0", "id": 4, "method": "tools/list"}))
        .await;
    b.send(json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list"}))
        .await;

    assert_eq!(a.recv().await["id"], 2);
    assert_eq!(a.recv().await["id"], 4);
    assert_eq!(b.recv().await["id"], 3);

    // All three drained through the queue; within one session the wire
    // order follows submission order (ids were assigned in that order,
    // and the queue admits one request at a time).
    let log = td
        .wait_for_log(|log| log.iter().filter(|m| m["method"] == "tools/list").count() == 3)
        .await;
    let ids: Vec<u64> = log
        .iter()
        .filter(|m| m["method"] == "tools/list")
        .filter_map(|m| m["id"].as_u64())
        .collect();
    let mut distinct = ids.clone();
    distinct.sort_unstable();
    distinct.dedup();
    assert_eq!(distinct.len(), 3, "global ids must be unique: {ids:?}");
}

/// Graceful shutdown: sessions closed, socket and PID files removed.
#[tokio::test(flavor = "multi_thread")]
async fn test_graceful_shutdown() {
    let td = TestDaemon::start_with_mock().await;
    let mut a = TestClient::connect(&td, "mock").await;
    a.initialize(json!(1), json!({})).await;

    assert!(td.pid_path.exists(), "pid file written on startup");
    let pid: u32 = std::fs::read_to_string(&td.pid_path)
        .expect("read pid file")
        .trim()
        .parse()
        .expect("pid file holds a decimal pid");
    assert_eq!(pid, std::process::id());

    td.daemon.trigger_shutdown();
    a.recv_eof().await;

    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while td.socket_path.exists() || td.pid_path.exists() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "socket/pid files not removed"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // New connections are refused.
    assert!(UnixStream::connect(&td.socket_path).await.is_err());
}

/// Config hot-reload: a server added after startup is reachable on the
/// next handshake without bouncing the daemon.
#[tokio::test(flavor = "multi_thread")]
async fn test_config_hot_reload_adds_server() {
    let td = TestDaemon::start_with_mock().await;

    // Unknown before the config edit.
    let mut c = TestClient::connect_raw(&td).await;
    c.send_raw(r#"{"mcpl":1,"type":"connect","server":"late"}"#).await;
    assert_eq!(c.recv().await["code"], "unknown_server");

    // Rewrite the config with a second server.
    let config_path = td.dir.path().join("config.json");
    let config = json!({
        "servers": {
            "mock": { "command": mock_server_bin() },
            "late": { "command": mock_server_bin() },
        }
    });
    atomic_write_file(
        &config_path,
        serde_json::to_string_pretty(&config).expect("encode").as_bytes(),
        0o600,
    )
    .expect("rewrite config");

    let mut c = TestClient::connect(&td, "late").await;
    let resp = c.initialize(json!(1), json!({})).await;
    assert_eq!(resp["result"]["serverInfo"]["name"], "mock");
}

/// A second daemon on the same socket refuses to start.
#[tokio::test(flavor = "multi_thread")]
async fn test_second_daemon_refuses_socket() {
    let td = TestDaemon::start_with_mock().await;

    let cfg = load(&td.dir.path().join("config.json")).expect("load config");
    let second = Daemon::new(
        &cfg,
        td.dir.path().join("config.json"),
        td.socket_path.clone(),
        None,
    );
    let err = second.run().await.expect_err("second daemon must refuse");
    assert!(matches!(err, mcpl::error::DaemonError::AlreadyRunning { .. }));
}
