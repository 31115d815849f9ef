//! One shim connection.

use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;

use mcpl_core::mcp::ClientCapabilities;

/// The daemon-side half of a shim connection.
///
/// The read half lives in the session's read loop; this holds the write half
/// behind a lock because two tasks write concurrently (the session loop's
/// direct replies and the server dispatcher's forwarded messages).
pub struct Session {
    id: String,
    server_name: String,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    capabilities: std::sync::Mutex<ClientCapabilities>,
}

impl Session {
    pub fn new(writer: OwnedWriteHalf, server_name: &str) -> Self {
        Session {
            id: uuid::Uuid::new_v4().to_string(),
            server_name: server_name.to_string(),
            writer: tokio::sync::Mutex::new(writer),
            capabilities: std::sync::Mutex::new(ClientCapabilities::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Capabilities negotiated by this session's `initialize`.
    pub fn capabilities(&self) -> ClientCapabilities {
        *self
            .capabilities
            .lock()
            .expect("capabilities lock poisoned")
    }

    pub fn set_capabilities(&self, caps: ClientCapabilities) {
        *self
            .capabilities
            .lock()
            .expect("capabilities lock poisoned") = caps;
    }

    /// Write one NDJSON line (newline appended) to the shim.
    pub async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await
    }
}
