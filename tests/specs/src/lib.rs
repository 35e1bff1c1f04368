// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `agentbridge-server` binary as a subprocess and drives
//! it over its WebSocket wire protocol, exactly the way a remote client
//! would.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Resolve the path to the compiled `agentbridge-server` binary.
pub fn server_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("agentbridge-server")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// Writes an executable shell script standing in for the `claude` binary,
/// used to exercise `execute` end to end without a real agent installed.
pub fn write_fake_agent(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-claude.sh");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "#!/bin/sh").unwrap();
    file.write_all(body.as_bytes()).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

pub struct ServerProcess {
    child: Child,
    pub port: u16,
    pub data_dir: tempfile::TempDir,
}

impl ServerProcess {
    /// Spawns the server bound to a free loopback port with a fresh
    /// temporary data directory, optionally pointing `claude.binary` at a
    /// fake agent script.
    pub fn start(claude_binary: Option<&Path>) -> anyhow::Result<Self> {
        let port = free_port()?;
        let data_dir = tempfile::tempdir()?;

        let mut cmd = Command::new(server_binary());
        cmd.arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .arg("--data-dir")
            .arg(data_dir.path())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        if let Some(bin) = claude_binary {
            cmd.arg("--claude-binary").arg(bin);
        }

        let child = cmd.spawn()?;
        Ok(ServerProcess { child, port, data_dir })
    }

    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    /// Polls the TCP port until it accepts connections or `timeout` elapses.
    pub async fn wait_ready(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if TcpStream::connect(("127.0.0.1", self.port)).await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("server never opened its listening port");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn connect(&self) -> anyhow::Result<ApiClient> {
        let (ws, _) = tokio_tungstenite::connect_async(self.ws_url()).await?;
        Ok(ApiClient { ws })
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Thin request/response wrapper around the raw WebSocket connection.
pub struct ApiClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl ApiClient {
    pub async fn send(&mut self, frame: Value) -> anyhow::Result<()> {
        self.ws.send(Message::Text(frame.to_string().into())).await?;
        Ok(())
    }

    /// Waits for the next text frame and parses it as JSON. Skips
    /// `shutdown` keepalive pings are not exposed at this layer (the
    /// tungstenite client answers WS-protocol pings itself).
    pub async fn recv(&mut self, timeout: Duration) -> anyhow::Result<Value> {
        let msg = tokio::time::timeout(timeout, self.ws.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("websocket stream ended"))??;
        match msg {
            Message::Text(t) => Ok(serde_json::from_str(&t)?),
            other => anyhow::bail!("expected a text frame, got: {other:?}"),
        }
    }

    /// Convenience for request/response handlers: send one frame, wait for
    /// the first reply whose `type` is not a broadcast `message` envelope.
    pub async fn request(&mut self, frame: Value, timeout: Duration) -> anyhow::Result<Value> {
        self.send(frame).await?;
        loop {
            let reply = self.recv(timeout).await?;
            if reply["type"] != "message" {
                return Ok(reply);
            }
        }
    }
}

pub fn project_create(path: &Path) -> Value {
    json!({ "type": "project_create", "data": { "path": path } })
}
