//! Transport adapters: HTTP JSON-RPC and line-delimited JSON-RPC over a
//! child process.
//!
//! A connection exposes one operation, `call`, which sends a JSON-RPC 2.0
//! envelope and resolves with the `result` member or a [`CallError`]. The
//! subprocess transport owns a framing reader: stdout is split on newlines,
//! each line parsed and dispatched to the pending waiter with the matching
//! request `id`. Process exit fails every pending waiter with
//! `ConnectionClosed`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::CallError;
use crate::registry::descriptor::{EndpointConfig, Transport};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
const CLIENT_NAME: &str = "meshflow";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Connection: Send + Sync {
    /// Sends one JSON-RPC request and awaits its reply.
    async fn call(&self, method: &str, params: Value, timeout: Duration)
        -> Result<Value, CallError>;

    async fn destroy(&self);

    fn is_alive(&self) -> bool;
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Connection>, CallError>;
}

/// Extracts `result` from a JSON-RPC reply, surfacing `error` members as
/// [`CallError::Remote`].
fn parse_jsonrpc_reply(reply: Value) -> Result<Value, CallError> {
    if let Some(error) = reply.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(CallError::Remote(message));
    }
    Ok(reply.get("result").cloned().unwrap_or(Value::Null))
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

pub struct HttpConnection {
    client: reqwest::Client,
    url: String,
    headers: reqwest::header::HeaderMap,
    next_id: AtomicU64,
}

impl HttpConnection {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self, CallError> {
        let mut header_map = reqwest::header::HeaderMap::new();
        for (key, value) in headers {
            let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| CallError::InvalidEndpoint(format!("header '{key}': {e}")))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| CallError::InvalidEndpoint(format!("header '{key}': {e}")))?;
            header_map.insert(name, value);
        }
        Ok(Self {
            client,
            url: format!("{}/mcp", base_url.trim_end_matches('/')),
            headers: header_map,
            next_id: AtomicU64::new(1),
        })
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let request = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .json(&envelope);

        // Dropping the in-flight future on expiry cancels the request.
        let response = tokio::time::timeout(timeout, async {
            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    CallError::Timeout(timeout.as_millis() as u64)
                } else {
                    CallError::NetworkUnavailable(e.to_string())
                }
            })?;
            let status = response.status();
            if status.is_server_error() {
                return Err(CallError::Http5xx {
                    status: status.as_u16(),
                });
            }
            if !status.is_success() {
                return Err(CallError::Remote(format!("HTTP {status}")));
            }
            response
                .json::<Value>()
                .await
                .map_err(|e| CallError::NetworkUnavailable(format!("bad response body: {e}")))
        })
        .await
        .map_err(|_| CallError::Timeout(timeout.as_millis() as u64))??;

        parse_jsonrpc_reply(response)
    }

    async fn destroy(&self) {}

    fn is_alive(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Subprocess (line-delimited JSON-RPC)
// ---------------------------------------------------------------------------

type PendingMap = Arc<DashMap<u64, oneshot::Sender<Result<Value, CallError>>>>;

pub struct SubprocessConnection {
    command: String,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    reader: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SubprocessConnection {
    /// Spawns the configured command and performs the one-time `initialize`
    /// handshake before the connection is handed out.
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, CallError> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CallError::NetworkUnavailable(format!("spawn {command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CallError::ConnectionClosed("stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CallError::ConnectionClosed("stdout unavailable".to_string()))?;

        let pending: PendingMap = Arc::new(DashMap::new());
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(Self::read_loop(
            command.to_string(),
            stdout,
            pending.clone(),
            alive.clone(),
        ));

        let conn = Self {
            command: command.to_string(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            reader: std::sync::Mutex::new(Some(reader)),
        };

        conn.call(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": CLIENT_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
            HANDSHAKE_TIMEOUT,
        )
        .await?;

        Ok(conn)
    }

    async fn read_loop(
        command: String,
        stdout: tokio::process::ChildStdout,
        pending: PendingMap,
        alive: Arc<AtomicBool>,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let reply: Value = match serde_json::from_str(line) {
                        Ok(value) => value,
                        Err(e) => {
                            warn!(command = %command, error = %e, "unparseable line from subprocess");
                            continue;
                        }
                    };
                    let Some(id) = reply.get("id").and_then(Value::as_u64) else {
                        debug!(command = %command, "subprocess message without id; ignoring");
                        continue;
                    };
                    match pending.remove(&id) {
                        Some((_, waiter)) => {
                            let _ = waiter.send(parse_jsonrpc_reply(reply));
                        }
                        // The caller timed out; its reply is discarded.
                        None => debug!(command = %command, id, "late reply discarded"),
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        alive.store(false, Ordering::SeqCst);
        let closed: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
        for id in closed {
            if let Some((_, waiter)) = pending.remove(&id) {
                let _ = waiter.send(Err(CallError::ConnectionClosed(format!(
                    "{command} exited"
                ))));
            }
        }
        debug!(command = %command, "subprocess stdout closed");
    }
}

#[async_trait]
impl Connection for SubprocessConnection {
    async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        if !self.is_alive() {
            return Err(CallError::ConnectionClosed(format!(
                "{} exited",
                self.command
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });
        let mut line = serde_json::to_vec(&envelope)
            .map_err(|e| CallError::Remote(format!("encode request: {e}")))?;
        line.push(b'\n');

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.write_all(&line).await {
                self.pending.remove(&id);
                self.alive.store(false, Ordering::SeqCst);
                return Err(CallError::ConnectionClosed(format!("write: {e}")));
            }
            if let Err(e) = stdin.flush().await {
                self.pending.remove(&id);
                self.alive.store(false, Ordering::SeqCst);
                return Err(CallError::ConnectionClosed(format!("flush: {e}")));
            }
        }
        // The reader may have observed EOF and drained `pending` before our
        // waiter was registered; re-checking here closes that window.
        if !self.is_alive() {
            self.pending.remove(&id);
            return Err(CallError::ConnectionClosed(format!(
                "{} exited",
                self.command
            )));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::ConnectionClosed(format!(
                "{} exited",
                self.command
            ))),
            Err(_) => {
                // Abandon the request; the read loop discards a late reply.
                self.pending.remove(&id);
                Err(CallError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    async fn destroy(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().expect("reader lock poisoned").take() {
            reader.abort();
        }
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
        let failed: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in failed {
            if let Some((_, waiter)) = self.pending.remove(&id) {
                let _ = waiter.send(Err(CallError::ConnectionClosed(format!(
                    "{} destroyed",
                    self.command
                ))));
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Builds connections for one endpoint; shared by the pool.
pub struct EndpointFactory {
    endpoint: EndpointConfig,
    http: reqwest::Client,
}

impl EndpointFactory {
    pub fn new(endpoint: EndpointConfig, http: reqwest::Client) -> Self {
        Self { endpoint, http }
    }
}

#[async_trait]
impl ConnectionFactory for EndpointFactory {
    async fn connect(&self) -> Result<Arc<dyn Connection>, CallError> {
        match &self.endpoint.transport {
            Transport::Http { url, headers } => Ok(Arc::new(HttpConnection::new(
                self.http.clone(),
                url,
                headers,
            )?)),
            Transport::Subprocess { command, args, env } => Ok(Arc::new(
                SubprocessConnection::spawn(command, args, env).await?,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonrpc_error_member_maps_to_remote() {
        let reply = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32000, "message": "boom"}});
        match parse_jsonrpc_reply(reply) {
            Err(CallError::Remote(message)) => assert_eq!(message, "boom"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn jsonrpc_result_member_is_extracted() {
        let reply = json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}});
        assert_eq!(parse_jsonrpc_reply(reply).unwrap(), json!({"ok": true}));
    }

    #[test]
    fn invalid_header_name_is_rejected() {
        let headers = HashMap::from([("bad header".to_string(), "x".to_string())]);
        let result = HttpConnection::new(reqwest::Client::new(), "http://svc:1", &headers);
        assert!(matches!(result, Err(CallError::InvalidEndpoint(_))));
    }

    // `cat` echoes each request line back; the echo carries the request's
    // own id and no `error` member, which is enough to satisfy the
    // handshake and exercise id matching.
    #[cfg(unix)]
    #[tokio::test]
    async fn subprocess_round_trip_via_cat() {
        let conn = SubprocessConnection::spawn("cat", &[], &HashMap::new())
            .await
            .unwrap();
        assert!(conn.is_alive());

        let result = conn
            .call("tools/call", json!({"name": "noop"}), Duration::from_secs(5))
            .await
            .unwrap();
        // The echoed request has no `result` member.
        assert_eq!(result, Value::Null);
        conn.destroy().await;
        assert!(!conn.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exiting_subprocess_fails_pending_calls() {
        // `true` exits immediately, so the handshake cannot complete.
        let result = SubprocessConnection::spawn("true", &[], &HashMap::new()).await;
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_command_is_network_unavailable() {
        let result =
            SubprocessConnection::spawn("definitely-not-a-command-xyz", &[], &HashMap::new())
                .await;
        assert!(matches!(result, Err(CallError::NetworkUnavailable(_))));
    }
}
