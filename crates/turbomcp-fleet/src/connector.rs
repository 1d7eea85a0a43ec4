//! Default handle factory for stdio subprocesses and HTTP/SSE endpoints
//!
//! Stdio servers are spawned with `tokio::process` and probed with a single
//! JSON-RPC `tools/list` request line. HTTP and SSE servers are probed with a
//! plain GET; any answer short of an error status counts as alive.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::config::{Connection, ServerConfig, ServerKind};
use crate::error::{FleetError, FleetResult};
use crate::handle::{HandleFactory, ProbeKind, ServerHandle};

/// Time a stdio server gets to exit after its stdin is closed
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Factory for the built-in transports
#[derive(Debug, Clone)]
pub struct DefaultConnector {
    client: reqwest::Client,
}

impl DefaultConnector {
    /// Create a connector with a shared HTTP connection pool
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new() -> FleetResult<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .build()
            .map_err(|e| FleetError::Other(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HandleFactory for DefaultConnector {
    async fn connect(&self, config: &ServerConfig) -> FleetResult<Arc<dyn ServerHandle>> {
        match &config.connection {
            Connection::Stdio {
                command,
                args,
                env,
                working_dir,
            } => {
                let handle = StdioHandle::spawn(
                    &config.id,
                    command,
                    args,
                    env,
                    working_dir.as_deref(),
                )?;
                Ok(Arc::new(handle))
            }
            Connection::Sse { url, headers } | Connection::Http { url, headers } => {
                let handle = HttpHandle::new(
                    &config.id,
                    config.kind(),
                    self.client.clone(),
                    url,
                    headers,
                    config.timeout,
                )?;
                Ok(Arc::new(handle))
            }
        }
    }
}

#[derive(Debug)]
struct StdioPipes {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// Handle to a spawned subprocess server
#[derive(Debug)]
pub struct StdioHandle {
    id: String,
    child: Mutex<Option<Child>>,
    pipes: Mutex<Option<StdioPipes>>,
    next_id: AtomicU64,
}

impl StdioHandle {
    fn spawn(
        id: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        working_dir: Option<&std::path::Path>,
    ) -> FleetResult<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| FleetError::network(format!("Failed to spawn '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FleetError::network("Failed to get stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FleetError::network("Failed to get stdout handle"))?;

        if let Some(stderr) = child.stderr.take() {
            let server_id = id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server_id = %server_id, "stderr: {}", line);
                }
            });
        }

        tracing::info!(server_id = %id, command = %command, pid = ?child.id(), "Spawned stdio server");

        Ok(Self {
            id: id.to_string(),
            child: Mutex::new(Some(child)),
            pipes: Mutex::new(Some(StdioPipes {
                stdin,
                stdout: BufReader::new(stdout).lines(),
            })),
            next_id: AtomicU64::new(1),
        })
    }

    async fn ensure_running(&self) -> FleetResult<()> {
        let mut child = self.child.lock().await;
        let Some(child) = child.as_mut() else {
            return Err(FleetError::network("process already shut down"));
        };
        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => Err(FleetError::network(format!("process exited: {status}"))),
            Err(e) => Err(FleetError::network(format!(
                "failed to check process status: {e}"
            ))),
        }
    }

    /// Send `tools/list` and wait for the matching response line
    async fn list_capabilities(&self) -> FleetResult<()> {
        self.ensure_running().await?;

        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": "tools/list",
            "params": {},
        });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let mut pipes = self.pipes.lock().await;
        let pipes = pipes
            .as_mut()
            .ok_or_else(|| FleetError::network("process already shut down"))?;

        pipes
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| FleetError::network(format!("write to stdin failed: {e}")))?;
        pipes
            .stdin
            .flush()
            .await
            .map_err(|e| FleetError::network(format!("flush stdin failed: {e}")))?;

        loop {
            let Some(raw) = pipes
                .stdout
                .next_line()
                .await
                .map_err(|e| FleetError::network(format!("read from stdout failed: {e}")))?
            else {
                return Err(FleetError::network("server closed stdout"));
            };

            if raw.trim().is_empty() {
                continue;
            }
            let message: Value = serde_json::from_str(&raw)
                .map_err(|e| FleetError::protocol(format!("malformed response line: {e}")))?;
            if check_response(&message, request_id)? {
                return Ok(());
            }
        }
    }
}

/// Whether `message` answers `request_id`
///
/// Notifications and responses to other requests are skipped. A JSON-RPC
/// error response still proves the server is alive and speaking the
/// protocol, so it counts as an answer.
fn check_response(message: &Value, request_id: u64) -> FleetResult<bool> {
    let Some(object) = message.as_object() else {
        return Err(FleetError::protocol("response is not a JSON object"));
    };
    if object.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(FleetError::protocol("response is missing jsonrpc 2.0 marker"));
    }
    if object.get("id").and_then(Value::as_u64) != Some(request_id) {
        return Ok(false);
    }
    if object.contains_key("result") || object.contains_key("error") {
        Ok(true)
    } else {
        Err(FleetError::protocol("response has neither result nor error"))
    }
}

#[async_trait]
impl ServerHandle for StdioHandle {
    fn server_id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ServerKind {
        ServerKind::Stdio
    }

    async fn probe(&self, probe: ProbeKind) -> FleetResult<()> {
        match probe {
            ProbeKind::ListCapabilities => self.list_capabilities().await,
            ProbeKind::Handshake => self.ensure_running().await,
        }
    }

    async fn shutdown(&self) -> FleetResult<()> {
        // Closing stdin asks a well-behaved server to exit
        drop(self.pipes.lock().await.take());

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server_id = %self.id, %status, "Stdio server exited");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                tracing::warn!(server_id = %self.id, "Stdio server did not exit, killing it");
                child.kill().await?;
                Ok(())
            }
        }
    }
}

/// Handle to a remote HTTP or SSE server
#[derive(Debug)]
pub struct HttpHandle {
    id: String,
    kind: ServerKind,
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl HttpHandle {
    fn new(
        id: &str,
        kind: ServerKind,
        client: reqwest::Client,
        url: &str,
        headers: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> FleetResult<Self> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| FleetError::validation(vec![format!("header '{name}': {e}")]))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| FleetError::validation(vec![format!("header '{name}': {e}")]))?;
            header_map.insert(name, value);
        }
        if kind == ServerKind::Sse {
            header_map.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }

        Ok(Self {
            id: id.to_string(),
            kind,
            client,
            url: url.to_string(),
            headers: header_map,
            timeout,
        })
    }

    async fn handshake(&self) -> FleetResult<()> {
        let response = self
            .client
            .get(&self.url)
            .headers(self.headers.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.request_error(&e))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        // The body is never read: an SSE stream would not end
        drop(response);
        classify_status(status.as_u16(), retry_after)
    }

    fn request_error(&self, error: &reqwest::Error) -> FleetError {
        if error.is_timeout() {
            FleetError::timeout(format!("handshake with {}", self.url), self.timeout)
        } else {
            FleetError::network(format!("{}: {error}", self.url))
        }
    }
}

/// Map a handshake status code to a probe outcome
///
/// 405 means the endpoint exists but wants another method, which is
/// normal for streamable HTTP servers, so it counts as alive.
fn classify_status(status: u16, retry_after: Option<Duration>) -> FleetResult<()> {
    match status {
        200..=399 | 405 => Ok(()),
        429 => Err(FleetError::rate_limited(
            format!("handshake returned {status}"),
            retry_after,
        )),
        _ => Err(FleetError::from_status(
            status,
            format!("handshake returned {status}"),
        )),
    }
}

#[async_trait]
impl ServerHandle for HttpHandle {
    fn server_id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ServerKind {
        self.kind
    }

    async fn probe(&self, _probe: ProbeKind) -> FleetResult<()> {
        self.handshake().await
    }

    async fn shutdown(&self) -> FleetResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use serde_json::json;

    #[test]
    fn test_check_response() {
        let ok = json!({"jsonrpc": "2.0", "id": 1, "result": {"tools": []}});
        assert!(check_response(&ok, 1).unwrap());

        let rpc_error = json!({"jsonrpc": "2.0", "id": 1, "error": {"code": -32601}});
        assert!(check_response(&rpc_error, 1).unwrap());

        let notification = json!({"jsonrpc": "2.0", "method": "notifications/message"});
        assert!(!check_response(&notification, 1).unwrap());

        let echoed = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
        assert!(check_response(&echoed, 1).is_err());

        assert!(check_response(&json!([1, 2]), 1).is_err());
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(200, None).is_ok());
        assert!(classify_status(405, None).is_ok());

        let err = classify_status(401, None).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Auth);

        let err = classify_status(429, Some(Duration::from_secs(7))).unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));

        let err = classify_status(502, None).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Server);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_spawn_missing_command_is_network_error() {
        let connector = DefaultConnector::new().unwrap();
        let config = ServerConfig::stdio("ghost", "definitely-not-a-real-binary-4f2a", vec![])
            .with_id("ghost");
        let err = connector.connect(&config).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Network);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_probe_round_trip() {
        let script = r#"read line; echo '{"jsonrpc":"2.0","method":"notifications/ready"}'; echo '{"jsonrpc":"2.0","id":1,"result":{"tools":[]}}'; read rest"#;
        let config = ServerConfig::stdio("sh", "sh", vec!["-c".into(), script.into()])
            .with_id("sh");
        let connector = DefaultConnector::new().unwrap();
        let handle = connector.connect(&config).await.unwrap();

        handle.probe(ProbeKind::ListCapabilities).await.unwrap();
        handle.shutdown().await.unwrap();
        assert!(handle.probe(ProbeKind::ListCapabilities).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdio_probe_detects_exit() {
        let config = ServerConfig::stdio("quit", "true", vec![]).with_id("quit");
        let connector = DefaultConnector::new().unwrap();
        let handle = connector.connect(&config).await.unwrap();

        let err = handle.probe(ProbeKind::ListCapabilities).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Network);
    }

    #[tokio::test]
    async fn test_http_probe_connection_refused() {
        let config = ServerConfig::http("down", "http://127.0.0.1:9/mcp")
            .with_id("down")
            .with_timeout(Duration::from_secs(2));
        let connector = DefaultConnector::new().unwrap();
        let handle = connector.connect(&config).await.unwrap();

        let err = handle.probe(ProbeKind::Handshake).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
