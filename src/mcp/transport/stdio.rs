use super::{encode_message, McpTransport, TransportError};
use crate::core::config::{ConfigError, McpServerConfig};
use crate::mcp::protocol::server_messages_from_value;
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{ClientMessage, ServerMessage};
use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const STDIN_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const CHILD_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

struct StdoutState {
    lines: Lines<BufReader<ChildStdout>>,
    queued: VecDeque<ServerMessage>,
}

/// Newline-delimited JSON-RPC over a child process's standard streams.
///
/// The child is killed when the transport is closed or dropped.
pub struct StdioTransport {
    server_id: String,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<StdoutState>,
    child: Mutex<Child>,
    closed: CancellationToken,
}

impl StdioTransport {
    pub fn spawn(config: &McpServerConfig) -> Result<Self, TransportError> {
        let command = config
            .command
            .as_deref()
            .map(str::trim)
            .filter(|command| !command.is_empty())
            .ok_or_else(|| ConfigError::MissingCommand {
                server_id: config.id.clone(),
            })?;

        let mut cmd = Command::new(command);
        cmd.args(config.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = &config.env {
            cmd.envs(env);
        }

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            command: command.to_string(),
            source,
        })?;
        let stdin = child.stdin.take().ok_or(TransportError::Closed)?;
        let stdout = child.stdout.take().ok_or(TransportError::Closed)?;
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_drain(config.id.clone(), stderr);
        }

        debug!(server_id = %config.id, command, pid = ?child.id(), "Spawned MCP stdio server");

        Ok(Self {
            server_id: config.id.clone(),
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(StdoutState {
                lines: BufReader::new(stdout).lines(),
                queued: VecDeque::new(),
            }),
            child: Mutex::new(child),
            closed: CancellationToken::new(),
        })
    }
}

fn spawn_stderr_drain(server_id: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!(server_id = %server_id, "stderr: {line}");
        }
    });
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut payload = encode_message(&message)?;
        payload.push('\n');

        let mut stdin = tokio::time::timeout(STDIN_LOCK_TIMEOUT, self.stdin.lock())
            .await
            .map_err(|_| TransportError::Timeout("waiting for MCP stdio stdin lock"))?;
        let writer = stdin.as_mut().ok_or(TransportError::Closed)?;
        tokio::time::timeout(STDIN_WRITE_TIMEOUT, writer.write_all(payload.as_bytes()))
            .await
            .map_err(|_| TransportError::Timeout("writing MCP stdio message"))??;
        tokio::time::timeout(STDIN_WRITE_TIMEOUT, writer.flush())
            .await
            .map_err(|_| TransportError::Timeout("flushing MCP stdio message"))??;
        debug!(server_id = %self.server_id, bytes = payload.len(), "MCP stdio message sent");
        Ok(())
    }

    async fn receive(&self) -> Result<ServerMessage, TransportError> {
        let mut stdout = self.stdout.lock().await;
        loop {
            if let Some(message) = stdout.queued.pop_front() {
                return Ok(message);
            }

            let line = tokio::select! {
                line = stdout.lines.next_line() => line?,
                _ = self.closed.cancelled() => return Err(TransportError::Closed),
            };
            let Some(line) = line else {
                debug!(server_id = %self.server_id, "MCP stdio stdout reached EOF");
                return Err(TransportError::Closed);
            };

            match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(value) => stdout.queued.extend(server_messages_from_value(value)),
                Err(_) => {
                    debug!(server_id = %self.server_id, "Ignoring non-JSON stdout line");
                }
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        self.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }
        child.start_kill()?;
        match tokio::time::timeout(CHILD_EXIT_TIMEOUT, child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(server_id = %self.server_id, ?status, "MCP stdio server exited");
                Ok(())
            }
            Err(_) => Err(TransportError::Timeout("waiting for MCP stdio server to exit")),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::mcp::protocol::{initialized_notification, response_id};
    use rust_mcp_schema::RequestId;

    fn shell_server(script: &str) -> McpServerConfig {
        McpServerConfig::stdio(
            "shell",
            "Shell",
            "sh",
            vec!["-c".to_string(), script.to_string()],
        )
    }

    #[tokio::test]
    async fn reads_responses_and_unpacks_batches() {
        let config = shell_server(
            r#"read line; echo 'not json'; echo '[{"jsonrpc":"2.0","id":7,"result":{}},{"jsonrpc":"2.0","id":8,"result":{}}]'"#,
        );
        let transport = StdioTransport::spawn(&config).expect("spawn");
        transport
            .send(initialized_notification().expect("notification"))
            .await
            .expect("send");

        let first = transport.receive().await.expect("first");
        let second = transport.receive().await.expect("second");
        assert_eq!(response_id(&first), Some(&RequestId::Integer(7)));
        assert_eq!(response_id(&second), Some(&RequestId::Integer(8)));
        assert!(matches!(
            transport.receive().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_terminates_the_child() {
        let transport = StdioTransport::spawn(&shell_server("sleep 30")).expect("spawn");
        transport.close().await.expect("close");
        assert!(matches!(
            transport.receive().await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            transport
                .send(initialized_notification().expect("notification"))
                .await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let config = McpServerConfig::stdio(
            "ghost",
            "Ghost",
            "/definitely/not/a/real/mcp-server",
            Vec::new(),
        );
        assert!(matches!(
            StdioTransport::spawn(&config),
            Err(TransportError::Spawn { .. })
        ));
    }
}
