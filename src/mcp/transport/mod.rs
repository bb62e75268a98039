//! Duplex message channels to MCP servers.
//!
//! Every backend exposes the same [`McpTransport`] contract so sessions never
//! inspect the transport kind after [`TransportConnector::open`] picks one.

use crate::core::config::{ConfigError, McpServerConfig, McpTransportKind};
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{ClientMessage, ServerMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod sse;
pub mod stdio;
pub mod streamable_http;

pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpTransport;

const MCP_JSON_CONTENT_TYPE: &str = "application/json";
const MCP_JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
const MCP_EVENT_STREAM_ACCEPT: &str = "text/event-stream";
const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";
const MCP_HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS: u64 = 90;
const MCP_HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to spawn MCP server '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("MCP HTTP request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("MCP HTTP error {status}: {body}")]
    Http {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("MCP channel closed.")]
    Closed,

    #[error("Timed out {0}.")]
    Timeout(&'static str),

    #[error("MCP I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode MCP message: {0}")]
    Encode(String),

    #[error("Invalid MCP endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("MCP event stream ended before announcing a message endpoint.")]
    MissingEndpoint,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Transport contract shared by stdio, streamable HTTP, and legacy SSE.
///
/// `receive` is driven by a single reader; `send` may be called concurrently.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn send(&self, message: ClientMessage) -> Result<(), TransportError>;

    async fn receive(&self) -> Result<ServerMessage, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    /// Records the protocol version negotiated during the handshake.
    fn set_protocol_version(&self, _protocol_version: &str) {}
}

/// Opens a transport for a server configuration.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(&self, config: &McpServerConfig)
        -> Result<Arc<dyn McpTransport>, TransportError>;
}

/// Picks the concrete transport from the configured kind.
#[derive(Debug, Clone)]
pub struct DefaultConnector {
    request_timeout: Duration,
}

impl DefaultConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl TransportConnector for DefaultConnector {
    async fn open(
        &self,
        config: &McpServerConfig,
    ) -> Result<Arc<dyn McpTransport>, TransportError> {
        config.validate()?;
        let transport: Arc<dyn McpTransport> = match config.transport {
            McpTransportKind::Stdio => Arc::new(StdioTransport::spawn(config)?),
            McpTransportKind::StreamableHttp => Arc::new(StreamableHttpTransport::new(
                config,
                build_mcp_http_client(Some(self.request_timeout))?,
            )?),
            McpTransportKind::Sse => {
                Arc::new(SseTransport::connect(config, build_mcp_http_client(None)?).await?)
            }
        };
        Ok(transport)
    }
}

/// Builds the shared HTTP client. Long-lived event streams pass `None` so the
/// stream is not cut off by a whole-request timeout.
pub(crate) fn build_mcp_http_client(
    request_timeout: Option<Duration>,
) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(MCP_HTTP_CONNECT_TIMEOUT_SECONDS))
        .pool_idle_timeout(Duration::from_secs(MCP_HTTP_POOL_IDLE_TIMEOUT_SECONDS))
        .pool_max_idle_per_host(MCP_HTTP_POOL_MAX_IDLE_PER_HOST);
    if let Some(timeout) = request_timeout {
        builder = builder.timeout(timeout);
    }
    Ok(builder.build()?)
}

pub(crate) fn require_url(config: &McpServerConfig) -> Result<String, TransportError> {
    config
        .url
        .as_deref()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            TransportError::Config(ConfigError::MissingUrl {
                server_id: config.id.clone(),
                transport: config.transport,
            })
        })
}

fn apply_json_post_headers(request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    request
        .header("Content-Type", MCP_JSON_CONTENT_TYPE)
        .header("Accept", MCP_JSON_AND_SSE_ACCEPT)
}

fn apply_protocol_version_header(
    request: reqwest::RequestBuilder,
    protocol_version: Option<&str>,
) -> reqwest::RequestBuilder {
    match protocol_version {
        Some(protocol_version) if !protocol_version.trim().is_empty() => {
            request.header(MCP_PROTOCOL_VERSION_HEADER, protocol_version)
        }
        _ => request,
    }
}

fn apply_custom_headers(
    mut request: reqwest::RequestBuilder,
    headers: &HashMap<String, String>,
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}

fn encode_message(message: &ClientMessage) -> Result<String, TransportError> {
    serde_json::to_string(message).map_err(|err| TransportError::Encode(err.to_string()))
}

/// Turns a non-2xx response into a [`TransportError::Http`] carrying the body.
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Http {
        status,
        body: body.trim().to_string(),
    })
}

#[cfg(test)]
pub(crate) mod test_server {
    //! Minimal HTTP/1.1 responder for transport tests.

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    pub struct CapturedRequest {
        pub request_line: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl CapturedRequest {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str())
        }

        pub fn json(&self) -> serde_json::Value {
            serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
        }
    }

    pub async fn bind() -> (TcpListener, String) {
        std::env::set_var("NO_PROXY", "*");
        std::env::set_var("no_proxy", "*");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        (listener, format!("http://{addr}"))
    }

    pub async fn read_request(stream: &mut TcpStream) -> Option<CapturedRequest> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                return None;
            }
            buffer.extend_from_slice(&chunk[..read]);
            if let Some(pos) = buffer.windows(4).position(|window| window == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default().to_string();
        let headers: Vec<(String, String)> = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
            .collect();
        let content_length = headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.parse::<usize>().ok())
            .unwrap_or(0);

        let mut body = buffer[header_end..].to_vec();
        while body.len() < content_length {
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
        }

        Some(CapturedRequest {
            request_line,
            headers,
            body,
        })
    }

    pub async fn respond(
        stream: &mut TcpStream,
        status: &str,
        content_type: &str,
        extra_headers: &str,
        body: &str,
    ) {
        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\n{extra_headers}content-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.flush().await;
    }
}
