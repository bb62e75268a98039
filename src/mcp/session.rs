//! One initialized MCP connection with correlated request/response traffic.

use crate::core::config::McpServerConfig;
use crate::mcp::protocol::{
    self, client_details_for, paginated_params, ResponseError, MCP_MAX_LIST_ITEMS,
};
use crate::mcp::transport::{McpTransport, TransportError};
use crate::mcp::types::{
    McpPrompt, McpResource, McpTool, PromptResult, PromptsPage, ReadResourceOutput,
    ResourcesPage, ToolCallOutput, ToolsPage,
};
use rust_mcp_schema::schema_utils::{RequestFromClient, ServerMessage};
use rust_mcp_schema::{
    CallToolRequestParams, GetPromptRequestParams, PaginatedRequestParams,
    ReadResourceRequestParams, RequestId,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<ServerMessage>>>>;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The channel to the server failed (spawn, network, closed, timeout).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server answered with something that is not a valid result.
    #[error("MCP protocol error: {0}")]
    Protocol(String),

    /// The server rejected a request with a JSON-RPC error.
    #[error("{message}")]
    Rpc { code: i64, message: String },

    /// The tool ran and reported failure, or refused the call.
    #[error("Tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    #[error("MCP session is not initialized.")]
    NotReady,

    #[error("MCP session is closed.")]
    Closed,
}

impl SessionError {
    /// True when the server is unreachable rather than merely unhappy.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, SessionError::Transport(_) | SessionError::Closed)
    }
}

impl From<ResponseError> for SessionError {
    fn from(err: ResponseError) -> Self {
        match err {
            ResponseError::Rpc { code, message } => SessionError::Rpc { code, message },
            ResponseError::Malformed(message) => SessionError::Protocol(message),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub request_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Name, version, and negotiated protocol reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub name: String,
    pub version: String,
    pub protocol_version: String,
}

pub struct McpSession {
    server_id: String,
    transport: Arc<dyn McpTransport>,
    pending: PendingMap,
    next_request_id: AtomicI64,
    ready: AtomicBool,
    shutdown: CancellationToken,
    channel_error: Arc<StdMutex<Option<String>>>,
    request_timeout: Duration,
    identity: Option<ServerIdentity>,
}

impl McpSession {
    /// Starts the reader and performs the initialize handshake. Dropping the
    /// session, or the future before it resolves, stops the reader.
    pub async fn establish(
        config: &McpServerConfig,
        transport: Arc<dyn McpTransport>,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let channel_error = Arc::new(StdMutex::new(None));

        spawn_reader(
            config.id.clone(),
            transport.clone(),
            pending.clone(),
            shutdown.clone(),
            channel_error.clone(),
        );

        let mut session = Self {
            server_id: config.id.clone(),
            transport,
            pending,
            next_request_id: AtomicI64::new(0),
            ready: AtomicBool::new(false),
            shutdown,
            channel_error,
            request_timeout: options.request_timeout,
            identity: None,
        };

        let response = session
            .exchange(RequestFromClient::InitializeRequest(client_details_for(
                config,
            )))
            .await?;
        let initialized = protocol::parse_initialize_result(response)?;
        session
            .transport
            .set_protocol_version(&initialized.protocol_version);
        session
            .transport
            .send(protocol::initialized_notification().map_err(SessionError::Protocol)?)
            .await?;

        debug!(
            server_id = %session.server_id,
            server = %initialized.server_info.name,
            protocol_version = %initialized.protocol_version,
            "MCP session ready"
        );
        session.identity = Some(ServerIdentity {
            name: initialized.server_info.name,
            version: initialized.server_info.version,
            protocol_version: initialized.protocol_version,
        });
        session.ready.store(true, Ordering::SeqCst);
        Ok(session)
    }

    pub fn identity(&self) -> Option<&ServerIdentity> {
        self.identity.as_ref()
    }

    /// False once closed or once the reader lost the channel.
    pub fn is_alive(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Why the channel died, when it died on its own.
    pub fn channel_error(&self) -> Option<String> {
        self.channel_error.lock().ok().and_then(|guard| guard.clone())
    }

    pub async fn close(&self) -> Result<(), SessionError> {
        self.ready.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.pending.lock().await.clear();
        self.transport.close().await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), SessionError> {
        let response = self.request(RequestFromClient::PingRequest(None)).await?;
        protocol::parse_response_value(response)?;
        Ok(())
    }

    pub async fn list_tools(&self) -> Result<Vec<McpTool>, SessionError> {
        self.collect_pages("tools/list", RequestFromClient::ListToolsRequest, |page: ToolsPage| {
            (page.tools, page.next_cursor)
        })
        .await
    }

    pub async fn list_prompts(&self) -> Result<Vec<McpPrompt>, SessionError> {
        self.collect_pages(
            "prompts/list",
            RequestFromClient::ListPromptsRequest,
            |page: PromptsPage| (page.prompts, page.next_cursor),
        )
        .await
    }

    pub async fn list_resources(&self) -> Result<Vec<McpResource>, SessionError> {
        self.collect_pages(
            "resources/list",
            RequestFromClient::ListResourcesRequest,
            |page: ResourcesPage| (page.resources, page.next_cursor),
        )
        .await
    }

    /// Calls a tool. JSON-RPC errors and `isError` results come back as
    /// [`SessionError::Tool`]; channel failures stay [`SessionError::Transport`].
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<ToolCallOutput, SessionError> {
        let mut params = CallToolRequestParams::new(name);
        if !arguments.is_empty() {
            params = params.with_arguments(arguments);
        }
        let response = self
            .request(RequestFromClient::CallToolRequest(params))
            .await?;

        let output: ToolCallOutput = match protocol::parse_response(response) {
            Ok(output) => output,
            Err(ResponseError::Rpc { message, .. }) => {
                return Err(SessionError::Tool {
                    tool: name.to_string(),
                    message,
                })
            }
            Err(ResponseError::Malformed(message)) => return Err(SessionError::Protocol(message)),
        };

        if output.is_error {
            let message = output.joined_text();
            return Err(SessionError::Tool {
                tool: name.to_string(),
                message: if message.is_empty() {
                    "tool reported an error".to_string()
                } else {
                    message
                },
            });
        }
        Ok(output)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<PromptResult, SessionError> {
        let params = GetPromptRequestParams {
            name: name.to_string(),
            arguments: (!arguments.is_empty()).then_some(arguments),
            meta: None,
        };
        self.request_parsed(RequestFromClient::GetPromptRequest(params))
            .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceOutput, SessionError> {
        let params = ReadResourceRequestParams {
            meta: None,
            uri: uri.to_string(),
        };
        self.request_parsed(RequestFromClient::ReadResourceRequest(params))
            .await
    }

    async fn request_parsed<T: DeserializeOwned>(
        &self,
        request: RequestFromClient,
    ) -> Result<T, SessionError> {
        let response = self.request(request).await?;
        Ok(protocol::parse_response(response)?)
    }

    async fn collect_pages<P, T>(
        &self,
        method: &'static str,
        request: fn(Option<PaginatedRequestParams>) -> RequestFromClient,
        split: fn(P) -> (Vec<T>, Option<String>),
    ) -> Result<Vec<T>, SessionError>
    where
        P: DeserializeOwned,
    {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let response = self.request(request(paginated_params(cursor.take()))).await?;
            if protocol::is_method_not_found(&response) {
                debug!(server_id = %self.server_id, method, "MCP server does not support method");
                break;
            }
            let (batch, next_cursor) = split(protocol::parse_response::<P>(response)?);
            items.extend(batch);
            if items.len() >= MCP_MAX_LIST_ITEMS {
                items.truncate(MCP_MAX_LIST_ITEMS);
                break;
            }
            match next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(items)
    }

    async fn request(&self, request: RequestFromClient) -> Result<ServerMessage, SessionError> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(if self.shutdown.is_cancelled() {
                SessionError::Closed
            } else {
                SessionError::NotReady
            });
        }
        self.exchange(request).await
    }

    /// Sends one request and waits for the response carrying its id.
    async fn exchange(&self, request: RequestFromClient) -> Result<ServerMessage, SessionError> {
        if self.shutdown.is_cancelled() {
            return Err(SessionError::Closed);
        }

        let request_id = RequestId::Integer(self.next_request_id.fetch_add(1, Ordering::SeqCst));
        let message = protocol::request_message(request, request_id.clone())
            .map_err(SessionError::Protocol)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);
        debug!(server_id = %self.server_id, request_id = ?request_id, "Sending MCP request");

        let outcome = tokio::time::timeout(self.request_timeout, async {
            self.transport.send(message).await?;
            tokio::select! {
                reply = rx => reply.map_err(|_| SessionError::Closed),
                _ = self.shutdown.cancelled() => Err(SessionError::Closed),
            }
        })
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(server_id = %self.server_id, request_id = ?request_id, "MCP request timed out");
                Err(SessionError::Transport(TransportError::Timeout(
                    "waiting for MCP response",
                )))
            }
        };
        if result.is_err() {
            self.pending.lock().await.remove(&request_id);
        }
        result
    }
}

impl Drop for McpSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_reader(
    server_id: String,
    transport: Arc<dyn McpTransport>,
    pending: PendingMap,
    shutdown: CancellationToken,
    channel_error: Arc<StdMutex<Option<String>>>,
) {
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                received = transport.receive() => received,
                _ = shutdown.cancelled() => break,
            };
            match received {
                Ok(message) => dispatch(&server_id, &pending, message).await,
                Err(err) => {
                    if !shutdown.is_cancelled() {
                        warn!(server_id = %server_id, error = %err, "MCP channel lost");
                        if let Ok(mut slot) = channel_error.lock() {
                            *slot = Some(err.to_string());
                        }
                    }
                    break;
                }
            }
        }
        shutdown.cancel();
        pending.lock().await.clear();
        debug!(server_id = %server_id, "MCP reader stopped");
    });
}

async fn dispatch(server_id: &str, pending: &PendingMap, message: ServerMessage) {
    match protocol::response_id(&message).cloned() {
        Some(id) => {
            if let Some(tx) = pending.lock().await.remove(&id) {
                let _ = tx.send(message);
            } else {
                debug!(server_id = %server_id, response_id = ?id, "Dropping uncorrelated MCP response");
            }
        }
        None => match &message {
            ServerMessage::Request(request) => {
                debug!(server_id = %server_id, method = %request.method(), "Ignoring MCP server request");
            }
            _ => {
                debug!(server_id = %server_id, "Received MCP message without id");
            }
        },
    }
}

#[cfg(test)]
mod tests;
