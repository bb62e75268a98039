//! Registry of live MCP sessions keyed by server id.
//!
//! Connect and disconnect for one id are serialized through a per-id slot
//! lock; status reads only take the shared state lock and never wait on a
//! slow server.

use crate::core::config::{McpServerConfig, TimeoutSettings};
use crate::mcp::session::{McpSession, ServerIdentity, SessionError, SessionOptions};
use crate::mcp::transport::{DefaultConnector, TransportConnector};
use crate::mcp::types::{
    ConnectionStatus, McpPrompt, McpResource, McpTool, PromptResult, ReadResourceOutput,
    ToolCallOutput,
};
use futures_util::future::join_all;
use futures_util::{stream, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

const MCP_STARTUP_CONCURRENCY_LIMIT: usize = 3;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("MCP server '{0}' is not connected.")]
    NotConnected(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ManagerError {
    /// True when the server is missing or its channel failed.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            ManagerError::NotConnected(_) => true,
            ManagerError::Session(err) => err.is_connection_failure(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl ManagerOptions {
    pub fn from_settings(settings: &TimeoutSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            request_timeout: settings.request_timeout(),
        }
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from_settings(&TimeoutSettings::default())
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, Arc<McpSession>>,
    statuses: HashMap<String, ConnectionStatus>,
}

pub struct ConnectionManager {
    connector: Arc<dyn TransportConnector>,
    options: ManagerOptions,
    state: RwLock<RegistryState>,
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn TransportConnector>, options: ManagerOptions) -> Self {
        Self {
            connector,
            options,
            state: RwLock::new(RegistryState::default()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Manager backed by real stdio/HTTP/SSE transports.
    pub fn with_default_connector(options: ManagerOptions) -> Self {
        Self::new(
            Arc::new(DefaultConnector::new(options.request_timeout)),
            options,
        )
    }

    async fn slot(&self, server_id: &str) -> Arc<Mutex<()>> {
        self.slots
            .lock()
            .await
            .entry(server_id.to_string())
            .or_default()
            .clone()
    }

    /// Connects (or reconnects) one server. Failures are reported through the
    /// returned status rather than as an error.
    pub async fn connect(&self, config: &McpServerConfig) -> ConnectionStatus {
        let slot = self.slot(&config.id).await;
        let _guard = slot.lock().await;

        self.disconnect_locked(&config.id).await;

        let outcome = self.open_session(config).await;
        let mut state = self.state.write().await;
        let status = match outcome {
            Ok(session) => {
                info!(server_id = %config.id, transport = %config.transport, "MCP server connected");
                state.sessions.insert(config.id.clone(), Arc::new(session));
                ConnectionStatus::connected(&config.id)
            }
            Err(message) => {
                warn!(server_id = %config.id, error = %message, "MCP server connection failed");
                ConnectionStatus::disconnected(&config.id, Some(message))
            }
        };
        state.statuses.insert(config.id.clone(), status.clone());
        status
    }

    async fn open_session(&self, config: &McpServerConfig) -> Result<McpSession, String> {
        config.validate().map_err(|err| err.to_string())?;
        let options = SessionOptions {
            request_timeout: self.options.request_timeout,
        };
        let attempt = async {
            let transport = self.connector.open(config).await?;
            McpSession::establish(config, transport, options).await
        };
        match tokio::time::timeout(self.options.connect_timeout, attempt).await {
            Ok(result) => result.map_err(|err: SessionError| err.to_string()),
            Err(_) => Err(format!(
                "Timed out connecting to MCP server after {}s.",
                self.options.connect_timeout.as_secs()
            )),
        }
    }

    /// Closes the live session, if any. Unknown ids are a no-op.
    pub async fn disconnect(&self, server_id: &str) -> ConnectionStatus {
        let slot = self.slot(server_id).await;
        let status = {
            let _guard = slot.lock().await;
            self.disconnect_locked(server_id).await
        };
        self.release_slot(server_id, slot).await;
        status
    }

    /// Drops the slot lock for `server_id` once no other caller holds it.
    async fn release_slot(&self, server_id: &str, slot: Arc<Mutex<()>>) {
        let mut slots = self.slots.lock().await;
        if Arc::strong_count(&slot) == 2 {
            slots.remove(server_id);
        }
    }

    async fn disconnect_locked(&self, server_id: &str) -> ConnectionStatus {
        let (session, status) = {
            let mut state = self.state.write().await;
            let session = state.sessions.remove(server_id);
            let status = match (&session, state.statuses.get(server_id)) {
                (Some(session), _) if !session.is_alive() => {
                    Self::lost_channel_status(server_id, session)
                }
                (Some(_), _) | (None, None) => ConnectionStatus::disconnected(server_id, None),
                (None, Some(previous)) => previous.clone(),
            };
            if session.is_some() {
                state
                    .statuses
                    .insert(server_id.to_string(), status.clone());
            }
            (session, status)
        };

        if let Some(session) = session {
            match session.close().await {
                Ok(()) => info!(server_id = %server_id, "MCP server disconnected"),
                Err(err) => {
                    warn!(server_id = %server_id, error = %err, "Error closing MCP session");
                }
            }
        }
        status
    }

    /// Connects every enabled server, a few at a time.
    pub async fn connect_all(&self, configs: &[McpServerConfig]) -> Vec<ConnectionStatus> {
        stream::iter(configs.iter().filter(|config| config.is_enabled()))
            .map(|config| self.connect(config))
            .buffer_unordered(MCP_STARTUP_CONCURRENCY_LIMIT)
            .collect()
            .await
    }

    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.state.read().await.sessions.keys().cloned().collect();
        join_all(ids.iter().map(|id| self.disconnect(id))).await;
    }

    fn effective_status(
        server_id: &str,
        session: Option<&Arc<McpSession>>,
        status: &ConnectionStatus,
    ) -> ConnectionStatus {
        match session {
            Some(session) if !session.is_alive() => Self::lost_channel_status(server_id, session),
            _ => status.clone(),
        }
    }

    fn lost_channel_status(server_id: &str, session: &McpSession) -> ConnectionStatus {
        let reason = session
            .channel_error()
            .unwrap_or_else(|| "MCP channel closed.".to_string());
        ConnectionStatus::disconnected(server_id, Some(reason))
    }

    /// `None` means the id was never seen.
    pub async fn status(&self, server_id: &str) -> Option<ConnectionStatus> {
        let state = self.state.read().await;
        state.statuses.get(server_id).map(|status| {
            Self::effective_status(server_id, state.sessions.get(server_id), status)
        })
    }

    pub async fn all_statuses(&self) -> Vec<ConnectionStatus> {
        let state = self.state.read().await;
        let mut statuses: Vec<ConnectionStatus> = state
            .statuses
            .iter()
            .map(|(id, status)| Self::effective_status(id, state.sessions.get(id), status))
            .collect();
        statuses.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        statuses
    }

    /// Ids with a live session, sorted.
    pub async fn connected_ids(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut ids: Vec<String> = state
            .sessions
            .iter()
            .filter(|(_, session)| session.is_alive())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    async fn session(&self, server_id: &str) -> Result<Arc<McpSession>, ManagerError> {
        self.state
            .read()
            .await
            .sessions
            .get(server_id)
            .filter(|session| session.is_alive())
            .cloned()
            .ok_or_else(|| ManagerError::NotConnected(server_id.to_string()))
    }

    pub async fn ping(&self, server_id: &str) -> Result<(), ManagerError> {
        Ok(self.session(server_id).await?.ping().await?)
    }

    /// What the server reported about itself during the handshake.
    pub async fn server_identity(&self, server_id: &str) -> Option<ServerIdentity> {
        self.state
            .read()
            .await
            .sessions
            .get(server_id)
            .and_then(|session| session.identity().cloned())
    }

    pub async fn list_tools(&self, server_id: &str) -> Result<Vec<McpTool>, ManagerError> {
        Ok(self.session(server_id).await?.list_tools().await?)
    }

    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<ToolCallOutput, ManagerError> {
        Ok(self
            .session(server_id)
            .await?
            .call_tool(tool_name, arguments)
            .await?)
    }

    pub async fn list_prompts(&self, server_id: &str) -> Result<Vec<McpPrompt>, ManagerError> {
        Ok(self.session(server_id).await?.list_prompts().await?)
    }

    pub async fn get_prompt(
        &self,
        server_id: &str,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<PromptResult, ManagerError> {
        Ok(self
            .session(server_id)
            .await?
            .get_prompt(name, arguments)
            .await?)
    }

    pub async fn list_resources(&self, server_id: &str) -> Result<Vec<McpResource>, ManagerError> {
        Ok(self.session(server_id).await?.list_resources().await?)
    }

    pub async fn read_resource(
        &self,
        server_id: &str,
        uri: &str,
    ) -> Result<ReadResourceOutput, ManagerError> {
        Ok(self.session(server_id).await?.read_resource(uri).await?)
    }
}
