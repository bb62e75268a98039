//! Scripted in-memory MCP servers for session, manager, and chat tests.

use crate::core::config::McpServerConfig;
use crate::mcp::transport::{McpTransport, TransportConnector, TransportError};
use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{ClientMessage, ServerMessage};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub type ToolHandler = Arc<dyn Fn(&str, &Value) -> Result<Value, (i64, String)> + Send + Sync>;

/// Answers JSON-RPC requests from canned data.
pub struct FakeServer {
    pub name: String,
    pub tools: Vec<Value>,
    pub page_size: Option<usize>,
    pub prompts: Option<Vec<Value>>,
    pub resources: Vec<Value>,
    /// Methods that never get a reply.
    pub silent_methods: Vec<String>,
    /// Methods answered only after a pause.
    pub delayed_methods: Vec<(String, Duration)>,
    pub handler: ToolHandler,
}

impl FakeServer {
    pub fn new(name: &str) -> Self {
        let server_name = name.to_string();
        Self {
            name: name.to_string(),
            tools: Vec::new(),
            page_size: None,
            prompts: None,
            resources: Vec::new(),
            silent_methods: Vec::new(),
            delayed_methods: Vec::new(),
            handler: Arc::new(move |tool, _args| {
                Ok(json!({
                    "content": [{"type": "text", "text": format!("{server_name}:{tool} ok")}],
                    "isError": false
                }))
            }),
        }
    }

    pub fn with_tool(mut self, name: &str, schema: Value) -> Self {
        self.tools.push(json!({
            "name": name,
            "description": format!("{name} tool"),
            "inputSchema": schema
        }));
        self
    }

    pub fn with_handler(
        mut self,
        handler: impl Fn(&str, &Value) -> Result<Value, (i64, String)> + Send + Sync + 'static,
    ) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    pub fn silent_on(mut self, method: &str) -> Self {
        self.silent_methods.push(method.to_string());
        self
    }

    /// Runs `method` (handler included) only after `delay` has passed.
    pub fn delay_on(mut self, method: &str, delay: Duration) -> Self {
        self.delayed_methods.push((method.to_string(), delay));
        self
    }

    fn delay_for(&self, method: &str) -> Option<Duration> {
        self.delayed_methods
            .iter()
            .find(|(delayed, _)| delayed == method)
            .map(|(_, delay)| *delay)
    }

    fn page(&self, items: &[Value], key: &str, params: &Value) -> Value {
        let (start, end) = match self.page_size {
            Some(size) => {
                let start = params
                    .get("cursor")
                    .and_then(Value::as_str)
                    .and_then(|cursor| cursor.parse::<usize>().ok())
                    .unwrap_or(0)
                    .min(items.len());
                (start, (start + size).min(items.len()))
            }
            None => (0, items.len()),
        };
        let mut page = serde_json::Map::new();
        page.insert(key.to_string(), Value::Array(items[start..end].to_vec()));
        if end < items.len() {
            page.insert("nextCursor".to_string(), json!(end.to_string()));
        }
        Value::Object(page)
    }

    /// `None` means the request is left unanswered.
    pub fn respond(&self, method: &str, params: &Value) -> Option<Result<Value, (i64, String)>> {
        if self.silent_methods.iter().any(|silent| silent == method) {
            return None;
        }
        let reply = match method {
            "initialize" => Ok(json!({
                "protocolVersion": "2025-06-18",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": self.name, "version": "1.0.0"}
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.page(&self.tools, "tools", params)),
            "tools/call" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or("");
                let known = self
                    .tools
                    .iter()
                    .any(|tool| tool.get("name").and_then(Value::as_str) == Some(name));
                if known {
                    let args = params.get("arguments").cloned().unwrap_or(json!({}));
                    (self.handler)(name, &args)
                } else {
                    Err((-32602, format!("Unknown tool: {name}")))
                }
            }
            "prompts/list" => match &self.prompts {
                Some(prompts) => Ok(self.page(prompts, "prompts", params)),
                None => Err((-32601, "Method not found".to_string())),
            },
            "prompts/get" => {
                let name = params.get("name").and_then(Value::as_str).unwrap_or("");
                let topic = params
                    .pointer("/arguments/topic")
                    .and_then(Value::as_str)
                    .unwrap_or("nothing");
                Ok(json!({
                    "description": format!("{name} prompt"),
                    "messages": [
                        {"role": "user", "content": {"type": "text", "text": format!("Tell me about {topic}")}}
                    ]
                }))
            }
            "resources/list" => Ok(self.page(&self.resources, "resources", params)),
            "resources/read" => {
                let uri = params.get("uri").and_then(Value::as_str).unwrap_or("");
                Ok(json!({
                    "contents": [{"uri": uri, "mimeType": "text/plain", "text": format!("contents of {uri}")}]
                }))
            }
            _ => Err((-32601, "Method not found".to_string())),
        };
        Some(reply)
    }
}

/// Channel that hands every client request to a [`FakeServer`].
pub struct MemoryTransport {
    server: Arc<FakeServer>,
    inbound_tx: mpsc::UnboundedSender<ServerMessage>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<ServerMessage>>,
    closed: CancellationToken,
    close_count: AtomicUsize,
    sent: StdMutex<Vec<Value>>,
}

impl MemoryTransport {
    pub fn new(server: Arc<FakeServer>) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            server,
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            closed: CancellationToken::new(),
            close_count: AtomicUsize::new(0),
            sent: StdMutex::new(Vec::new()),
        })
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Methods of every message sent so far, in order.
    pub fn sent_methods(&self) -> Vec<String> {
        self.sent
            .lock()
            .map(|sent| {
                sent.iter()
                    .filter_map(|message| message.get("method").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn sent_messages(&self) -> Vec<Value> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    /// Simulates the server process dying.
    pub fn sever(&self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl McpTransport for MemoryTransport {
    async fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let value =
            serde_json::to_value(&message).map_err(|err| TransportError::Encode(err.to_string()))?;
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(value.clone());
        }

        let (Some(id), Some(method)) = (
            value.get("id").cloned(),
            value.get("method").and_then(Value::as_str),
        ) else {
            return Ok(());
        };
        let params = value.get("params").cloned().unwrap_or(json!({}));
        if let Some(delay) = self.server.delay_for(method) {
            let server = self.server.clone();
            let inbound_tx = self.inbound_tx.clone();
            let method = method.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Ok(Some(message)) = reply_message(&server, id, &method, &params) {
                    let _ = inbound_tx.send(message);
                }
            });
            return Ok(());
        }
        if let Some(message) = reply_message(&self.server, id, method, &params)? {
            let _ = self.inbound_tx.send(message);
        }
        Ok(())
    }

    async fn receive(&self) -> Result<ServerMessage, TransportError> {
        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            message = inbound.recv() => message.ok_or(TransportError::Closed),
            _ = self.closed.cancelled() => Err(TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        Ok(())
    }
}

fn reply_message(
    server: &FakeServer,
    id: Value,
    method: &str,
    params: &Value,
) -> Result<Option<ServerMessage>, TransportError> {
    let reply = match server.respond(method, params) {
        None => return Ok(None),
        Some(Ok(result)) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Some(Err((code, message))) => {
            json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
        }
    };
    serde_json::from_value(reply)
        .map(Some)
        .map_err(|err| TransportError::Encode(err.to_string()))
}

/// Connector that serves registered fake servers by id.
#[derive(Default)]
pub struct MemoryConnector {
    servers: StdMutex<HashMap<String, Arc<FakeServer>>>,
    opened: StdMutex<Vec<(String, Arc<MemoryTransport>)>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(self, id: &str, server: FakeServer) -> Self {
        if let Ok(mut servers) = self.servers.lock() {
            servers.insert(id.to_string(), Arc::new(server));
        }
        self
    }

    pub fn transports_for(&self, id: &str) -> Vec<Arc<MemoryTransport>> {
        self.opened
            .lock()
            .map(|opened| {
                opened
                    .iter()
                    .filter(|(server_id, _)| server_id == id)
                    .map(|(_, transport)| transport.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl TransportConnector for MemoryConnector {
    async fn open(
        &self,
        config: &McpServerConfig,
    ) -> Result<Arc<dyn McpTransport>, TransportError> {
        config.validate()?;
        let server = self
            .servers
            .lock()
            .ok()
            .and_then(|servers| servers.get(&config.id).cloned())
            .ok_or_else(|| TransportError::Spawn {
                command: config.command.clone().unwrap_or_else(|| config.id.clone()),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such server"),
            })?;
        let transport = MemoryTransport::new(server);
        if let Ok(mut opened) = self.opened.lock() {
            opened.push((config.id.clone(), transport.clone()));
        }
        Ok(transport)
    }
}

pub fn stdio_config(id: &str) -> McpServerConfig {
    McpServerConfig::stdio(id, id.to_uppercase(), format!("{id}-server"), Vec::new())
}
