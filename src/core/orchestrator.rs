//! Function-calling loop for one chat turn.
//!
//! A turn walks `CollectTools -> Generate -> ExecuteCalls -> Generate ... ->
//! Finalize`, pushing [`ChatEvent`]s to the caller as it goes. Tool failures
//! become result text; only a failed model call ends the turn early.

use crate::api::{ModelClient, ModelError, ModelRequest, ModelResponse};
use crate::core::config::data::DEFAULT_MAX_ITERATIONS;
use crate::core::conversation::{Content, FunctionCall, FunctionResponse};
use crate::core::events::{ChatEvent, ToolCallRecord, ToolImage};
use crate::core::schema::FunctionDeclaration;
use crate::mcp::manager::{ConnectionManager, ManagerError};
use crate::mcp::types::{is_image_mime, McpTool, ToolCallOutput, ToolContent};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Chat turn was cancelled.")]
    Cancelled,
}

/// Prior conversation plus the new user message.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub history: Vec<Content>,
    pub message: String,
}

impl TurnRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            history: Vec::new(),
            message: message.into(),
        }
    }

    pub fn with_history(mut self, history: Vec<Content>) -> Self {
        self.history = history;
        self
    }
}

/// Conversation extended by this turn, and every tool call it made.
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    pub contents: Vec<Content>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub text: String,
}

struct ToolEntry {
    server_id: String,
    tool: McpTool,
    validator: Option<jsonschema::Validator>,
}

/// Tools of every connected server, keyed by name.
#[derive(Default)]
struct ToolTable {
    entries: BTreeMap<String, ToolEntry>,
}

impl ToolTable {
    fn insert(&mut self, server_id: &str, tool: McpTool) {
        let validator = match jsonschema::validator_for(&tool.input_schema) {
            Ok(validator) => Some(validator),
            Err(err) => {
                warn!(
                    server_id,
                    tool = %tool.name,
                    error = %err,
                    "Tool input schema cannot be compiled; arguments will not be validated"
                );
                None
            }
        };
        let name = tool.name.clone();
        let entry = ToolEntry {
            server_id: server_id.to_string(),
            tool,
            validator,
        };
        if let Some(previous) = self.entries.insert(name.clone(), entry) {
            warn!(
                tool = %name,
                shadowed = %previous.server_id,
                winner = server_id,
                "Tool name collision; the later server wins"
            );
        }
    }

    fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.entries
            .values()
            .map(|entry| FunctionDeclaration::from_tool(&entry.tool))
            .collect()
    }

    fn get(&self, name: &str) -> Option<&ToolEntry> {
        self.entries.get(name)
    }
}

enum TurnState {
    CollectTools,
    Generate { cycles: usize },
    ExecuteCalls { cycles: usize, response: ModelResponse },
    Finalize { text: String },
}

/// Result of one tool call before it is written into the record.
enum CallResult {
    Success { text: String, images: Vec<ToolImage> },
    Failure(String),
}

impl CallResult {
    fn display_text(&self) -> String {
        match self {
            CallResult::Success { text, .. } => text.clone(),
            CallResult::Failure(message) => format!("Error: {message}"),
        }
    }

    fn response_payload(&self) -> Value {
        match self {
            CallResult::Success { text, .. } => json!({ "result": text }),
            CallResult::Failure(message) => json!({ "error": message }),
        }
    }
}

pub struct Orchestrator {
    manager: Arc<ConnectionManager>,
    model: Arc<dyn ModelClient>,
    max_iterations: usize,
}

impl Orchestrator {
    pub fn new(manager: Arc<ConnectionManager>, model: Arc<dyn ModelClient>) -> Self {
        Self {
            manager,
            model,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Caps function-call cycles per turn; values below one are raised to one.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Runs a turn on a background task and returns its event stream.
    ///
    /// Dropping the receiver cancels the turn.
    pub fn spawn_turn(
        self: &Arc<Self>,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<ChatEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = orchestrator.run_turn(request, &tx, &cancel).await {
                debug!(error = %err, "Chat turn ended early");
            }
        });
        rx
    }

    pub async fn run_turn(
        &self,
        request: TurnRequest,
        sink: &mpsc::UnboundedSender<ChatEvent>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, OrchestrationError> {
        let TurnRequest { history, message } = request;
        let mut contents = history;
        contents.push(Content::user_text(message));

        let mut tools = ToolTable::default();
        let mut declarations = Vec::new();
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut state = TurnState::CollectTools;

        loop {
            state = match state {
                TurnState::CollectTools => {
                    tools = self.collect_tools().await;
                    declarations = tools.declarations();
                    debug!(tools = declarations.len(), "Collected tool declarations");
                    TurnState::Generate { cycles: 0 }
                }
                TurnState::Generate { cycles } => {
                    let response = self
                        .generate(&contents, &declarations, sink, cancel)
                        .await?;
                    if response.function_calls.is_empty() {
                        TurnState::Finalize {
                            text: response.text,
                        }
                    } else if cycles >= self.max_iterations {
                        warn!(
                            max_iterations = self.max_iterations,
                            pending_calls = response.function_calls.len(),
                            "Tool iteration budget exhausted; finishing turn"
                        );
                        TurnState::Finalize {
                            text: response.text,
                        }
                    } else {
                        TurnState::ExecuteCalls { cycles, response }
                    }
                }
                TurnState::ExecuteCalls { cycles, response } => {
                    let ModelResponse {
                        text,
                        function_calls,
                    } = response;
                    let mut responses = Vec::with_capacity(function_calls.len());
                    for call in &function_calls {
                        let pending = self.pending_record(&tools, call);
                        if !emit(sink, cancel, ChatEvent::ToolCall(pending)) {
                            return Err(OrchestrationError::Cancelled);
                        }
                        let (record, response) = self.execute_call(&tools, call).await;
                        if !emit(sink, cancel, ChatEvent::ToolResult(record.clone())) {
                            return Err(OrchestrationError::Cancelled);
                        }
                        records.push(record);
                        responses.push(response);
                    }

                    contents.push(Content::model_calls(text, function_calls));
                    contents.push(Content::function_responses(responses));
                    TurnState::Generate { cycles: cycles + 1 }
                }
                TurnState::Finalize { text } => {
                    if !text.is_empty() {
                        contents.push(Content::model_text(text.clone()));
                        if !emit(sink, cancel, ChatEvent::Text { text: text.clone() }) {
                            return Err(OrchestrationError::Cancelled);
                        }
                    }
                    if !emit(
                        sink,
                        cancel,
                        ChatEvent::Done {
                            tool_calls: records.clone(),
                        },
                    ) {
                        return Err(OrchestrationError::Cancelled);
                    }
                    info!(tool_calls = records.len(), "Chat turn finished");
                    return Ok(TurnOutcome {
                        contents,
                        tool_calls: records,
                        text,
                    });
                }
            };
        }
    }

    async fn collect_tools(&self) -> ToolTable {
        let mut table = ToolTable::default();
        for server_id in self.manager.connected_ids().await {
            match self.manager.list_tools(&server_id).await {
                Ok(tools) => {
                    for tool in tools {
                        table.insert(&server_id, tool);
                    }
                }
                Err(err) => {
                    warn!(server_id = %server_id, error = %err, "Skipping tools of MCP server")
                }
            }
        }
        table
    }

    async fn generate(
        &self,
        contents: &[Content],
        declarations: &[FunctionDeclaration],
        sink: &mpsc::UnboundedSender<ChatEvent>,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, OrchestrationError> {
        let request = ModelRequest {
            contents,
            tools: declarations,
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OrchestrationError::Cancelled),
            _ = sink.closed() => {
                cancel.cancel();
                return Err(OrchestrationError::Cancelled);
            }
            result = self.model.generate(request) => result,
        };

        match result {
            Ok(response) => Ok(response),
            Err(err) => {
                warn!(error = %err, "Model call failed");
                emit(
                    sink,
                    cancel,
                    ChatEvent::Error {
                        message: err.to_string(),
                    },
                );
                Err(err.into())
            }
        }
    }

    fn pending_record(&self, tools: &ToolTable, call: &FunctionCall) -> ToolCallRecord {
        let server_id = tools
            .get(&call.name)
            .map(|entry| entry.server_id.as_str())
            .unwrap_or_default();
        ToolCallRecord::pending(call.name.clone(), server_id, call.args.clone())
    }

    async fn execute_call(
        &self,
        tools: &ToolTable,
        call: &FunctionCall,
    ) -> (ToolCallRecord, FunctionResponse) {
        let mut record = self.pending_record(tools, call);
        let started = Instant::now();

        let result = match tools.get(&call.name) {
            None => CallResult::Failure(format!("tool '{}' not found.", call.name)),
            Some(entry) => match validate_arguments(entry, &call.args) {
                Err(message) => CallResult::Failure(message),
                Ok(()) => {
                    debug!(server_id = %entry.server_id, tool = %call.name, "Calling tool");
                    match self
                        .manager
                        .call_tool(&entry.server_id, &call.name, call.args.clone())
                        .await
                    {
                        Ok(output) => summarize_output(&output),
                        Err(ManagerError::NotConnected(server_id)) => CallResult::Failure(format!(
                            "tool '{}' not found: MCP server '{}' is not connected.",
                            call.name, server_id
                        )),
                        Err(err) => {
                            if err.is_connection_failure() {
                                warn!(
                                    server_id = %entry.server_id,
                                    tool = %call.name,
                                    error = %err,
                                    "MCP channel failed during tool call"
                                );
                            }
                            CallResult::Failure(err.to_string())
                        }
                    }
                }
            },
        };

        record.duration = Some(started.elapsed().as_millis() as u64);
        record.result = Some(result.display_text());
        let response = FunctionResponse {
            name: call.name.clone(),
            response: result.response_payload(),
        };
        if let CallResult::Success { images, .. } = result {
            record.images = images;
        }
        (record, response)
    }
}

/// Sends one event unless the turn is cancelled. A dropped receiver cancels.
fn emit(
    sink: &mpsc::UnboundedSender<ChatEvent>,
    cancel: &CancellationToken,
    event: ChatEvent,
) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    if sink.send(event).is_err() {
        cancel.cancel();
        return false;
    }
    true
}

fn validate_arguments(entry: &ToolEntry, args: &Map<String, Value>) -> Result<(), String> {
    let Some(validator) = &entry.validator else {
        return Ok(());
    };
    let instance = Value::Object(args.clone());
    let problems: Vec<String> = validator
        .iter_errors(&instance)
        .map(|error| error.to_string())
        .collect();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "invalid arguments for tool '{}': {}",
            entry.tool.name,
            problems.join("; ")
        ))
    }
}

fn summarize_output(output: &ToolCallOutput) -> CallResult {
    let mut texts = Vec::new();
    let mut images = Vec::new();

    for item in &output.content {
        match item {
            ToolContent::Text { text } => texts.push(text.clone()),
            ToolContent::Image { data, mime_type } => images.push(ToolImage::Inline {
                data: data.clone(),
                mime_type: mime_type.clone(),
            }),
            ToolContent::Resource { resource } => {
                match (&resource.blob, &resource.text) {
                    (Some(blob), _) if resource.has_image_mime() => {
                        images.push(ToolImage::Inline {
                            data: blob.clone(),
                            mime_type: resource.mime_type.clone().unwrap_or_default(),
                        })
                    }
                    (_, Some(text)) => texts.push(text.clone()),
                    _ => {}
                }
            }
            ToolContent::ResourceLink { uri, mime_type, .. }
                if is_image_mime(mime_type.as_deref()) =>
            {
                images.push(ToolImage::Remote {
                    url: uri.clone(),
                    mime_type: mime_type.clone().unwrap_or_default(),
                });
            }
            ToolContent::ResourceLink { uri, .. } => texts.push(uri.clone()),
            ToolContent::Audio { .. } | ToolContent::Unknown => {}
        }
    }

    let text = if !texts.is_empty() {
        texts.join("\n")
    } else if !images.is_empty() {
        format!("[{} image(s) returned]", images.len())
    } else if let Some(structured) = &output.structured_content {
        Value::Object(structured.clone()).to_string()
    } else {
        String::new()
    };

    CallResult::Success { text, images }
}
