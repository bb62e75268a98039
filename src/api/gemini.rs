//! Streaming client for the Gemini `generateContent` API.

use super::{ModelClient, ModelError, ModelRequest, ModelResponse};
use crate::core::config::data::DEFAULT_REQUEST_TIMEOUT_SECONDS;
use crate::core::config::{ModelSettings, TimeoutSettings};
use crate::core::conversation::{Content, FunctionCall, Part, Role};
use crate::core::schema::FunctionDeclaration;
use crate::utils::sse::{sse_data_payload, SseLineBuffer};
use crate::utils::url::stream_generate_url;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Serialize)]
struct WireContent<'a> {
    role: &'static str,
    parts: &'a [Part],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTool<'a> {
    function_declarations: &'a [FunctionDeclaration],
}

#[derive(Serialize)]
struct GenerateContentRequest<'a> {
    contents: Vec<WireContent<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::User | Role::Function => "user",
        Role::Model => "model",
    }
}

fn request_body<'a>(
    contents: &'a [Content],
    tools: &'a [FunctionDeclaration],
) -> GenerateContentRequest<'a> {
    GenerateContentRequest {
        contents: contents
            .iter()
            .map(|content| WireContent {
                role: wire_role(content.role),
                parts: &content.parts,
            })
            .collect(),
        tools: if tools.is_empty() {
            Vec::new()
        } else {
            vec![WireTool {
                function_declarations: tools,
            }]
        },
    }
}

pub struct GeminiClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    idle_timeout: Duration,
}

impl GeminiClient {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
            idle_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
        }
    }

    /// Longest wait for response headers or for the next stream chunk.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Builds a client from settings, reading the API key from the configured
    /// environment variable.
    pub fn from_settings(
        settings: &ModelSettings,
        timeouts: &TimeoutSettings,
    ) -> Result<Self, ModelError> {
        let api_key = std::env::var(settings.api_key_env())
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ModelError::MissingApiKey(settings.api_key_env().to_string()))?;
        let client = reqwest::Client::builder()
            .connect_timeout(timeouts.connect_timeout())
            .build()?;
        Ok(Self::new(client, settings.base_url(), settings.model(), api_key)
            .with_idle_timeout(timeouts.request_timeout()))
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ModelClient for GeminiClient {
    async fn generate(&self, request: ModelRequest<'_>) -> Result<ModelResponse, ModelError> {
        let url = stream_generate_url(&self.base_url, &self.model);
        let body = request_body(request.contents, request.tools);
        debug!(
            model = %self.model,
            turns = request.contents.len(),
            tools = request.tools.len(),
            "Requesting model generation"
        );

        let send = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send();
        let response = tokio::time::timeout(self.idle_timeout, send)
            .await
            .map_err(|_| ModelError::Timeout(self.idle_timeout))??;

        let status = response.status();
        if !status.is_success() {
            let error_text = tokio::time::timeout(self.idle_timeout, response.text())
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default();
            return Err(ModelError::Api {
                status: Some(status),
                message: format_api_error(&error_text),
            });
        }

        let mut aggregate = StreamAggregate::default();
        let mut lines = SseLineBuffer::default();
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::time::timeout(self.idle_timeout, stream.next())
                .await
                .map_err(|_| ModelError::Timeout(self.idle_timeout))?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;
            for line in lines.push(&chunk) {
                aggregate.accept_line(&line)?;
            }
        }
        for line in lines.finish() {
            aggregate.accept_line(&line)?;
        }

        aggregate.finish()
    }
}

/// Folds streamed `GenerateContentResponse` chunks into one reply.
#[derive(Default)]
struct StreamAggregate {
    text: String,
    function_calls: Vec<FunctionCall>,
    block_reason: Option<String>,
}

impl StreamAggregate {
    fn accept_line(&mut self, line: &str) -> Result<(), ModelError> {
        let Some(payload) = sse_data_payload(line) else {
            return Ok(());
        };
        if payload.is_empty() || payload == "[DONE]" {
            return Ok(());
        }

        let Ok(chunk) = serde_json::from_str::<Value>(payload) else {
            return Err(ModelError::Api {
                status: None,
                message: format_api_error(payload),
            });
        };
        if chunk.get("error").is_some() {
            return Err(ModelError::Api {
                status: None,
                message: format_api_error(payload),
            });
        }
        self.accept_chunk(&chunk);
        Ok(())
    }

    fn accept_chunk(&mut self, chunk: &Value) {
        if let Some(reason) = chunk
            .pointer("/promptFeedback/blockReason")
            .and_then(Value::as_str)
        {
            self.block_reason = Some(reason.to_string());
        }

        let parts = chunk
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array);
        for part in parts.into_iter().flatten() {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if part.get("thought").and_then(Value::as_bool) != Some(true) {
                    self.text.push_str(text);
                }
            }
            if let Some(call) = part.get("functionCall") {
                match serde_json::from_value::<FunctionCall>(call.clone()) {
                    Ok(call) => self.function_calls.push(call),
                    Err(err) => warn!(error = %err, "Ignoring malformed functionCall part"),
                }
            }
        }
    }

    fn finish(self) -> Result<ModelResponse, ModelError> {
        if self.text.is_empty() && self.function_calls.is_empty() {
            if let Some(reason) = self.block_reason {
                return Err(ModelError::Blocked(reason));
            }
        }
        Ok(ModelResponse {
            text: self.text,
            function_calls: self.function_calls,
        })
    }
}

fn extract_error_summary(value: &Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                Value::String(s) => Some(s.to_string()),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.trim().to_string()
    })
}

/// Renders an error body for display, pretty-printing JSON when possible.
pub(crate) fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();

    if trimmed.is_empty() {
        return "API Error:\n```\n<empty>\n```".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<Value>(trimmed) {
        if let Ok(pretty_json) = serde_json::to_string_pretty(&json_value) {
            if let Some(summary) = extract_error_summary(&json_value) {
                if !summary.is_empty() {
                    return format!("API Error: {}\n```json\n{}\n```", summary, pretty_json);
                }
            }
            return format!("API Error:\n```json\n{}\n```", pretty_json);
        }
    }

    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        format!("API Error:\n```xml\n{}\n```", trimmed)
    } else {
        format!("API Error:\n```\n{}\n```", trimmed)
    }
}
