//! JSON-RPC framing helpers shared by every transport.

use crate::core::config::McpServerConfig;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{
    ClientCapabilities, Implementation, InitializeRequestParams, InitializeResult,
    PaginatedRequestParams, RequestId, RpcError, LATEST_PROTOCOL_VERSION,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

/// JSON-RPC code used by servers to indicate unsupported list methods.
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;

/// Upper bound on items collected across list pages.
pub const MCP_MAX_LIST_ITEMS: usize = 100;

/// Why a response could not be turned into the expected result.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseError {
    Rpc { code: i64, message: String },
    Malformed(String),
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseError::Rpc { message, .. } => f.write_str(message),
            ResponseError::Malformed(message) => f.write_str(message),
        }
    }
}

pub(crate) fn requested_protocol_version(config: &McpServerConfig) -> String {
    config
        .protocol_version
        .clone()
        .filter(|version| !version.trim().is_empty())
        .unwrap_or_else(|| LATEST_PROTOCOL_VERSION.to_string())
}

pub(crate) fn client_details_for(config: &McpServerConfig) -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "mcpchat".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("mcpchat".to_string()),
            description: Some("Tool-calling chat client for MCP servers".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: requested_protocol_version(config),
    }
}

pub(crate) fn paginated_params(cursor: Option<String>) -> Option<PaginatedRequestParams> {
    cursor.map(|cursor| PaginatedRequestParams {
        cursor: Some(cursor),
        meta: None,
    })
}

pub(crate) fn request_message(
    request: RequestFromClient,
    request_id: RequestId,
) -> Result<ClientMessage, String> {
    ClientMessage::from_message(MessageFromClient::RequestFromClient(request), Some(request_id))
        .map_err(|err| err.to_string())
}

pub(crate) fn initialized_notification() -> Result<ClientMessage, String> {
    ClientMessage::from_message(
        MessageFromClient::NotificationFromClient(NotificationFromClient::InitializedNotification(
            None,
        )),
        None,
    )
    .map_err(|err| err.to_string())
}

/// The request id a response or error answers, if any.
pub(crate) fn response_id(message: &ServerMessage) -> Option<&RequestId> {
    match message {
        ServerMessage::Response(response) => Some(&response.id),
        ServerMessage::Error(error) => error.id.as_ref(),
        ServerMessage::Request(_) | ServerMessage::Notification(_) => None,
    }
}

/// Returns true when a server reports the JSON-RPC method-not-found code.
pub fn is_method_not_found(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Error(error) if error.error.code == MCP_METHOD_NOT_FOUND
    )
}

pub(crate) fn parse_initialize_result(
    message: ServerMessage,
) -> Result<InitializeResult, ResponseError> {
    let result: InitializeResult = parse_response(message)?;
    if result.protocol_version.trim().is_empty() {
        return Err(ResponseError::Malformed(
            "Unexpected initialize response.".to_string(),
        ));
    }
    Ok(result)
}

pub(crate) fn parse_response<T: DeserializeOwned>(
    message: ServerMessage,
) -> Result<T, ResponseError> {
    let value = parse_response_value(message)?;
    serde_json::from_value::<T>(value).map_err(|err| ResponseError::Malformed(err.to_string()))
}

pub(crate) fn parse_response_value(message: ServerMessage) -> Result<Value, ResponseError> {
    match message {
        ServerMessage::Response(response) => serde_json::to_value(&response.result)
            .map_err(|err| ResponseError::Malformed(err.to_string())),
        ServerMessage::Error(error) => Err(ResponseError::Rpc {
            code: error.error.code,
            message: format_rpc_error(&error.error),
        }),
        other => Err(ResponseError::Malformed(format!(
            "Unexpected MCP server message: {other:?}"
        ))),
    }
}

pub(crate) fn format_rpc_error(error: &RpcError) -> String {
    let mut output = format!("MCP error {}: {}", error.code, error.message);
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| data.as_str().map(|value| value.to_string()))
            .or_else(|| serde_json::to_string_pretty(data).ok());

        if let Some(details) = details {
            if !details.is_empty() {
                output.push('\n');
                output.push_str(&details);
            }
        }
    }
    output
}

/// Parses one decoded JSON payload, unpacking batches, into server messages.
/// Entries that are not valid server messages are skipped.
pub(crate) fn server_messages_from_value(value: Value) -> Vec<ServerMessage> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value::<ServerMessage>(item).ok())
            .collect(),
        other => serde_json::from_value::<ServerMessage>(other)
            .map(|message| vec![message])
            .unwrap_or_default(),
    }
}
