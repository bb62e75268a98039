//! Model-calling collaborator used by the chat orchestrator.

use crate::core::conversation::{Content, FunctionCall};
use crate::core::schema::FunctionDeclaration;
use async_trait::async_trait;
use thiserror::Error;

pub mod gemini;

pub use gemini::GeminiClient;

/// Conversation plus the functions the model may call.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub contents: &'a [Content],
    pub tools: &'a [FunctionDeclaration],
}

/// Aggregated model reply: closing text and/or requested function calls, in
/// emission order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub function_calls: Vec<FunctionCall>,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            function_calls: Vec::new(),
        }
    }

    pub fn calls(function_calls: Vec<FunctionCall>) -> Self {
        Self {
            text: String::new(),
            function_calls,
        }
    }
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("{message}")]
    Api {
        status: Option<reqwest::StatusCode>,
        message: String,
    },

    #[error("Model did not respond within {0:?}.")]
    Timeout(std::time::Duration),

    #[error("Model response was blocked: {0}")]
    Blocked(String),

    #[error("Environment variable {0} is not set; it must hold the model API key.")]
    MissingApiKey(String),
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, request: ModelRequest<'_>) -> Result<ModelResponse, ModelError>;
}
