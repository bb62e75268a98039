use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::ConfigError;

pub const DEFAULT_MODEL_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-001";
pub const DEFAULT_API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const DEFAULT_MAX_ITERATIONS: usize = 10;
pub const DEFAULT_CONNECT_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 60;

/// Supported MCP transport backends.
///
/// - [`McpTransportKind::Stdio`] for locally spawned processes.
/// - [`McpTransportKind::StreamableHttp`] for remote servers over HTTP POST with
///   JSON or event-stream responses.
/// - [`McpTransportKind::Sse`] for the legacy long-lived event stream plus a
///   POST endpoint announced by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum McpTransportKind {
    Stdio,
    #[default]
    #[serde(alias = "streamable_http", alias = "http")]
    StreamableHttp,
    Sse,
}

impl McpTransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            McpTransportKind::Stdio => "stdio",
            McpTransportKind::StreamableHttp => "streamable-http",
            McpTransportKind::Sse => "sse",
        }
    }
}

impl fmt::Display for McpTransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct McpServerConfig {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub transport: McpTransportKind,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    pub url: Option<String>,
    /// Extra HTTP headers sent with every request (HTTP transports only)
    pub headers: Option<HashMap<String, String>>,
    /// Overrides the protocol version requested during the handshake
    pub protocol_version: Option<String>,
    pub enabled: Option<bool>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl McpServerConfig {
    pub fn stdio(
        id: impl Into<String>,
        display_name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            display_name: display_name.into(),
            transport: McpTransportKind::Stdio,
            command: Some(command.into()),
            args: (!args.is_empty()).then_some(args),
            env: None,
            url: None,
            headers: None,
            protocol_version: None,
            enabled: Some(true),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remote(
        id: impl Into<String>,
        display_name: impl Into<String>,
        transport: McpTransportKind,
        url: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            display_name: display_name.into(),
            transport,
            command: None,
            args: None,
            env: None,
            url: Some(url.into()),
            headers: None,
            protocol_version: None,
            enabled: Some(true),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn args(&self) -> &[String] {
        self.args.as_deref().unwrap_or_default()
    }

    /// Checks that the transport parameters match the declared transport kind.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::MissingId);
        }

        match self.transport {
            McpTransportKind::Stdio => {
                let has_command = self
                    .command
                    .as_deref()
                    .is_some_and(|command| !command.trim().is_empty());
                if !has_command {
                    return Err(ConfigError::MissingCommand {
                        server_id: self.id.clone(),
                    });
                }
            }
            McpTransportKind::StreamableHttp | McpTransportKind::Sse => {
                let Some(url) = self.url.as_deref().filter(|url| !url.trim().is_empty()) else {
                    return Err(ConfigError::MissingUrl {
                        server_id: self.id.clone(),
                        transport: self.transport,
                    });
                };
                let parsed = reqwest::Url::parse(url.trim()).map_err(|err| {
                    ConfigError::InvalidUrl {
                        server_id: self.id.clone(),
                        url: url.to_string(),
                        reason: err.to_string(),
                    }
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(ConfigError::InvalidUrl {
                        server_id: self.id.clone(),
                        url: url.to_string(),
                        reason: format!("unsupported scheme '{}'", parsed.scheme()),
                    });
                }
            }
        }

        Ok(())
    }

    /// Produces an edited copy of this config. The copy gets a fresh
    /// `updated_at` and must validate before it is handed out.
    pub fn revised(&self, edit: impl FnOnce(&mut McpServerConfig)) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        edit(&mut next);
        next.id = self.id.clone();
        next.created_at = self.created_at;
        next.updated_at = Utc::now();
        next.validate()?;
        Ok(next)
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct ModelSettings {
    pub base_url: Option<String>,
    pub model: Option<String>,
    /// Name of the environment variable holding the API key
    pub api_key_env: Option<String>,
}

impl ModelSettings {
    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_MODEL_BASE_URL)
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    pub fn api_key_env(&self) -> &str {
        self.api_key_env.as_deref().unwrap_or(DEFAULT_API_KEY_ENV)
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct OrchestrationSettings {
    /// Upper bound on function-call cycles per user turn
    pub max_iterations: Option<usize>,
}

impl OrchestrationSettings {
    pub fn max_iterations(&self) -> usize {
        self.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS)
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct TimeoutSettings {
    pub connect_secs: Option<u64>,
    pub request_secs: Option<u64>,
}

impl TimeoutSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(
            self.connect_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECONDS)
                .max(1),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECONDS)
                .max(1),
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub orchestration: OrchestrationSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}

impl Config {
    pub fn find_server(&self, id: &str) -> Option<&McpServerConfig> {
        self.mcp_servers
            .iter()
            .find(|server| server.id.eq_ignore_ascii_case(id))
    }

    pub fn enabled_servers(&self) -> impl Iterator<Item = &McpServerConfig> {
        self.mcp_servers.iter().filter(|server| server.is_enabled())
    }

    pub fn add_server(&mut self, server: McpServerConfig) -> Result<(), ConfigError> {
        server.validate()?;
        if self.find_server(&server.id).is_some() {
            return Err(ConfigError::DuplicateServer(server.id));
        }
        self.mcp_servers.push(server);
        Ok(())
    }

    pub fn remove_server(&mut self, id: &str) -> bool {
        let before = self.mcp_servers.len();
        self.mcp_servers
            .retain(|server| !server.id.eq_ignore_ascii_case(id));
        self.mcp_servers.len() != before
    }

    /// Validates every server entry and rejects duplicate ids.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen: Vec<String> = Vec::with_capacity(self.mcp_servers.len());
        for server in &self.mcp_servers {
            server.validate()?;
            let key = server.id.to_ascii_lowercase();
            if seen.contains(&key) {
                return Err(ConfigError::DuplicateServer(server.id.clone()));
            }
            seen.push(key);
        }
        Ok(())
    }
}
