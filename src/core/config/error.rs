use std::path::PathBuf;
use thiserror::Error;

use super::data::{path_display, McpTransportKind};

/// Errors raised while loading, saving, or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("Failed to read config at {}: {source}", path_display(path))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse the configuration file as valid TOML.
    #[error("Failed to parse config at {}: {source}", path_display(path))]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to write config at {}: {message}", path_display(path))]
    Write { path: PathBuf, message: String },

    #[error("Unable to determine the configuration directory.")]
    NoConfigDir,

    #[error("MCP server id must not be empty.")]
    MissingId,

    #[error("MCP command is required for stdio transport (server '{server_id}').")]
    MissingCommand { server_id: String },

    #[error("MCP url is required for {transport} transport (server '{server_id}').")]
    MissingUrl {
        server_id: String,
        transport: McpTransportKind,
    },

    #[error("Invalid MCP url '{url}' for server '{server_id}': {reason}")]
    InvalidUrl {
        server_id: String,
        url: String,
        reason: String,
    },

    #[error("An MCP server with id '{0}' already exists.")]
    DuplicateServer(String),
}
