pub mod data;
pub mod error;
pub mod io;

pub use data::{
    path_display, Config, McpServerConfig, McpTransportKind, ModelSettings,
    OrchestrationSettings, TimeoutSettings,
};
pub use error::ConfigError;
