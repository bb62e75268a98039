use std::collections::HashMap;
use std::error::Error;
use std::path::Path;

use crate::core::config::{path_display, Config, McpServerConfig, McpTransportKind};

/// Server definition as entered on the command line.
pub struct ServerSpec {
    pub id: String,
    pub transport: McpTransportKind,
    pub name: Option<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub url: Option<String>,
    pub headers: Vec<(String, String)>,
    pub enabled: bool,
}

impl ServerSpec {
    pub fn into_config(self) -> McpServerConfig {
        let display_name = self
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| self.id.clone());
        let mut server = match self.transport {
            McpTransportKind::Stdio => McpServerConfig::stdio(
                self.id,
                display_name,
                self.command.unwrap_or_default(),
                self.args,
            ),
            kind => McpServerConfig::remote(
                self.id,
                display_name,
                kind,
                self.url.unwrap_or_default(),
            ),
        };
        if !self.env.is_empty() {
            server.env = Some(self.env.into_iter().collect::<HashMap<_, _>>());
        }
        if !self.headers.is_empty() {
            server.headers = Some(self.headers.into_iter().collect::<HashMap<_, _>>());
        }
        server.enabled = Some(self.enabled);
        server
    }
}

fn target_of(server: &McpServerConfig) -> String {
    match server.transport {
        McpTransportKind::Stdio => {
            let mut parts = vec![server.command.clone().unwrap_or_default()];
            parts.extend(server.args().iter().cloned());
            parts.join(" ")
        }
        _ => server.url.clone().unwrap_or_default(),
    }
}

pub fn list_servers(config: &Config, config_path: &Path) {
    println!("Config: {}", path_display(config_path));
    if config.mcp_servers.is_empty() {
        println!("No MCP servers configured.");
        return;
    }

    println!();
    for server in &config.mcp_servers {
        let state = if server.is_enabled() { "enabled" } else { "disabled" };
        println!(
            "{} ({}) [{}, {}]\n    {}",
            server.id,
            server.display_name,
            server.transport,
            state,
            target_of(server)
        );
    }
}

pub fn add_server(
    mut config: Config,
    config_path: &Path,
    server: McpServerConfig,
) -> Result<(), Box<dyn Error>> {
    let id = server.id.clone();
    config.add_server(server)?;
    config.save_to_path(config_path)?;
    println!("✅ Added MCP server '{id}' to {}", path_display(config_path));
    Ok(())
}

pub fn remove_server(
    mut config: Config,
    config_path: &Path,
    id: &str,
) -> Result<(), Box<dyn Error>> {
    if !config.remove_server(id) {
        return Err(format!("No MCP server named '{id}' is configured.").into());
    }
    config.save_to_path(config_path)?;
    println!("✅ Removed MCP server '{id}'");
    Ok(())
}
