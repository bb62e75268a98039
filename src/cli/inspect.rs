//! One-shot commands against a single MCP server.

use std::collections::HashMap;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{Map, Value};

use crate::core::config::{Config, McpServerConfig};
use crate::mcp::types::{ToolCallOutput, ToolContent};
use crate::mcp::{ConnectionManager, ManagerOptions};

/// Connects to the named server, failing with its connect error.
async fn connect_one(
    config: &Config,
    server_id: &str,
) -> Result<(Arc<ConnectionManager>, String), Box<dyn Error>> {
    let server = config
        .find_server(server_id)
        .ok_or_else(|| format!("No MCP server named '{server_id}' is configured."))?;
    let manager = Arc::new(ConnectionManager::with_default_connector(
        ManagerOptions::from_settings(&config.timeouts),
    ));
    let status = manager.connect(server).await;
    if !status.connected {
        let reason = status.error.unwrap_or_else(|| "unknown error".to_string());
        return Err(format!("Could not connect to MCP server '{}': {reason}", server.id).into());
    }
    Ok((manager, server.id.clone()))
}

pub async fn server_status(config: &Config) -> Result<(), Box<dyn Error>> {
    let enabled: Vec<McpServerConfig> = config.enabled_servers().cloned().collect();
    if enabled.is_empty() {
        println!("No enabled MCP servers.");
        return Ok(());
    }
    let manager = ConnectionManager::with_default_connector(ManagerOptions::from_settings(
        &config.timeouts,
    ));
    manager.connect_all(&enabled).await;
    for line in status_lines(&manager).await {
        println!("{line}");
    }
    manager.disconnect_all().await;
    Ok(())
}

/// One line per known server: its identity and ping latency, or why it is down.
pub(crate) async fn status_lines(manager: &ConnectionManager) -> Vec<String> {
    let mut lines = Vec::new();
    for status in manager.all_statuses().await {
        let id = &status.server_id;
        if !status.connected {
            let reason = status.error.as_deref().unwrap_or("unknown error");
            lines.push(format!("{id}: unavailable ({reason})"));
            continue;
        }
        let started = Instant::now();
        let line = match manager.ping(id).await {
            Ok(()) => {
                let latency = started.elapsed().as_millis();
                match manager.server_identity(id).await {
                    Some(identity) => format!(
                        "{id}: connected to {} {} (protocol {}, ping {latency} ms)",
                        identity.name, identity.version, identity.protocol_version
                    ),
                    None => format!("{id}: connected (ping {latency} ms)"),
                }
            }
            Err(err) => format!("{id}: ping failed ({err})"),
        };
        lines.push(line);
    }
    lines
}

pub async fn list_tools(config: &Config, server_id: &str) -> Result<(), Box<dyn Error>> {
    let (manager, id) = connect_one(config, server_id).await?;
    let result = manager.list_tools(&id).await;
    manager.disconnect_all().await;

    let tools = result?;
    if tools.is_empty() {
        println!("{id} exposes no tools.");
        return Ok(());
    }
    for tool in tools {
        match tool.description.as_deref().map(str::trim) {
            Some(description) if !description.is_empty() => {
                println!("{}: {}", tool.name, first_line(description))
            }
            _ => println!("{}", tool.name),
        }
    }
    Ok(())
}

pub async fn list_prompts(config: &Config, server_id: &str) -> Result<(), Box<dyn Error>> {
    let (manager, id) = connect_one(config, server_id).await?;
    let result = manager.list_prompts(&id).await;
    manager.disconnect_all().await;

    let prompts = result?;
    if prompts.is_empty() {
        println!("{id} exposes no prompts.");
        return Ok(());
    }
    for prompt in prompts {
        let arguments: Vec<String> = prompt
            .arguments
            .iter()
            .map(|arg| {
                if arg.required {
                    arg.name.clone()
                } else {
                    format!("[{}]", arg.name)
                }
            })
            .collect();
        println!("{} {}", prompt.name, arguments.join(" "));
        if let Some(description) = prompt.description.as_deref() {
            println!("    {}", first_line(description));
        }
    }
    Ok(())
}

pub async fn list_resources(config: &Config, server_id: &str) -> Result<(), Box<dyn Error>> {
    let (manager, id) = connect_one(config, server_id).await?;
    let result = manager.list_resources(&id).await;
    manager.disconnect_all().await;

    let resources = result?;
    if resources.is_empty() {
        println!("{id} exposes no resources.");
        return Ok(());
    }
    for resource in resources {
        let mime = resource.mime_type.as_deref().unwrap_or("unknown type");
        println!("{} ({}, {})", resource.uri, resource.name, mime);
    }
    Ok(())
}

pub(crate) fn parse_tool_args(raw: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("Tool arguments must be a JSON object.".to_string()),
        Err(err) => Err(format!("Tool arguments are not valid JSON: {err}")),
    }
}

pub async fn call_tool(
    config: &Config,
    server_id: &str,
    tool: &str,
    raw_args: &str,
    save_images: Option<&Path>,
) -> Result<(), Box<dyn Error>> {
    let arguments = parse_tool_args(raw_args)?;
    let (manager, id) = connect_one(config, server_id).await?;
    let result = manager.call_tool(&id, tool, arguments).await;
    manager.disconnect_all().await;

    let output = result?;
    print_tool_output(&output);
    if let Some(dir) = save_images {
        for path in save_inline_images(&output, tool, dir)? {
            println!("saved {}", path);
        }
    }
    Ok(())
}

fn print_tool_output(output: &ToolCallOutput) {
    for item in &output.content {
        match item {
            ToolContent::Text { text } => println!("{text}"),
            ToolContent::Image { mime_type, data } => {
                println!("[image {mime_type}, {} base64 bytes]", data.len())
            }
            ToolContent::Audio { mime_type, .. } => println!("[audio {mime_type}]"),
            ToolContent::Resource { resource } => match &resource.text {
                Some(text) => println!("{text}"),
                None => println!("[resource {}]", resource.uri),
            },
            ToolContent::ResourceLink { uri, .. } => println!("[link {uri}]"),
            ToolContent::Unknown => println!("[unsupported content]"),
        }
    }
    if output.content.is_empty() {
        if let Some(structured) = &output.structured_content {
            println!("{}", Value::Object(structured.clone()));
        }
    }
}

fn extension_for(mime_type: &str) -> &str {
    match mime_type.trim().to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        _ => "png",
    }
}

/// Decodes inline image items into `dir`, returning the written paths.
pub(crate) fn save_inline_images(
    output: &ToolCallOutput,
    tool: &str,
    dir: &Path,
) -> Result<Vec<String>, Box<dyn Error>> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::new();
    let images = output.content.iter().filter_map(|item| match item {
        ToolContent::Image { data, mime_type } => Some((data, mime_type.as_str())),
        ToolContent::Resource { resource } if resource.has_image_mime() => resource
            .blob
            .as_ref()
            .map(|blob| (blob, resource.mime_type.as_deref().unwrap_or("image/png"))),
        _ => None,
    });
    for (index, (data, mime_type)) in images.enumerate() {
        let bytes = STANDARD.decode(data.trim())?;
        let path = dir.join(format!("{tool}-{}.{}", index + 1, extension_for(mime_type)));
        std::fs::write(&path, bytes)?;
        written.push(path.display().to_string());
    }
    Ok(written)
}

pub async fn get_prompt(
    config: &Config,
    server_id: &str,
    name: &str,
    args: Vec<(String, String)>,
) -> Result<(), Box<dyn Error>> {
    let arguments: HashMap<String, String> = args.into_iter().collect();
    let (manager, id) = connect_one(config, server_id).await?;
    let result = manager.get_prompt(&id, name, arguments).await;
    manager.disconnect_all().await;

    let prompt = result?;
    if let Some(description) = prompt.description.as_deref() {
        println!("# {description}");
    }
    for message in prompt.messages {
        let role = serde_json::to_value(message.role)?;
        let body = match &message.content {
            ToolContent::Text { text } => text.clone(),
            other => serde_json::to_string(other)?,
        };
        println!("{}: {}", role.as_str().unwrap_or("user"), body);
    }
    Ok(())
}

pub async fn read_resource(
    config: &Config,
    server_id: &str,
    uri: &str,
) -> Result<(), Box<dyn Error>> {
    let (manager, id) = connect_one(config, server_id).await?;
    let result = manager.read_resource(&id, uri).await;
    manager.disconnect_all().await;

    for content in result?.contents {
        match (&content.text, &content.blob) {
            (Some(text), _) => println!("{text}"),
            (None, Some(blob)) => println!(
                "[{} binary, {} base64 bytes]",
                content.mime_type.as_deref().unwrap_or("unknown type"),
                blob.len()
            ),
            (None, None) => println!("[{} is empty]", content.uri),
        }
    }
    Ok(())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default().trim()
}
