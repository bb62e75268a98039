//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the appropriate commands.

pub mod chat;
pub mod inspect;
pub mod servers;

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};

use crate::core::config::{Config, ConfigError, McpTransportKind};
use crate::core::logging::init_tracing;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\ncommit:  ",
    env!("VERGEN_GIT_DESCRIBE"),
    " (",
    env!("VERGEN_GIT_SHA"),
    ")\nbuilt:   ",
    env!("VERGEN_BUILD_DATE"),
    "\nrustc:   ",
    env!("VERGEN_RUSTC_SEMVER"),
);

#[derive(Parser)]
#[command(name = "mcpchat")]
#[command(version, long_version = LONG_VERSION)]
#[command(about = "Chat with a model that can call tools on MCP servers")]
#[command(
    long_about = "mcpchat connects to the MCP servers listed in its config file and lets a \
Gemini model call their tools while answering a message.\n\n\
Environment Variables:\n\
  GEMINI_API_KEY    Model API key (the variable name is configurable under [model])\n\
  MCPCHAT_LOG       Log filter directives, e.g. mcpchat=debug\n\n\
Events from `mcpchat chat` are printed to stdout as JSON lines; logs go to stderr."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file to use instead of the platform default
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(short = 'l', long, global = true, value_name = "FILE")]
    pub log: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TransportArg {
    Stdio,
    StreamableHttp,
    Sse,
}

impl From<TransportArg> for McpTransportKind {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Stdio => McpTransportKind::Stdio,
            TransportArg::StreamableHttp => McpTransportKind::StreamableHttp,
            TransportArg::Sse => McpTransportKind::Sse,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// List configured MCP servers
    Servers,
    /// Connect to every enabled server and report whether it answers
    Status,
    /// Add an MCP server to the config file
    AddServer {
        /// Server id used by other commands
        id: String,
        #[arg(long, value_enum, default_value_t = TransportArg::Stdio)]
        transport: TransportArg,
        /// Display name (defaults to the id)
        #[arg(long)]
        name: Option<String>,
        /// Executable to spawn (stdio)
        #[arg(long)]
        command: Option<String>,
        /// Argument passed to the command; repeatable
        #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
        args: Vec<String>,
        /// Environment variable for the command, KEY=VALUE; repeatable
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        env: Vec<(String, String)>,
        /// Endpoint URL (streamable-http, sse)
        #[arg(long)]
        url: Option<String>,
        /// HTTP header, KEY=VALUE; repeatable
        #[arg(long = "header", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        headers: Vec<(String, String)>,
        /// Add the server without enabling it
        #[arg(long)]
        disabled: bool,
    },
    /// Remove an MCP server from the config file
    RemoveServer { id: String },
    /// List the tools a server exposes
    Tools { server: String },
    /// List the prompts a server exposes
    Prompts { server: String },
    /// List the resources a server exposes
    Resources { server: String },
    /// Call one tool directly
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        /// Directory to write returned inline images into
        #[arg(long, value_name = "DIR")]
        save_images: Option<PathBuf>,
    },
    /// Fetch a prompt
    Prompt {
        server: String,
        name: String,
        /// Prompt argument, KEY=VALUE; repeatable
        #[arg(long = "arg", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        args: Vec<(String, String)>,
    },
    /// Read a resource
    Read { server: String, uri: String },
    /// Run one chat turn with every enabled server's tools
    Chat {
        /// Message to send
        #[arg(required = true, trailing_var_arg = true)]
        message: Vec<String>,
        /// JSON conversation file; read before the turn and rewritten after it
        #[arg(long, value_name = "FILE")]
        history: Option<PathBuf>,
    },
}

pub(crate) fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

pub(crate) fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Config::config_path(),
    }
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(args.log.as_deref())?;

    let config_path = resolve_config_path(args.config.as_deref())?;
    let config = Config::load_from_path(&config_path)?;

    match args.command {
        Commands::Servers => {
            servers::list_servers(&config, &config_path);
            Ok(())
        }
        Commands::AddServer {
            id,
            transport,
            name,
            command,
            args: command_args,
            env,
            url,
            headers,
            disabled,
        } => {
            let server = servers::ServerSpec {
                id,
                transport: transport.into(),
                name,
                command,
                args: command_args,
                env,
                url,
                headers,
                enabled: !disabled,
            }
            .into_config();
            servers::add_server(config, &config_path, server)
        }
        Commands::Status => inspect::server_status(&config).await,
        Commands::RemoveServer { id } => servers::remove_server(config, &config_path, &id),
        Commands::Tools { server } => inspect::list_tools(&config, &server).await,
        Commands::Prompts { server } => inspect::list_prompts(&config, &server).await,
        Commands::Resources { server } => inspect::list_resources(&config, &server).await,
        Commands::Call {
            server,
            tool,
            args: raw_args,
            save_images,
        } => inspect::call_tool(&config, &server, &tool, &raw_args, save_images.as_deref()).await,
        Commands::Prompt {
            server,
            name,
            args: prompt_args,
        } => inspect::get_prompt(&config, &server, &name, prompt_args).await,
        Commands::Read { server, uri } => inspect::read_resource(&config, &server, &uri).await,
        Commands::Chat { message, history } => {
            chat::run_chat(&config, message.join(" "), history.as_deref()).await
        }
    }
}
