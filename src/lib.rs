//! mcpchat lets a language model call tools hosted on MCP servers.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`mcp`] owns server connections: transports (stdio, streamable HTTP,
//!   SSE), initialized sessions, and the [`mcp::ConnectionManager`] registry.
//! - [`core`] holds configuration, conversation types, the tool schema
//!   translator, and the function-calling [`core::Orchestrator`].
//! - [`api`] defines the model collaborator and its Gemini client.
//!
//! The binary (`src/main.rs`) routes through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod mcp;
pub mod utils;
