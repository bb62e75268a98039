pub mod config;
pub mod conversation;
pub mod events;
pub mod logging;
pub mod orchestrator;
pub mod schema;

pub use orchestrator::{OrchestrationError, Orchestrator, TurnOutcome, TurnRequest};
