//! `mcpchat chat`: one orchestrated turn, printed as JSON lines.

use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::GeminiClient;
use crate::core::config::{Config, McpServerConfig};
use crate::core::conversation::Content;
use crate::core::events::ChatEvent;
use crate::core::{OrchestrationError, Orchestrator, TurnRequest};
use crate::mcp::{ConnectionManager, ManagerOptions};

pub(crate) fn load_history(path: &Path) -> Result<Vec<Content>, Box<dyn Error>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw)
        .map_err(|err| format!("History file {} is not valid: {err}", path.display()).into())
}

pub(crate) fn save_history(path: &Path, contents: &[Content]) -> Result<(), Box<dyn Error>> {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut temp_file = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut temp_file, contents)?;
    temp_file.persist(path)?;
    Ok(())
}

pub async fn run_chat(
    config: &Config,
    message: String,
    history_path: Option<&Path>,
) -> Result<(), Box<dyn Error>> {
    if message.trim().is_empty() {
        return Err("Usage: mcpchat chat <message>".into());
    }
    let history = match history_path {
        Some(path) => load_history(path)?,
        None => Vec::new(),
    };
    let model = GeminiClient::from_settings(&config.model, &config.timeouts)?;

    let manager = Arc::new(ConnectionManager::with_default_connector(
        ManagerOptions::from_settings(&config.timeouts),
    ));
    let enabled: Vec<McpServerConfig> = config.enabled_servers().cloned().collect();
    for status in manager.connect_all(&enabled).await {
        if !status.connected {
            warn!(
                server_id = %status.server_id,
                error = status.error.as_deref().unwrap_or_default(),
                "MCP server unavailable for this turn"
            );
        }
    }

    let orchestrator = Orchestrator::new(manager.clone(), Arc::new(model))
        .with_max_iterations(config.orchestration.max_iterations());

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted; cancelling turn");
                cancel.cancel();
            }
        })
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<ChatEvent>();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(err) => warn!(error = %err, kind = event.kind(), "Could not encode event"),
            }
        }
    });

    let request = TurnRequest::new(message).with_history(history);
    let result = orchestrator.run_turn(request, &tx, &cancel).await;
    drop(tx);
    let _ = printer.await;
    interrupt.abort();
    manager.disconnect_all().await;

    match result {
        Ok(outcome) => {
            if let Some(path) = history_path {
                save_history(path, &outcome.contents)?;
            }
            Ok(())
        }
        Err(OrchestrationError::Cancelled) => {
            eprintln!("Cancelled.");
            Ok(())
        }
        // Already reported on the event stream.
        Err(OrchestrationError::Model(err)) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_round_trips_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("history.json");
        assert!(load_history(&path).expect("missing file").is_empty());

        let turns = vec![Content::user_text("hi"), Content::model_text("hello")];
        save_history(&path, &turns).expect("save");
        assert_eq!(load_history(&path).expect("load"), turns);
    }

    #[test]
    fn malformed_history_names_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.json");
        std::fs::write(&path, "{not json").expect("write");
        let err = load_history(&path).expect_err("invalid");
        assert!(err.to_string().contains("history.json"));
    }
}
