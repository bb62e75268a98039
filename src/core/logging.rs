//! Diagnostic logging setup.
//!
//! Logs go to stderr (or `--log FILE`) so stdout stays a clean event stream.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directives, e.g.
/// `MCPCHAT_LOG=mcpchat::mcp=debug`.
pub const LOG_ENV: &str = "MCPCHAT_LOG";
const DEFAULT_DIRECTIVES: &str = "mcpchat=info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Installs the global subscriber. A second call leaves the first in place.
pub fn init_tracing(log_file: Option<&Path>) -> io::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true);

    let installed = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(io::stderr).try_init(),
    };

    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_is_created_and_reinit_is_harmless() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mcpchat.log");

        init_tracing(Some(&path)).expect("first init");
        assert!(path.exists());
        init_tracing(None).expect("second init");
    }

    #[test]
    fn unwritable_log_path_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing").join("mcpchat.log");
        assert!(init_tracing(Some(&path)).is_err());
    }
}
