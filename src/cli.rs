use crate::config::types::{RunConfig, SandboxError};
use crate::config::validator::validate_config;
use crate::exec::coordinator::{cancel_pair, CancelHandle};
use crate::kernel::signal::SignalHandler;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one command in a fresh sandbox and print the JSON report
    Run {
        /// Configuration file (JSON); read from stdin when omitted
        #[arg(long)]
        config: Option<PathBuf>,
        /// Pretty-print the report
        #[arg(long)]
        pretty: bool,
    },
    /// Check a configuration without running it
    Validate {
        /// Configuration file (JSON); read from stdin when omitted
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Binary entry point. Exit code 0 when a report was produced, 1 when the
/// configuration was rejected.
pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config, pretty } => {
            let config = load_config(config.as_deref())?;
            let signals =
                SignalHandler::init().map_err(|e| anyhow::anyhow!("signal setup: {}", e))?;

            let (handle, cancel) = cancel_pair();
            let (done_tx, done_rx) = bounded::<()>(0);
            let watcher = thread::Builder::new()
                .name("runj-signals".to_string())
                .spawn(move || watch_signals(signals, handle, done_rx))
                .context("failed to spawn signal watcher")?;

            let result = crate::run_with_cancel(&config, &cancel);
            drop(done_tx);
            let _ = watcher.join();

            match result {
                Ok(report) => {
                    let json = if pretty {
                        serde_json::to_string_pretty(&report)?
                    } else {
                        serde_json::to_string(&report)?
                    };
                    println!("{}", json);
                }
                Err(SandboxError::Config(errors)) => {
                    eprintln!("Invalid configuration: {}", errors);
                    std::process::exit(1);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Validate { config } => {
            let config = load_config(config.as_deref())?;
            let result = validate_config(&config);
            for warning in &result.warnings {
                println!("warning: {}", warning);
            }
            for error in &result.errors {
                println!("error: {}", error);
            }
            if !result.is_valid() {
                std::process::exit(1);
            }
            println!("configuration is valid");
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    let raw = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("failed to read configuration from stdin")?;
            raw
        }
    };
    serde_json::from_str(&raw).context("configuration is not valid JSON for a run")
}

/// Turn SIGINT/SIGTERM into run cancellation until `done` is dropped
fn watch_signals(signals: SignalHandler, handle: CancelHandle, done: Receiver<()>) {
    loop {
        if signals.shutdown_requested() {
            log::warn!("Received signal {}, cancelling run", signals.get_signal());
            handle.cancel();
            return;
        }
        match done.recv_timeout(SignalHandler::poll_interval()) {
            Err(RecvTimeoutError::Timeout) => continue,
            _ => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(
            &path,
            r#"{"command": "/bin/echo 'hello world'", "limits": {"time_ms": 500}}"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.command, vec!["/bin/echo", "hello world"]);
        assert_eq!(config.limits.time_ms, Some(500));
    }

    #[test]
    fn test_load_config_rejects_garbage() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }
}
