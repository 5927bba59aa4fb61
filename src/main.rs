//! Chatclimb CLI
//!
//! Reads host commands as JSON lines on stdin and writes replies and host
//! events as JSON lines on stdout. Logs go to stderr. The tree starts from
//! an optional snapshot; the host streams later rendering in through the
//! tree commands (`append-node`, `set-text`, ...).

use chatclimb::{ChatStore, ClimbConfig, Dispatcher, Document, HostEvent, LiveTree};
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Chatclimb - extract and thread conversation history from a chat tree
#[derive(Parser, Debug)]
#[command(name = "chatclimb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.chatclimb/config.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// JSON snapshot of the host tree to load at startup
    #[arg(long)]
    snapshot: Option<PathBuf>,

    /// Initial location, e.g. https://chat.example.com/app/abc123def
    #[arg(long)]
    location: Option<String>,

    /// Directory for stored transcripts and thread maps
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// Verbose output: log at debug level
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Config is read first so its `verbose` setting can pick the log level
    let mut config = match &cli.config {
        Some(path) => ClimbConfig::load(path).await?,
        None => ClimbConfig::load_default().await?,
    };
    if let Some(dir) = cli.store_dir.clone() {
        config = config.with_store_dir(dir);
    }
    let verbose = cli.verbose || config.verbose;
    config = config.with_verbose(verbose);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_log_level(config.verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let doc = match &cli.snapshot {
        Some(path) => {
            let json = tokio::fs::read_to_string(path).await?;
            Document::from_json(&json)?
        }
        None => Document::new(),
    };
    info!("Starting Chatclimb with {} tree nodes", doc.len());
    info!("Store directory: {:?}", config.store_dir);

    let store = ChatStore::new(&config.store_dir).await?;
    let (event_tx, mut event_rx) = mpsc::channel::<HostEvent>(64);
    let dispatcher = Dispatcher::new(LiveTree::new(doc), &config, store, Some(event_tx))?;
    if let Some(location) = &cli.location {
        dispatcher.set_location(location).await;
    }

    // Replies and events share stdout, one JSON object per line
    let (output_tx, mut output_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        while let Some(line) = output_rx.recv().await {
            let mut stdout = io::stdout().lock();
            if let Err(e) = writeln!(stdout, "{}", line) {
                error!("Error writing stdout: {}", e);
                break;
            }
            let _ = stdout.flush();
        }
    });

    let event_out = output_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event_line(&event) {
                Ok(line) => {
                    if event_out.send(line).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to encode event: {}", e),
            }
        }
    });

    let (input_tx, mut input_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if input_tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("Error reading stdin: {}", e);
                    break;
                }
            }
        }
    });

    while let Some(line) = input_rx.recv().await {
        if line.trim().is_empty() {
            continue;
        }
        let reply = dispatcher.handle_line(&line).await;
        if output_tx.send(reply.to_string()).await.is_err() {
            break;
        }
    }

    info!("Input closed, shutting down");
    dispatcher.shutdown().await;
    drop(dispatcher);
    let _ = forwarder.await;
    drop(output_tx);
    let _ = writer.await;

    Ok(())
}

fn default_log_level(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

fn event_line(event: &HostEvent) -> serde_json::Result<String> {
    serde_json::to_string(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_flags() {
        let cli = Cli::try_parse_from([
            "chatclimb",
            "--snapshot",
            "tree.json",
            "--location",
            "/app/abcdef123456",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.snapshot, Some(PathBuf::from("tree.json")));
        assert_eq!(cli.location.as_deref(), Some("/app/abcdef123456"));
        assert!(cli.verbose);
        assert!(cli.config.is_none());
    }

    #[tokio::test]
    async fn test_config_verbose_sets_log_level() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "verbose = true\n").unwrap();

        let config = ClimbConfig::load(&path).await.unwrap();
        let cli = Cli::try_parse_from(["chatclimb"]).unwrap();
        assert!(!cli.verbose);
        assert_eq!(default_log_level(cli.verbose || config.verbose), "debug");
        assert_eq!(default_log_level(false), "info");
    }

    #[test]
    fn test_event_line() {
        let line = event_line(&HostEvent::UpdateProgress { count: 3 }).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["action"], "updateProgress");
        assert_eq!(parsed["count"], 3);
    }
}
