//! Hivebot CLI — entry point.
//!
//! # Commands
//!
//! - `hivebot start` — run the queue dispatcher against a hive root
//! - `hivebot chat` — local REPL channel (drops message files, polls replies)
//! - `hivebot init` — create the hive directory layout and a default config
//! - `hivebot status` — show configuration and queue depths

mod chat;
mod helpers;
mod init_cmd;
mod status;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use hivebot_core::config::load_config;
use hivebot_core::events::FileEventSink;
use hivebot_core::layout::HiveLayout;
use hivebot_engine::Dispatcher;
use hivebot_workers::CliWorkerInvoker;

// ─────────────────────────────────────────────
// CLI definition
// ─────────────────────────────────────────────

/// 🐝 Hivebot — multi-agent orchestrator over a file queue
#[derive(Parser)]
#[command(name = "hivebot", version, about, long_about = None)]
struct Cli {
    /// Hive root directory (defaults to ~/.hivebot)
    #[arg(short, long, global = true)]
    root: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the queue dispatcher
    Start {
        /// Enable debug logging
        #[arg(long, default_value_t = false)]
        logs: bool,
    },

    /// Chat through the local queue (interactive REPL)
    Chat {
        /// Channel name stamped on deposited messages
        #[arg(long, default_value = "cli")]
        channel: String,

        /// Sender name stamped on deposited messages
        #[arg(long, default_value = "local")]
        sender: String,
    },

    /// Create the hive layout and a default config
    Init,

    /// Show configuration and queue depths
    Status,
}

// ─────────────────────────────────────────────
// Entrypoint
// ─────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let root = helpers::resolve_root(cli.root.as_deref());

    match cli.command {
        Commands::Start { logs } => {
            init_logging(logs);
            run_dispatcher(root).await
        }
        Commands::Chat { channel, sender } => {
            init_logging(false);
            chat::run(root, &channel, &sender).await
        }
        Commands::Init => init_cmd::run(root),
        Commands::Status => status::run(root),
    }
}

// ─────────────────────────────────────────────
// Start command
// ─────────────────────────────────────────────

async fn run_dispatcher(root: std::path::PathBuf) -> Result<()> {
    let layout = HiveLayout::new(&root);
    layout
        .ensure()
        .with_context(|| format!("failed to create hive layout at {}", root.display()))?;

    let config = load_config(&root);
    config
        .validate()
        .context("configuration failed validation")?;

    let events = Arc::new(FileEventSink::new(layout.events()));
    let invoker = Arc::new(
        CliWorkerInvoker::new(
            &root,
            Duration::from_secs(config.queue.worker_timeout_secs),
            config.queue.worker_stdout_cap_bytes,
        )
        .with_events(events.clone())
        .with_env(worker_env()),
    );

    info!(
        root = %root.display(),
        agents = config.agents.len(),
        teams = config.teams.len(),
        swarms = config.swarms.len(),
        "starting dispatcher"
    );

    let dispatcher = Dispatcher::new(Arc::new(config), layout, invoker, events);

    // Ctrl-C stops the poll loop; in-flight messages recover on next start.
    let stopper = dispatcher.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.stop();
        }
    });

    dispatcher.run().await;
    Ok(())
}

/// Environment forwarded to worker subprocesses. Values are handed to the
/// process environment only; nothing secret ever lands in an argv.
fn worker_env() -> HashMap<String, String> {
    ["ANTHROPIC_API_KEY", "OPENAI_API_KEY", "HOME", "PATH"]
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|v| (key.to_string(), v)))
        .collect()
}

/// Initialize tracing/logging.
fn init_logging(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("hivebot=debug,info")
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
