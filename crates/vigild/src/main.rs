//! vigild: the Vigil agent daemon.
//!
//! Runs the local agent: registers configured services and checks,
//! restores what was persisted in the data directory, keeps proxies in line
//! with central config entries, and reaps services stuck critical.
//!
//! # Usage
//!
//! ```text
//! vigild agent --config /etc/vigil/vigil.toml
//! vigild agent --dev
//! ```
//!
//! `SIGHUP` re-reads the config file; Ctrl-C shuts down.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

use vigil_agent::{Agent, ConfigEntryStore, ResolvedConfigCache};
use vigil_core::AgentConfig;

#[derive(Parser)]
#[command(name = "vigild", about = "Vigil agent daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent.
    Agent {
        /// Path to vigil.toml.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the data directory from the config file.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// In-memory agent; nothing is persisted.
        #[arg(long)]
        dev: bool,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Agent {
            config,
            data_dir,
            dev,
            log_json,
        } => {
            init_tracing(log_json);
            let overrides = Overrides { data_dir, dev };
            run_agent(config, overrides).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,vigild=debug,vigil=debug"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Command-line settings that win over the config file.
struct Overrides {
    data_dir: Option<PathBuf>,
    dev: bool,
}

fn load_config(path: Option<&Path>, overrides: &Overrides) -> anyhow::Result<AgentConfig> {
    let mut config = match path {
        Some(path) => AgentConfig::from_file(path)?,
        None if overrides.dev => AgentConfig::dev(),
        None => anyhow::bail!("--config is required unless --dev is set"),
    };
    if let Some(dir) = &overrides.data_dir {
        config.data_dir = dir.clone();
    }
    if overrides.dev {
        config.dev_mode = true;
    }
    Ok(config)
}

async fn run_agent(config_path: Option<PathBuf>, overrides: Overrides) -> anyhow::Result<()> {
    let config = load_config(config_path.as_deref(), &overrides)?;
    info!(
        node = %config.node_name,
        datacenter = %config.datacenter,
        dev = config.dev_mode,
        "Vigil agent starting"
    );

    if !config.dev_mode {
        std::fs::create_dir_all(&config.data_dir)?;
        info!(path = ?config.data_dir, "data directory ready");
    }

    // ── Central config ─────────────────────────────────────────

    let entries = Arc::new(ConfigEntryStore::new(&config.config_entries));
    let cache = Arc::new(ResolvedConfigCache::new(Arc::clone(&entries)));
    info!(entries = config.config_entries.len(), "config entries loaded");

    // ── Agent ──────────────────────────────────────────────────

    let agent = Agent::new(config, cache, None);
    if let Err(e) = agent.load_tokens() {
        warn!(error = %e, "failed to load persisted tokens, continuing with configured tokens");
    }
    agent.start().await?;

    // ── Signals ────────────────────────────────────────────────

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!(error = %e, "failed to listen for ctrl-c");
                }
                info!("shutdown signal received");
                break;
            }
            _ = hangup.recv() => {
                info!("reload signal received");
                match load_config(config_path.as_deref(), &overrides) {
                    Ok(config) => {
                        for entry in &config.config_entries {
                            entries.set(entry.clone());
                        }
                        if let Err(e) = agent.reload(config).await {
                            error!(error = %e, "reload failed");
                        }
                    }
                    Err(e) => error!(error = %e, "failed to read config, keeping the current one"),
                }
            }
        }
    }

    agent.shutdown().await;
    info!("Vigil agent stopped");
    Ok(())
}
