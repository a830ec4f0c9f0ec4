//! Command line interface.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use zlink_core::sqlite_store::SqliteStore;
use zlink_core::{ConnectionEvent, PeerNode, ReconnectEvent, Store, TransferDirection, TransferRecord, TransferStatus};
use zlink_security::Signer;
use zlink_transport::ConnectionState;

use crate::config::AgentConfig;
use crate::identity;
use crate::runtime::Agent;

/// zippy-link agent
#[derive(Parser, Debug)]
#[command(name = "zlink-agent")]
#[command(version, about = "Keeps a paired link up, serves commands and moves files")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level or filter directive (RUST_LOG wins if set)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Keep the link up and serve commands until Ctrl-C
    Serve,

    /// Send one command and print the result
    Call {
        /// Method name, e.g. system:status
        method: String,
        /// JSON parameters
        #[arg(default_value = "{}")]
        params: String,
    },

    /// Upload a file to the peer and wait for it to finish
    Send {
        path: PathBuf,
    },

    /// List transfers from the local store
    Transfers {
        /// Include finished transfers
        #[arg(long)]
        all: bool,
    },

    /// Print the local identity, creating it if needed
    Identity,
}

impl Cli {
    pub async fn execute(self, config: AgentConfig) -> anyhow::Result<()> {
        match self.command {
            Commands::Serve => serve(config).await,
            Commands::Call { method, params } => call(config, &method, &params).await,
            Commands::Send { path } => send(config, path).await,
            Commands::Transfers { all } => transfers(config, all).await,
            Commands::Identity => print_identity(&config),
        }
    }
}

// ============================================================================
// serve
// ============================================================================

async fn serve(config: AgentConfig) -> anyhow::Result<()> {
    let agent = Agent::start(config).await?;
    info!(identity = %agent.node.identity(), recovered = agent.recovered.len(), "agent ready");

    let monitor = tokio::spawn(monitor(agent.node.clone()));

    let result = tokio::select! {
        res = agent.connect_with_backoff() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted before the link came up");
            monitor.abort();
            agent.shutdown().await;
            return Ok(());
        }
    };
    if let Err(e) = result {
        monitor.abort();
        agent.shutdown().await;
        return Err(e);
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    monitor.abort();
    agent.shutdown().await;
    Ok(())
}

/// Log peer events, connection changes and transfer progress. Paused
/// outbound transfers are resumed whenever the link comes back.
async fn monitor(node: std::sync::Arc<PeerNode>) {
    let mut events = node.events();
    let mut connection = node.connection().events();
    let mut progress = node.transfers().progress_stream();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => info!(name = %event.name, payload = %event.payload, "peer event"),
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "peer events lagged"),
                Err(RecvError::Closed) => break,
            },
            event = connection.recv() => match event {
                Ok(ConnectionEvent::StateChanged(ConnectionState::Connected)) => {
                    info!("link up");
                    resume_paused(&node).await;
                }
                Ok(ConnectionEvent::StateChanged(state)) => info!(state = %state, "link state"),
                Ok(ConnectionEvent::Reconnect(ReconnectEvent::Scheduled { attempt, max_attempts, delay })) => {
                    info!(attempt, max_attempts, delay_ms = delay.as_millis() as u64, "reconnecting");
                }
                Ok(ConnectionEvent::Reconnect(event)) => debug!(?event, "reconnect"),
                Ok(ConnectionEvent::HeartbeatTimeout { elapsed }) => {
                    warn!(elapsed_ms = elapsed.as_millis() as u64, "heartbeat timeout");
                }
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "connection events lagged"),
                Err(RecvError::Closed) => break,
            },
            update = progress.recv() => match update {
                Ok(p) => debug!(
                    transfer_id = %p.transfer_id,
                    status = p.status.as_str(),
                    completed = p.completed_chunks,
                    total = p.total_chunks,
                    "transfer progress"
                ),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
    }
}

async fn resume_paused(node: &PeerNode) {
    let paused = node
        .transfers()
        .list()
        .into_iter()
        .filter(|r| r.direction == TransferDirection::Outbound && r.status == TransferStatus::Paused && r.can_resume());
    for record in paused {
        match node.transfers().resume_transfer(&record.transfer_id).await {
            Ok(()) => info!(transfer_id = %record.transfer_id, "resumed transfer"),
            Err(e) => warn!(transfer_id = %record.transfer_id, error = %e, "resume failed"),
        }
    }
}

// ============================================================================
// call
// ============================================================================

async fn call(config: AgentConfig, method: &str, params: &str) -> anyhow::Result<()> {
    let params: Value = serde_json::from_str(params).context("params must be JSON")?;

    let agent = Agent::start(config).await?;
    let result = async {
        agent.connect().await?;
        let value: Value = agent.node.call(method, params).await?;
        anyhow::Ok(value)
    }
    .await;
    agent.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}

// ============================================================================
// send
// ============================================================================

async fn send(config: AgentConfig, path: PathBuf) -> anyhow::Result<()> {
    let agent = Agent::start(config).await?;
    let result = upload(&agent, &path).await;
    agent.shutdown().await;

    let record = result?;
    println!("{} {} ({} bytes)", record.transfer_id, record.status.as_str(), record.bytes_transferred);
    if record.status != TransferStatus::Completed {
        anyhow::bail!(
            "transfer ended {}: {}",
            record.status.as_str(),
            record.error.as_deref().unwrap_or("no reason given")
        );
    }
    Ok(())
}

async fn upload(agent: &Agent, path: &std::path::Path) -> anyhow::Result<TransferRecord> {
    let node = &agent.node;
    agent.connect_with_backoff().await?;

    let mut progress = node.transfers().progress_stream();
    let mut connection = node.connection().events();
    let transfer_id = node.transfers().request_upload(path).await?;
    info!(transfer_id = %transfer_id, path = %path.display(), "upload requested");

    loop {
        tokio::select! {
            update = progress.recv() => match update {
                Ok(p) if p.transfer_id == transfer_id => {
                    info!(
                        status = p.status.as_str(),
                        completed = p.completed_chunks,
                        total = p.total_chunks,
                        "progress"
                    );
                    if p.status.is_terminal() {
                        break;
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            event = connection.recv() => {
                if let Ok(ConnectionEvent::StateChanged(ConnectionState::Connected)) = event {
                    resume_paused(node).await;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(transfer_id = %transfer_id, "interrupted, pausing");
                node.transfers().pause_transfer(&transfer_id).await?;
                break;
            }
        }
    }

    node.transfers()
        .get(&transfer_id)
        .with_context(|| format!("transfer {} disappeared", transfer_id))
}

// ============================================================================
// transfers
// ============================================================================

async fn transfers(config: AgentConfig, all: bool) -> anyhow::Result<()> {
    let path = config.database_path();
    if !path.exists() {
        println!("no transfers");
        return Ok(());
    }
    let store = SqliteStore::new(&path).with_context(|| format!("opening {}", path.display()))?;
    let records = if all {
        store.list_transfers().await?
    } else {
        store.load_active_transfers().await?
    };
    if records.is_empty() {
        println!("no transfers");
        return Ok(());
    }
    println!("{}", transfer_table(&records));
    Ok(())
}

fn transfer_table(records: &[TransferRecord]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["ID", "Direction", "File", "Status", "Progress", "Updated"]);
    for r in records {
        table.add_row(vec![
            r.transfer_id.clone(),
            r.direction.as_str().to_string(),
            r.file_name.clone(),
            r.status.as_str().to_string(),
            format!(
                "{}/{} ({:.0}%)",
                r.completed_chunks,
                r.total_chunks,
                r.progress_fraction() * 100.0
            ),
            r.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    table
}

// ============================================================================
// identity
// ============================================================================

fn print_identity(config: &AgentConfig) -> anyhow::Result<()> {
    let path = config.identity_path();
    let (signer, created) = identity::load_or_create(&path)?;
    println!("{}", signer.identity());
    if created {
        eprintln!("created {}", path.display());
    }
    Ok(())
}
