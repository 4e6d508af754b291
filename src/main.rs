// notesync CLI - Run a sync node or operate on a local replica

use clap::{Args, Parser, Subcommand};
use notesync::ledger::{EntityType, LedgerError};
use notesync::sync::{SessionOutcome, SyncEngine, SyncError};
use notesync::transport::{TcpChannel, TcpSyncServer, TransportError};
use notesync::{ConfigError, EngineConfig, Replica};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "notesync")]
#[command(about = "Entity synchronization for a hierarchical note store")]
struct Cli {
    /// Database directory
    #[arg(long, global = true, default_value = "notesync.db")]
    db: PathBuf,

    #[command(flatten)]
    tuning: Tuning,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Args)]
struct Tuning {
    /// Changes per page
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Per request timeout in seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    /// Retries for retryable failures
    #[arg(long, global = true)]
    max_retries: Option<u32>,

    /// Seconds between scheduled syncs, 0 disables the scheduler
    #[arg(long, global = true)]
    interval_secs: Option<u64>,
}

impl Tuning {
    fn config(&self) -> Result<EngineConfig, ConfigError> {
        let mut config = EngineConfig::new();
        if let Some(size) = self.batch_size {
            config = config.with_batch_size(size);
        }
        if let Some(secs) = self.timeout_secs {
            config = config.with_request_timeout_secs(secs);
        }
        if let Some(retries) = self.max_retries {
            config = config.with_max_retries(retries);
        }
        if let Some(secs) = self.interval_secs {
            config = config.with_sync_interval_secs((secs > 0).then_some(secs));
        }
        config.validate()?;
        Ok(config)
    }
}

/// `name=host:port`
#[derive(Clone, Debug)]
struct TcpPeer {
    name: String,
    address: String,
}

impl FromStr for TcpPeer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((name, address)) if !name.is_empty() && !address.is_empty() => Ok(Self {
                name: name.to_string(),
                address: address.to_string(),
            }),
            _ => Err(format!("expected name=host:port, got {:?}", s)),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Answer sync requests and sync with peers on a timer
    Serve {
        #[arg(long, default_value = "127.0.0.1:7420")]
        listen: String,
        /// Peer as name=host:port, repeatable
        #[arg(long = "peer")]
        peers: Vec<TcpPeer>,
    },
    /// Run one session against a peer
    Sync { peer: TcpPeer },
    /// Check a peer is reachable and still the same instance
    Test { peer: TcpPeer },
    /// Create or replace an entity
    Put {
        entity_type: EntityType,
        entity_id: String,
        content: String,
    },
    /// Erase an entity
    Erase {
        entity_type: EntityType,
        entity_id: String,
    },
    /// Print the current content of an entity
    Get {
        entity_type: EntityType,
        entity_id: String,
    },
    /// Cursors and last error of a peer
    Status { peer: String },
    /// Ledger and sector statistics
    Stats,
    /// Verify the sector index against the ledger
    Check,
    /// Stream everything with a peer at the next session
    ForceFullSync { peer: String },
    /// Record ledger entries for entities written without one
    Fill,
    /// Re-stream one sector with a peer at the next session
    QueueSector { peer: String, sector: u8 },
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = cli.tuning.config()?;
    let replica = Arc::new(Replica::open(&cli.db)?);
    let engine = Arc::new(SyncEngine::new(replica.clone(), config.clone())?);

    match cli.cmd {
        Command::Serve { listen, peers } => {
            for peer in &peers {
                register(&engine, peer, &config);
            }
            let server =
                TcpSyncServer::bind(&listen, engine.responder(), config.max_frame_bytes).await?;
            info!(address = %server.local_addr()?, instance = %replica.instance_id(), "serving");

            let (stop, stopped) = watch::channel(false);
            let server = server.spawn(stopped);
            let scheduler = engine.spawn_scheduler();

            // Ctrl-C is the only way out
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            engine.shutdown();
            stop.send_replace(true);
            let _ = server.await;
            if let Some(scheduler) = scheduler {
                let _ = scheduler.await;
            }
            replica.store().flush_async().await.map_err(LedgerError::from)?;
        }
        Command::Sync { peer } => {
            register(&engine, &peer, &config);
            let result = engine.sync_with_retry(&peer.name).await;
            match SessionOutcome::from_result(&result) {
                SessionOutcome::Success => println!("sync with {} succeeded", peer.name),
                SessionOutcome::PartialSuccess { skipped } => {
                    println!("sync with {} succeeded, {} changes skipped", peer.name, skipped)
                }
                SessionOutcome::Failed { retryable, error } => {
                    println!("sync with {} failed (retryable: {}): {}", peer.name, retryable, error)
                }
            }
            if let Ok(report) = &result {
                println!(
                    "  full: {}  sectors: {:?}  pulled: {}  adopted: {}  kept local: {}  pushed: {}",
                    report.full_sync,
                    report.divergent_sectors,
                    report.pulled,
                    report.adopted,
                    report.kept_local,
                    report.pushed
                );
                for skipped in &report.skipped {
                    println!("  skipped {}", skipped);
                }
            }
            result?;
        }
        Command::Test { peer } => {
            register(&engine, &peer, &config);
            let hello = engine.test_peer(&peer.name).await?;
            println!(
                "{} is instance {} at sequence {} (knows us: {})",
                peer.name, hello.instance_id, hello.head_sequence, hello.knows_requester
            );
        }
        Command::Put {
            entity_type,
            entity_id,
            content,
        } => {
            let change = replica.entities().put(entity_type, &entity_id, content.as_bytes())?;
            println!("{} {} -> seq {}", entity_type, entity_id, change.sequence_id());
        }
        Command::Erase {
            entity_type,
            entity_id,
        } => {
            let change = replica.entities().erase(entity_type, &entity_id)?;
            println!("{} {} erased -> seq {}", entity_type, entity_id, change.sequence_id());
        }
        Command::Get {
            entity_type,
            entity_id,
        } => match replica.entities().get_current_state(entity_type, &entity_id)? {
            Some(content) => println!("{}", String::from_utf8_lossy(&content)),
            None => println!("{} {} not found", entity_type, entity_id),
        },
        Command::Status { peer } => {
            let status = engine.get_sync_status(&peer)?;
            match &status.state {
                Some(state) => {
                    println!("peer:            {}", state.peer());
                    match state.peer_instance_id() {
                        Some(id) => println!("instance:        {}", id),
                        None => println!("instance:        (not pinned)"),
                    }
                    println!("last pushed:     {}", state.last_pushed_sequence());
                    println!("last pulled:     {}", state.last_pulled_sequence());
                    match state.last_full_sync_at() {
                        Some(at) => println!("last full sync:  {}", at.to_rfc3339()),
                        None => println!("last full sync:  never"),
                    }
                    println!("full pending:    {}", state.full_sync_pending());
                    let queued: Vec<u8> = state.queued_sectors().collect();
                    if !queued.is_empty() {
                        println!("queued sectors:  {:?}", queued);
                    }
                }
                None => println!("no sync state for {}", peer),
            }
            if let Some(error) = &status.last_error {
                println!("last error:      {}", error);
            }
        }
        Command::Stats => {
            let stats = engine.get_stats()?;
            println!("instance:     {}", stats.instance_id);
            println!("ledger size:  {}", stats.ledger_size);
            println!("keys:         {}", stats.key_count);
            println!("entities:     {}", stats.entity_count);
            println!("head:         {}", stats.head_sequence);
            println!("sectors:      {}", stats.sector_count);
            let populated = stats.per_sector_counts.iter().filter(|c| **c > 0).count();
            println!("populated:    {}", populated);
            for status in &stats.peers {
                let cursors = status
                    .state
                    .as_ref()
                    .map(|s| format!("pushed {} pulled {}", s.last_pushed_sequence(), s.last_pulled_sequence()))
                    .unwrap_or_else(|| "no state".to_string());
                println!("peer {}: {}", status.peer, cursors);
            }
        }
        Command::Check => {
            engine.check_integrity()?;
            println!("sector index matches the ledger");
        }
        Command::ForceFullSync { peer } => {
            engine.force_full_sync(&peer)?;
            println!("{} will stream everything at the next session", peer);
        }
        Command::Fill => {
            let written = replica.entities().fill_entity_changes()?;
            println!("{} ledger entries written", written);
        }
        Command::QueueSector { peer, sector } => {
            engine.queue_sector(&peer, sector)?;
            println!("sector {} queued for {}", sector, peer);
        }
    }

    replica.store().flush().map_err(LedgerError::from)?;
    Ok(())
}

fn register(engine: &SyncEngine, peer: &TcpPeer, config: &EngineConfig) {
    engine.register_peer(
        &peer.name,
        Arc::new(TcpChannel::new(&peer.address, config.max_frame_bytes)),
    );
}
