//! Unisync indexer: rebuilds Unirep attester state from contract events.
//!
//! This binary provides:
//! - `run`: set up, catch up and follow the chain until Ctrl+C
//! - `status`: per-attester cursors and table counts
//! - `init-db`: create and migrate a database
//! - `ingest-subgraph`: fill the database from a subgraph instead of the chain

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use unisync_core::AttesterId;
use unisync_indexer::config::{AttesterSelection, Config, LoggingConfig};
use unisync_indexer::listener::{EventSource, RpcProvider};
use unisync_indexer::notify::Notification;
use unisync_indexer::storage::Storage;
use unisync_indexer::subgraph::{GraphqlClient, SubgraphSynchronizer};
use unisync_indexer::{Synchronizer, UnirepState};

#[derive(Parser)]
#[command(name = "unisync-indexer")]
#[command(version, about = "Unirep event synchronizer", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "unisync.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize until interrupted
    Run,

    /// Show cursors and table counts
    Status,

    /// Initialize the database
    InitDb {
        /// Database URL
        #[arg(long, default_value = "sqlite://unisync.db")]
        database_url: String,
    },

    /// Ingest a subgraph into the database
    IngestSubgraph {
        /// Only ingest this attester (decimal or 0x hex)
        #[arg(long)]
        attester: Option<AttesterId>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it can be read
    let logging = Config::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(cli.debug, &logging)?;

    info!("Unisync indexer starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&cli.config).await?,
        Commands::Status => show_status(&cli.config).await?,
        Commands::InitDb { database_url } => init_database(&database_url).await?,
        Commands::IngestSubgraph { attester } => ingest_subgraph(&cli.config, attester).await?,
    }

    Ok(())
}

/// Initialize tracing subscriber for logging
fn init_logging(debug: bool, logging: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = if debug {
        EnvFilter::new("unisync_indexer=debug,sqlx=warn")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("unisync_indexer={}", logging.level)))
    };

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .init();
    }

    Ok(())
}

async fn open_storage(config: &Config) -> Result<Storage> {
    let storage = Storage::new(
        &config.database.url,
        Some(config.database.max_connections),
        Some(config.database.min_connections),
    )
    .await
    .context("Failed to connect to database")?;

    storage
        .run_migrations()
        .await
        .context("Failed to run migrations")?;

    Ok(storage)
}

async fn connect_provider(config: &Config) -> Result<RpcProvider> {
    let provider = RpcProvider::new(&config.network.rpc_url, config.contracts.unirep)
        .await
        .context("Failed to create RPC provider")?;

    let chain_id = provider.chain_id().await?;
    if chain_id != config.network.chain_id {
        warn!(
            "Node reports chain id {} but the config expects {}",
            chain_id, config.network.chain_id
        );
    }
    Ok(provider)
}

/// Main service: set up, start polling, stop on Ctrl+C
async fn run(config_path: &str) -> Result<()> {
    info!("Starting synchronizer with config: {}", config_path);

    let config = Config::from_file(config_path).context("Failed to load configuration")?;

    info!("Configuration loaded successfully");
    info!("  Chain ID: {}", config.network.chain_id);
    info!("  RPC URL: {}", config.network.rpc_url);
    info!("  Unirep: {}", config.contracts.unirep);
    info!("  Database: {}", config.database.url);
    info!("  Attesters: {}", describe(&config.sync.attesters));

    let storage = open_storage(&config).await?;
    let provider = connect_provider(&config).await?;

    let sync = Synchronizer::new(Arc::new(provider), storage.clone(), config.sync.options())?;
    let mut notifications = sync.notifier().subscribe();
    let handle = sync.start().await.context("Failed to start synchronizer")?;

    let settings = sync.protocol_settings()?;
    info!(
        "Protocol: state tree depth {}, epoch tree depth {}, history tree depth {}",
        settings.state_tree_depth, settings.epoch_tree_depth, settings.history_tree_depth
    );
    info!("Synchronizer is running. Press Ctrl+C to stop.");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received shutdown signal, gracefully shutting down...");
                break;
            }
            received = notifications.recv() => match received {
                Ok(Notification::Event { kind, event, raw, redundant }) => {
                    debug!(
                        "{} for attester {} at {}{}",
                        kind,
                        event.attester_id(),
                        raw.position(),
                        if redundant { " (redundant)" } else { "" }
                    );
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => debug!("Skipped {} notifications", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    sync.stop();
    if let Err(e) = handle.await {
        warn!("Synchronizer task ended abnormally: {}", e);
    }
    storage.close().await;
    Ok(())
}

fn describe(selection: &AttesterSelection) -> String {
    match selection {
        AttesterSelection::All => "all".to_string(),
        AttesterSelection::Only(ids) => ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
    }
}

/// Show cursors and database statistics
async fn show_status(config_path: &str) -> Result<()> {
    let config = Config::from_file(config_path).context("Failed to load configuration")?;
    let storage = open_storage(&config).await?;

    let stats = storage.stats().await?;
    let cursors = storage.list_cursors().await?;

    println!("\n=== Unisync Indexer Status ===\n");
    println!("Chain ID: {}", config.network.chain_id);
    println!("Unirep: {}", config.contracts.unirep);
    println!("Attesters: {}", describe(&config.sync.attesters));

    println!("\nCursors:");
    if cursors.is_empty() {
        println!("  (none, run the synchronizer first)");
    }
    for cursor in &cursors {
        let complete = cursor
            .latest_complete_block
            .map_or_else(|| "-".to_string(), |b| b.to_string());
        let processed = cursor
            .latest_processed
            .map_or_else(|| "-".to_string(), |p| p.to_string());
        println!(
            "  {}: complete to block {}, last event {}",
            cursor.attester_id, complete, processed
        );
    }

    println!("\nDatabase:");
    println!("  Attesters: {}", stats.attester_count);
    println!("  Epochs: {}", stats.epoch_count);
    println!("  State tree leaves: {}", stats.state_tree_leaf_count);
    println!("  Epoch tree leaves: {}", stats.epoch_tree_leaf_count);
    println!("  History tree leaves: {}", stats.history_tree_leaf_count);
    println!("  User sign ups: {}", stats.user_signup_count);
    println!("  Attestations: {}", stats.attestation_count);
    println!("  Nullifiers: {}", stats.nullifier_count);
    println!();

    storage.close().await;
    Ok(())
}

/// Initialize a database
async fn init_database(database_url: &str) -> Result<()> {
    info!("Initializing database: {}", database_url);

    let storage = Storage::new(database_url, None, None)
        .await
        .context("Failed to create database")?;

    storage
        .run_migrations()
        .await
        .context("Failed to run migrations")?;

    storage.health_check().await?;

    info!("Database initialized successfully");
    storage.close().await;
    Ok(())
}

/// Fill the database from the configured subgraph
async fn ingest_subgraph(config_path: &str, attester: Option<AttesterId>) -> Result<()> {
    let config = Config::from_file(config_path).context("Failed to load configuration")?;
    let subgraph = config
        .subgraph
        .clone()
        .context("No [subgraph] section in configuration")?;

    let storage = open_storage(&config).await?;
    let provider = connect_provider(&config).await?;
    let settings = provider.settings().await?;

    let selection = match attester {
        Some(id) => AttesterSelection::Only(vec![id]),
        None => config.sync.attesters.clone(),
    };

    info!("Ingesting subgraph {}", subgraph.url);
    let client = GraphqlClient::new(subgraph.url.clone())?;
    let adapter = SubgraphSynchronizer::new(
        Arc::new(client),
        storage.clone(),
        &selection,
        settings,
        subgraph.query_count,
    );
    let summary = adapter.save(attester).await?;

    if let Ok(id) = adapter.attester_id() {
        let epoch = adapter.load_current_epoch(Some(id)).await?;
        info!("Attester {} is in epoch {}", id, epoch);
    }
    info!(
        "Ingested {} entities ({} applied)",
        summary.read, summary.applied
    );

    storage.close().await;
    Ok(())
}
