//! patch-sync command line
//!
//! Watches files and mirrors their edits into per-document patch streams, and
//! exposes the administrative history operations.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use patch_sync_core::{
    access::AllowAll,
    history::{DocumentRef, HistoryRequest, PurgeRequest},
    registry::JsonRegistry,
    stream::WalStreamFactory,
    HistoryService, SyncConfig, SyncEngine, WatchStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "patch-sync")]
#[command(about = "Mirror file edits into durable patch streams")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory document paths are relative to
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Project namespace for document identities
    #[arg(short, long)]
    project_id: Option<Uuid>,

    /// Writer id stamped on published patches
    #[arg(short, long)]
    user_id: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch files until interrupted, printing events as JSON lines
    Watch {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Print the stored patches of a document
    History {
        path: PathBuf,

        #[arg(long)]
        start_seq: Option<u64>,

        #[arg(long)]
        end_seq: Option<u64>,
    },

    /// Delete a document's history and fence out stale writers
    Purge {
        path: PathBuf,

        /// Account recorded as the purging actor
        #[arg(long)]
        account_id: Option<Uuid>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Watch { paths } => run_watch(config, paths).await?,
        Commands::History {
            path,
            start_seq,
            end_seq,
        } => {
            let service = history_service(&config).await?;
            let response = service
                .history(HistoryRequest {
                    account_id: Uuid::nil(),
                    document: document_ref(&config, &path)?,
                    start_seq,
                    end_seq,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Purge { path, account_id } => {
            let service = history_service(&config).await?;
            let result = service
                .purge_history(PurgeRequest {
                    account_id: account_id.unwrap_or_else(Uuid::nil),
                    document: document_ref(&config, &path)?,
                    keep_current_state: true,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    if let Some(project_id) = cli.project_id {
        config.project_id = project_id;
    }
    if let Some(user_id) = cli.user_id {
        config.user_id = user_id;
    }
    config.root = std::path::absolute(&config.root)?;
    Ok(config)
}

fn document_ref(config: &SyncConfig, path: &Path) -> Result<DocumentRef> {
    let absolute = std::path::absolute(path)?;
    let relative = absolute
        .strip_prefix(&config.root)
        .with_context(|| format!("{} is not under {}", path.display(), config.root.display()))?;
    Ok(DocumentRef::new(config.project_id, relative))
}

async fn history_service(config: &SyncConfig) -> Result<HistoryService> {
    let registry = JsonRegistry::open(config.registry_dir()).await?;
    let streams = WalStreamFactory::new(config.stream_dir())?;
    Ok(HistoryService::new(
        Arc::new(registry),
        Arc::new(streams),
        Arc::new(AllowAll),
    ))
}

async fn run_watch(config: SyncConfig, paths: Vec<PathBuf>) -> Result<()> {
    let store = WatchStore::open(config.store_path())
        .with_context(|| format!("opening {}", config.store_path().display()))?;
    let streams = Arc::new(WalStreamFactory::new(config.stream_dir())?);
    let refresh = config
        .heartbeat_ttl()
        .map(|ttl| (ttl / 3).max(Duration::from_secs(1)));
    let engine = SyncEngine::new(config, store, streams);

    for path in &paths {
        let mut events = engine.subscribe(path)?;
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!(error = %e, "unprintable event"),
                    },
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "event output fell behind"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
        engine.heartbeat(path, true, None).await?;
    }
    info!(count = paths.len(), "watching; press Ctrl-C to stop");

    let keep_alive = {
        let engine = engine.clone();
        let paths = paths.clone();
        tokio::spawn(async move {
            let Some(period) = refresh else {
                return;
            };
            let mut ticks = tokio::time::interval(period);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                for path in &paths {
                    if let Err(e) = engine.heartbeat(path, true, None).await {
                        warn!(path = %path.display(), error = %e, "heartbeat failed");
                    }
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    keep_alive.abort();
    engine.close().await?;
    Ok(())
}
