//! supertag CLI tool
//!
//! Command-line interface for syncing a markdown vault into its supertag store.
//!
//! ## Commands
//!
//! - `sync <vault>`: One full sync pass, then write the store image
//! - `watch <vault>`: Initial sync, then follow filesystem changes until interrupted
//! - `tags <vault>`: List supertags with their property schemas
//! - `search <vault>`: Filtered block search

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use supertag_core::{
    config::SyncConfig,
    documents::FsDocumentStore,
    event::SyncEvent,
    query::BlockQuery,
    sync::{SyncHandle, SyncService},
    watch::VaultWatcher,
};
use tokio::sync::mpsc::unbounded_channel;

#[derive(Parser)]
#[command(name = "supertag")]
#[command(author, version, about = "Keep supertag block metadata in sync with a markdown vault", long_about = None)]
struct Cli {
    /// Configuration file path (defaults to <vault>/.supertag/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync every document once and write the store image
    Sync {
        /// Vault root
        vault: PathBuf,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Sync, then keep following changes until Ctrl-C
    Watch {
        /// Vault root
        vault: PathBuf,
    },

    /// List tags and their property definitions
    Tags {
        /// Vault root
        vault: PathBuf,
    },

    /// Search blocks
    Search {
        /// Vault root
        vault: PathBuf,

        /// Block must carry this tag (repeatable, all must match)
        #[arg(short, long)]
        tag: Vec<String>,

        /// Block text must contain this substring
        #[arg(long)]
        text: Option<String>,

        /// Block must have a value for this property
        #[arg(short, long)]
        field: Option<String>,

        /// Block must embed an attachment
        #[arg(short, long)]
        attachment: bool,

        /// Maximum number of results
        #[arg(short, long)]
        limit: Option<u32>,
    },
}

fn load_config(vault: &Path, explicit: Option<&PathBuf>) -> Result<SyncConfig, Box<dyn std::error::Error>> {
    let path = explicit
        .cloned()
        .unwrap_or_else(|| vault.join(".supertag").join("config.toml"));
    Ok(SyncConfig::load(path)?)
}

async fn open(vault: &Path, config: SyncConfig) -> Result<SyncHandle, Box<dyn std::error::Error>> {
    let documents = FsDocumentStore::new(vault);
    Ok(SyncService::open(documents, config, None).await?.spawn())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        match cli.command {
            Commands::Sync { vault, verbose } => {
                let config = load_config(&vault, cli.config.as_ref())?;
                let handle = open(&vault, config).await?;
                let report = handle.initial_sync().await?;
                println!(
                    "{} synced, {} unchanged, {} ignored, {} failed",
                    report.synced,
                    report.unchanged,
                    report.ignored,
                    report.failed.len()
                );
                for (path, error) in report.failed.iter() {
                    eprintln!("  {path}: {error}");
                }
                if verbose {
                    let counts = handle.counts().await?;
                    println!(
                        "documents: {}, blocks: {}, tags: {}, values: {}",
                        counts.documents, counts.blocks, counts.tags, counts.values
                    );
                }
                handle.shutdown().await?;
            }
            Commands::Watch { vault } => {
                let config = load_config(&vault, cli.config.as_ref())?;
                let (event_tx, mut event_rx) = unbounded_channel::<SyncEvent>();
                let documents = FsDocumentStore::new(&vault);
                let handle = SyncService::open(documents.clone(), config.clone(), Some(event_tx))
                    .await?
                    .spawn();
                handle.initial_sync().await?;
                let watcher = VaultWatcher::start(&documents, &config, handle.clone())?;
                println!("Watching {:?}, press Ctrl-C to stop", vault);

                loop {
                    tokio::select! {
                        event = event_rx.recv() => match event {
                            Some(SyncEvent::Synced { path, report, .. }) => println!(
                                "synced {path}: +{} ~{} -{}",
                                report.created, report.position_matched, report.deleted
                            ),
                            Some(SyncEvent::Failed(path, error)) => {
                                eprintln!("failed {}: {error}", path.unwrap_or_default())
                            }
                            Some(_) => {}
                            None => break,
                        },
                        _ = tokio::signal::ctrl_c() => break,
                    }
                }
                watcher.stop()?;
                handle.shutdown().await?;
            }
            Commands::Tags { vault } => {
                let config = load_config(&vault, cli.config.as_ref())?;
                let handle = open(&vault, config).await?;
                for supertag in handle.supertags().await? {
                    println!("#{}", supertag.name);
                    for property in supertag.properties {
                        println!("  {} ({})", property.name, property.property_type);
                    }
                }
                handle.shutdown().await?;
            }
            Commands::Search {
                vault,
                tag,
                text,
                field,
                attachment,
                limit,
            } => {
                let config = load_config(&vault, cli.config.as_ref())?;
                let handle = open(&vault, config).await?;
                let mut query = BlockQuery::new();
                for name in tag {
                    query = query.tag(name.trim_start_matches('#'));
                }
                if let Some(text) = text {
                    query = query.text(text);
                }
                if let Some(field) = field {
                    query = query.field(field);
                }
                if attachment {
                    query = query.attachment();
                }
                if let Some(limit) = limit {
                    query = query.limit(limit);
                }
                for hit in handle.search(query).await? {
                    println!("{}:{}  {}", hit.document_path, hit.start_line + 1, hit.text);
                }
                handle.shutdown().await?;
            }
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
