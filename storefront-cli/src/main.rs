//! `storefront`: operator tool for the local document store.
//!
//! Runs the same access layer the storefront uses against the RocksDB store
//! under the configured data directory.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use storefront_store::backup::{self, Backup};
use storefront_store::{
    ConnectionConfig, Payload, RocksConnector, StoreClient, StoreResult, StoreSettings,
};

/// Storefront document store CLI
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Data directory (overrides SF_DATA_DIR and storefront.toml)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Project id; selects the database under the data directory
    #[arg(short, long)]
    project: Option<String>,

    /// API key used to open the project
    #[arg(long)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print one document
    Get { collection: String, id: String },

    /// Print a whole collection in snapshot order
    List { collection: String },

    /// Write a JSON object (merged into any existing document)
    Put {
        collection: String,
        /// Document as JSON
        json: String,
    },

    /// Delete one document
    Delete { collection: String, id: String },

    /// Print every snapshot of a collection until interrupted
    Watch {
        collection: String,
        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Write a backup file
    Export {
        /// Output file
        #[arg(short, long)]
        out: PathBuf,
        /// Collections to export (default: all)
        #[arg(short, long)]
        collections: Vec<String>,
    },

    /// Restore a backup file through batched writes
    Import {
        /// Backup file
        file: PathBuf,
        /// Documents per batch commit
        #[arg(long)]
        chunk: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let mut settings = StoreSettings::load()?;
    if let Some(dir) = &cli.data_dir {
        settings.data_dir = dir.clone();
    }
    if let Commands::Import { chunk: Some(chunk), .. } = &cli.command {
        settings.batch_chunk_size = *chunk;
        settings.validate()?;
    }

    let connector = Arc::new(RocksConnector::new(settings.data_dir.clone()));
    let client = StoreClient::new(connector, settings);
    client.init(&connection_config(&cli)).await?;

    run(&client, cli.command).await?;
    Ok(())
}

fn connection_config(cli: &Cli) -> ConnectionConfig {
    let mut config = ConnectionConfig::compiled_default();
    if let Some(project) = &cli.project {
        config.project_id = project.clone();
    }
    if let Some(key) = &cli.api_key {
        config.api_key = key.clone();
    }
    config
}

async fn run(client: &StoreClient, command: Commands) -> StoreResult<()> {
    match command {
        Commands::Get { collection, id } => match client.get_document(&collection, &id).await? {
            Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
            None => eprintln!("[{collection}] {id}: not found"),
        },
        Commands::List { collection } => {
            let docs = client.get_collection(&collection).await?;
            println!("{}", serde_json::to_string_pretty(&docs)?);
        }
        Commands::Put { collection, json } => {
            let value: serde_json::Value = serde_json::from_str(&json)?;
            let id = client.set_document(&collection, Payload::from(value)).await?;
            println!("{id}");
        }
        Commands::Delete { collection, id } => {
            client.delete_document(&collection, &id).await?;
        }
        Commands::Watch { collection, seconds } => {
            let sub = client
                .listen_to_collection(&collection, |docs| {
                    match serde_json::to_string(&docs) {
                        Ok(line) => println!("{line}"),
                        Err(e) => log::error!("Failed to print snapshot: {e}"),
                    }
                })
                .await;

            match seconds {
                Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                None => {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        log::error!("Failed to wait for interrupt: {e}");
                    }
                }
            }
            sub.unsubscribe();
        }
        Commands::Export { out, collections } => {
            let backup = if collections.is_empty() {
                backup::export_all(client).await?
            } else {
                backup::export(client, &collections).await?
            };
            std::fs::write(&out, backup.to_json_pretty()?).map_err(|e| {
                storefront_store::StoreError::Configuration(format!(
                    "Failed to write {}: {e}",
                    out.display()
                ))
            })?;
            println!("Exported {} documents to {}", backup.document_count(), out.display());
        }
        Commands::Import { file, .. } => {
            let contents = std::fs::read_to_string(&file).map_err(|e| {
                storefront_store::StoreError::Configuration(format!(
                    "Failed to read {}: {e}",
                    file.display()
                ))
            })?;
            let backup = Backup::from_json(&contents)?;
            let report = backup::restore(client, &backup).await;
            println!(
                "Migrated {} documents, {} errors",
                report.total_migrated, report.errors
            );
        }
    }
    Ok(())
}
