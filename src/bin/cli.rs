//! CLI for a shared store

use anyhow::Context;
use clap::{Parser, Subcommand};
use sharekv::{ScanRange, ShareConfig, SharedDb};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "sharekv")]
#[command(about = "Key-value store shared by every process on one machine")]
#[command(version)]
struct Cli {
    /// Store directory
    #[arg(long, default_value = "./sharekv-data")]
    location: PathBuf,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the value of a key
    Get {
        /// Key
        key: String,
    },

    /// Set a key
    Put {
        /// Key
        key: String,

        /// Value
        value: String,
    },

    /// Delete a key
    Del {
        /// Key
        key: String,
    },

    /// Print a key range as JSON lines
    Scan {
        /// Only keys starting with this prefix
        #[arg(long)]
        prefix: Option<String>,

        /// Walk backwards
        #[arg(long)]
        reverse: bool,

        /// Stop after this many entries
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Lead the store until interrupted
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ShareConfig::load(cli.config.as_deref()).context("loading configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let db = SharedDb::open_with(&cli.location, config)
        .await
        .with_context(|| format!("opening {}", cli.location.display()))?;

    let result = run(&db, cli.command).await;
    let closed = db.close().await;
    result?;
    closed?;
    Ok(())
}

async fn run(db: &SharedDb, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Get { key } => match db.get(&key).await? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => anyhow::bail!("key not found: {}", key),
        },

        Commands::Put { key, value } => {
            db.put(&key, &value).await?;
            tracing::debug!("Stored {}", key);
        }

        Commands::Del { key } => {
            db.delete(&key).await?;
        }

        Commands::Scan {
            prefix,
            reverse,
            limit,
        } => {
            let mut range = match prefix {
                Some(prefix) => ScanRange::prefix(prefix),
                None => ScanRange::all(),
            };
            if reverse {
                range = range.reverse();
            }
            if let Some(limit) = limit {
                range = range.limit(limit);
            }

            let mut cursor = db.iter(range);
            while let Some(page) = cursor.next_page().await? {
                for entry in page {
                    let line = serde_json::json!({
                        "key": String::from_utf8_lossy(&entry.key),
                        "value": String::from_utf8_lossy(&entry.value),
                    });
                    println!("{}", line);
                }
            }
        }

        Commands::Serve => {
            db.wait_for_leader().await?;
            tracing::info!("Serving {} at {}", db.location().display(), db.rendezvous());
            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down");
        }
    }
    Ok(())
}
