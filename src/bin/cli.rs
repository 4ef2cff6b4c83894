use std::env;
use std::time::Duration;

use clap::{Parser, Subcommand};
use node_storage::{InitOptions, NodeStorage, NodeStorageManager};
use serde_json::Value;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Root directory. Falls back to NODE_STORAGE_DIR, then ./node_storage.
    #[arg(short, long)]
    dir: Option<String>,

    #[arg(long)]
    logging: bool,

    #[arg(long)]
    write_queue: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    Names,
    Create { storage: String },
    Remove { storage: String },
    Get { storage: String, key: String },
    Set {
        storage: String,
        key: String,
        value: String,
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    Del { storage: String, key: String },
    Keys { storage: String },
    Dump { storage: String },
    Clear { storage: String },
    /// Checks the root store, or the named storage when given.
    Health { storage: Option<String> },
    Log { storage: Option<String> },
}

/// Opens `name` only if it is already registered, so a mistyped name is not created.
async fn open_existing(manager: &NodeStorageManager, name: &str) -> anyhow::Result<Option<NodeStorage>> {
    let storage = manager.get_storage(name).await?;
    if storage.is_none() {
        println!("NOT FOUND");
    }
    Ok(storage)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut options = InitOptions::new().logging(cli.logging).write_queue(cli.write_queue);
    if let Some(dir) = cli.dir.or_else(|| env::var("NODE_STORAGE_DIR").ok()) {
        options = options.dir(dir);
    }
    let manager = NodeStorageManager::open(options).await?;

    match cli.command {
        Commands::Names => {
            let names = manager.get_storage_names().await?;
            println!("{}", serde_json::to_string_pretty(&names)?);
        }
        Commands::Create { storage } => {
            manager.create_storage(&storage).await?.close().await?;
            println!("OK");
        }
        Commands::Remove { storage } => {
            if manager.remove_storage(&storage).await? {
                println!("OK");
            } else {
                println!("NOT FOUND");
            }
        }
        Commands::Get { storage, key } => {
            let Some(storage) = open_existing(&manager, &storage).await? else {
                return close(manager).await;
            };
            match storage.get::<Value>(&key).await? {
                Some(val) => println!("{}", serde_json::to_string_pretty(&val)?),
                None => println!("NOT FOUND"),
            }
            storage.close().await?;
        }
        Commands::Set { storage, key, value, ttl_secs } => {
            let storage = manager.create_storage(&storage).await?;
            let val: Value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            match ttl_secs {
                Some(secs) => storage.set_with_ttl(&key, &val, Duration::from_secs(secs)).await?,
                None => storage.set(&key, &val).await?,
            };
            storage.close().await?;
            println!("OK");
        }
        Commands::Del { storage, key } => {
            let Some(storage) = open_existing(&manager, &storage).await? else {
                return close(manager).await;
            };
            storage.remove(&key).await?;
            storage.close().await?;
            println!("OK");
        }
        Commands::Keys { storage } => {
            let Some(storage) = open_existing(&manager, &storage).await? else {
                return close(manager).await;
            };
            println!("{}", serde_json::to_string_pretty(&storage.keys().await?)?);
            storage.close().await?;
        }
        Commands::Dump { storage } => {
            let Some(storage) = open_existing(&manager, &storage).await? else {
                return close(manager).await;
            };
            println!("{}", serde_json::to_string_pretty(&storage.data().await?)?);
            storage.close().await?;
        }
        Commands::Clear { storage } => {
            let Some(storage) = open_existing(&manager, &storage).await? else {
                return close(manager).await;
            };
            storage.clear().await?;
            storage.close().await?;
            println!("OK");
        }
        Commands::Health { storage } => {
            let healthy = match storage {
                Some(name) => {
                    let Some(storage) = open_existing(&manager, &name).await? else {
                        return close(manager).await;
                    };
                    let healthy = NodeStorage::health_check(storage.engine()).await;
                    storage.close().await?;
                    healthy
                }
                None => NodeStorage::health_check(manager.engine()).await,
            };
            println!("{}", if healthy { "HEALTHY" } else { "UNHEALTHY" });
        }
        Commands::Log { storage } => {
            let count = match storage {
                Some(name) => {
                    let Some(storage) = open_existing(&manager, &name).await? else {
                        return close(manager).await;
                    };
                    let count = storage.log_storage().await?;
                    storage.close().await?;
                    count
                }
                None => manager.log_storage().await?,
            };
            println!("{}", count);
        }
    }

    close(manager).await
}

async fn close(manager: NodeStorageManager) -> anyhow::Result<()> {
    manager.close().await?;
    Ok(())
}
