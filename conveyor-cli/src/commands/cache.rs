use crate::output;

use std::path::PathBuf;

use clap::Subcommand;
use color_eyre::Result;

use conveyor_engine::{CacheStore, ConveyorConfig, FsCacheStore};

#[derive(Subcommand, Debug)]
pub enum CacheCommands {
    /// List cache keys and their entries, oldest first
    List {
        /// Only show this key
        key: Option<String>,

        /// Cache directory (default: ~/.conveyor/cache)
        #[arg(long, value_name = "DIR", env = "CONVEYOR_CACHE_DIR")]
        cache_dir: Option<PathBuf>,
    },
    /// Delete all but the newest entries of a key
    Prune {
        key: String,

        /// Entries to keep
        #[arg(long, default_value_t = 1)]
        keep: usize,

        #[arg(long, value_name = "DIR", env = "CONVEYOR_CACHE_DIR")]
        cache_dir: Option<PathBuf>,
    },
    /// Delete every cache entry
    Clear {
        #[arg(long, value_name = "DIR", env = "CONVEYOR_CACHE_DIR")]
        cache_dir: Option<PathBuf>,
    },
}

fn open_store(flag: Option<PathBuf>, config: &ConveyorConfig) -> FsCacheStore {
    FsCacheStore::new(flag.unwrap_or_else(|| config.cache_dir()))
}

pub async fn execute(command: CacheCommands, config: ConveyorConfig) -> Result<()> {
    match command {
        CacheCommands::List { key, cache_dir } => {
            let store = open_store(cache_dir, &config);
            let keys = match key {
                Some(key) => vec![key],
                None => store.keys().await?,
            };

            if keys.is_empty() {
                output::info(&format!("cache at {} is empty", store.root().display()));
                return Ok(());
            }

            for key in keys {
                let entries = store.entries(&key).await?;
                println!("{} ({} entries)", key, entries.len());
                for discriminator in entries {
                    output::dim(&format!("    {}", discriminator));
                }
            }
        }
        CacheCommands::Prune {
            key,
            keep,
            cache_dir,
        } => {
            let store = open_store(cache_dir, &config);
            let removed = store.prune(&key, keep).await?;
            output::check(&format!(
                "pruned {} entr{} of {}",
                removed,
                if removed == 1 { "y" } else { "ies" },
                key
            ));
        }
        CacheCommands::Clear { cache_dir } => {
            let store = open_store(cache_dir, &config);
            store.clear().await?;
            output::check(&format!("cleared {}", store.root().display()));
        }
    }
    Ok(())
}
