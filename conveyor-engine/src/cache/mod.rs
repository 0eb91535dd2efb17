// Artifact Cache
// Branch-scoped build cache where every miss or failure degrades to a cold build

pub mod store;

pub use store::{CacheEntry, CacheError, CacheStore, Discriminator, FsCacheStore, MemoryCacheStore};

use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};

/// Result of restoring a key into the workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Hit {
        discriminator: Discriminator,
        bytes: usize,
    },
    Miss,
    /// The store failed; treated as a miss
    Unavailable(String),
}

impl RestoreOutcome {
    pub fn notice(&self, key: &str) -> String {
        match self {
            RestoreOutcome::Hit {
                discriminator,
                bytes,
            } => format!("restored {} ({} bytes, entry {})", key, bytes, discriminator),
            RestoreOutcome::Miss => format!("no cache entry for {}; building cold", key),
            RestoreOutcome::Unavailable(reason) => {
                format!("cache unavailable for {} ({}); building cold", key, reason)
            }
        }
    }
}

/// Result of saving a workspace path under a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved {
        discriminator: Discriminator,
        bytes: usize,
    },
    Failed(String),
}

impl SaveOutcome {
    pub fn notice(&self, key: &str) -> String {
        match self {
            SaveOutcome::Saved {
                discriminator,
                bytes,
            } => format!("saved {} ({} bytes, entry {})", key, bytes, discriminator),
            SaveOutcome::Failed(reason) => format!("cache save for {} skipped: {}", key, reason),
        }
    }
}

/// Step-facing wrapper over a store. Neither operation can fail a step.
#[derive(Clone)]
pub struct ArtifactCache {
    store: Arc<dyn CacheStore>,
}

impl ArtifactCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Write the newest entry for `key` to `dest`
    pub async fn restore_into(&self, key: &str, dest: &Path) -> RestoreOutcome {
        let entry = match self.store.restore(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(key, "cache miss");
                return RestoreOutcome::Miss;
            }
            Err(e) => {
                warn!(key, error = %e, "cache restore failed");
                return RestoreOutcome::Unavailable(e.to_string());
            }
        };

        if let Some(parent) = dest.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                warn!(key, error = %e, "could not prepare restore destination");
                return RestoreOutcome::Unavailable(e.to_string());
            }
        }
        if let Err(e) = fs::write(dest, &entry.blob).await {
            warn!(key, error = %e, "could not write restored entry");
            return RestoreOutcome::Unavailable(e.to_string());
        }

        debug!(key, discriminator = %entry.discriminator, "cache hit");
        RestoreOutcome::Hit {
            discriminator: entry.discriminator,
            bytes: entry.blob.len(),
        }
    }

    /// Store the contents of `src` as a new entry for `key`
    pub async fn save_from(&self, key: &str, src: &Path) -> SaveOutcome {
        let blob = match fs::read(src).await {
            Ok(blob) => blob,
            Err(e) => {
                warn!(key, path = %src.display(), error = %e, "nothing to cache");
                return SaveOutcome::Failed(format!("{}: {}", src.display(), e));
            }
        };
        let bytes = blob.len();

        match self.store.save(key, blob).await {
            Ok(discriminator) => {
                debug!(key, discriminator = %discriminator, "cache saved");
                SaveOutcome::Saved {
                    discriminator,
                    bytes,
                }
            }
            Err(e) => {
                warn!(key, error = %e, "cache save failed");
                SaveOutcome::Failed(e.to_string())
            }
        }
    }
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache").finish_non_exhaustive()
    }
}
