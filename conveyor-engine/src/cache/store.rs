// Cache Stores
// Append-only keyed blob storage with freshness discriminators

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Invalid cache key: {0:?}")]
    InvalidKey(String),

    #[error("Could not allocate a fresh entry for key {0:?}")]
    Exhausted(String),
}

static LAST_MILLIS: AtomicI64 = AtomicI64::new(0);
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Write-time ordering token. Lexicographic order equals write order within a
/// process; across processes ties on the millisecond are broken by pid.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Discriminator(String);

impl Discriminator {
    /// A discriminator fresher than every one this process handed out before
    pub fn fresh() -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let millis = LAST_MILLIS.fetch_max(now, Ordering::SeqCst).max(now);
        let seq = SEQUENCE.fetch_add(1, Ordering::SeqCst);
        Self(format!(
            "{:013}-{:07}-{:08}",
            millis,
            std::process::id(),
            seq
        ))
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.chars().all(|c| c.is_ascii_digit() || c == '-')
            && !raw.starts_with('-');
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Discriminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One stored blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub discriminator: Discriminator,
    pub blob: Vec<u8>,
}

/// Keyed get/put collaborator.
///
/// `save` never overwrites: every call produces a new entry under a fresh
/// discriminator. `restore` returns the newest entry for the key.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    async fn restore(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    async fn restore_exact(
        &self,
        key: &str,
        discriminator: &Discriminator,
    ) -> Result<Option<CacheEntry>, CacheError>;

    async fn save(&self, key: &str, blob: Vec<u8>) -> Result<Discriminator, CacheError>;

    /// Discriminators for a key, oldest first
    async fn entries(&self, key: &str) -> Result<Vec<Discriminator>, CacheError>;

    /// All keys that have at least one entry, sorted
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Delete all but the newest `keep` entries; returns how many were removed
    async fn prune(&self, key: &str, keep: usize) -> Result<usize, CacheError>;

    async fn clear(&self) -> Result<(), CacheError>;
}

// =============================================================================
// Filesystem store
// =============================================================================

const BLOB_EXT: &str = "blob";
const SAVE_ATTEMPTS: usize = 8;

/// Stores entries as `<root>/<encoded key>/<discriminator>.blob`
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    root: PathBuf,
}

impl FsCacheStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// `~/.conveyor/cache`
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".conveyor")
            .join("cache")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_dir(&self, key: &str) -> Result<PathBuf, CacheError> {
        if key.trim().is_empty() {
            return Err(CacheError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(encode_key(key)))
    }

    fn entry_path(dir: &Path, discriminator: &Discriminator) -> PathBuf {
        dir.join(format!("{}.{}", discriminator, BLOB_EXT))
    }

    async fn read_entry(
        &self,
        key: &str,
        dir: &Path,
        discriminator: Discriminator,
    ) -> Result<Option<CacheEntry>, CacheError> {
        match fs::read(Self::entry_path(dir, &discriminator)).await {
            Ok(blob) => Ok(Some(CacheEntry {
                key: key.to_string(),
                discriminator,
                blob,
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait::async_trait]
impl CacheStore for FsCacheStore {
    async fn restore(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let dir = self.key_dir(key)?;
        match self.entries(key).await?.pop() {
            Some(newest) => self.read_entry(key, &dir, newest).await,
            None => Ok(None),
        }
    }

    async fn restore_exact(
        &self,
        key: &str,
        discriminator: &Discriminator,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let dir = self.key_dir(key)?;
        self.read_entry(key, &dir, discriminator.clone()).await
    }

    async fn save(&self, key: &str, blob: Vec<u8>) -> Result<Discriminator, CacheError> {
        let dir = self.key_dir(key)?;
        fs::create_dir_all(&dir).await?;

        for _ in 0..SAVE_ATTEMPTS {
            let discriminator = Discriminator::fresh();
            let final_path = Self::entry_path(&dir, &discriminator);
            let tmp_path = dir.join(format!(".{}.tmp", discriminator));

            let file = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&tmp_path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            };
            write_temp(&tmp_path, file, &blob).await?;

            if fs::try_exists(&final_path).await? {
                fs::remove_file(&tmp_path).await?;
                continue;
            }
            fs::rename(&tmp_path, &final_path).await?;
            return Ok(discriminator);
        }

        Err(CacheError::Exhausted(key.to_string()))
    }

    async fn entries(&self, key: &str) -> Result<Vec<Discriminator>, CacheError> {
        let dir = self.key_dir(key)?;
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(&format!(".{}", BLOB_EXT)) {
                if let Some(d) = Discriminator::parse(stem) {
                    found.push(d);
                }
            }
        }
        found.sort();
        Ok(found)
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut read_dir = match fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(key) = decode_key(&entry.file_name().to_string_lossy()) {
                if !self.entries(&key).await?.is_empty() {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn prune(&self, key: &str, keep: usize) -> Result<usize, CacheError> {
        let dir = self.key_dir(key)?;
        let entries = self.entries(key).await?;
        let excess = entries.len().saturating_sub(keep);

        for discriminator in &entries[..excess] {
            fs::remove_file(Self::entry_path(&dir, discriminator)).await?;
        }
        Ok(excess)
    }

    async fn clear(&self) -> Result<(), CacheError> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Percent-encode everything outside `[A-Za-z0-9._-]` so keys map to one
/// directory name and back
/// Write and sync a new temp entry. On failure the temp file is removed so
/// no partial blob is left in the key directory.
async fn write_temp(tmp_path: &Path, mut file: fs::File, blob: &[u8]) -> io::Result<()> {
    let written = async {
        file.write_all(blob).await?;
        // tokio reports a failed background write on flush, not on write_all
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);

    if written.is_err() {
        let _ = fs::remove_file(tmp_path).await;
    }
    written
}

fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            b'.' if !out.is_empty() => out.push('.'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

// =============================================================================
// In-memory store
// =============================================================================

/// Process-local store, used when no cache directory is configured
#[derive(Debug, Clone, Default)]
pub struct MemoryCacheStore {
    entries: Arc<RwLock<HashMap<String, BTreeMap<Discriminator, Vec<u8>>>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryCacheStore {
    async fn restore(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries.get(key).and_then(|versions| {
            versions.iter().next_back().map(|(d, blob)| CacheEntry {
                key: key.to_string(),
                discriminator: d.clone(),
                blob: blob.clone(),
            })
        }))
    }

    async fn restore_exact(
        &self,
        key: &str,
        discriminator: &Discriminator,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .and_then(|versions| versions.get(discriminator))
            .map(|blob| CacheEntry {
                key: key.to_string(),
                discriminator: discriminator.clone(),
                blob: blob.clone(),
            }))
    }

    async fn save(&self, key: &str, blob: Vec<u8>) -> Result<Discriminator, CacheError> {
        if key.trim().is_empty() {
            return Err(CacheError::InvalidKey(key.to_string()));
        }
        let discriminator = Discriminator::fresh();
        self.entries
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .insert(discriminator.clone(), blob);
        Ok(discriminator)
    }

    async fn entries(&self, key: &str) -> Result<Vec<Discriminator>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .map(|versions| versions.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let mut keys: Vec<_> = self.entries.read().await.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn prune(&self, key: &str, keep: usize) -> Result<usize, CacheError> {
        let mut entries = self.entries.write().await;
        let Some(versions) = entries.get_mut(key) else {
            return Ok(0);
        };
        let excess = versions.len().saturating_sub(keep);
        let doomed: Vec<_> = versions.keys().take(excess).cloned().collect();
        for d in doomed {
            versions.remove(&d);
        }
        Ok(excess)
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.write().await.clear();
        Ok(())
    }
}
