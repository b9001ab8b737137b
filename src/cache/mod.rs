//! The partial-file cache.
//!
//! Maps content keys to [`FileSlot`]s backed by sparse files under a
//! per-instance cache root. Slot handles live in a bounded map; evicting a
//! handle closes nothing for on-disk state and existing references keep
//! the slot alive, so eviction only bounds the in-memory index.
//!
//! # On-disk layout
//!
//! ```text
//! <cache_root>/<hex sha256 of key>.bin    # sparse data file
//! <cache_root>/<hex sha256 of key>.bits   # bitmap || u64 LE size footer
//! ```

pub mod bitmap;
pub mod slot;
pub mod syncmap;

use crate::cache::slot::FileSlot;
use crate::cache::syncmap::SyncMap;
use sha2::{Digest, Sha256};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Hex encoding of the key's SHA-256, collision-free and immune to
/// name-length limits.
pub fn encode_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Lazily opens and indexes file slots under a cache root.
pub struct FileCache {
    root: PathBuf,
    chunk_size: u64,
    slots: SyncMap<Arc<FileSlot>>,
    // Serializes slot creation so two concurrent acquires of a new key
    // cannot install rival slots with independent reservation tables.
    create_lock: tokio::sync::Mutex<()>,
}

impl FileCache {
    /// Create a cache rooted at `root`. The directory is created if
    /// missing; the root is fixed for the lifetime of the instance.
    pub fn new(
        root: PathBuf,
        chunk_size: u64,
        capacity: usize,
        eviction_percentage: usize,
    ) -> io::Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            chunk_size,
            slots: SyncMap::with_eviction_percentage(capacity, eviction_percentage),
            create_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The cache root directory.
    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    /// The chunk quantum applied to every slot.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Return the slot for `key`, opening or creating it as needed.
    ///
    /// `size` of 0 means unknown: the slot is created unsized and must be
    /// finalised via [`FileSlot::ensure_sized`] once the first fetch
    /// resolves the total.
    pub async fn acquire(&self, key: &str, size: u64) -> io::Result<Arc<FileSlot>> {
        let slot = match self.slots.get(key) {
            Some(slot) => slot,
            None => {
                let _create = self.create_lock.lock().await;
                match self.slots.get(key) {
                    Some(slot) => slot,
                    None => {
                        let data_path = self.root.join(format!("{}.bin", encode_key(key)));
                        let slot = FileSlot::open(key, data_path, self.chunk_size).await?;
                        self.slots.set(key, Arc::clone(&slot));
                        debug!(key, size, "opened file slot");
                        slot
                    }
                }
            }
        };

        if size > 0 {
            slot.ensure_sized(size).await?;
        }
        Ok(slot)
    }

    /// Return the slot for `key` only if it is already indexed or exists
    /// on disk. Never creates backing files.
    pub async fn peek(&self, key: &str) -> io::Result<Option<Arc<FileSlot>>> {
        if let Some(slot) = self.slots.get(key) {
            return Ok(Some(slot));
        }

        let data_path = self.root.join(format!("{}.bin", encode_key(key)));
        if !tokio::fs::try_exists(&data_path).await? {
            return Ok(None);
        }

        let _create = self.create_lock.lock().await;
        if let Some(slot) = self.slots.get(key) {
            return Ok(Some(slot));
        }
        let slot = FileSlot::open(key, data_path, self.chunk_size).await?;
        self.slots.set(key, Arc::clone(&slot));
        Ok(Some(slot))
    }
}
