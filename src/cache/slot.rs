//! Per-key file slot: backing file, bitmap, and chunk reservations.
//!
//! A slot owns one sparse data file plus its bitmap sidecar and arbitrates
//! which task fetches which chunk. Each chunk moves absent → in-flight →
//! persisted and never backwards; at most one task owns the in-flight
//! fetch of a chunk, and everyone else waits on the owner's outcome.
//!
//! # Durability
//!
//! Chunk bytes are positionally written and synced to the data file before
//! the bitmap bit flips, so a crash-recovered bitmap never claims bytes
//! that did not reach disk.

use crate::cache::bitmap::ChunkBitmap;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Terminal outcome of an in-flight chunk, broadcast to its waiters.
#[derive(Debug, Clone)]
pub enum ChunkFault {
    /// Every peer and the origin answered 404 or equivalent.
    NotFound(String),
    /// The origin failed after the retry budget ran out.
    Fetch(String),
    /// The local write failed; the slot is degraded.
    Io(String),
    /// The owning task was cancelled with no remaining audience.
    Cancelled,
}

impl std::fmt::Display for ChunkFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChunkFault::NotFound(msg) => write!(f, "not found: {msg}"),
            ChunkFault::Fetch(msg) => write!(f, "fetch failed: {msg}"),
            ChunkFault::Io(msg) => write!(f, "write failed: {msg}"),
            ChunkFault::Cancelled => write!(f, "fetch cancelled"),
        }
    }
}

/// Completion signal shared between a chunk's owner and its waiters.
pub type ChunkSignal = std::result::Result<(), ChunkFault>;

/// The role a caller ends up with for one chunk of a reservation request.
pub enum ChunkClaim {
    /// The chunk is already on disk; read it directly.
    Persisted(u64),
    /// The caller must fetch this chunk and report the outcome.
    Owner(u64),
    /// Another task is fetching; await its broadcast outcome.
    Waiter(u64, broadcast::Receiver<ChunkSignal>),
}

impl ChunkClaim {
    /// The chunk index this claim refers to.
    pub fn chunk(&self) -> u64 {
        match self {
            ChunkClaim::Persisted(c) | ChunkClaim::Owner(c) => *c,
            ChunkClaim::Waiter(c, _) => *c,
        }
    }
}

struct Reservation {
    tx: broadcast::Sender<ChunkSignal>,
}

struct SlotState {
    bitmap: Option<ChunkBitmap>,
    reservations: HashMap<u64, Reservation>,
    degraded: bool,
}

/// One cached file: data file, bitmap sidecar, and reservation table.
pub struct FileSlot {
    key: String,
    data_path: PathBuf,
    bits_path: PathBuf,
    file: Arc<File>,
    chunk_size: u64,
    state: parking_lot::Mutex<SlotState>,
    // Serializes bitmap snapshots and sidecar writes so a stale snapshot
    // can never overwrite a newer one.
    persist_lock: tokio::sync::Mutex<()>,
}

impl FileSlot {
    /// Open or create the slot backing files under `data_path`.
    ///
    /// An existing sidecar determines the file size; without one the slot
    /// starts unsized and must be finalised via [`FileSlot::ensure_sized`]
    /// before chunks can be reserved.
    pub async fn open(key: &str, data_path: PathBuf, chunk_size: u64) -> io::Result<Arc<Self>> {
        let bits_path = data_path.with_extension("bits");
        let bitmap = ChunkBitmap::load(&bits_path, chunk_size).await?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&data_path)?;

        if let Some(ref bm) = bitmap {
            debug!(
                key,
                size = bm.file_size(),
                persisted = bm.count(),
                "reopened cached file"
            );
        }

        Ok(Arc::new(Self {
            key: key.to_string(),
            data_path,
            bits_path,
            file: Arc::new(file),
            chunk_size,
            state: parking_lot::Mutex::new(SlotState {
                bitmap,
                reservations: HashMap::new(),
                degraded: false,
            }),
            persist_lock: tokio::sync::Mutex::new(()),
        }))
    }

    /// The content key this slot caches.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Path of the backing data file.
    pub fn path(&self) -> &Path {
        &self.data_path
    }

    /// Total file size, if known yet.
    pub fn size(&self) -> Option<u64> {
        self.state.lock().bitmap.as_ref().map(|b| b.file_size())
    }

    /// The chunk quantum of this slot.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of persisted chunks.
    pub fn persisted_chunks(&self) -> u64 {
        self.state.lock().bitmap.as_ref().map_or(0, |b| b.count())
    }

    /// Whether chunk `i` is persisted.
    pub fn is_persisted(&self, chunk: u64) -> bool {
        self.state
            .lock()
            .bitmap
            .as_ref()
            .is_some_and(|b| b.test(chunk))
    }

    /// Whether a write failure has degraded this slot.
    pub fn is_degraded(&self) -> bool {
        self.state.lock().degraded
    }

    /// Whether every chunk covering `[offset, offset + len)` is persisted.
    /// An unsized slot covers nothing; a zero-length range is covered.
    pub fn range_persisted(&self, offset: u64, len: u64) -> bool {
        if len == 0 {
            return true;
        }
        let state = self.state.lock();
        let Some(ref bitmap) = state.bitmap else {
            return false;
        };
        if offset + len > bitmap.file_size() {
            return false;
        }
        let c_lo = offset / self.chunk_size;
        let c_hi = (offset + len).div_ceil(self.chunk_size);
        (c_lo..c_hi).all(|c| bitmap.test(c))
    }

    /// Fix the total file size, sparsely allocating the data file and
    /// initialising an all-zero bitmap. Idempotent for a matching size; a
    /// mismatched size keeps the first one and logs.
    pub async fn ensure_sized(&self, size: u64) -> io::Result<()> {
        {
            let state = self.state.lock();
            if let Some(ref bm) = state.bitmap {
                if bm.file_size() != size {
                    warn!(
                        key = %self.key,
                        known = bm.file_size(),
                        offered = size,
                        "ignoring conflicting size for cached file"
                    );
                }
                return Ok(());
            }
        }

        self.file.set_len(size)?;
        let bitmap = ChunkBitmap::new(size, self.chunk_size);
        bitmap.persist(&self.bits_path).await?;

        let mut state = self.state.lock();
        // A racing ensure_sized may have won; first writer sticks.
        if state.bitmap.is_none() {
            state.bitmap = Some(bitmap);
        }
        Ok(())
    }

    /// Partition chunks `[lo, hi)` into persisted, owned, and awaited.
    ///
    /// For each chunk not yet persisted, the caller either installs a new
    /// reservation (becoming the owner that must fetch it) or joins the
    /// existing one as a waiter. A degraded slot refuses to take on new
    /// fetches.
    pub fn reserve_chunks(&self, lo: u64, hi: u64) -> io::Result<Vec<ChunkClaim>> {
        let mut state = self.state.lock();
        let bitmap_ready = state.bitmap.is_some();
        if !bitmap_ready {
            return Err(io::Error::other("slot has no size yet"));
        }

        let mut claims = Vec::with_capacity((hi - lo) as usize);
        for chunk in lo..hi {
            if state.bitmap.as_ref().is_some_and(|b| b.test(chunk)) {
                claims.push(ChunkClaim::Persisted(chunk));
            } else if let Some(res) = state.reservations.get(&chunk) {
                claims.push(ChunkClaim::Waiter(chunk, res.tx.subscribe()));
            } else {
                if state.degraded {
                    return Err(io::Error::other("slot is degraded"));
                }
                let (tx, _) = broadcast::channel(1);
                state.reservations.insert(chunk, Reservation { tx });
                claims.push(ChunkClaim::Owner(chunk));
            }
        }
        Ok(claims)
    }

    /// Whether any task is currently subscribed to chunk `i`'s outcome.
    ///
    /// Owners consult this when their own caller has gone away: with an
    /// audience the fetch continues, without one it may abort.
    pub fn has_waiters(&self, chunk: u64) -> bool {
        self.state
            .lock()
            .reservations
            .get(&chunk)
            .is_some_and(|r| r.tx.receiver_count() > 0)
    }

    /// Persist `bytes` as chunk `i` and wake its waiters.
    ///
    /// Only the chunk's owner calls this, making it the sole writer of bit
    /// *i*. The write is synced before the bit is set.
    pub async fn complete_chunk(&self, chunk: u64, bytes: Vec<u8>) -> io::Result<()> {
        let offset = chunk * self.chunk_size;
        let file = Arc::clone(&self.file);

        let write_result = tokio::task::spawn_blocking(move || {
            file.write_all_at(&bytes, offset)?;
            file.sync_data()
        })
        .await
        .map_err(io::Error::other)?;

        if let Err(e) = write_result {
            self.degrade(chunk, &e);
            return Err(e);
        }

        let snapshot = {
            let _persist = self.persist_lock.lock().await;
            let snapshot = {
                let mut state = self.state.lock();
                match state.bitmap.as_mut() {
                    Some(bm) => {
                        bm.set(chunk);
                        bm.clone()
                    }
                    None => return Err(io::Error::other("slot lost its bitmap")),
                }
            };
            if let Err(e) = snapshot.persist(&self.bits_path).await {
                // The chunk bytes are synced and the in-memory bit is set,
                // so this process can still serve the chunk; only crash
                // recovery would lose it. Refuse further fetches.
                warn!(key = %self.key, chunk, error = %e, "bitmap persist failed, degrading slot");
                self.state.lock().degraded = true;
            }
            snapshot
        };

        let tx = {
            let mut state = self.state.lock();
            state.reservations.remove(&chunk).map(|r| r.tx)
        };
        if let Some(tx) = tx {
            let _ = tx.send(Ok(()));
        }

        debug!(
            key = %self.key,
            chunk,
            persisted = snapshot.count(),
            total = snapshot.num_chunks(),
            "chunk persisted"
        );
        Ok(())
    }

    /// Drop chunk `i`'s reservation and signal its waiters with `fault`.
    pub fn fail_chunk(&self, chunk: u64, fault: ChunkFault) {
        let tx = {
            let mut state = self.state.lock();
            state.reservations.remove(&chunk).map(|r| r.tx)
        };
        if let Some(tx) = tx {
            let _ = tx.send(Err(fault));
        }
    }

    /// Read `len` bytes starting at `offset` from the data file.
    ///
    /// The caller is responsible for only reading persisted ranges; the
    /// file itself is never locked for I/O.
    pub async fn read_range(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            file.read_exact_at(&mut buf, offset)?;
            Ok(buf)
        })
        .await
        .map_err(io::Error::other)?
    }

    /// The byte length of chunk `i`, accounting for a short last chunk.
    pub fn chunk_len(&self, chunk: u64) -> u64 {
        let size = self.size().unwrap_or(0);
        let start = chunk * self.chunk_size;
        size.saturating_sub(start).min(self.chunk_size)
    }

    fn degrade(&self, chunk: u64, err: &io::Error) {
        warn!(key = %self.key, chunk, error = %err, "disk write failed, degrading slot");
        {
            let mut state = self.state.lock();
            state.degraded = true;
        }
        self.fail_chunk(chunk, ChunkFault::Io(err.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const CHUNK: u64 = 4096;

    async fn open_sized(dir: &Path, size: u64) -> Arc<FileSlot> {
        let slot = FileSlot::open("test-key", dir.join("blob.bin"), CHUNK)
            .await
            .unwrap();
        slot.ensure_sized(size).await.unwrap();
        slot
    }

    #[tokio::test]
    async fn reserve_partitions_roles() {
        let dir = tempdir().unwrap();
        let slot = open_sized(dir.path(), 3 * CHUNK).await;

        slot.complete_chunk(0, vec![0xAA; CHUNK as usize])
            .await
            .unwrap();

        let claims = slot.reserve_chunks(0, 3).unwrap();
        assert!(matches!(claims[0], ChunkClaim::Persisted(0)));
        assert!(matches!(claims[1], ChunkClaim::Owner(1)));
        assert!(matches!(claims[2], ChunkClaim::Owner(2)));

        // A second caller joins the in-flight chunks as a waiter.
        let claims2 = slot.reserve_chunks(1, 3).unwrap();
        assert!(matches!(claims2[0], ChunkClaim::Waiter(1, _)));
        assert!(matches!(claims2[1], ChunkClaim::Waiter(2, _)));
    }

    #[tokio::test]
    async fn complete_wakes_waiters_and_sets_bit() {
        let dir = tempdir().unwrap();
        let slot = open_sized(dir.path(), 2 * CHUNK).await;

        let owner_claims = slot.reserve_chunks(0, 1).unwrap();
        assert!(matches!(owner_claims[0], ChunkClaim::Owner(0)));

        let mut rx = match slot.reserve_chunks(0, 1).unwrap().remove(0) {
            ChunkClaim::Waiter(0, rx) => rx,
            _ => panic!("expected waiter"),
        };

        let waiter = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move {
                rx.recv().await.unwrap().unwrap();
                slot.read_range(0, CHUNK as usize).await.unwrap()
            })
        };

        slot.complete_chunk(0, vec![0xBB; CHUNK as usize])
            .await
            .unwrap();

        let bytes = waiter.await.unwrap();
        assert!(bytes.iter().all(|&b| b == 0xBB));
        assert!(slot.is_persisted(0));
        assert_eq!(slot.persisted_chunks(), 1);
    }

    #[tokio::test]
    async fn fail_signals_waiters_and_clears_reservation() {
        let dir = tempdir().unwrap();
        let slot = open_sized(dir.path(), CHUNK).await;

        let _owner = slot.reserve_chunks(0, 1).unwrap();
        let mut rx = match slot.reserve_chunks(0, 1).unwrap().remove(0) {
            ChunkClaim::Waiter(0, rx) => rx,
            _ => panic!("expected waiter"),
        };

        slot.fail_chunk(0, ChunkFault::Fetch("no peers".into()));
        assert!(matches!(rx.recv().await.unwrap(), Err(ChunkFault::Fetch(_))));

        // The chunk is absent again; a new owner can claim it.
        let claims = slot.reserve_chunks(0, 1).unwrap();
        assert!(matches!(claims[0], ChunkClaim::Owner(0)));
    }

    #[tokio::test]
    async fn waiter_census_tracks_receivers() {
        let dir = tempdir().unwrap();
        let slot = open_sized(dir.path(), CHUNK).await;

        let _owner = slot.reserve_chunks(0, 1).unwrap();
        assert!(!slot.has_waiters(0));

        let claim = slot.reserve_chunks(0, 1).unwrap().remove(0);
        assert!(slot.has_waiters(0));

        drop(claim);
        assert!(!slot.has_waiters(0));
    }

    #[tokio::test]
    async fn bitmap_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        {
            let slot = FileSlot::open("k", path.clone(), CHUNK).await.unwrap();
            slot.ensure_sized(2 * CHUNK).await.unwrap();
            slot.complete_chunk(1, vec![7u8; CHUNK as usize])
                .await
                .unwrap();
        }

        let slot = FileSlot::open("k", path, CHUNK).await.unwrap();
        assert_eq!(slot.size(), Some(2 * CHUNK));
        assert!(!slot.is_persisted(0));
        assert!(slot.is_persisted(1));

        let bytes = slot.read_range(CHUNK, CHUNK as usize).await.unwrap();
        assert!(bytes.iter().all(|&b| b == 7));
    }

    #[tokio::test]
    async fn short_last_chunk_length() {
        let dir = tempdir().unwrap();
        let slot = open_sized(dir.path(), CHUNK + 100).await;
        assert_eq!(slot.chunk_len(0), CHUNK);
        assert_eq!(slot.chunk_len(1), 100);
        assert_eq!(slot.chunk_len(2), 0);
    }

    #[tokio::test]
    async fn unsized_slot_refuses_reservations() {
        let dir = tempdir().unwrap();
        let slot = FileSlot::open("k", dir.path().join("b.bin"), CHUNK)
            .await
            .unwrap();
        assert!(slot.size().is_none());
        assert!(slot.reserve_chunks(0, 1).is_err());
    }
}
