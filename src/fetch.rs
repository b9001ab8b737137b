//! The fetch engine: peer-first range reads with origin fallback.
//!
//! `read` serves a byte range of a keyed file. Chunks already on disk
//! stream straight out of the cache; missing chunks are reserved through
//! the slot (one owner per chunk, everyone else waits) and fetched on a
//! bounded worker pool, trying resolved peers in arrival order before
//! falling back to the caller-supplied origin. Bytes reach the sink in
//! strictly increasing offset order regardless of fetch completion order.
//!
//! Peer-level failures never surface to callers: a peer that refuses or
//! times out is skipped, and only the terminal outcome of the whole fetch
//! is reported.

use crate::cache::slot::{ChunkClaim, ChunkFault, FileSlot};
use crate::cache::FileCache;
use crate::error::{FetchError, Result};
use crate::metrics::Metrics;
use crate::remote::{blob_url, RemoteError, RemoteReader};
use crate::routing::Router;
use rand::Rng;
use reqwest::header::HeaderMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upstream target for cache misses. Authentication headers pass through
/// verbatim from the caller.
#[derive(Debug, Clone, Default)]
pub struct Origin {
    pub url: String,
    pub headers: HeaderMap,
}

impl Origin {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Size of the chunk-fetch worker pool.
    pub fetch_workers: usize,
    /// Peers requested per resolution.
    pub max_peers_per_resolve: usize,
    /// Extra origin attempts after the first failure.
    pub origin_retries: u32,
    /// Base backoff between origin attempts; doubles per retry.
    pub origin_backoff: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            fetch_workers: 32,
            max_peers_per_resolve: 10,
            origin_retries: 2,
            origin_backoff: Duration::from_millis(250),
        }
    }
}

/// Orchestrates range reads across the cache, the peer mesh, and the
/// origin.
///
/// Peer and origin traffic go through separate HTTP clients: the mesh may
/// run on self-signed intra-cluster certificates, while origin fetches
/// must keep full certificate validation.
pub struct Fetcher {
    cache: Arc<FileCache>,
    router: Arc<dyn Router>,
    peer_client: reqwest::Client,
    origin_client: reqwest::Client,
    workers: Arc<Semaphore>,
    metrics: Metrics,
    config: FetcherConfig,
    owned: parking_lot::Mutex<HashSet<String>>,
}

impl Fetcher {
    pub fn new(
        cache: Arc<FileCache>,
        router: Arc<dyn Router>,
        peer_client: reqwest::Client,
        origin_client: reqwest::Client,
        metrics: Metrics,
        config: FetcherConfig,
    ) -> Arc<Self> {
        let workers = Arc::new(Semaphore::new(config.fetch_workers.max(1)));
        Arc::new(Self {
            cache,
            router,
            peer_client,
            origin_client,
            workers,
            metrics,
            config,
            owned: parking_lot::Mutex::new(HashSet::new()),
        })
    }

    /// The keys this node has at least one persisted chunk of, for
    /// periodic re-advertisement.
    pub fn owned_keys(&self) -> Vec<String> {
        self.owned.lock().iter().cloned().collect()
    }

    /// Total size of `key`, from the local cache when known, otherwise
    /// from the origin.
    pub async fn stat(
        &self,
        key: &str,
        origin: &Origin,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        if key.is_empty() {
            return Err(FetchError::InvalidArgument("empty key".into()));
        }
        if let Some(slot) = self.cache.peek(key).await? {
            if let Some(size) = slot.size() {
                return Ok(size);
            }
        }
        if origin.url.is_empty() {
            return Err(FetchError::InvalidArgument(
                "unknown key and no origin URL".into(),
            ));
        }

        let reader = RemoteReader::new(self.origin_client.clone(), origin.url.clone())
            .with_headers(origin.headers.clone());
        tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            size = reader.fstat() => size.map_err(origin_error),
        }
    }

    /// Stream `[offset, offset + length)` of `key` into `sink`.
    ///
    /// Returns the number of bytes written. Requests past the end of the
    /// file are clamped; a zero-length request succeeds without work.
    pub async fn read<W>(
        self: &Arc<Self>,
        key: &str,
        offset: u64,
        length: u64,
        sink: &mut W,
        origin: &Origin,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        if key.is_empty() {
            return Err(FetchError::InvalidArgument("empty key".into()));
        }
        if length == 0 {
            return Ok(0);
        }
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        // For a key with no local state, resolve the total before touching
        // the disk: an invalid or failing call must not leave an empty
        // slot behind under the cache root.
        let slot = match self.cache.peek(key).await? {
            Some(slot) => slot,
            None => {
                let size = self.stat(key, origin, cancel).await?;
                self.cache.acquire(key, size).await?
            }
        };
        if slot.size().is_none() {
            let size = self.stat(key, origin, cancel).await?;
            slot.ensure_sized(size).await?;
        }
        let Some(size) = slot.size() else {
            return Err(FetchError::Io(std::io::Error::other(
                "slot failed to take a size",
            )));
        };

        if offset >= size {
            return Ok(0);
        }
        let length = length.min(size - offset);
        let end = offset + length;
        let chunk_size = slot.chunk_size();
        let c_lo = offset / chunk_size;
        let c_hi = end.div_ceil(chunk_size);

        let claims = slot.reserve_chunks(c_lo, c_hi)?;

        self.metrics.active_fetches.inc();
        let result = self
            .drive(&slot, claims, key, offset, end, origin, sink, cancel)
            .await;
        self.metrics.active_fetches.dec();
        result
    }

    /// Spawn owner fetches, then drain every chunk into the sink in
    /// offset order.
    #[allow(clippy::too_many_arguments)]
    async fn drive<W>(
        self: &Arc<Self>,
        slot: &Arc<FileSlot>,
        claims: Vec<ChunkClaim>,
        key: &str,
        offset: u64,
        end: u64,
        origin: &Origin,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut owner_tasks: HashMap<u64, JoinHandle<std::result::Result<(), ChunkFault>>> =
            HashMap::new();
        for claim in &claims {
            if let ChunkClaim::Owner(chunk) = claim {
                let task = ChunkTask {
                    fetcher: Arc::clone(self),
                    slot: Arc::clone(slot),
                    key: key.to_string(),
                    chunk: *chunk,
                    origin: origin.clone(),
                    cancel: cancel.clone(),
                };
                owner_tasks.insert(*chunk, tokio::spawn(task.run()));
            }
        }

        let chunk_size = slot.chunk_size();
        let mut written = 0u64;
        for claim in claims {
            let chunk = claim.chunk();
            match claim {
                ChunkClaim::Persisted(_) => {}
                ChunkClaim::Owner(_) => {
                    let handle = owner_tasks
                        .remove(&chunk)
                        .expect("owner claims spawn exactly one task");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        joined = handle => match joined {
                            Ok(Ok(())) => {}
                            Ok(Err(fault)) => return Err(fault_error(fault)),
                            Err(e) => {
                                return Err(FetchError::Io(std::io::Error::other(e)));
                            }
                        },
                    }
                }
                ChunkClaim::Waiter(_, mut signal) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                        outcome = signal.recv() => match outcome {
                            Ok(Ok(())) => {}
                            Ok(Err(fault)) => return Err(fault_error(fault)),
                            Err(RecvError::Closed) | Err(RecvError::Lagged(_)) => {
                                // The owner vanished without signalling;
                                // trust the bitmap as the source of truth.
                                if !slot.is_persisted(chunk) {
                                    return Err(FetchError::Io(std::io::Error::other(
                                        "chunk owner disappeared",
                                    )));
                                }
                            }
                        },
                    }
                }
            }

            // Trim the chunk to the requested byte bounds.
            let chunk_start = chunk * chunk_size;
            let lo = offset.max(chunk_start);
            let hi = end.min(chunk_start + slot.chunk_len(chunk));
            if hi > lo {
                let bytes = slot.read_range(lo, (hi - lo) as usize).await?;
                sink.write_all(&bytes).await?;
                written += bytes.len() as u64;
            }
        }

        sink.flush().await?;
        Ok(written)
    }

    /// Record that this node now owns (part of) `key` and advertise it
    /// once on first ownership.
    fn record_ownership(self: &Arc<Self>, key: &str) {
        let newly_owned = self.owned.lock().insert(key.to_string());
        if !newly_owned {
            return;
        }
        let router = Arc::clone(&self.router);
        let key = key.to_string();
        tokio::spawn(async move {
            if let Err(e) = router.advertise(std::slice::from_ref(&key)).await {
                warn!(key = %key, error = %e, "first advertisement failed");
            }
        });
    }
}

/// One owned chunk fetch, run on the worker pool.
struct ChunkTask {
    fetcher: Arc<Fetcher>,
    slot: Arc<FileSlot>,
    key: String,
    chunk: u64,
    origin: Origin,
    cancel: CancellationToken,
}

impl ChunkTask {
    async fn run(self) -> std::result::Result<(), ChunkFault> {
        let Ok(_permit) = Arc::clone(&self.fetcher.workers).acquire_owned().await else {
            let fault = ChunkFault::Cancelled;
            self.slot.fail_chunk(self.chunk, fault.clone());
            return Err(fault);
        };

        match self.fetch().await {
            Ok(()) => Ok(()),
            Err(fault) => {
                self.slot.fail_chunk(self.chunk, fault.clone());
                Err(fault)
            }
        }
    }

    async fn fetch(&self) -> std::result::Result<(), ChunkFault> {
        let chunk_len = self.slot.chunk_len(self.chunk) as usize;
        let chunk_off = self.chunk * self.slot.chunk_size();
        let metrics = &self.fetcher.metrics;

        // Peers first, in resolution arrival order.
        match self
            .fetcher
            .router
            .resolve_with_negative_cache_callback(
                &self.key,
                false,
                self.fetcher.config.max_peers_per_resolve,
            )
            .await
        {
            Ok((mut peers, mark_negative)) => {
                while let Some(peer) = peers.recv().await {
                    if self.abandoned() {
                        return Err(ChunkFault::Cancelled);
                    }

                    let reader = RemoteReader::new(
                        self.fetcher.peer_client.clone(),
                        blob_url(&peer.http_host, &self.key),
                    );
                    let mut buf = vec![0u8; chunk_len];
                    match reader.pread(&mut buf, chunk_off).await {
                        Ok(n) if n == chunk_len => {
                            self.persist(buf).await?;
                            metrics.peer_hits.inc();
                            metrics.bytes_from_peers.inc_by(chunk_len as u64);
                            self.fetcher.router.annotate(&self.key, vec![peer]);
                            return Ok(());
                        }
                        Ok(n) => {
                            metrics.peer_misses.inc();
                            debug!(
                                key = %self.key,
                                chunk = self.chunk,
                                peer = %peer.http_host,
                                got = n,
                                want = chunk_len,
                                "peer returned a short chunk, trying next"
                            );
                        }
                        Err(e) => {
                            metrics.peer_misses.inc();
                            debug!(
                                key = %self.key,
                                chunk = self.chunk,
                                peer = %peer.http_host,
                                error = %e,
                                refusal = e.is_refusal(),
                                "peer fetch failed, trying next"
                            );
                        }
                    }
                }
                // Every candidate was tried and none worked.
                mark_negative();
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "peer resolution failed, going to origin");
            }
        }

        self.fetch_from_origin(chunk_off, chunk_len).await
    }

    async fn fetch_from_origin(
        &self,
        chunk_off: u64,
        chunk_len: usize,
    ) -> std::result::Result<(), ChunkFault> {
        if self.origin.url.is_empty() {
            return Err(ChunkFault::NotFound(format!(
                "no peer holds {} and no origin URL was supplied",
                self.key
            )));
        }

        let metrics = &self.fetcher.metrics;
        let reader = RemoteReader::new(self.fetcher.origin_client.clone(), self.origin.url.clone())
            .with_headers(self.origin.headers.clone());

        let mut attempt: u32 = 0;
        loop {
            if self.abandoned() {
                return Err(ChunkFault::Cancelled);
            }

            let mut buf = vec![0u8; chunk_len];
            let outcome = reader.pread(&mut buf, chunk_off).await;
            match outcome {
                Ok(n) if n == chunk_len => {
                    self.persist(buf).await?;
                    metrics.origin_fetches.inc();
                    metrics.bytes_from_origin.inc_by(chunk_len as u64);
                    return Ok(());
                }
                Ok(n) => {
                    metrics.origin_failures.inc();
                    return Err(ChunkFault::Fetch(format!(
                        "origin returned {n} of {chunk_len} bytes for chunk {}",
                        self.chunk
                    )));
                }
                Err(e) => {
                    // 4xx will not improve with retries.
                    if e.is_not_found() {
                        metrics.origin_failures.inc();
                        return Err(ChunkFault::NotFound(e.to_string()));
                    }
                    if e.is_refusal() || attempt >= self.fetcher.config.origin_retries {
                        metrics.origin_failures.inc();
                        return Err(ChunkFault::Fetch(e.to_string()));
                    }

                    let backoff = self.fetcher.config.origin_backoff * 2u32.pow(attempt);
                    let jitter =
                        Duration::from_millis(rand::rng().random_range(0..50));
                    debug!(
                        key = %self.key,
                        chunk = self.chunk,
                        attempt,
                        error = %e,
                        "origin fetch failed, backing off"
                    );
                    tokio::time::sleep(backoff + jitter).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn persist(&self, bytes: Vec<u8>) -> std::result::Result<(), ChunkFault> {
        self.slot
            .complete_chunk(self.chunk, bytes)
            .await
            .map_err(|e| ChunkFault::Io(e.to_string()))?;
        self.fetcher.record_ownership(&self.key);
        Ok(())
    }

    /// Whether this fetch lost both its initiating caller and every
    /// waiter. Owners keep going for their audience; with nobody left
    /// they abort between attempts.
    fn abandoned(&self) -> bool {
        self.cancel.is_cancelled() && !self.slot.has_waiters(self.chunk)
    }
}

fn fault_error(fault: ChunkFault) -> FetchError {
    match fault {
        ChunkFault::NotFound(msg) => FetchError::NotFound(msg),
        ChunkFault::Fetch(msg) => FetchError::OriginFailure(msg),
        ChunkFault::Io(msg) => FetchError::Io(std::io::Error::other(msg)),
        ChunkFault::Cancelled => FetchError::Cancelled,
    }
}

fn origin_error(err: RemoteError) -> FetchError {
    if err.is_not_found() {
        FetchError::NotFound(err.to_string())
    } else {
        FetchError::OriginFailure(err.to_string())
    }
}
