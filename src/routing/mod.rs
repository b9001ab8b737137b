//! Content-addressed peer discovery.
//!
//! The router answers "which peers hold key *k*?" over a Kademlia-style
//! DHT, shaped by two caches sharing one bounded store: a positive cache
//! of peers known to hold a key and a negative cache of keys that recently
//! had no reachable provider. Negative marking is driven by the consumer's
//! verdict, never by an empty DHT reply — a slow-to-propagate DHT must not
//! poison later lookups.
//!
//! Keys are translated to DHT content identifiers by hashing the key
//! bytes with SHA-256 into a raw-codec CIDv1; the translation is
//! deterministic across processes.

pub mod mock;
pub mod p2p;

use crate::cache::syncmap::SyncMap;
use async_trait::async_trait;
use cid::Cid;
use multihash::Multihash;
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Raw multicodec, the content type used for blob identifiers.
const RAW_CODEC: u64 = 0x55;

/// SHA2-256 multihash code.
const SHA2_256_CODE: u64 = 0x12;

/// Errors from the discovery layer. Empty results are not errors.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The key could not be hashed into a content identifier.
    #[error("invalid content key: {0}")]
    ContentId(String),

    /// The DHT backend could not even start the query.
    #[error("discovery backend unavailable: {0}")]
    Backend(String),

    /// Some keys in an advertisement batch failed; the rest went through.
    #[error("advertise failed for {failed} of {total} keys")]
    PartialAdvertise { failed: usize, total: usize },
}

/// A resolved peer, addressable over the cluster's peer HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// The peer's DHT identity.
    pub id: String,
    /// Absolute URL base, `<scheme>://<ip>:<peer_registry_port>`.
    pub http_host: String,
}

/// A raw provider record as surfaced by the DHT, before address shaping.
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    /// The provider's peer identity.
    pub id: String,
    /// First advertised IPv4 address, when known.
    pub ipv4: Option<Ipv4Addr>,
}

/// The DHT contract the router needs: advertise a content identifier and
/// stream back providers for one. Any implementation suffices, including
/// in-memory fakes for tests.
#[async_trait]
pub trait ContentRouting: Send + Sync + 'static {
    /// Advertise this node as a provider of `cid`.
    async fn provide(&self, cid: Cid) -> Result<(), RouteError>;

    /// Stream up to `count` provider records for `cid`. The channel closes
    /// when the query is exhausted.
    async fn find_providers(
        &self,
        cid: Cid,
        count: usize,
    ) -> Result<mpsc::Receiver<ProviderRecord>, RouteError>;

    /// This node's own peer identity, for self-filtering.
    fn local_peer(&self) -> String;
}

/// Callback handed to resolve consumers; invoking it records that every
/// candidate was tried and none worked. Idempotent.
pub type NegCacheCallback = Box<dyn Fn() + Send + Sync>;

/// Peer resolution and advertisement for content keys.
#[async_trait]
pub trait Router: Send + Sync {
    /// Advertise ownership of `keys` to the DHT. Per-key failures are
    /// collected; the batch never aborts early.
    async fn advertise(&self, keys: &[String]) -> Result<(), RouteError>;

    /// Emit up to `count` candidate peers for `key`. A fresh negative
    /// cache entry yields an empty, already-closed channel; a positive
    /// entry replays the cached peers; otherwise the DHT is queried.
    async fn resolve(
        &self,
        key: &str,
        allow_self: bool,
        count: usize,
    ) -> Result<mpsc::Receiver<PeerInfo>, RouteError>;

    /// Like [`Router::resolve`], plus a callback the consumer invokes
    /// after draining the channel without success.
    async fn resolve_with_negative_cache_callback(
        &self,
        key: &str,
        allow_self: bool,
        count: usize,
    ) -> Result<(mpsc::Receiver<PeerInfo>, NegCacheCallback), RouteError>;

    /// Record peers that actually served bytes for `key` in the positive
    /// cache. Positive caching is the caller's decision so that peers that
    /// proved unreachable never poison the cache.
    fn annotate(&self, key: &str, peers: Vec<PeerInfo>);
}

/// One entry per key; the latest write wins, so a positive and a negative
/// entry never coexist.
#[derive(Clone)]
enum ResolveEntry {
    Peers(Vec<PeerInfo>, Instant),
    NotFound(Instant),
}

/// Tuning for the router's caches and address shaping.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// TCP port of every peer's HTTP surface.
    pub peer_registry_port: u16,
    /// URL scheme for peer hosts.
    pub peer_scheme: String,
    /// Lifetime of positive resolutions.
    pub t_positive: Duration,
    /// Lifetime of negative (no provider) resolutions.
    pub t_negative: Duration,
    /// Capacity of the resolution cache.
    pub map_capacity: usize,
    /// Bulk eviction percentage of the resolution cache.
    pub map_evict_pct: usize,
    /// Upper bound on peers returned per resolve.
    pub max_peers_per_resolve: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            peer_registry_port: 5000,
            peer_scheme: "https".to_string(),
            t_positive: Duration::from_secs(300),
            t_negative: Duration::from_secs(30),
            map_capacity: 4096,
            map_evict_pct: 5,
            max_peers_per_resolve: 10,
        }
    }
}

/// Router over a [`ContentRouting`] backend with layered caches.
pub struct P2pRouter<C: ContentRouting> {
    content: Arc<C>,
    lookup_cache: Arc<SyncMap<ResolveEntry>>,
    config: RouterConfig,
    negative_hits: Option<prometheus_client::metrics::counter::Counter>,
}

impl<C: ContentRouting> P2pRouter<C> {
    pub fn new(content: Arc<C>, config: RouterConfig) -> Self {
        let lookup_cache = Arc::new(SyncMap::with_eviction_percentage(
            config.map_capacity,
            config.map_evict_pct,
        ));
        Self {
            content,
            lookup_cache,
            config,
            negative_hits: None,
        }
    }

    /// Count negative-cache hits on `counter`.
    pub fn with_negative_hit_counter(
        mut self,
        counter: prometheus_client::metrics::counter::Counter,
    ) -> Self {
        self.negative_hits = Some(counter);
        self
    }

    /// Fresh cache entry for `key`, if any. Expired entries read as misses.
    fn cache_lookup(&self, key: &str) -> Option<ResolveEntry> {
        match self.lookup_cache.get(key)? {
            ResolveEntry::Peers(peers, stored) if stored.elapsed() < self.config.t_positive => {
                Some(ResolveEntry::Peers(peers, stored))
            }
            ResolveEntry::NotFound(stored) if stored.elapsed() < self.config.t_negative => {
                Some(ResolveEntry::NotFound(stored))
            }
            _ => {
                self.lookup_cache.delete(key);
                None
            }
        }
    }
}

#[async_trait]
impl<C: ContentRouting> Router for P2pRouter<C> {
    async fn advertise(&self, keys: &[String]) -> Result<(), RouteError> {
        let mut failed = 0usize;
        for key in keys {
            let outcome = match content_id(key) {
                Ok(cid) => self.content.provide(cid).await,
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                warn!(key, error = %e, "advertise failed");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(RouteError::PartialAdvertise {
                failed,
                total: keys.len(),
            });
        }
        Ok(())
    }

    async fn resolve(
        &self,
        key: &str,
        allow_self: bool,
        count: usize,
    ) -> Result<mpsc::Receiver<PeerInfo>, RouteError> {
        let count = count.max(1).min(self.config.max_peers_per_resolve.max(1));

        match self.cache_lookup(key) {
            Some(ResolveEntry::NotFound(_)) => {
                debug!(key, "resolve suppressed by negative cache");
                if let Some(counter) = &self.negative_hits {
                    counter.inc();
                }
                let (_tx, rx) = mpsc::channel(1);
                return Ok(rx);
            }
            Some(ResolveEntry::Peers(peers, _)) => {
                debug!(key, peers = peers.len(), "resolve served from cache");
                let (tx, rx) = mpsc::channel(count.max(peers.len()).max(1));
                for peer in peers.into_iter().take(count) {
                    let _ = tx.try_send(peer);
                }
                return Ok(rx);
            }
            None => {}
        }

        let cid = content_id(key)?;
        let mut providers = self.content.find_providers(cid, count).await?;
        let local = self.content.local_peer();
        let scheme_host = {
            let config = self.config.clone();
            move |ip: Ipv4Addr| {
                format!(
                    "{}://{}:{}",
                    config.peer_scheme, ip, config.peer_registry_port
                )
            }
        };

        let (tx, rx) = mpsc::channel(count);
        tokio::spawn(async move {
            let mut emitted = 0usize;
            while let Some(record) = providers.recv().await {
                if !allow_self && record.id == local {
                    continue;
                }
                let Some(ip) = record.ipv4 else {
                    continue;
                };
                let info = PeerInfo {
                    id: record.id,
                    http_host: scheme_host(ip),
                };
                if tx.send(info).await.is_err() {
                    break;
                }
                emitted += 1;
                if emitted >= count {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn resolve_with_negative_cache_callback(
        &self,
        key: &str,
        allow_self: bool,
        count: usize,
    ) -> Result<(mpsc::Receiver<PeerInfo>, NegCacheCallback), RouteError> {
        let rx = self.resolve(key, allow_self, count).await?;

        let cache = Arc::clone(&self.lookup_cache);
        let key = key.to_string();
        let callback: NegCacheCallback = Box::new(move || {
            debug!(key = %key, "caching negative resolution");
            cache.set(key.clone(), ResolveEntry::NotFound(Instant::now()));
        });

        Ok((rx, callback))
    }

    fn annotate(&self, key: &str, peers: Vec<PeerInfo>) {
        if peers.is_empty() {
            return;
        }
        self.lookup_cache
            .set(key, ResolveEntry::Peers(peers, Instant::now()));
    }
}

/// Derive the DHT content identifier for a key:
/// `CIDv1(raw, sha2-256(key bytes))`. Stable across processes.
pub fn content_id(key: &str) -> Result<Cid, RouteError> {
    let digest = Sha256::digest(key.as_bytes());
    let mh = Multihash::<64>::wrap(SHA2_256_CODE, &digest)
        .map_err(|e| RouteError::ContentId(e.to_string()))?;
    Ok(Cid::new_v1(RAW_CODEC, mh))
}
