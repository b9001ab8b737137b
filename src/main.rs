//! Peerd entry point.
//!
//! Peerd is a node-local agent that joins a cluster-wide distribution
//! mesh: it advertises the blob ranges it has cached, serves them to
//! peers over HTTP, and fills local misses from peers before touching
//! the upstream origin.

use anyhow::Result;
use clap::Parser;
use libp2p::Multiaddr;
use peerd::cache::FileCache;
use peerd::config::PeerdConfig;
use peerd::fetch::Fetcher;
use peerd::handlers;
use peerd::metrics::Metrics;
use peerd::routing::p2p::SwarmRouting;
use peerd::routing::{P2pRouter, Router};
use peerd::state::AppState;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "PEERD_CONFIG")]
    config: Option<String>,

    /// Cache root directory (overrides config)
    #[arg(long, env = "PEERD_CACHE_ROOT")]
    cache_root: Option<String>,

    /// Peer HTTP port (overrides config)
    #[arg(long, env = "PEERD_REGISTRY_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "Starting peerd");

    let mut config = match PeerdConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "Config load warning, using defaults");
            PeerdConfig::default()
        }
    };
    if let Some(root) = cli.cache_root {
        config.cache.root = root;
    }
    if let Some(port) = cli.port {
        config.network.peer_registry_port = port;
    }

    info!(
        cache_root = %config.cache.root,
        chunk_size = config.cache.chunk_size,
        registry_port = config.network.peer_registry_port,
        p2p_port = config.network.p2p_port,
        "Configuration loaded"
    );

    // 1. Partial-file cache.
    let cache = Arc::new(FileCache::new(
        config.cache.root.clone().into(),
        config.cache.chunk_size,
        config.routing.map_capacity,
        config.routing.map_evict_pct,
    )?);

    // 2. DHT swarm and router.
    let bootstrap: Vec<Multiaddr> = config
        .network
        .bootstrap_peers
        .iter()
        .filter_map(|s| match s.parse() {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!(addr = %s, error = %e, "Skipping unparseable bootstrap peer");
                None
            }
        })
        .collect();
    let swarm = SwarmRouting::spawn(config.network.p2p_port, &bootstrap)
        .map_err(|e| anyhow::anyhow!("DHT startup failed: {e}"))?;
    let metrics = Metrics::new();
    let router: Arc<dyn Router> = Arc::new(
        P2pRouter::new(Arc::new(swarm), config.router_config())
            .with_negative_hit_counter(metrics.negative_cache_hits.clone()),
    );

    // 3. Fetch engine. Peer and origin traffic use separate clients:
    // mesh peers present self-signed intra-cluster certificates, so only
    // the peer client relaxes verification. Origin fetches always
    // validate certificates.
    let request_timeout = Duration::from_secs(config.tuning.request_timeout_secs);
    let peer_client = reqwest::Client::builder()
        .timeout(request_timeout)
        .danger_accept_invalid_certs(config.network.peer_scheme == "https")
        .build()?;
    let origin_client = reqwest::Client::builder()
        .timeout(request_timeout)
        .build()?;
    let fetcher = Fetcher::new(
        Arc::clone(&cache),
        Arc::clone(&router),
        peer_client,
        origin_client,
        metrics.clone(),
        config.fetcher_config(),
    );

    // 4. Periodic re-advertisement of owned keys, jittered so a fleet
    // restart does not hammer the DHT in lockstep.
    spawn_advertise_loop(
        Arc::clone(&fetcher),
        Arc::clone(&router),
        config.network.advertise_interval_secs,
    );

    // 5. Peer HTTP surface.
    let state = AppState {
        cache,
        fetcher,
        metrics,
    };
    let app = handlers::app(state);
    let listener = tokio::net::TcpListener::bind((
        std::net::Ipv4Addr::UNSPECIFIED,
        config.network.peer_registry_port,
    ))
    .await?;
    info!(
        port = config.network.peer_registry_port,
        "Peer HTTP surface listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down");
        })
        .await?;

    Ok(())
}

/// Re-advertise every owned key on a fixed interval.
///
/// DHT provider records expire; without re-provide a node silently drops
/// out of resolution for content it still holds.
fn spawn_advertise_loop(fetcher: Arc<Fetcher>, router: Arc<dyn Router>, interval_secs: u64) {
    tokio::spawn(async move {
        let jitter_secs = rand::rng().random_range(0..interval_secs.max(1));
        tokio::time::sleep(Duration::from_secs(jitter_secs)).await;

        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            ticker.tick().await;
            let keys = fetcher.owned_keys();
            if keys.is_empty() {
                continue;
            }
            if let Err(e) = router.advertise(&keys).await {
                error!(error = %e, keys = keys.len(), "Periodic advertisement failed");
            }
        }
    });
}
