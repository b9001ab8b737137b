//! End-to-end fetch pipeline scenarios against real HTTP fixtures.
//!
//! Each test wires a fetch engine to mock peers and a mock origin served
//! by axum on ephemeral ports, with the in-memory content router standing
//! in for the DHT.

use axum::extract::{Path as AxPath, State as AxState};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use peerd::cache::FileCache;
use peerd::fetch::{Fetcher, FetcherConfig, Origin};
use peerd::metrics::Metrics;
use peerd::routing::mock::MemoryContentRouting;
use peerd::routing::{P2pRouter, PeerInfo, Router, RouterConfig};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MIB: u64 = 1024 * 1024;

/// A blob server fixture: serves configured blobs over the peer wire
/// format and counts ranged GETs.
struct BlobServer {
    addr: SocketAddr,
    range_gets: Arc<AtomicUsize>,
}

#[derive(Clone)]
struct BlobServerState {
    blobs: Arc<HashMap<String, Vec<u8>>>,
    range_gets: Arc<AtomicUsize>,
    delay: Duration,
}

async fn serve_blob(
    AxState(state): AxState<BlobServerState>,
    AxPath(key): AxPath<String>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let Some(body) = state.blobs.get(&key) else {
        return (StatusCode::NOT_FOUND, "no such blob").into_response();
    };
    let total = body.len();

    if method == Method::HEAD {
        return ([(header::CONTENT_LENGTH, total.to_string())], StatusCode::OK).into_response();
    }

    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }

    if let Some((start, end)) = headers
        .get(header::RANGE)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("bytes="))
        .and_then(|s| s.split_once('-'))
        .and_then(|(a, b)| {
            let a: usize = a.parse().ok()?;
            let b: usize = b.parse::<usize>().ok()?.min(total.saturating_sub(1));
            (a <= b && a < total).then_some((a, b))
        })
    {
        state.range_gets.fetch_add(1, Ordering::SeqCst);
        return (
            StatusCode::PARTIAL_CONTENT,
            [(
                header::CONTENT_RANGE,
                format!("bytes {start}-{end}/{total}"),
            )],
            body[start..=end].to_vec(),
        )
            .into_response();
    }

    (StatusCode::OK, body.clone()).into_response()
}

async fn spawn_blob_server(blobs: HashMap<String, Vec<u8>>, delay: Duration) -> BlobServer {
    let range_gets = Arc::new(AtomicUsize::new(0));
    let state = BlobServerState {
        blobs: Arc::new(blobs),
        range_gets: Arc::clone(&range_gets),
        delay,
    };
    let app = axum::Router::new()
        .route("/v2/blobs/{key}", get(serve_blob))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    BlobServer { addr, range_gets }
}

impl BlobServer {
    fn blob_url(&self, key: &str) -> String {
        format!(
            "http://{}/v2/blobs/{}",
            self.addr,
            urlencoding::encode(key)
        )
    }

    fn peer_info(&self, id: &str) -> PeerInfo {
        PeerInfo {
            id: id.to_string(),
            http_host: format!("http://{}", self.addr),
        }
    }
}

struct Harness {
    fetcher: Arc<Fetcher>,
    router: Arc<P2pRouter<MemoryContentRouting>>,
    content: Arc<MemoryContentRouting>,
    cache: Arc<FileCache>,
    dir: tempfile::TempDir,
}

/// Build a fetch engine over a fresh cache root. `peer_port` is the port
/// DHT-resolved peers are addressed on.
fn harness(chunk_size: u64, peer_port: u16) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(FileCache::new(dir.path().to_path_buf(), chunk_size, 64, 5).unwrap());
    let content = Arc::new(MemoryContentRouting::new("self"));
    let router = Arc::new(P2pRouter::new(
        Arc::clone(&content),
        RouterConfig {
            peer_registry_port: peer_port,
            peer_scheme: "http".to_string(),
            ..RouterConfig::default()
        },
    ));
    let dyn_router: Arc<dyn Router> = Arc::clone(&router) as Arc<dyn Router>;
    let fetcher = Fetcher::new(
        Arc::clone(&cache),
        dyn_router,
        reqwest::Client::new(),
        reqwest::Client::new(),
        Metrics::new(),
        FetcherConfig {
            origin_backoff: Duration::from_millis(10),
            ..FetcherConfig::default()
        },
    );
    Harness {
        fetcher,
        router,
        content,
        cache,
        dir,
    }
}

#[tokio::test]
async fn peer_cache_hit_never_touches_origin() {
    let key = "K";
    let peer = spawn_blob_server(
        HashMap::from([(key.to_string(), vec![0xAAu8; MIB as usize])]),
        Duration::ZERO,
    )
    .await;
    let origin = spawn_blob_server(
        HashMap::from([(key.to_string(), vec![0xEEu8; MIB as usize])]),
        Duration::ZERO,
    )
    .await;

    let h = harness(MIB, peer.addr.port());
    // P1 sits in the router's positive cache; no DHT query is needed.
    h.router.annotate(key, vec![peer.peer_info("p1")]);

    let mut sink = Vec::new();
    let written = h
        .fetcher
        .read(
            key,
            0,
            MIB,
            &mut sink,
            &Origin::new(origin.blob_url(key)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(written, MIB);
    assert_eq!(sink.len(), MIB as usize);
    assert!(sink.iter().all(|&b| b == 0xAA));
    assert_eq!(origin.range_gets.load(Ordering::SeqCst), 0);
    assert_eq!(peer.range_gets.load(Ordering::SeqCst), 1);
    assert_eq!(h.content.lookup_count(), 0);
}

#[tokio::test]
async fn all_peers_miss_falls_back_to_origin_and_caches_negative() {
    let key = "K";
    // The peer server knows no blobs: every peer attempt 404s.
    let peers = spawn_blob_server(HashMap::new(), Duration::ZERO).await;
    let origin = spawn_blob_server(
        HashMap::from([(key.to_string(), vec![0xBBu8; MIB as usize])]),
        Duration::ZERO,
    )
    .await;

    let h = harness(MIB, peers.addr.port());
    h.content
        .add_provider(key, "p1", Some(Ipv4Addr::new(127, 0, 0, 1)));
    h.content
        .add_provider(key, "p2", Some(Ipv4Addr::new(127, 0, 0, 1)));

    let mut sink = Vec::new();
    let written = h
        .fetcher
        .read(
            key,
            0,
            MIB,
            &mut sink,
            &Origin::new(origin.blob_url(key)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(written, MIB);
    assert!(sink.iter().all(|&b| b == 0xBB));
    assert_eq!(origin.range_gets.load(Ordering::SeqCst), 1);
    assert_eq!(h.content.lookup_count(), 1);

    // The exhausted resolution was cached negatively: another resolve
    // comes back empty without a DHT query.
    let mut rx = h.router.resolve(key, false, 2).await.unwrap();
    assert!(rx.recv().await.is_none());
    assert_eq!(h.content.lookup_count(), 1);
}

#[tokio::test]
async fn concurrent_readers_share_one_chunk_fetch() {
    let key = "K";
    let origin = spawn_blob_server(
        HashMap::from([(key.to_string(), vec![0x5Au8; 4096])]),
        Duration::from_millis(50),
    )
    .await;

    let h = harness(4096, 1);
    let upstream = Origin::new(origin.blob_url(key));

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let fetcher = Arc::clone(&h.fetcher);
        let upstream = upstream.clone();
        tasks.push(tokio::spawn(async move {
            let mut sink = Vec::new();
            let written = fetcher
                .read(key, 0, 4096, &mut sink, &upstream, &CancellationToken::new())
                .await
                .unwrap();
            (written, sink)
        }));
    }

    for task in tasks {
        let (written, sink) = task.await.unwrap();
        assert_eq!(written, 4096);
        assert!(sink.iter().all(|&b| b == 0x5A));
    }

    // Exactly one ranged GET reached the origin for chunk 0, and the bit
    // was set exactly once.
    assert_eq!(origin.range_gets.load(Ordering::SeqCst), 1);
    let slot = h.cache.peek(key).await.unwrap().unwrap();
    assert_eq!(slot.persisted_chunks(), 1);
}

#[tokio::test]
async fn partial_last_chunk_is_trimmed() {
    let key = "K";
    let total: u64 = 1_500_000;
    let body: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
    let origin = spawn_blob_server(
        HashMap::from([(key.to_string(), body.clone())]),
        Duration::ZERO,
    )
    .await;

    let h = harness(MIB, 1);
    let mut sink = Vec::new();
    let written = h
        .fetcher
        .read(
            key,
            MIB,
            500_000,
            &mut sink,
            &Origin::new(origin.blob_url(key)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    // The request is clamped to the end of the file.
    assert_eq!(written, total - MIB);
    assert_eq!(sink, body[MIB as usize..].to_vec());

    // Only chunk 1 was fetched.
    assert_eq!(origin.range_gets.load(Ordering::SeqCst), 1);
    let slot = h.cache.peek(key).await.unwrap().unwrap();
    assert!(!slot.is_persisted(0));
    assert!(slot.is_persisted(1));
}

#[tokio::test]
async fn reads_past_the_end_are_empty() {
    let key = "K";
    let origin = spawn_blob_server(
        HashMap::from([(key.to_string(), vec![1u8; 4096])]),
        Duration::ZERO,
    )
    .await;

    let h = harness(4096, 1);
    let upstream = Origin::new(origin.blob_url(key));
    let cancel = CancellationToken::new();

    let mut sink = Vec::new();
    assert_eq!(
        h.fetcher
            .read(key, 0, 0, &mut sink, &upstream, &cancel)
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        h.fetcher
            .read(key, 10_000, 100, &mut sink, &upstream, &cancel)
            .await
            .unwrap(),
        0
    );
    assert!(sink.is_empty());
}

#[tokio::test]
async fn cancellation_keeps_completed_chunks() {
    let key = "K";
    let chunks = 16u64;
    let origin = spawn_blob_server(
        HashMap::from([(key.to_string(), vec![9u8; (chunks * 4096) as usize])]),
        Duration::from_millis(150),
    )
    .await;

    let h = harness(4096, 1);
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let mut sink = Vec::new();
    let err = h
        .fetcher
        .read(
            key,
            0,
            chunks * 4096,
            &mut sink,
            &Origin::new(origin.blob_url(key)),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, peerd::error::FetchError::Cancelled));

    // Chunk tasks that were already in flight run to completion; their
    // bytes and bits survive the cancellation.
    let slot = h.cache.peek(key).await.unwrap().unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if slot.persisted_chunks() == chunks {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "persisted {} of {chunks} chunks",
            slot.persisted_chunks()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for c in 0..chunks {
        assert!(slot.is_persisted(c));
    }
}

#[tokio::test]
async fn failed_reads_of_unknown_keys_leave_no_cache_files() {
    let origin = spawn_blob_server(HashMap::new(), Duration::ZERO).await;
    let h = harness(4096, 1);
    let cancel = CancellationToken::new();

    let mut sink = Vec::new();
    let err = h
        .fetcher
        .read("K", 0, 100, &mut sink, &Origin::new(""), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, peerd::error::FetchError::InvalidArgument(_)));

    let err = h
        .fetcher
        .read(
            "K",
            0,
            100,
            &mut sink,
            &Origin::new(origin.blob_url("K")),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, peerd::error::FetchError::NotFound(_)));

    // Neither failure created a slot on disk.
    assert!(
        std::fs::read_dir(h.dir.path()).unwrap().next().is_none(),
        "cache root should stay empty after failed reads"
    );
    assert!(h.cache.peek("K").await.unwrap().is_none());
}

#[tokio::test]
async fn origin_404_surfaces_not_found() {
    let origin = spawn_blob_server(HashMap::new(), Duration::ZERO).await;
    let h = harness(4096, 1);

    let mut sink = Vec::new();
    let err = h
        .fetcher
        .read(
            "K",
            0,
            100,
            &mut sink,
            &Origin::new(origin.blob_url("K")),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, peerd::error::FetchError::NotFound(_)));
}

#[tokio::test]
async fn stat_prefers_local_size_over_origin() {
    let key = "K";
    let origin = spawn_blob_server(
        HashMap::from([(key.to_string(), vec![0u8; 12345])]),
        Duration::ZERO,
    )
    .await;

    let h = harness(4096, 1);
    let upstream = Origin::new(origin.blob_url(key));
    let cancel = CancellationToken::new();

    assert_eq!(
        h.fetcher.stat(key, &upstream, &cancel).await.unwrap(),
        12345
    );

    // Populate the cache, then stat again with an unreachable origin.
    let mut sink = Vec::new();
    h.fetcher
        .read(key, 0, 1, &mut sink, &upstream, &cancel)
        .await
        .unwrap();
    let dead_origin = Origin::new("http://127.0.0.1:1/v2/blobs/K");
    assert_eq!(
        h.fetcher.stat(key, &dead_origin, &cancel).await.unwrap(),
        12345
    );
}

#[tokio::test]
async fn second_read_is_served_from_disk() {
    let key = "K";
    let origin = spawn_blob_server(
        HashMap::from([(key.to_string(), vec![0xC3u8; 8192])]),
        Duration::ZERO,
    )
    .await;

    let h = harness(4096, 1);
    let upstream = Origin::new(origin.blob_url(key));
    let cancel = CancellationToken::new();

    let mut sink = Vec::new();
    h.fetcher
        .read(key, 0, 8192, &mut sink, &upstream, &cancel)
        .await
        .unwrap();
    assert_eq!(origin.range_gets.load(Ordering::SeqCst), 2);

    let mut sink2 = Vec::new();
    let written = h
        .fetcher
        .read(key, 1000, 5000, &mut sink2, &upstream, &cancel)
        .await
        .unwrap();
    assert_eq!(written, 5000);
    assert!(sink2.iter().all(|&b| b == 0xC3));
    // No further origin traffic: both chunks were already persisted.
    assert_eq!(origin.range_gets.load(Ordering::SeqCst), 2);
}
