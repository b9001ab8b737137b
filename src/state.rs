//! Application state for the peer HTTP surface.

use crate::cache::FileCache;
use crate::fetch::Fetcher;
use crate::metrics::Metrics;
use std::sync::Arc;

/// Shared state for all HTTP handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    /// The partial-file cache this node serves from.
    pub cache: Arc<FileCache>,
    /// The fetch engine; the seam where a registry-adapting front-end
    /// plugs its read/stat calls in.
    pub fetcher: Arc<Fetcher>,
    /// Prometheus metrics.
    pub metrics: Metrics,
}
