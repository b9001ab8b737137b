//! In-memory [`ContentRouting`] for tests and local development.
//!
//! Resolution tables are keyed by content identifier, mirroring what a
//! real DHT sees, and every lookup is counted so tests can assert whether
//! the caches actually suppressed a query.

use crate::routing::{content_id, ContentRouting, ProviderRecord, RouteError};
use async_trait::async_trait;
use cid::Cid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

/// A content router backed by a plain map.
pub struct MemoryContentRouting {
    local: String,
    providers: Mutex<HashMap<Cid, Vec<ProviderRecord>>>,
    provided: Mutex<Vec<Cid>>,
    lookups: AtomicUsize,
    fail_next_provide: AtomicBool,
}

impl MemoryContentRouting {
    pub fn new(local_peer: &str) -> Self {
        Self {
            local: local_peer.to_string(),
            providers: Mutex::new(HashMap::new()),
            provided: Mutex::new(Vec::new()),
            lookups: AtomicUsize::new(0),
            fail_next_provide: AtomicBool::new(false),
        }
    }

    /// Register a provider for `key`, keyed internally by its content id.
    pub fn add_provider(&self, key: &str, peer: &str, ipv4: Option<Ipv4Addr>) {
        let cid = content_id(key).expect("valid key");
        self.providers.lock().entry(cid).or_default().push(ProviderRecord {
            id: peer.to_string(),
            ipv4,
        });
    }

    /// Drop all providers registered for `key`.
    pub fn remove_providers(&self, key: &str) {
        let cid = content_id(key).expect("valid key");
        self.providers.lock().remove(&cid);
    }

    /// Content ids advertised so far, in order.
    pub fn provided(&self) -> Vec<Cid> {
        self.provided.lock().clone()
    }

    /// Number of provider lookups that reached this backend.
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Make the next `provide` call fail once.
    pub fn fail_next_provide(&self) {
        self.fail_next_provide.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContentRouting for MemoryContentRouting {
    async fn provide(&self, cid: Cid) -> Result<(), RouteError> {
        if self.fail_next_provide.swap(false, Ordering::SeqCst) {
            return Err(RouteError::Backend("injected provide failure".into()));
        }
        self.provided.lock().push(cid);
        Ok(())
    }

    async fn find_providers(
        &self,
        cid: Cid,
        count: usize,
    ) -> Result<mpsc::Receiver<ProviderRecord>, RouteError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);

        let records: Vec<ProviderRecord> = self
            .providers
            .lock()
            .get(&cid)
            .map(|v| v.iter().take(count.max(1)).cloned().collect())
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel(count.max(1));
        for record in records {
            let _ = tx.try_send(record);
        }
        // Dropping the sender closes the stream: an unknown cid resolves
        // to an immediately-exhausted channel.
        Ok(rx)
    }

    fn local_peer(&self) -> String {
        self.local.clone()
    }
}
