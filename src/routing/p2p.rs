//! Kademlia-backed [`ContentRouting`] over a libp2p swarm.
//!
//! The swarm runs on its own task and is driven exclusively through a
//! command channel; callers never touch libp2p types. Provider lookups
//! are translated into per-query provider streams: each `GetProviders`
//! progress event feeds the requesting channel until the requested count
//! is reached or the query is exhausted.

use crate::cache::syncmap::SyncMap;
use crate::routing::{ContentRouting, ProviderRecord, RouteError};
use async_trait::async_trait;
use cid::Cid;
use futures::StreamExt;
use libp2p::kad::store::MemoryStore;
use libp2p::kad::{self, GetProvidersOk, QueryId, QueryResult, RecordKey};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::SwarmEvent;
use libp2p::{Multiaddr, PeerId, Swarm, SwarmBuilder};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How many commands may queue before backpressure reaches callers.
const COMMAND_BUFFER: usize = 64;

/// Bound on the peer → listen-address book fed from routing updates.
const ADDR_BOOK_CAPACITY: usize = 1024;

/// Handle to the swarm task; cheap to clone.
#[derive(Clone)]
pub struct SwarmRouting {
    cmd_tx: mpsc::Sender<SwarmCommand>,
    local_peer_id: PeerId,
}

enum SwarmCommand {
    Provide {
        cid: Cid,
        reply: oneshot::Sender<Result<(), RouteError>>,
    },
    FindProviders {
        cid: Cid,
        count: usize,
        sink: mpsc::Sender<ProviderRecord>,
    },
}

/// State of one in-flight `GetProviders` query.
struct ProviderLookup {
    sink: mpsc::Sender<ProviderRecord>,
    seen: HashSet<PeerId>,
    remaining: usize,
}

impl SwarmRouting {
    /// Build the swarm, start listening on `p2p_port`, dial the bootstrap
    /// peers, and spawn the event loop.
    pub fn spawn(p2p_port: u16, bootstrap_peers: &[Multiaddr]) -> Result<Self, RouteError> {
        let mut swarm = SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                libp2p::tcp::Config::default(),
                libp2p::noise::Config::new,
                libp2p::yamux::Config::default,
            )
            .map_err(|e| RouteError::Backend(format!("tcp transport: {e}")))?
            .with_behaviour(|key| {
                let peer_id = key.public().to_peer_id();
                kad::Behaviour::new(peer_id, MemoryStore::new(peer_id))
            })
            .map_err(|e| RouteError::Backend(format!("behaviour: {e}")))?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        // Server mode so this node answers provider queries and accepts
        // provider records even before the routing table fills up.
        swarm.behaviour_mut().set_mode(Some(kad::Mode::Server));

        let listen: Multiaddr = format!("/ip4/0.0.0.0/tcp/{p2p_port}")
            .parse()
            .map_err(|e| RouteError::Backend(format!("listen addr: {e}")))?;
        swarm
            .listen_on(listen)
            .map_err(|e| RouteError::Backend(format!("listen: {e}")))?;

        for addr in bootstrap_peers {
            let Some(peer_id) = addr.iter().find_map(|p| match p {
                Protocol::P2p(peer_id) => Some(peer_id),
                _ => None,
            }) else {
                warn!(%addr, "bootstrap address lacks a /p2p/ component, skipping");
                continue;
            };
            info!(peer = %peer_id, %addr, "adding bootstrap peer");
            swarm.behaviour_mut().add_address(&peer_id, addr.clone());
        }
        if !bootstrap_peers.is_empty() {
            if let Err(e) = swarm.behaviour_mut().bootstrap() {
                warn!(error = %e, "initial DHT bootstrap failed");
            }
        }

        let local_peer_id = *swarm.local_peer_id();
        info!(peer = %local_peer_id, port = p2p_port, "DHT swarm starting");

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(
            SwarmDriver {
                swarm,
                cmd_rx,
                pending_provides: HashMap::new(),
                pending_lookups: HashMap::new(),
                addr_book: SyncMap::new(ADDR_BOOK_CAPACITY),
            }
            .run(),
        );

        Ok(Self {
            cmd_tx,
            local_peer_id,
        })
    }
}

#[async_trait]
impl ContentRouting for SwarmRouting {
    async fn provide(&self, cid: Cid) -> Result<(), RouteError> {
        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SwarmCommand::Provide { cid, reply })
            .await
            .map_err(|_| RouteError::Backend("swarm task is gone".into()))?;
        reply_rx
            .await
            .map_err(|_| RouteError::Backend("swarm task dropped the reply".into()))?
    }

    async fn find_providers(
        &self,
        cid: Cid,
        count: usize,
    ) -> Result<mpsc::Receiver<ProviderRecord>, RouteError> {
        let count = count.max(1);
        let (sink, rx) = mpsc::channel(count);
        self.cmd_tx
            .send(SwarmCommand::FindProviders { cid, count, sink })
            .await
            .map_err(|_| RouteError::Backend("swarm task is gone".into()))?;
        Ok(rx)
    }

    fn local_peer(&self) -> String {
        self.local_peer_id.to_string()
    }
}

struct SwarmDriver {
    swarm: Swarm<kad::Behaviour<MemoryStore>>,
    cmd_rx: mpsc::Receiver<SwarmCommand>,
    pending_provides: HashMap<QueryId, oneshot::Sender<Result<(), RouteError>>>,
    pending_lookups: HashMap<QueryId, ProviderLookup>,
    // Peer listen addresses observed via routing updates; providers are
    // only addressable over HTTP once an IPv4 address is known for them.
    addr_book: SyncMap<Vec<Multiaddr>>,
}

impl SwarmDriver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // All handles dropped: shut the swarm down.
                    None => break,
                },
                event = self.swarm.select_next_some() => self.handle_event(event),
            }
        }
        debug!("DHT swarm task exiting");
    }

    fn handle_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::Provide { cid, reply } => {
                let key = RecordKey::new(&cid.to_bytes());
                match self.swarm.behaviour_mut().start_providing(key) {
                    Ok(query_id) => {
                        self.pending_provides.insert(query_id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(RouteError::Backend(format!(
                            "start_providing: {e}"
                        ))));
                    }
                }
            }
            SwarmCommand::FindProviders { cid, count, sink } => {
                let key = RecordKey::new(&cid.to_bytes());
                let query_id = self.swarm.behaviour_mut().get_providers(key);
                self.pending_lookups.insert(
                    query_id,
                    ProviderLookup {
                        sink,
                        seen: HashSet::new(),
                        remaining: count,
                    },
                );
            }
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<kad::Event>) {
        match event {
            SwarmEvent::Behaviour(kad::Event::OutboundQueryProgressed { id, result, .. }) => {
                self.handle_query_progress(id, result)
            }
            SwarmEvent::Behaviour(kad::Event::RoutingUpdated {
                peer, addresses, ..
            }) => {
                self.addr_book
                    .set(peer.to_base58(), addresses.into_vec());
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "DHT listening");
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!(peer = %peer_id, "peer connected");
            }
            _ => {}
        }
    }

    fn handle_query_progress(&mut self, id: QueryId, result: QueryResult) {
        match result {
            QueryResult::StartProviding(outcome) => {
                if let Some(reply) = self.pending_provides.remove(&id) {
                    let _ = reply.send(
                        outcome
                            .map(|_| ())
                            .map_err(|e| RouteError::Backend(format!("provide: {e}"))),
                    );
                }
            }
            QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders {
                providers, ..
            })) => {
                let Some(lookup) = self.pending_lookups.get_mut(&id) else {
                    return;
                };
                let mut satisfied = false;
                for peer in providers {
                    if !lookup.seen.insert(peer) {
                        continue;
                    }
                    let record = ProviderRecord {
                        id: peer.to_string(),
                        ipv4: first_ipv4(&self.addr_book, &peer),
                    };
                    if lookup.sink.try_send(record).is_err() {
                        satisfied = true;
                        break;
                    }
                    lookup.remaining = lookup.remaining.saturating_sub(1);
                    if lookup.remaining == 0 {
                        satisfied = true;
                        break;
                    }
                }
                if satisfied {
                    self.pending_lookups.remove(&id);
                    if let Some(mut query) = self.swarm.behaviour_mut().query_mut(&id) {
                        query.finish();
                    }
                }
            }
            QueryResult::GetProviders(Ok(
                GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
            )) => {
                // Dropping the lookup drops its sink, closing the stream.
                self.pending_lookups.remove(&id);
            }
            QueryResult::GetProviders(Err(e)) => {
                debug!(error = %e, "provider lookup ended");
                self.pending_lookups.remove(&id);
            }
            QueryResult::Bootstrap(Ok(_)) => {}
            QueryResult::Bootstrap(Err(e)) => {
                warn!(error = %e, "DHT bootstrap round failed");
            }
            _ => {}
        }
    }
}

fn first_ipv4(addr_book: &SyncMap<Vec<Multiaddr>>, peer: &PeerId) -> Option<Ipv4Addr> {
    addr_book.get(&peer.to_base58())?.iter().find_map(|addr| {
        addr.iter().find_map(|p| match p {
            Protocol::Ip4(ip) if !ip.is_loopback() => Some(ip),
            _ => None,
        })
    })
}
