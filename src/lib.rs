//! Core library for the peerd daemon.
//!
//! Peerd turns a fleet of nodes into a peer-to-peer distribution mesh for
//! container-image blobs and other HTTP-addressed files. Each node serves
//! the byte ranges it has already pulled and fetches misses from peers in
//! the same cluster before falling back to the upstream origin.
//!
//! The fetch pipeline is built from three subsystems:
//! - [`routing`] — content-addressed peer discovery over a Kademlia DHT,
//!   shaped by positive and negative resolution caches.
//! - [`cache`] — the partial-file store: per-key file slots, a persisted
//!   chunk bitmap, and per-chunk fetch reservations.
//! - [`fetch`] — the orchestrator that races peers against the origin and
//!   streams bytes back in offset order.

pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod handlers;
pub mod metrics;
pub mod remote;
pub mod routing;
pub mod state;
