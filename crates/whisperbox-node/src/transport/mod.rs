//! Pub/sub transport seam.
//!
//! Delivery is at-least-once and unordered. Besides live delivery a
//! transport can replay history it stored locally and history fetched
//! from the network.

pub mod p2p;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use thiserror::Error;

pub use p2p::Libp2pTransport;
pub use memory::{MemoryHub, MemoryTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no peers for {0:?} after {1:?}")]
    PeerTimeout(Vec<PeerProtocol>, Duration),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("history query failed: {0}")]
    History(String),
    #[error("transport closed")]
    Closed,
}

/// Peer capabilities the engine waits for before joining the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerProtocol {
    /// Peers that accept our publishes.
    Push,
    /// Peers that deliver channel traffic to us.
    Filter,
    /// Peers that answer history queries.
    History,
}

impl PeerProtocol {
    pub const ALL: [PeerProtocol; 3] = [Self::Push, Self::Filter, Self::History];
}

/// Live message stream for one channel.
pub struct Subscription {
    inner: BoxStream<'static, Vec<u8>>,
}

impl Subscription {
    pub fn new(inner: BoxStream<'static, Vec<u8>>) -> Self {
        Self { inner }
    }

    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.inner.next().await
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolve once at least `min_peers` peers support each of `protocols`.
    async fn wait_for_peers(
        &self,
        protocols: &[PeerProtocol],
        min_peers: usize,
    ) -> Result<(), TransportError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError>;

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Messages this node stored for `channel`, oldest first.
    async fn replay_local(&self, channel: &str) -> Result<Vec<Vec<u8>>, TransportError>;

    /// Messages other peers stored for `channel`, oldest first.
    async fn replay_network(&self, channel: &str) -> Result<Vec<Vec<u8>>, TransportError>;
}
