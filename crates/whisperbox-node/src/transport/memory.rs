//! In-process transport: every `MemoryTransport` connected to the same
//! `MemoryHub` sees the others' publishes. The hub also keeps the
//! network-wide history served by `replay_network`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, Mutex};

use super::{PeerProtocol, Subscription, Transport, TransportError};
use crate::history::HistoryStore;

const CHANNEL_CAPACITY: usize = 256;
const PEER_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone)]
struct HubMessage {
    origin:  u64,
    payload: Vec<u8>,
}

pub struct MemoryHub {
    channels: Mutex<HashMap<String, broadcast::Sender<HubMessage>>>,
    history:  Mutex<HistoryStore>,
    members:  AtomicUsize,
    next_id:  AtomicU64,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            history:  Mutex::new(HistoryStore::in_memory()),
            members:  AtomicUsize::new(0),
            next_id:  AtomicU64::new(1),
        })
    }

    async fn channel(&self, name: &str) -> broadcast::Sender<HubMessage> {
        let mut guard = self.channels.lock().await;
        guard
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Messages ever published on `channel` through this hub.
    pub async fn history(&self, channel: &str) -> Vec<Vec<u8>> {
        entries(&self.history, channel).await
    }
}

type LocalHistory = Arc<Mutex<HistoryStore>>;

async fn record(history: &Mutex<HistoryStore>, channel: &str, payload: &[u8]) {
    if let Err(e) = history.lock().await.record(channel, payload) {
        tracing::warn!("History append failed on {channel}: {e}");
    }
}

async fn entries(history: &Mutex<HistoryStore>, channel: &str) -> Vec<Vec<u8>> {
    match history.lock().await.entries(channel) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("History read failed on {channel}: {e}");
            Vec::new()
        }
    }
}

pub struct MemoryTransport {
    hub:     Arc<MemoryHub>,
    id:      u64,
    local:   LocalHistory,
    offline: AtomicBool,
}

impl MemoryTransport {
    pub fn connect(hub: &Arc<MemoryHub>) -> Self {
        hub.members.fetch_add(1, Ordering::SeqCst);
        Self {
            hub:     Arc::clone(hub),
            id:      hub.next_id.fetch_add(1, Ordering::Relaxed),
            local:   Arc::new(Mutex::new(HistoryStore::in_memory())),
            offline: AtomicBool::new(false),
        }
    }

    /// Seed local history, as if these messages had been seen in an earlier run.
    pub async fn preload_local(&self, channel: &str, payloads: Vec<Vec<u8>>) {
        for payload in payloads {
            record(&self.local, channel, &payload).await;
        }
    }

    /// While offline every publish fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn peer_count(&self) -> usize {
        self.hub.members.load(Ordering::SeqCst).saturating_sub(1)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.hub.members.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn wait_for_peers(
        &self,
        _protocols: &[PeerProtocol],
        min_peers: usize,
    ) -> Result<(), TransportError> {
        // Every hub member speaks every protocol.
        while self.peer_count() < min_peers {
            tokio::time::sleep(PEER_POLL_INTERVAL).await;
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        let rx = self.hub.channel(channel).await.subscribe();
        let state = (rx, self.id, Arc::clone(&self.local), channel.to_string());

        let stream = stream::unfold(state, |(mut rx, id, local, channel)| async move {
            loop {
                match rx.recv().await {
                    // No self-delivery, like gossipsub.
                    Ok(msg) if msg.origin == id => continue,
                    Ok(msg) => {
                        record(&local, &channel, &msg.payload).await;
                        return Some((msg.payload, (rx, id, local, channel)));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Memory subscription on {channel} lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Subscription::new(stream.boxed()))
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("transport is offline".into()));
        }
        record(&self.local, channel, &payload).await;
        record(&self.hub.history, channel, &payload).await;
        // No receivers is not an error: publishing into an empty network is fine.
        let _ = self.hub.channel(channel).await.send(HubMessage { origin: self.id, payload });
        Ok(())
    }

    async fn replay_local(&self, channel: &str) -> Result<Vec<Vec<u8>>, TransportError> {
        Ok(entries(&self.local, channel).await)
    }

    async fn replay_network(&self, channel: &str) -> Result<Vec<Vec<u8>>, TransportError> {
        Ok(self.hub.history(channel).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_others_but_not_self() {
        let hub = MemoryHub::new();
        let a = MemoryTransport::connect(&hub);
        let b = MemoryTransport::connect(&hub);
        let mut sub_a = a.subscribe("c").await.unwrap();
        let mut sub_b = b.subscribe("c").await.unwrap();

        a.publish("c", b"hello".to_vec()).await.unwrap();
        assert_eq!(sub_b.next().await.unwrap(), b"hello");

        b.publish("c", b"back".to_vec()).await.unwrap();
        assert_eq!(sub_a.next().await.unwrap(), b"back");
    }

    #[tokio::test]
    async fn local_and_network_history() {
        let hub = MemoryHub::new();
        let a = MemoryTransport::connect(&hub);
        let b = MemoryTransport::connect(&hub);
        let mut sub_b = b.subscribe("c").await.unwrap();

        a.publish("c", b"one".to_vec()).await.unwrap();
        sub_b.next().await.unwrap();

        assert_eq!(a.replay_local("c").await.unwrap(), vec![b"one".to_vec()]);
        assert_eq!(b.replay_local("c").await.unwrap(), vec![b"one".to_vec()]);

        let late = MemoryTransport::connect(&hub);
        assert!(late.replay_local("c").await.unwrap().is_empty());
        assert_eq!(late.replay_network("c").await.unwrap(), vec![b"one".to_vec()]);
    }

    #[tokio::test]
    async fn waits_for_peers() {
        let hub = MemoryHub::new();
        let a = MemoryTransport::connect(&hub);
        a.wait_for_peers(&PeerProtocol::ALL, 0).await.unwrap();

        let pending = tokio::time::timeout(
            Duration::from_millis(50),
            a.wait_for_peers(&PeerProtocol::ALL, 1),
        );
        assert!(pending.await.is_err());

        let _b = MemoryTransport::connect(&hub);
        a.wait_for_peers(&PeerProtocol::ALL, 1).await.unwrap();
    }

    #[tokio::test]
    async fn offline_publish_fails() {
        let hub = MemoryHub::new();
        let a = MemoryTransport::connect(&hub);
        a.set_offline(true);
        assert!(matches!(
            a.publish("c", b"x".to_vec()).await,
            Err(TransportError::Publish(_))
        ));
    }
}
