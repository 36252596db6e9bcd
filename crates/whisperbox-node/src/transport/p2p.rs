//! Gossipsub-backed transport.
//!
//! The swarm runs in its own task. `Libp2pTransport` talks to it over a
//! command channel and watches peer counts published by that task. Every
//! message seen or published is appended to the node's history store,
//! which also answers other peers' history queries.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use libp2p::{
    gossipsub, identify, kad, mdns,
    request_response::{self, OutboundRequestId},
    swarm::SwarmEvent,
    PeerId, StreamProtocol, Swarm,
};
use tokio::sync::{mpsc, oneshot, watch};

use super::{PeerProtocol, Subscription, Transport, TransportError};
use crate::{
    history::HistoryStore,
    network::{WhisperBehaviour, WhisperBehaviourEvent, HISTORY_PROTOCOL},
};

const COMMAND_QUEUE: usize = 64;
const SUBSCRIBER_QUEUE: usize = 256;
/// Most recent entries served per history query.
const HISTORY_SERVE_LIMIT: usize = 512;

type Reply<T> = oneshot::Sender<Result<T, TransportError>>;
type SharedHistory = Arc<Mutex<HistoryStore>>;

enum SwarmCommand {
    Subscribe {
        channel: String,
        reply:   Reply<mpsc::Receiver<Vec<u8>>>,
    },
    Publish {
        channel: String,
        payload: Vec<u8>,
        reply:   Reply<()>,
    },
    FetchHistory {
        channel: String,
        reply:   Reply<Vec<Vec<u8>>>,
    },
}

/// Connected peers per capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerCounts {
    /// Peers speaking gossipsub; they relay our publishes and deliver traffic.
    pub gossip:  usize,
    /// Peers advertising the history protocol.
    pub history: usize,
}

impl PeerCounts {
    pub fn supporting(&self, protocol: PeerProtocol) -> usize {
        match protocol {
            PeerProtocol::Push | PeerProtocol::Filter => self.gossip,
            PeerProtocol::History => self.history,
        }
    }
}

pub struct Libp2pTransport {
    commands: mpsc::Sender<SwarmCommand>,
    peers:    watch::Receiver<PeerCounts>,
    history:  SharedHistory,
}

impl Libp2pTransport {
    /// Move `swarm` into a background task and return the handle to it.
    pub fn spawn(swarm: Swarm<WhisperBehaviour>, history: HistoryStore) -> Self {
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        let (peers_tx, peers) = watch::channel(PeerCounts::default());
        let history = Arc::new(Mutex::new(history));
        let task = SwarmTask {
            swarm,
            commands:      rx,
            peers:         peers_tx,
            history:       Arc::clone(&history),
            subscribers:   HashMap::new(),
            history_peers: HashSet::new(),
            pending:       HashMap::new(),
        };
        tokio::spawn(task.run());
        Self { commands, peers, history }
    }

    pub fn peer_counts(&self) -> PeerCounts {
        *self.peers.borrow()
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> SwarmCommand) -> Result<T, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(build(reply)).await.map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)?
    }
}

#[async_trait]
impl Transport for Libp2pTransport {
    async fn wait_for_peers(
        &self,
        protocols: &[PeerProtocol],
        min_peers: usize,
    ) -> Result<(), TransportError> {
        let mut peers = self.peers.clone();
        let reached = peers
            .wait_for(|counts| protocols.iter().all(|p| counts.supporting(*p) >= min_peers))
            .await
            .is_ok();
        if reached { Ok(()) } else { Err(TransportError::Closed) }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        let channel = channel.to_string();
        let rx = self.request(|reply| SwarmCommand::Subscribe { channel, reply }).await?;
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });
        Ok(Subscription::new(stream.boxed()))
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let channel = channel.to_string();
        self.request(|reply| SwarmCommand::Publish { channel, payload, reply }).await
    }

    async fn replay_local(&self, channel: &str) -> Result<Vec<Vec<u8>>, TransportError> {
        let mut store = self.history.lock().map_err(|_| TransportError::History("history lock poisoned".into()))?;
        store.entries(channel).map_err(|e| TransportError::History(e.to_string()))
    }

    async fn replay_network(&self, channel: &str) -> Result<Vec<Vec<u8>>, TransportError> {
        let channel = channel.to_string();
        self.request(|reply| SwarmCommand::FetchHistory { channel, reply }).await
    }
}

// ============================================================================
// Swarm task
// ============================================================================

struct SwarmTask {
    swarm:         Swarm<WhisperBehaviour>,
    commands:      mpsc::Receiver<SwarmCommand>,
    peers:         watch::Sender<PeerCounts>,
    history:       SharedHistory,
    subscribers:   HashMap<gossipsub::TopicHash, Vec<mpsc::Sender<Vec<u8>>>>,
    history_peers: HashSet<PeerId>,
    pending:       HashMap<OutboundRequestId, Reply<Vec<Vec<u8>>>>,
}

impl SwarmTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::info!("Transport dropped, stopping swarm");
                        break;
                    }
                },
            }
        }
    }

    fn record(&self, channel: &str, payload: &[u8]) {
        let Ok(mut store) = self.history.lock() else {
            tracing::warn!("History lock poisoned, not recording");
            return;
        };
        if let Err(e) = store.record(channel, payload) {
            tracing::warn!("History append failed on {channel}: {e}");
        }
    }

    fn refresh_peer_counts(&mut self) {
        let counts = PeerCounts {
            gossip:  self.swarm.behaviour().gossipsub.all_peers().count(),
            history: self.history_peers.len(),
        };
        self.peers.send_if_modified(|current| {
            if *current == counts {
                return false;
            }
            tracing::debug!(gossip = counts.gossip, history = counts.history, "Peer counts changed");
            *current = counts;
            true
        });
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn handle_command(&mut self, command: SwarmCommand) {
        match command {
            SwarmCommand::Subscribe { channel, reply } => {
                let topic = gossipsub::IdentTopic::new(channel.as_str());
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .subscribe(&topic)
                    .map(|_| {
                        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
                        self.subscribers.entry(topic.hash()).or_default().push(tx);
                        rx
                    })
                    .map_err(|e| TransportError::Subscribe(e.to_string()));
                let _ = reply.send(result);
            }
            SwarmCommand::Publish { channel, payload, reply } => {
                let topic = gossipsub::IdentTopic::new(channel.as_str());
                let result = match self.swarm.behaviour_mut().gossipsub.publish(topic, payload.clone()) {
                    Ok(_) | Err(gossipsub::PublishError::Duplicate) => {
                        self.record(&channel, &payload);
                        Ok(())
                    }
                    Err(e) => Err(TransportError::Publish(e.to_string())),
                };
                let _ = reply.send(result);
            }
            SwarmCommand::FetchHistory { channel, reply } => {
                let Some(peer) = self.history_peers.iter().next().copied() else {
                    let _ = reply.send(Err(TransportError::History("no history peers".into())));
                    return;
                };
                tracing::debug!("Querying {peer} for {channel} history");
                let id = self.swarm.behaviour_mut().history.send_request(&peer, channel);
                self.pending.insert(id, reply);
            }
        }
    }

    // ========================================================================
    // Swarm events
    // ========================================================================

    fn handle_swarm_event(&mut self, event: SwarmEvent<WhisperBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!("Listening on {address}");
            }
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                tracing::debug!("Connected to {peer_id} via {endpoint:?}");
                self.refresh_peer_counts();
            }
            SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                tracing::debug!("Disconnected from {peer_id}");
                if num_established == 0 {
                    self.history_peers.remove(&peer_id);
                }
                self.refresh_peer_counts();
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                tracing::warn!("Outgoing connection error to {peer_id:?}: {error}");
            }
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: WhisperBehaviourEvent) {
        match event {
            WhisperBehaviourEvent::Gossipsub(gossipsub::Event::Message { message, .. }) => {
                self.deliver(message);
            }
            WhisperBehaviourEvent::Gossipsub(gossipsub::Event::Subscribed { peer_id, topic }) => {
                tracing::debug!("{peer_id} subscribed to {topic}");
                self.refresh_peer_counts();
            }
            WhisperBehaviourEvent::Gossipsub(_) => {}

            WhisperBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                for (peer_id, addr) in peers {
                    tracing::info!("mDNS discovered {peer_id} at {addr}");
                    self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
                    let _ = self.swarm.dial(peer_id);
                }
            }
            WhisperBehaviourEvent::Mdns(mdns::Event::Expired(peers)) => {
                for (peer_id, _addr) in peers {
                    tracing::debug!("mDNS expired {peer_id}");
                }
            }

            WhisperBehaviourEvent::Kademlia(kad::Event::RoutingUpdated { peer, .. }) => {
                tracing::debug!("Kademlia routing updated: {peer}");
            }
            WhisperBehaviourEvent::Kademlia(_) => {}

            WhisperBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                tracing::debug!("Identified {peer_id}: agent={}", info.agent_version);
                for addr in &info.listen_addrs {
                    self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                }
                if info.protocols.contains(&StreamProtocol::new(HISTORY_PROTOCOL)) {
                    self.history_peers.insert(peer_id);
                    self.refresh_peer_counts();
                }
            }
            WhisperBehaviourEvent::Identify(_) => {}

            WhisperBehaviourEvent::History(request_response::Event::Message { peer, message, .. }) => {
                match message {
                    request_response::Message::Request { request, channel, .. } => {
                        self.serve_history(peer, request, channel);
                    }
                    request_response::Message::Response { request_id, response } => {
                        tracing::debug!("{peer} returned {} history messages", response.len());
                        if let Some(reply) = self.pending.remove(&request_id) {
                            let _ = reply.send(Ok(response));
                        }
                    }
                }
            }
            WhisperBehaviourEvent::History(request_response::Event::OutboundFailure {
                peer, request_id, error, ..
            }) => {
                tracing::warn!("History query to {peer} failed: {error}");
                if let Some(reply) = self.pending.remove(&request_id) {
                    let _ = reply.send(Err(TransportError::History(error.to_string())));
                }
            }
            WhisperBehaviourEvent::History(request_response::Event::InboundFailure {
                peer, error, ..
            }) => {
                tracing::warn!("History request from {peer} failed: {error}");
            }
            WhisperBehaviourEvent::History(_) => {}
        }
    }

    /// Record an inbound message and fan it out to local subscribers.
    fn deliver(&mut self, message: gossipsub::Message) {
        let Some(senders) = self.subscribers.get_mut(&message.topic) else {
            return;
        };
        senders.retain(|tx| match tx.try_send(message.data.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Subscriber on {} is full, dropping message", message.topic);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        let channel = message.topic.as_str().to_string();
        self.record(&channel, &message.data);
    }

    fn serve_history(
        &mut self,
        peer:    PeerId,
        channel: String,
        respond: request_response::ResponseChannel<Vec<Vec<u8>>>,
    ) {
        let entries = match self.history.lock() {
            Ok(mut store) => store.recent(&channel, HISTORY_SERVE_LIMIT).unwrap_or_else(|e| {
                tracing::warn!("History read for {channel} failed: {e}");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        tracing::debug!("Serving {} {channel} history messages to {peer}", entries.len());
        if self.swarm.behaviour_mut().history.send_response(respond, entries).is_err() {
            tracing::debug!("History response to {peer} dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_counts_per_protocol() {
        let counts = PeerCounts { gossip: 3, history: 1 };
        assert_eq!(counts.supporting(PeerProtocol::Push), 3);
        assert_eq!(counts.supporting(PeerProtocol::Filter), 3);
        assert_eq!(counts.supporting(PeerProtocol::History), 1);
    }

    #[tokio::test]
    async fn waits_on_published_counts() {
        let (commands, _rx) = mpsc::channel(1);
        let (peers_tx, peers) = watch::channel(PeerCounts::default());
        let transport = Libp2pTransport {
            commands,
            peers,
            history: Arc::new(Mutex::new(HistoryStore::in_memory())),
        };

        transport.wait_for_peers(&PeerProtocol::ALL, 0).await.unwrap();

        let waiting = tokio::spawn(async move {
            transport.wait_for_peers(&PeerProtocol::ALL, 1).await.map(|_| transport)
        });
        peers_tx.send_replace(PeerCounts { gossip: 1, history: 0 });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());

        peers_tx.send_replace(PeerCounts { gossip: 1, history: 1 });
        let transport = waiting.await.unwrap().unwrap();
        assert_eq!(transport.peer_counts(), PeerCounts { gossip: 1, history: 1 });
    }

    #[tokio::test]
    async fn dead_swarm_task_reports_closed() {
        let (commands, rx) = mpsc::channel(1);
        drop(rx);
        let (peers_tx, peers) = watch::channel(PeerCounts::default());
        drop(peers_tx);
        let transport = Libp2pTransport {
            commands,
            peers,
            history: Arc::new(Mutex::new(HistoryStore::in_memory())),
        };
        assert!(matches!(
            transport.publish("c", b"x".to_vec()).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            transport.wait_for_peers(&PeerProtocol::ALL, 1).await,
            Err(TransportError::Closed)
        ));
        assert!(transport.replay_local("c").await.unwrap().is_empty());
    }
}
