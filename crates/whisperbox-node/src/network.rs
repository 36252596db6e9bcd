use std::error::Error;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::{
    gossipsub, identify, kad, mdns, noise, request_response, tcp, yamux,
    identity::Keypair,
    swarm::NetworkBehaviour,
    Multiaddr, StreamProtocol, Swarm,
};
use whisperbox_protocol::{constants::MAX_MESSAGE_SIZE, encoding::to_hex, hash::keccak256};

/// libp2p protocol string for history queries.
pub const HISTORY_PROTOCOL: &str = "/whisperbox/history/1.0.0";

const IDENTIFY_PROTOCOL: &str = "/whisperbox/identify/1.0.0";

/// Upper bound for one history response frame.
pub const HISTORY_FRAME_LIMIT: usize = 16 * 1024 * 1024;

/// Channel names are short; anything longer is not a history request.
const HISTORY_REQUEST_LIMIT: usize = 1024;

/// Gossipsub wraps each payload in its own protobuf frame.
const GOSSIP_FRAME_OVERHEAD: usize = 4 * 1024;

type BoxError = Box<dyn Error + Send + Sync + 'static>;

// ============================================================================
// Combined behaviour
// ============================================================================

#[derive(NetworkBehaviour)]
pub struct WhisperBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub kademlia:  kad::Behaviour<kad::store::MemoryStore>,
    pub mdns:      mdns::tokio::Behaviour,
    pub identify:  identify::Behaviour,
    /// Serves and queries stored channel history.
    pub history:   request_response::Behaviour<HistoryCodec>,
}

// ============================================================================
// History request-response codec
// ============================================================================

/// 4-byte LE length-prefixed frames.
/// Request  = channel name, UTF-8
/// Response = CBOR array of byte strings, oldest first
#[derive(Clone, Default)]
pub struct HistoryCodec;

#[async_trait]
impl request_response::Codec for HistoryCodec {
    type Protocol = StreamProtocol;
    type Request  = String;
    type Response = Vec<Vec<u8>>;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T)
        -> io::Result<Self::Request>
    where T: AsyncRead + Unpin + Send {
        let bytes = read_framed(io, HISTORY_REQUEST_LIMIT).await?;
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, io: &mut T)
        -> io::Result<Self::Response>
    where T: AsyncRead + Unpin + Send {
        decode_history(&read_framed(io, HISTORY_FRAME_LIMIT).await?)
    }

    async fn write_request<T>(&mut self, _: &Self::Protocol, io: &mut T, req: Self::Request)
        -> io::Result<()>
    where T: AsyncWrite + Unpin + Send {
        write_framed(io, req.as_bytes()).await
    }

    async fn write_response<T>(&mut self, _: &Self::Protocol, io: &mut T, res: Self::Response)
        -> io::Result<()>
    where T: AsyncWrite + Unpin + Send {
        write_framed(io, &encode_history(&res)?).await
    }
}

pub fn encode_history(messages: &[Vec<u8>]) -> io::Result<Vec<u8>> {
    let value = ciborium::Value::Array(
        messages.iter().map(|m| ciborium::Value::Bytes(m.clone())).collect(),
    );
    let mut out = Vec::new();
    ciborium::into_writer(&value, &mut out)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    Ok(out)
}

pub fn decode_history(data: &[u8]) -> io::Result<Vec<Vec<u8>>> {
    let invalid = |msg: String| io::Error::new(io::ErrorKind::InvalidData, msg);
    let value: ciborium::Value =
        ciborium::from_reader(data).map_err(|e| invalid(e.to_string()))?;
    let ciborium::Value::Array(items) = value else {
        return Err(invalid("history response is not an array".into()));
    };
    items
        .into_iter()
        .map(|item| match item {
            ciborium::Value::Bytes(bytes) => Ok(bytes),
            _ => Err(invalid("history entry is not a byte string".into())),
        })
        .collect()
}

async fn read_framed<T: AsyncRead + Unpin>(io: &mut T, max: usize) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame exceeds limit"));
    }
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_framed<T: AsyncWrite + Unpin>(io: &mut T, data: &[u8]) -> io::Result<()> {
    io.write_all(&(data.len() as u32).to_le_bytes()).await?;
    io.write_all(data).await?;
    io.flush().await
}

// ============================================================================
// Swarm builder
// ============================================================================

fn new_behaviour(key: &Keypair) -> Result<WhisperBehaviour, BoxError> {
    let peer_id = key.public().to_peer_id();

    // Identical payloads from different publishers are one message.
    let gossip_cfg = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(Duration::from_secs(10))
        .validation_mode(gossipsub::ValidationMode::Strict)
        .max_transmit_size(MAX_MESSAGE_SIZE + GOSSIP_FRAME_OVERHEAD)
        .message_id_fn(|msg: &gossipsub::Message| {
            gossipsub::MessageId::from(to_hex(&keccak256(&msg.data)))
        })
        .build()?;

    let gossipsub = gossipsub::Behaviour::new(
        gossipsub::MessageAuthenticity::Signed(key.clone()),
        gossip_cfg,
    )?;

    let mut kademlia = kad::Behaviour::new(peer_id, kad::store::MemoryStore::new(peer_id));
    kademlia.set_mode(Some(kad::Mode::Server));

    let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)?;

    let identify = identify::Behaviour::new(identify::Config::new(
        IDENTIFY_PROTOCOL.to_string(),
        key.public(),
    ));

    let history = request_response::Behaviour::<HistoryCodec>::new(
        [(StreamProtocol::new(HISTORY_PROTOCOL), request_response::ProtocolSupport::Full)],
        request_response::Config::default().with_request_timeout(Duration::from_secs(30)),
    );

    Ok(WhisperBehaviour { gossipsub, kademlia, mdns, identify, history })
}

/// Build the libp2p swarm, start listening and dial the bootstrap peers.
pub fn build_swarm(
    keypair:         Keypair,
    listen_addr:     Multiaddr,
    bootstrap_peers: &[Multiaddr],
) -> anyhow::Result<Swarm<WhisperBehaviour>> {
    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)?
        .with_quic()
        .with_dns()?
        .with_behaviour(new_behaviour)?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    for addr in bootstrap_peers {
        let peer_id = addr.iter().find_map(|p| match p {
            libp2p::multiaddr::Protocol::P2p(pid) => Some(pid),
            _ => None,
        });
        if let Some(peer_id) = peer_id {
            swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
        }
        if let Err(e) = swarm.dial(addr.clone()) {
            tracing::warn!("Dial to bootstrap peer {addr} failed: {e}");
        }
    }
    if !bootstrap_peers.is_empty() {
        if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
            tracing::debug!("Kademlia bootstrap skipped: {e}");
        }
    }

    swarm.listen_on(listen_addr.clone())?;

    // TCP and UDP can share the same port number.
    if let Some(quic_addr) = to_quic_addr(&listen_addr) {
        match swarm.listen_on(quic_addr.clone()) {
            Ok(_)  => tracing::info!("Also listening on QUIC: {quic_addr}"),
            Err(e) => tracing::warn!("QUIC listen failed for {quic_addr}: {e}"),
        }
    }

    Ok(swarm)
}

/// /ip4/X.X.X.X/tcp/PORT → /ip4/X.X.X.X/udp/PORT/quic-v1
fn to_quic_addr(tcp_addr: &Multiaddr) -> Option<Multiaddr> {
    use libp2p::multiaddr::Protocol;
    let mut new_addr = Multiaddr::empty();
    let mut found = false;
    for proto in tcp_addr.iter() {
        match proto {
            Protocol::Tcp(port) => {
                new_addr.push(Protocol::Udp(port));
                new_addr.push(Protocol::QuicV1);
                found = true;
            }
            other => new_addr.push(other),
        }
    }
    if found { Some(new_addr) } else { None }
}
