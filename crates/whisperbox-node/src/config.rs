use clap::Parser;
use libp2p::Multiaddr;
use std::{net::SocketAddr, path::PathBuf, time::Duration};

use crate::engine::{now_millis, EngineConfig};

/// SQLite database file inside the data directory.
pub const DB_FILE: &str = "whisperbox.db";

#[derive(Parser, Debug)]
#[command(name = "whisperbox-node", about = "WhisperBox private forms node")]
pub struct Config {
    /// libp2p listen multiaddr.
    #[arg(long, env = "WHISPERBOX_LISTEN_ADDR", default_value = "/ip4/0.0.0.0/tcp/9100")]
    pub listen_addr: Multiaddr,

    /// Bootstrap peer multiaddrs (repeat or comma-separate).
    #[arg(long, env = "WHISPERBOX_BOOTSTRAP", value_delimiter = ',')]
    pub bootstrap: Vec<Multiaddr>,

    /// Path to the 32-byte Ed25519 wallet key file.
    #[arg(long, env = "WHISPERBOX_KEYPAIR_PATH", default_value = "whisperbox-identity.key")]
    pub keypair_path: PathBuf,

    /// Directory for the form database and channel history.
    #[arg(long, env = "WHISPERBOX_DATA_DIR", default_value = ".")]
    pub data_dir: PathBuf,

    /// Keep forms, keys and history in memory only.
    #[arg(long, env = "WHISPERBOX_IN_MEMORY", default_value_t = false)]
    pub in_memory: bool,

    /// Ethereum JSON-RPC endpoint for NFT whitelist checks.
    /// If absent, NFT-gated forms are closed to everyone but their creator.
    #[arg(long, env = "WHISPERBOX_NFT_RPC_URL")]
    pub nft_rpc_url: Option<String>,

    /// Peers required per protocol before the node joins the channel.
    #[arg(long, env = "WHISPERBOX_MIN_PEERS", default_value_t = 1)]
    pub min_peers: usize,

    /// Seconds to wait for peers; 0 waits forever.
    #[arg(long, env = "WHISPERBOX_PEER_WAIT_SECS", default_value_t = 30)]
    pub peer_wait_secs: u64,

    /// HTTP + WebSocket API listen address, e.g. 127.0.0.1:8080.
    /// If absent, the API server is not started.
    #[arg(long, env = "WHISPERBOX_API_ADDR")]
    pub api_addr: Option<SocketAddr>,

    /// Browser origins allowed to call the API cross-origin (comma-separated).
    #[arg(long, env = "WHISPERBOX_API_CORS_ORIGINS", value_delimiter = ',')]
    pub api_cors_origins: Vec<String>,

    /// Engine events buffered for slow consumers before dropping.
    #[arg(long, env = "WHISPERBOX_EVENT_CAPACITY", default_value_t = 256)]
    pub event_capacity: usize,
}

impl Config {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    /// Where channel history logs go; `None` keeps them in memory.
    pub fn history_dir(&self) -> Option<PathBuf> {
        (!self.in_memory).then(|| self.data_dir.clone())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            min_peers:         self.min_peers,
            peer_wait_timeout: (self.peer_wait_secs > 0)
                .then(|| Duration::from_secs(self.peer_wait_secs)),
            event_capacity:    self.event_capacity,
            clock:             now_millis,
        }
    }
}
