use std::sync::Arc;

use clap::Parser;
use whisperbox_nft_client::NftClient;
use whisperbox_node::{
    access::{AccessEvaluator, OwnershipOracle, UnconfiguredOracle},
    api::{self, ApiState},
    config::Config,
    engine::Engine,
    events::log_events,
    history::HistoryStore,
    identity::{LocalWallet, Wallet},
    keystore::KeyStore,
    kv::{KvStore, MemoryKv, SqliteKv},
    network,
    repository::FormRepository,
    transport::Libp2pTransport,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("whisperbox_node=info,libp2p=warn")),
        )
        .init();

    let config = Config::parse();
    let wallet = Arc::new(LocalWallet::load_or_generate(&config.keypair_path)?);
    tracing::info!(address = %wallet.address(), "WhisperBox node starting");

    let kv: Arc<dyn KvStore> = if config.in_memory {
        Arc::new(MemoryKv::new())
    } else {
        std::fs::create_dir_all(&config.data_dir)?;
        Arc::new(SqliteKv::open(&config.db_path())?)
    };

    let oracle: Arc<dyn OwnershipOracle> = match &config.nft_rpc_url {
        Some(url) => Arc::new(NftClient::new(url)?),
        None => {
            tracing::info!("No NFT RPC endpoint configured; NFT-gated forms stay closed");
            Arc::new(UnconfiguredOracle)
        }
    };

    let repository = FormRepository::open(kv.clone(), AccessEvaluator::new(oracle))?;
    let keys = KeyStore::open(kv)?;
    tracing::info!("Loaded {} forms and {} sealing keys", repository.len(), keys.len());

    let swarm = network::build_swarm(
        wallet.libp2p_keypair()?,
        config.listen_addr.clone(),
        &config.bootstrap,
    )?;
    tracing::info!(
        peer_id = %swarm.local_peer_id(),
        "Bootstrap multiaddr: {}/p2p/{}",
        config.listen_addr,
        swarm.local_peer_id(),
    );
    let history = match config.history_dir() {
        Some(dir) => HistoryStore::open(dir),
        None => HistoryStore::in_memory(),
    };
    let transport = Arc::new(Libp2pTransport::spawn(swarm, history));

    let (engine, handle, events) =
        Engine::new(config.engine_config(), transport, wallet.clone(), repository, keys);

    match config.api_addr {
        Some(addr) => {
            let state = ApiState::new(handle.clone(), wallet.address().to_string());
            tokio::spawn(state.clone().forward_events(events));
            let cors_origins = config.api_cors_origins.clone();
            tokio::spawn(async move {
                if let Err(e) = api::serve(state, addr, &cors_origins).await {
                    tracing::error!("API server stopped: {e}");
                }
            });
        }
        None => {
            tokio::spawn(log_events(events));
        }
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(engine.run(shutdown_rx));

    // A failed start leaves the engine in `failed`; POST /initialize retries it.
    if let Err(e) = handle.initialize().await {
        tracing::error!("Engine did not become ready: {e}");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(true);
    engine_task.await?;
    Ok(())
}
