use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use std::path::Path;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use whisperbox_protocol::signature::{address_of, sign_message};

use crate::error::EngineError;

/// The local signing identity. External wallets (browser extensions,
/// hardware devices) implement this the same way; signing may suspend.
#[async_trait]
pub trait Wallet: Send + Sync {
    fn address(&self) -> &str;
    async fn sign(&self, message: &str) -> Result<String, EngineError>;
}

/// Wallet backed by an Ed25519 key file.
///
/// The same secret drives both wallet signatures and the libp2p peer identity.
pub struct LocalWallet {
    signing_key: SigningKey,
    address:     String,
}

impl LocalWallet {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = address_of(&signing_key.verifying_key());
        Self { signing_key, address }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        use std::io::Write;
        // mode 0o600: owner read/write only.
        #[cfg(unix)]
        let mut file = std::fs::OpenOptions::new()
            .write(true).create(true).truncate(true).mode(0o600)
            .open(path)?;
        #[cfg(not(unix))]
        let mut file = std::fs::OpenOptions::new()
            .write(true).create(true).truncate(true)
            .open(path)?;
        file.write_all(&self.signing_key.to_bytes())?;
        Ok(())
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("invalid key file: expected 32 bytes"))?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&arr)))
    }

    pub fn load_or_generate(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let wallet = Self::load(path)?;
            tracing::info!(address = %wallet.address, "Loaded identity from {:?}", path);
            Ok(wallet)
        } else {
            let wallet = Self::generate();
            wallet.save(path)?;
            tracing::info!(address = %wallet.address, "Generated new identity, saved to {:?}", path);
            Ok(wallet)
        }
    }

    pub fn libp2p_keypair(&self) -> anyhow::Result<libp2p::identity::Keypair> {
        libp2p::identity::Keypair::ed25519_from_bytes(self.signing_key.to_bytes())
            .map_err(|e| anyhow::anyhow!("invalid ed25519 secret for libp2p: {e}"))
    }
}

#[async_trait]
impl Wallet for LocalWallet {
    fn address(&self) -> &str {
        &self.address
    }

    async fn sign(&self, message: &str) -> Result<String, EngineError> {
        Ok(sign_message(&self.signing_key, message))
    }
}
