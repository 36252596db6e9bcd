// whisperbox-nft-client: JSON-RPC client for ERC-721 ownership checks.
// Answers "does this address hold at least one token of that contract"
// for NFT-gated forms, without a full Ethereum SDK.

pub mod client;
pub mod error;

pub use client::NftClient;
pub use error::NftClientError;
