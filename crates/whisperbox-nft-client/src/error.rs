use thiserror::Error;

#[derive(Debug, Error)]
pub enum NftClientError {
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("RPC call failed: code={code} msg={message}")]
    Call { code: i64, message: String },
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("malformed RPC result: {0}")]
    MalformedResult(String),
}
