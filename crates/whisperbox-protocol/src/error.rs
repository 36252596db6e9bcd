use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid hex encoding: {0}")]
    InvalidHex(String),

    #[error("schema validation failed: {0}")]
    Validation(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("signer mismatch: claimed {claimed}, recovered {recovered}")]
    SignerMismatch { claimed: String, recovered: String },

    #[error("decryption failed")]
    Decryption,

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("unknown message kind: {0}")]
    UnknownKind(String),

    #[error("envelope too large: {size} bytes exceeds {limit}")]
    EnvelopeTooLarge { size: usize, limit: usize },

    #[error("JSON encode error: {0}")]
    JsonEncode(String),

    #[error("JSON decode error: {0}")]
    JsonDecode(String),
}

impl ProtocolError {
    /// True for failures that mean "missing, malformed or mismatched signature".
    pub fn is_signature_error(&self) -> bool {
        matches!(self, Self::InvalidSignature(_) | Self::SignerMismatch { .. })
    }
}
