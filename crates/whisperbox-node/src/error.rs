use thiserror::Error;
use whisperbox_protocol::ProtocolError;

use crate::{events::EngineState, kv::StorageError, transport::TransportError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("access denied: {address} may not respond to form {form_id}")]
    AccessDenied { form_id: String, address: String },

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("decryption failed")]
    Decryption,

    #[error("no sealing key stored for form {0}")]
    KeyNotFound(String),

    #[error("form not found: {0}")]
    FormNotFound(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("engine not ready (state: {0})")]
    NotReady(EngineState),

    #[error("engine shut down")]
    Shutdown,
}

impl From<ProtocolError> for EngineError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::InvalidSignature(_) | ProtocolError::SignerMismatch { .. } => {
                Self::Signature(e.to_string())
            }
            ProtocolError::Decryption => Self::Decryption,
            other => Self::Validation(other.to_string()),
        }
    }
}
