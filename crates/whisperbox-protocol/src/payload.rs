//! Payloads of the `form-response` and `confirmation` envelopes.

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::{
    constants::CONFIRMATION_ID_LEN,
    encoding::{from_hex, is_canonical_hex, to_hex},
    error::ProtocolError,
    form::Response,
    sealing,
};

// ============================================================================
// FormResponse payload
// ============================================================================

/// A response sealed under its form's public key. Nothing in it names the form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedResponse {
    pub encrypted_payload: String,
}

impl EncryptedResponse {
    pub fn seal(response: &Response, public_key: &str) -> Result<Self, ProtocolError> {
        let plaintext =
            serde_json::to_vec(response).map_err(|e| ProtocolError::JsonEncode(e.to_string()))?;
        let sealed = sealing::seal(&plaintext, public_key)?;
        Ok(Self { encrypted_payload: to_hex(&sealed) })
    }

    /// Raw sealed bytes; decode once, then trial-open with each candidate key.
    pub fn sealed_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        from_hex(&self.encrypted_payload)
    }

    /// Open sealed bytes with one private key and parse the plaintext as a
    /// Response. A key mismatch yields `Decryption`; garbage plaintext
    /// yields `JsonDecode`.
    pub fn open_with(sealed: &[u8], private_key: &str) -> Result<Response, ProtocolError> {
        let plaintext = sealing::open(sealed, private_key)?;
        serde_json::from_slice(&plaintext).map_err(|e| ProtocolError::JsonDecode(e.to_string()))
    }
}

// ============================================================================
// Confirmation payload
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    pub form_id:         String,
    pub confirmation_id: String,
}

/// Fresh random confirmation id: 32 bytes from the OS RNG, hex.
pub fn random_confirmation_id() -> String {
    let mut bytes = [0u8; CONFIRMATION_ID_LEN];
    OsRng.fill_bytes(&mut bytes);
    to_hex(&bytes)
}

impl Confirmation {
    pub fn new(form_id: impl Into<String>, confirmation_id: impl Into<String>) -> Self {
        Self { form_id: form_id.into(), confirmation_id: confirmation_id.into() }
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.form_id.is_empty() {
            return Err(ProtocolError::Validation("confirmation without formId".into()));
        }
        if !is_canonical_hex(&self.confirmation_id, CONFIRMATION_ID_LEN) {
            return Err(ProtocolError::Validation(
                "confirmationId is not canonical 32-byte hex".into(),
            ));
        }
        Ok(())
    }
}
