use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::ProtocolError;

/// The three WhisperBox message kinds. All travel on the same channel and
/// are discriminated by the envelope's `kind` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// Broadcast: "here is a form you may answer"
    NewForm,
    /// Broadcast, sealed to one creator: "here are my answers"
    FormResponse,
    /// Broadcast in clear: "I received response <confirmationId>"
    Confirmation,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [Self::NewForm, Self::FormResponse, Self::Confirmation];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewForm => "new-form",
            Self::FormResponse => "form-response",
            Self::Confirmation => "confirmation",
        }
    }

    /// Returns true if the payload is opaque ciphertext to everyone but the addressee.
    pub fn is_sealed(self) -> bool {
        matches!(self, Self::FormResponse)
    }
}

impl FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownKind(s.to_string()))
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
