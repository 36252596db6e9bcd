use serde::{Deserialize, Serialize};

use crate::{
    constants::MAX_MESSAGE_SIZE,
    error::ProtocolError,
    form::Form,
    message::MessageKind,
    payload::{Confirmation, EncryptedResponse},
};

/// Wire envelope: `{"kind": "<kind>", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum Envelope {
    NewForm(Form),
    FormResponse(EncryptedResponse),
    Confirmation(Confirmation),
}

impl Envelope {
    /// Announce a form. The private key never leaves this function.
    pub fn new_form(form: &Form) -> Self {
        Self::NewForm(form.for_publication())
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::NewForm(_) => MessageKind::NewForm,
            Self::FormResponse(_) => MessageKind::FormResponse,
            Self::Confirmation(_) => MessageKind::Confirmation,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let bytes = serde_json::to_vec(self).map_err(|e| ProtocolError::JsonEncode(e.to_string()))?;
        Self::check_size(bytes.len())?;
        Ok(bytes)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Self::check_size(data.len())?;
        serde_json::from_slice(data).map_err(|e| ProtocolError::JsonDecode(e.to_string()))
    }

    fn check_size(size: usize) -> Result<(), ProtocolError> {
        if size > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::EnvelopeTooLarge { size, limit: MAX_MESSAGE_SIZE });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        form::{FormDraft, Question, QuestionKind, Whitelist},
        sealing::FormKeyPair,
    };

    fn form() -> Form {
        let keys = FormKeyPair::generate();
        let mut form = FormDraft {
            title: "Poll".into(),
            description: String::new(),
            questions: vec![Question {
                id: "q1".into(),
                kind: QuestionKind::Text,
                text: "Name?".into(),
                required: true,
                options: vec![],
            }],
            whitelist: Whitelist::addresses(["0xAAA", "0xBBB"]),
        }
        .into_form("0xC1".into(), 1_700_000_000_000, keys.public_key);
        form.private_key = keys.private_key;
        form.creator_signature = "ee".repeat(96);
        form
    }

    #[test]
    fn new_form_roundtrip_strips_private_key() {
        let original = form();
        let bytes = Envelope::new_form(&original).to_bytes().unwrap();
        let Envelope::NewForm(decoded) = Envelope::from_bytes(&bytes).unwrap() else {
            panic!("wrong kind");
        };
        assert!(decoded.private_key.is_empty());
        assert_eq!(decoded, Form { private_key: String::new(), ..original });
    }

    #[test]
    fn wire_shape() {
        let conf = Envelope::Confirmation(Confirmation::new("f1", "c1"));
        let json: serde_json::Value = serde_json::from_slice(&conf.to_bytes().unwrap()).unwrap();
        assert_eq!(json["kind"], "confirmation");
        assert_eq!(json["payload"]["formId"], "f1");
        assert_eq!(json["payload"]["confirmationId"], "c1");

        let resp = Envelope::FormResponse(EncryptedResponse { encrypted_payload: "00".into() });
        let json: serde_json::Value = serde_json::from_slice(&resp.to_bytes().unwrap()).unwrap();
        assert_eq!(json["kind"], "form-response");
        assert_eq!(json["payload"]["encryptedPayload"], "00");
        assert_eq!(resp.kind(), MessageKind::FormResponse);
    }

    #[test]
    fn unknown_kind_is_decode_error() {
        let raw = br#"{"kind":"vote","payload":{}}"#;
        assert!(matches!(Envelope::from_bytes(raw), Err(ProtocolError::JsonDecode(_))));
    }

    #[test]
    fn oversized_envelopes_rejected() {
        let big = Envelope::FormResponse(EncryptedResponse {
            encrypted_payload: "0".repeat(MAX_MESSAGE_SIZE),
        });
        assert!(matches!(big.to_bytes(), Err(ProtocolError::EnvelopeTooLarge { .. })));
        let raw = vec![b' '; MAX_MESSAGE_SIZE + 1];
        assert!(matches!(
            Envelope::from_bytes(&raw),
            Err(ProtocolError::EnvelopeTooLarge { .. })
        ));
    }
}
