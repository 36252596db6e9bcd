//! Canonical signable strings, wallet signatures and signer recovery.
//!
//! A wallet signature is `hex(verifying_key(32) || ed25519_signature(64))`.
//! Embedding the verifying key makes the signer recoverable: verification
//! checks the signature against the embedded key and derives the address
//! from it, which is then compared to the claimed address.

use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH,
};

use crate::{
    constants::{ADDRESS_LEN, FORM_CREATION_HEADER, FORM_RESPONSE_HEADER},
    encoding::{from_hex, to_hex},
    error::ProtocolError,
    form::{Form, Response},
    hash::keccak256,
};

const WALLET_SIGNATURE_LEN: usize = PUBLIC_KEY_LENGTH + SIGNATURE_LENGTH;

// ============================================================================
// Signable messages
// ============================================================================

pub fn form_creation_message(title: &str, creator: &str, created_at: u64) -> String {
    format!("{FORM_CREATION_HEADER}\ntitle: {title}\ncreator: {creator}\ncreatedAt: {created_at}")
}

pub fn response_message(form_id: &str, respondent: &str, submitted_at: u64) -> String {
    format!(
        "{FORM_RESPONSE_HEADER}\nformId: {form_id}\nrespondent: {respondent}\nsubmittedAt: {submitted_at}"
    )
}

// ============================================================================
// Addresses
// ============================================================================

/// `0x` + hex of the last 20 bytes of keccak256(verifying key).
pub fn address_of(key: &VerifyingKey) -> String {
    let digest = keccak256(key.as_bytes());
    format!("0x{}", to_hex(&digest[digest.len() - ADDRESS_LEN..]))
}

pub fn addresses_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

// ============================================================================
// Sign / recover
// ============================================================================

pub fn sign_message(key: &SigningKey, message: &str) -> String {
    let sig: Signature = key.sign(message.as_bytes());
    let mut buf = Vec::with_capacity(WALLET_SIGNATURE_LEN);
    buf.extend_from_slice(key.verifying_key().as_bytes());
    buf.extend_from_slice(&sig.to_bytes());
    to_hex(&buf)
}

/// Verify `signature` over `message` and return the signer's address.
pub fn recover_signer(message: &str, signature: &str) -> Result<String, ProtocolError> {
    if signature.is_empty() {
        return Err(ProtocolError::InvalidSignature("missing signature".into()));
    }
    let bytes = from_hex(signature).map_err(|e| ProtocolError::InvalidSignature(e.to_string()))?;
    if bytes.len() != WALLET_SIGNATURE_LEN {
        return Err(ProtocolError::InvalidSignature(format!(
            "expected {WALLET_SIGNATURE_LEN} bytes, got {}",
            bytes.len()
        )));
    }

    let (key_bytes, sig_bytes) = bytes.split_at(PUBLIC_KEY_LENGTH);
    let key_bytes: [u8; PUBLIC_KEY_LENGTH] = key_bytes
        .try_into()
        .map_err(|_| ProtocolError::InvalidSignature("bad key length".into()))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| ProtocolError::InvalidSignature(e.to_string()))?;
    let sig = Signature::from_slice(sig_bytes)
        .map_err(|e| ProtocolError::InvalidSignature(e.to_string()))?;

    key.verify(message.as_bytes(), &sig)
        .map_err(|_| ProtocolError::InvalidSignature("verification failed".into()))?;

    Ok(address_of(&key))
}

/// Verification = recovered address equals the claimed one, case-insensitively.
pub fn verify_signer(message: &str, signature: &str, claimed: &str) -> Result<(), ProtocolError> {
    let recovered = recover_signer(message, signature)?;
    if !addresses_match(&recovered, claimed) {
        return Err(ProtocolError::SignerMismatch {
            claimed: claimed.to_string(),
            recovered,
        });
    }
    Ok(())
}

pub fn verify_form(form: &Form) -> Result<(), ProtocolError> {
    verify_signer(&form.signing_message(), &form.creator_signature, &form.creator)
}

pub fn verify_response(response: &Response) -> Result<(), ProtocolError> {
    verify_signer(&response.signing_message(), &response.signature, &response.respondent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn templates_are_stable() {
        assert_eq!(
            form_creation_message("Poll", "0xc1", 1_700_000_000_000),
            "WhisperBox form creation\ntitle: Poll\ncreator: 0xc1\ncreatedAt: 1700000000000",
        );
        assert_eq!(
            response_message("ab12", "0xr1", 42),
            "WhisperBox form response\nformId: ab12\nrespondent: 0xr1\nsubmittedAt: 42",
        );
    }

    #[test]
    fn address_shape() {
        let key = SigningKey::generate(&mut OsRng);
        let addr = address_of(&key.verifying_key());
        assert!(addr.starts_with("0x"));
        assert_eq!(addr.len(), 2 + ADDRESS_LEN * 2);
    }

    #[test]
    fn sign_then_recover() {
        let key = SigningKey::generate(&mut OsRng);
        let msg = form_creation_message("Poll", "0xc1", 1);
        let sig = sign_message(&key, &msg);
        assert_eq!(recover_signer(&msg, &sig).unwrap(), address_of(&key.verifying_key()));
    }

    #[test]
    fn claimed_address_compared_case_insensitively() {
        let key = SigningKey::generate(&mut OsRng);
        let addr = address_of(&key.verifying_key()).to_uppercase().replacen("0X", "0x", 1);
        let sig = sign_message(&key, "hello");
        verify_signer("hello", &sig, &addr).unwrap();
    }

    #[test]
    fn tampered_message_fails() {
        let key = SigningKey::generate(&mut OsRng);
        let sig = sign_message(&key, "hello");
        assert!(matches!(
            recover_signer("hell0", &sig),
            Err(ProtocolError::InvalidSignature(_))
        ));
    }

    #[test]
    fn wrong_claimed_signer_is_mismatch() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let sig = sign_message(&key, "hello");
        let err = verify_signer("hello", &sig, &address_of(&other.verifying_key())).unwrap_err();
        assert!(matches!(err, ProtocolError::SignerMismatch { .. }));
        assert!(err.is_signature_error());
    }

    #[test]
    fn malformed_signatures_rejected() {
        assert!(recover_signer("m", "").is_err());
        assert!(recover_signer("m", "zz").is_err());
        assert!(recover_signer("m", &"00".repeat(10)).is_err());
    }
}
