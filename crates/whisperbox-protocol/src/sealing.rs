//! Per-form sealing keys and response encryption.
//!
//! Each form carries an X25519 public key. A respondent seals its response
//! with a fresh ephemeral key agreement; only the holder of the form's
//! private key can open it. The ciphertext carries no form identifier.
//!
//! Layout: `ephemeral_public(32) || nonce(12) || chacha20poly1305(plaintext)`.
//!
//! Secrets are raw X25519 keys and always clamped before use, so the
//! small-order part of a peer's point never affects the shared secret.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use curve25519_dalek::montgomery::MontgomeryPoint;
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;

use crate::{
    constants::SEALING_KEY_LEN,
    encoding::{from_hex_array, to_hex},
    error::ProtocolError,
};

const SEALING_DOMAIN: &[u8] = b"WHISPERBOX_RESPONSE_SEAL_v1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = SEALING_KEY_LEN + NONCE_LEN;

/// A form's sealing keypair, both halves canonical hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormKeyPair {
    pub public_key: String,
    pub private_key: String,
}

impl FormKeyPair {
    pub fn generate() -> Self {
        let secret = random_secret();
        Self {
            public_key: to_hex(MontgomeryPoint::mul_base_clamped(secret).as_bytes()),
            private_key: to_hex(&secret),
        }
    }
}

/// Public key matching a hex private key.
pub fn public_key_for(private_key: &str) -> Result<String, ProtocolError> {
    let secret: [u8; 32] = from_hex_array(private_key)?;
    Ok(to_hex(MontgomeryPoint::mul_base_clamped(secret).as_bytes()))
}

fn random_secret() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn derive_key(
    shared: &MontgomeryPoint,
    ephemeral: &[u8; SEALING_KEY_LEN],
    recipient: &[u8; SEALING_KEY_LEN],
) -> Option<[u8; 32]> {
    // Low-order recipient or ephemeral points collapse to the identity.
    if shared.as_bytes() == &[0u8; 32] {
        return None;
    }
    let hk = Hkdf::<Sha256>::new(Some(SEALING_DOMAIN), shared.as_bytes());
    let mut info = [0u8; SEALING_KEY_LEN * 2];
    info[..SEALING_KEY_LEN].copy_from_slice(ephemeral);
    info[SEALING_KEY_LEN..].copy_from_slice(recipient);
    let mut key = [0u8; 32];
    hk.expand(&info, &mut key).ok()?;
    Some(key)
}

/// Seal `plaintext` to the holder of `public_key`.
pub fn seal(plaintext: &[u8], public_key: &str) -> Result<Vec<u8>, ProtocolError> {
    let recipient: [u8; SEALING_KEY_LEN] =
        from_hex_array(public_key).map_err(|e| ProtocolError::Encryption(e.to_string()))?;

    let ephemeral = random_secret();
    let ephemeral_public = MontgomeryPoint::mul_base_clamped(ephemeral).to_bytes();
    let shared = MontgomeryPoint(recipient).mul_clamped(ephemeral);
    let key = derive_key(&shared, &ephemeral_public, &recipient)
        .ok_or_else(|| ProtocolError::Encryption("degenerate recipient key".into()))?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new_from_slice(&key)
        .map_err(|e| ProtocolError::Encryption(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| ProtocolError::Encryption("aead seal failed".into()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    out.extend_from_slice(&ephemeral_public);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a sealed payload with a form's private key. Any mismatch, truncation
/// or tampering yields `ProtocolError::Decryption`.
pub fn open(sealed: &[u8], private_key: &str) -> Result<Vec<u8>, ProtocolError> {
    if sealed.len() < HEADER_LEN + TAG_LEN {
        return Err(ProtocolError::Decryption);
    }
    let secret: [u8; 32] = from_hex_array(private_key).map_err(|_| ProtocolError::Decryption)?;

    let mut ephemeral_public = [0u8; SEALING_KEY_LEN];
    ephemeral_public.copy_from_slice(&sealed[..SEALING_KEY_LEN]);
    let nonce = &sealed[SEALING_KEY_LEN..HEADER_LEN];
    let ciphertext = &sealed[HEADER_LEN..];

    let own_public = MontgomeryPoint::mul_base_clamped(secret).to_bytes();
    let shared = MontgomeryPoint(ephemeral_public).mul_clamped(secret);
    let key = derive_key(&shared, &ephemeral_public, &own_public).ok_or(ProtocolError::Decryption)?;

    let cipher = ChaCha20Poly1305::new_from_slice(&key).map_err(|_| ProtocolError::Decryption)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| ProtocolError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_halves_match() {
        let pair = FormKeyPair::generate();
        assert_eq!(pair.public_key.len(), 64);
        assert_eq!(pair.private_key.len(), 64);
        assert_eq!(public_key_for(&pair.private_key).unwrap(), pair.public_key);
    }

    #[test]
    fn seal_then_open() {
        let pair = FormKeyPair::generate();
        let sealed = seal(b"answers", &pair.public_key).unwrap();
        assert_eq!(open(&sealed, &pair.private_key).unwrap(), b"answers");
    }

    #[test]
    fn two_seals_differ() {
        let pair = FormKeyPair::generate();
        let a = seal(b"same", &pair.public_key).unwrap();
        let b = seal(b"same", &pair.public_key).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn other_forms_key_fails_cleanly() {
        let pair = FormKeyPair::generate();
        let other = FormKeyPair::generate();
        let sealed = seal(b"answers", &pair.public_key).unwrap();
        assert!(matches!(open(&sealed, &other.private_key), Err(ProtocolError::Decryption)));
    }

    #[test]
    fn tampering_and_truncation_fail() {
        let pair = FormKeyPair::generate();
        let mut sealed = seal(b"answers", &pair.public_key).unwrap();
        assert!(open(&sealed[..HEADER_LEN + TAG_LEN - 1], &pair.private_key).is_err());
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(open(&sealed, &pair.private_key), Err(ProtocolError::Decryption)));
    }

    #[test]
    fn sealed_bytes_hide_plaintext() {
        let pair = FormKeyPair::generate();
        let secret = b"formId: deadbeef";
        let sealed = seal(secret, &pair.public_key).unwrap();
        assert!(!sealed.windows(secret.len()).any(|w| w == secret));
    }

    #[test]
    fn small_order_components_do_not_reach_the_shared_secret() {
        use curve25519_dalek::{constants::EIGHT_TORSION, edwards::EdwardsPoint, scalar::Scalar};

        let pair = FormKeyPair::generate();
        let secret: [u8; 32] = from_hex_array(&pair.private_key).unwrap();

        let clean = EdwardsPoint::mul_base(&Scalar::from(7u64));
        for torsion in EIGHT_TORSION.iter() {
            let mixed = (clean + torsion).to_montgomery();
            assert_eq!(
                mixed.mul_clamped(secret),
                clean.to_montgomery().mul_clamped(secret)
            );
        }
    }

    #[test]
    fn small_order_ephemeral_is_refused() {
        use curve25519_dalek::constants::EIGHT_TORSION;

        let pair = FormKeyPair::generate();
        let mut sealed = seal(b"answers", &pair.public_key).unwrap();
        sealed[..SEALING_KEY_LEN].copy_from_slice(EIGHT_TORSION[1].to_montgomery().as_bytes());
        assert!(matches!(open(&sealed, &pair.private_key), Err(ProtocolError::Decryption)));
    }

    #[test]
    fn bad_public_key_rejected() {
        assert!(matches!(seal(b"x", "nothex"), Err(ProtocolError::Encryption(_))));
        assert!(matches!(
            seal(b"x", &"00".repeat(32)),
            Err(ProtocolError::Encryption(_))
        ));
    }
}
