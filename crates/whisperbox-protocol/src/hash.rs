use tiny_keccak::{Hasher, Keccak};

use crate::encoding::to_hex;

/// Keccak-256 hash of the input bytes.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut k = Keccak::v256();
    let mut out = [0u8; 32];
    k.update(data);
    k.finalize(&mut out);
    out
}

/// Form id = hex(keccak256(utf8(title) || utf8(creator) || decimal(created_at))).
///
/// Re-deriving from the same triple always yields the same id, which lets
/// peers de-duplicate forms across redundant network replays.
pub fn form_id(title: &str, creator: &str, created_at: u64) -> String {
    let mut k = Keccak::v256();
    let mut out = [0u8; 32];
    k.update(title.as_bytes());
    k.update(creator.as_bytes());
    k.update(created_at.to_string().as_bytes());
    k.finalize(&mut out);
    to_hex(&out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_of_empty_input() {
        assert_eq!(
            to_hex(&keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470",
        );
    }

    #[test]
    fn form_id_hashes_the_plain_concatenation() {
        let id = form_id("Poll", "0xC1", 1_700_000_000_000);
        assert_eq!(id, to_hex(&keccak256(b"Poll0xC11700000000000")));
        assert_eq!(id.len(), 64);
    }

    #[test]
    fn form_id_is_deterministic() {
        assert_eq!(
            form_id("Poll", "0xC1", 1_700_000_000_000),
            form_id("Poll", "0xC1", 1_700_000_000_000),
        );
    }

    #[test]
    fn each_input_changes_the_id() {
        let base = form_id("Poll", "0xC1", 1_700_000_000_000);
        assert_ne!(base, form_id("Poll!", "0xC1", 1_700_000_000_000));
        assert_ne!(base, form_id("Poll", "0xC2", 1_700_000_000_000));
        assert_ne!(base, form_id("Poll", "0xC1", 1_700_000_000_001));
    }
}
