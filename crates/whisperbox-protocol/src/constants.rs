// ============================================================================
// Protocol constants
// ============================================================================

/// The single pub/sub channel carrying every WhisperBox envelope kind.
/// The kind travels inside the envelope, never in the channel name.
pub const CHANNEL: &str = "/whisperbox/1/forms/json";

// --- Transport --------------------------------------------------------------

/// Maximum encoded envelope size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 262_144; // 256 KiB

// --- Identifiers & keys -----------------------------------------------------

/// Byte length of the random confirmation id a respondent embeds in its response.
pub const CONFIRMATION_ID_LEN: usize = 32;

/// Byte length of an X25519 form sealing key (public and private).
pub const SEALING_KEY_LEN: usize = 32;

/// Byte length of a wallet address: last 20 bytes of keccak256(verifying key).
pub const ADDRESS_LEN: usize = 20;

// --- Form schema ------------------------------------------------------------

/// Single- and multi-choice questions need at least this many options.
pub const MIN_CHOICE_OPTIONS: usize = 2;

// --- Signable messages ------------------------------------------------------
// First line of each canonical signable string. Part of the wire contract.

pub const FORM_CREATION_HEADER: &str = "WhisperBox form creation";
pub const FORM_RESPONSE_HEADER: &str = "WhisperBox form response";
