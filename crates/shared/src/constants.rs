/// Length of an X25519 public or private key.
pub const KEY_LENGTH: usize = 32;
/// Length of an XSalsa20 nonce.
pub const NONCE_LENGTH: usize = 24;
/// Envelope version written by current senders.
pub const CURRENT_ENVELOPE_VERSION: u32 = 3;
/// Oldest envelope version a receiver will open.
pub const MIN_SUPPORTED_ENVELOPE_VERSION: u32 = 3;
/// Default cap for a single media payload held in memory: 100 MB.
pub const MAX_MEDIA_PAYLOAD_BYTES: usize = 100 * 1024 * 1024;
/// Default number of SAS symbols shown to users.
pub const DEFAULT_SAS_SYMBOLS: usize = 5;
