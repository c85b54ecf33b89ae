use konst::{option, primitive::parse_usize, result::unwrap_ctx};

/// Roster capacity is fixed up front so the maps never resize under load.
pub const MAX_CLIENTS: usize = unwrap_ctx!(parse_usize(option::unwrap_or!(option_env!("MUMBLED_MAX_CLIENTS"), "2048")));

/// Outbound queue depth per client before broadcasts start dropping.
pub const CLIENT_QUEUE_CAPACITY: usize =
    unwrap_ctx!(parse_usize(option::unwrap_or!(option_env!("MUMBLED_QUEUE_CAPACITY"), "128")));

/// Whisper target slots addressable by the 5-bit audio target field (1..=30).
pub const VOICE_TARGET_SLOTS: usize = 30;

/// Largest UDP datagram the voice socket will accept.
pub const MAX_UDP_DATAGRAM: usize = 1024;

/// Learned UDP peers are forgotten after this long without a decryptable
/// packet, forcing address rediscovery and a crypt resync.
pub const CRYPT_STALE_MILLIS: u128 = 5000;

/// Clients silent on the control channel longer than this are reaped.
pub const PING_TIMEOUT_SECS: u64 = 30;

/// Advertised protocol version, packed major << 16 | minor << 8 | patch.
pub const PROTOCOL_VERSION: u32 = 1 << 16 | 2 << 8 | 2;
