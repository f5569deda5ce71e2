//! # Constants
//!
//! Shared constants for the cryptocomms wire protocol.

// ═══════════════════════════════════════════════════════════════════════════
// IDENTIFIERS
// ═══════════════════════════════════════════════════════════════════════════

/// Host identifier size in bytes
pub const HOST_ID_SIZE: usize = 4;

/// Channel identifier size in bytes
pub const CHANNEL_ID_SIZE: usize = 2;

/// Connection identifier size in bytes (host id followed by channel id)
pub const CONN_ID_SIZE: usize = HOST_ID_SIZE + CHANNEL_ID_SIZE;

// ═══════════════════════════════════════════════════════════════════════════
// SEGMENT AND MESSAGE NUMBERS
// ═══════════════════════════════════════════════════════════════════════════

/// Segment and message numbers travel as unsigned 6-byte integers, so their
/// maximum value is 2^48 - 1.
pub const SEGNUM_MAX: u64 = 281_474_976_710_655;

/// Wire size of a segment or message number in bytes
pub const SEGNUM_SIZE: usize = 6;

// ═══════════════════════════════════════════════════════════════════════════
// PACKET LAYOUT
// ═══════════════════════════════════════════════════════════════════════════

/// Packet header size in bytes:
/// HostId(4) + ChannelId(2) + ReceiverSeg(6) + SenderSeg(6) + MsgNum(6)
pub const PACKET_HEADER_SIZE: usize = 24;

/// AES-256-GCM authentication tag size in bytes
pub const AEAD_TAG_SIZE: usize = 16;

/// AES-256-GCM initialization vector size in bytes
pub const AEAD_IV_SIZE: usize = 12;

/// Secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Smallest valid packet: a full header plus the tag over an empty payload
pub const MIN_PACKET_SIZE: usize = PACKET_HEADER_SIZE + AEAD_TAG_SIZE;

/// Default maximum packet size when the configuration does not set one
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1200;

/// Largest UDP payload over IPv4
pub const MAX_UDP_PAYLOAD: usize = 65507;

// ═══════════════════════════════════════════════════════════════════════════
// LOCAL ENDPOINTS
// ═══════════════════════════════════════════════════════════════════════════

/// Suffix of the FIFO carrying bytes from the user into the tunnel
pub const FIFO_OUTWARD_SUFFIX: &str = "_OUTWARD";

/// Suffix of the FIFO carrying bytes from the tunnel back to the user
pub const FIFO_INWARD_SUFFIX: &str = "_INWARD";

/// Default base path for the segment number files
pub const DEFAULT_SEGNUM_FILE: &str = "segnumfile";

// ═══════════════════════════════════════════════════════════════════════════
// SCHEDULER
// ═══════════════════════════════════════════════════════════════════════════

/// Default number of connection worker threads
pub const DEFAULT_WORKERS: usize = 5;

/// Lower bound on the per-dispatch work loop count
pub const DWELL_MIN: u32 = 5;

/// Upper bound on the per-dispatch work loop count
pub const DWELL_MAX: u32 = 50;
