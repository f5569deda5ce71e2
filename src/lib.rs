//! # cryptocomms - Peer-to-Peer Secure Datagram Tunnel
//!
//! Each host exposes a pair of named FIFOs per *channel*; bytes written
//! into a channel's outward FIFO come out of the peered host's inward FIFO,
//! carried over an authenticated, replay-resistant UDP transport
//! (AES-256-GCM, per-direction keys derived from a pre-shared secret).
//!
//! ## Architecture
//!
//! ```text
//! src/
//! ├── config.rs       # configuration file parsing
//! ├── crypto/         # key storage, HKDF, AEAD codec
//! ├── segnum.rs       # crash-safe segment number allocation
//! ├── replay.rs       # receive-side replay window
//! ├── rtt.rs          # smoothed round-trip estimate
//! ├── clock.rs        # epoch milliseconds
//! ├── net/            # UDP socket, FIFO endpoints, poll plumbing
//! ├── connection.rs   # per-channel protocol state machine
//! ├── session.rs      # threads: socket reader, fifo monitor, workers
//! └── error.rs        # unified error type
//! ```
//!
//! Data flow on send: outward FIFO → [`Connection`] (encrypt) → UDP.
//! On receive: UDP → [`Session`] (demux by the packet's leading host and
//! channel ids) → [`Connection`] (authenticate, replay-filter, decrypt) →
//! inward FIFO.

pub mod clock;
pub mod config;
pub mod connection;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod net;
pub mod replay;
pub mod rtt;
pub mod segnum;
pub mod session;

// Re-export commonly used types
pub use config::{parse_config, parse_config_file, ChannelId, Config, HostId, PeerConfig};
pub use connection::{ConnId, Connection};
pub use crypto::{hkdf_expand, AeadCodec, SecretKey};
pub use error::{CommsError, Result};
pub use replay::ReplayWindow;
pub use rtt::RttTracker;
pub use segnum::SegmentNumGenerator;
pub use session::Session;
