//! # Error Module
//!
//! Unified error handling for the tunnel.

use std::fmt;
use std::io;

/// Errors surfaced by cryptocomms.
///
/// Authentication failure on a received packet is deliberately absent:
/// invalid ciphertexts are expected from the network and are reported as
/// `None` by [`crate::crypto::AeadCodec::decrypt`], never as an error.
#[derive(Debug)]
pub enum CommsError {
    /// Rejected configuration (malformed hex, duplicate channel, bad port).
    /// Fatal at startup only.
    Config(String),
    /// Missing or corrupt segment number files, socket bind failure,
    /// unusable FIFO path. Fatal at startup.
    Startup(String),
    /// A `SecretKey` was used while erased or uninitialized.
    KeyInvalid,
    /// The segment number generator cannot allocate without crossing the
    /// 48-bit limit. The session must stop.
    Reservation(String),
    /// The AEAD primitive failed to process data. The session must stop.
    Codec(String),
    /// Unrecoverable socket or FIFO error (non-EINTR, non-EAGAIN).
    Io(io::Error),
}

impl std::error::Error for CommsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommsError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for CommsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommsError::Config(msg) => write!(f, "config error: {}", msg),
            CommsError::Startup(msg) => write!(f, "startup error: {}", msg),
            CommsError::KeyInvalid => write!(f, "secret key used while invalid"),
            CommsError::Reservation(msg) => {
                write!(f, "segment number reservation error: {}", msg)
            }
            CommsError::Codec(msg) => write!(f, "AEAD codec error: {}", msg),
            CommsError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl From<io::Error> for CommsError {
    fn from(e: io::Error) -> Self {
        CommsError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, CommsError>;
