//! # Secret Key
//!
//! Fixed 32-byte key container with in-memory hygiene. The destructor
//! zeroes the key, and the parsing path never places any part of the key
//! value anywhere except in the destination byte array.

use zeroize::Zeroize;

use crate::constants::SECRET_KEY_SIZE;
use crate::error::{CommsError, Result};

/// A 32-byte cryptographic key.
///
/// A `SecretKey` tracks its own validity: it is invalid after
/// [`SecretKey::new_zeroed`] or [`SecretKey::erase`], and any attempt to read
/// the bytes of an invalid key fails with `KeyInvalid`. This prevents a key
/// of all zeros from ever being handed to the cipher. There is no `Clone`
/// impl, and the key cannot be used after being moved from, so the only
/// copies of the key bytes are the ones explicitly created by callers of
/// [`SecretKey::bytes`].
pub struct SecretKey {
    key: [u8; SECRET_KEY_SIZE],
    valid: bool,
}

impl SecretKey {
    /// An invalid, all-zero key.
    pub fn new_zeroed() -> Self {
        SecretKey {
            key: [0u8; SECRET_KEY_SIZE],
            valid: false,
        }
    }

    /// Parse a key from exactly 64 hexadecimal characters.
    ///
    /// Each pair of characters becomes one key byte. The conversion writes
    /// nibble-by-nibble into the destination byte only; no substring or
    /// intermediate integer holding key material is ever created.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.as_bytes();
        if hex.len() != 2 * SECRET_KEY_SIZE {
            return Err(CommsError::Config(
                "key string has wrong length".to_string(),
            ));
        }

        let mut out = SecretKey::new_zeroed();
        for i in 0..SECRET_KEY_SIZE {
            add_hex_to_byte(hex[i * 2], &mut out.key[i])?;
            out.key[i] *= 16;
            add_hex_to_byte(hex[i * 2 + 1], &mut out.key[i])?;
        }
        out.valid = true;
        Ok(out)
    }

    /// Wrap raw key bytes. The caller is responsible for scrubbing its copy.
    pub(crate) fn from_bytes(bytes: &[u8; SECRET_KEY_SIZE]) -> Self {
        SecretKey {
            key: *bytes,
            valid: true,
        }
    }

    /// The key bytes, or `KeyInvalid` if the key is erased or uninitialized.
    pub fn bytes(&self) -> Result<&[u8; SECRET_KEY_SIZE]> {
        if !self.valid {
            return Err(CommsError::KeyInvalid);
        }
        Ok(&self.key)
    }

    /// Zero the key bytes and mark the key invalid.
    pub fn erase(&mut self) {
        self.key.zeroize();
        self.valid = false;
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print key bytes
        f.debug_struct("SecretKey")
            .field("valid", &self.valid)
            .finish_non_exhaustive()
    }
}

/// Add the value of one hex digit to `out`.
///
/// The digit value goes straight from the match arm into `out`; it is never
/// stored anywhere else.
fn add_hex_to_byte(hex: u8, out: &mut u8) -> Result<()> {
    match hex {
        b'0' => {}
        b'1' => *out += 1,
        b'2' => *out += 2,
        b'3' => *out += 3,
        b'4' => *out += 4,
        b'5' => *out += 5,
        b'6' => *out += 6,
        b'7' => *out += 7,
        b'8' => *out += 8,
        b'9' => *out += 9,
        b'a' | b'A' => *out += 10,
        b'b' | b'B' => *out += 11,
        b'c' | b'C' => *out += 12,
        b'd' | b'D' => *out += 13,
        b'e' | b'E' => *out += 14,
        b'f' | b'F' => *out += 15,
        other => {
            return Err(CommsError::Config(format!(
                "\"{}\" is not a valid hex digit",
                other as char
            )));
        }
    }
    Ok(())
}
