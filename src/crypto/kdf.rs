//! # Key Derivation
//!
//! HKDF-SHA256 expand, used to derive the per-direction subkeys of a
//! connection from the pre-shared secret.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::constants::SECRET_KEY_SIZE;
use crate::error::{CommsError, Result};
use crate::crypto::SecretKey;

/// Derive a 32-byte key from `secret` and the context bytes in `info`.
///
/// Only the HKDF expand operation is used. The pre-shared secret is required
/// to be chosen with cryptographic randomness, so the extract step would add
/// nothing. Each connection calls this twice with the same secret but
/// different `info` to derive its send and receive keys.
pub fn hkdf_expand(secret: &SecretKey, info: &[u8]) -> Result<SecretKey> {
    let hkdf = Hkdf::<Sha256>::from_prk(secret.bytes()?)
        .map_err(|_| CommsError::Codec("HKDF rejected the input key".to_string()))?;

    let mut okm = Zeroizing::new([0u8; SECRET_KEY_SIZE]);
    hkdf.expand(info, &mut *okm)
        .map_err(|_| CommsError::Codec("HKDF expand failed".to_string()))?;

    // okm is scrubbed when it drops; the only surviving copy is in the key
    Ok(SecretKey::from_bytes(&okm))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_secret() -> SecretKey {
        SecretKey::from_hex("0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20")
            .unwrap()
    }

    #[test]
    fn test_expand_is_deterministic() {
        let a = hkdf_expand(&test_secret(), b"context").unwrap();
        let b = hkdf_expand(&test_secret(), b"context").unwrap();
        assert_eq!(a.bytes().unwrap(), b.bytes().unwrap());
    }

    #[test]
    fn test_different_info_different_keys() {
        let a = hkdf_expand(&test_secret(), b"send").unwrap();
        let b = hkdf_expand(&test_secret(), b"recv").unwrap();
        assert_ne!(a.bytes().unwrap(), b.bytes().unwrap());
    }

    #[test]
    fn test_output_differs_from_input() {
        let out = hkdf_expand(&test_secret(), b"").unwrap();
        assert_ne!(out.bytes().unwrap(), test_secret().bytes().unwrap());
    }

    #[test]
    fn test_invalid_secret_rejected() {
        let secret = SecretKey::new_zeroed();
        assert!(matches!(
            hkdf_expand(&secret, b"x"),
            Err(CommsError::KeyInvalid)
        ));
    }
}
