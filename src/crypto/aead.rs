//! # AEAD Codec
//!
//! AES-256-GCM with a 12-byte IV and 16-byte tag, wrapped for the two
//! directions of a connection. NIST SP 800-38D compliant via RustCrypto.

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce, Tag};
use zeroize::Zeroize;

use crate::constants::{AEAD_IV_SIZE, AEAD_TAG_SIZE};
use crate::crypto::SecretKey;
use crate::error::{CommsError, Result};

/// Paired encrypt/decrypt contexts for one connection.
///
/// The key bytes live only inside the cipher instances; an unused direction
/// may be given a dummy key. Authentication failure on decryption is an
/// expected event (attackers can send arbitrary ciphertexts) and is reported
/// as `None`, not as an error.
pub struct AeadCodec {
    seal: Aes256Gcm,
    open: Aes256Gcm,
}

impl AeadCodec {
    /// Build a codec from the send-direction and receive-direction keys.
    pub fn new(send_key: &SecretKey, recv_key: &SecretKey) -> Result<Self> {
        let seal = Aes256Gcm::new_from_slice(send_key.bytes()?)
            .map_err(|_| CommsError::Codec("bad encrypt key length".to_string()))?;
        let open = Aes256Gcm::new_from_slice(recv_key.bytes()?)
            .map_err(|_| CommsError::Codec("bad decrypt key length".to_string()))?;
        Ok(AeadCodec { seal, open })
    }

    /// Encrypt `plaintext` with `additional` authenticated data, writing
    /// `plaintext.len() + 16` bytes (ciphertext then tag) at
    /// `dest[offset..]`. Returns the number of bytes written.
    pub fn encrypt_into(
        &self,
        plaintext: &[u8],
        additional: &[u8],
        iv: &[u8; AEAD_IV_SIZE],
        dest: &mut [u8],
        offset: usize,
    ) -> Result<usize> {
        let total = plaintext.len() + AEAD_TAG_SIZE;
        if dest.len() < offset + total {
            return Err(CommsError::Codec(
                "encrypt destination buffer too small".to_string(),
            ));
        }

        let (body, rest) = dest[offset..].split_at_mut(plaintext.len());
        body.copy_from_slice(plaintext);
        let tag = self
            .seal
            .encrypt_in_place_detached(Nonce::from_slice(iv), additional, body)
            .map_err(|_| {
                // scrub the plaintext we copied in before reporting failure
                body.zeroize();
                CommsError::Codec("AES-GCM encryption failed".to_string())
            })?;
        rest[..AEAD_TAG_SIZE].copy_from_slice(tag.as_slice());

        Ok(total)
    }

    /// Verify the trailing 16-byte tag of `src` and decrypt.
    ///
    /// `Some(plaintext)` of `src.len() - 16` bytes on success; `None` when
    /// the tag (or the additional data) does not authenticate.
    pub fn decrypt(
        &self,
        src: &[u8],
        additional: &[u8],
        iv: &[u8; AEAD_IV_SIZE],
    ) -> Option<Vec<u8>> {
        if src.len() < AEAD_TAG_SIZE {
            return None;
        }

        let body_len = src.len() - AEAD_TAG_SIZE;
        let mut plaintext = src[..body_len].to_vec();
        let tag = Tag::from_slice(&src[body_len..]);

        match self
            .open
            .decrypt_in_place_detached(Nonce::from_slice(iv), additional, &mut plaintext, tag)
        {
            Ok(()) => Some(plaintext),
            Err(_) => {
                // the buffer holds an unauthenticated keystream mix; scrub it
                plaintext.zeroize();
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_codec() -> AeadCodec {
        let key = SecretKey::from_hex(
            "0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20",
        )
        .unwrap();
        AeadCodec::new(&key, &key).unwrap()
    }

    #[test]
    fn test_roundtrip_with_additional_data() {
        let codec = test_codec();
        let iv = [7u8; 12];
        let mut packet = vec![0u8; 64];

        let n = codec
            .encrypt_into(b"hello tunnel", b"header bytes", &iv, &mut packet, 8)
            .unwrap();
        assert_eq!(n, 12 + 16);

        let plain = codec
            .decrypt(&packet[8..8 + n], b"header bytes", &iv)
            .unwrap();
        assert_eq!(&plain, b"hello tunnel");
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let codec = test_codec();
        let iv = [1u8; 12];
        let mut buf = vec![0u8; 16];

        let n = codec.encrypt_into(b"", b"ad", &iv, &mut buf, 0).unwrap();
        assert_eq!(n, 16);

        let plain = codec.decrypt(&buf, b"ad", &iv).unwrap();
        assert!(plain.is_empty());
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let codec = test_codec();
        let iv = [2u8; 12];
        let mut buf = vec![0u8; 32];
        let n = codec.encrypt_into(b"secret", b"", &iv, &mut buf, 0).unwrap();

        for i in 0..n {
            let mut evil = buf[..n].to_vec();
            evil[i] ^= 1;
            assert!(codec.decrypt(&evil, b"", &iv).is_none(), "byte {}", i);
        }
    }

    #[test]
    fn test_wrong_additional_data_rejected() {
        let codec = test_codec();
        let iv = [3u8; 12];
        let mut buf = vec![0u8; 32];
        let n = codec
            .encrypt_into(b"secret", b"right", &iv, &mut buf, 0)
            .unwrap();
        assert!(codec.decrypt(&buf[..n], b"wrong", &iv).is_none());
    }

    #[test]
    fn test_wrong_iv_rejected() {
        let codec = test_codec();
        let mut buf = vec![0u8; 32];
        let n = codec
            .encrypt_into(b"secret", b"", &[4u8; 12], &mut buf, 0)
            .unwrap();
        assert!(codec.decrypt(&buf[..n], b"", &[5u8; 12]).is_none());
    }

    #[test]
    fn test_short_input_rejected() {
        let codec = test_codec();
        assert!(codec.decrypt(&[0u8; 15], b"", &[0u8; 12]).is_none());
    }

    #[test]
    fn test_directional_keys() {
        let k1 = SecretKey::from_hex(
            "0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f20",
        )
        .unwrap();
        let k2 = SecretKey::from_hex(
            "f0e0d0c0b0a090807060504030201000f0e0d0c0b0a09080706050403020100f",
        )
        .unwrap();

        // a's send key is b's receive key
        let a = AeadCodec::new(&k1, &k2).unwrap();
        let b = AeadCodec::new(&k2, &k1).unwrap();

        let iv = [9u8; 12];
        let mut buf = vec![0u8; 32];
        let n = a.encrypt_into(b"from a", b"", &iv, &mut buf, 0).unwrap();

        assert_eq!(b.decrypt(&buf[..n], b"", &iv).unwrap(), b"from a");
        // a cannot read its own traffic
        assert!(a.decrypt(&buf[..n], b"", &iv).is_none());
    }
}
