//! # Cryptographic Primitives
//!
//! Key storage, key derivation and the AEAD codec. All key material lives
//! in scrubbable containers; nothing in this module logs, formats or
//! otherwise copies key bytes out of them.

pub mod aead;
pub mod kdf;
pub mod secret_key;

pub use aead::AeadCodec;
pub use kdf::hkdf_expand;
pub use secret_key::SecretKey;
