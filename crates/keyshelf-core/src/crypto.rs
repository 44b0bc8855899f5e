//! Authenticated encryption primitives for `keyshelf`.
//!
//! Provides AES-256-GCM sealing with detached nonces, CSPRNG helpers and a
//! zeroize-on-drop key newtype. All envelopes in this crate are built on
//! [`seal`] and [`open`].
//!
//! # Security model
//!
//! - Every [`seal`] draws a fresh 96-bit nonce from `OsRng`; the nonce is
//!   returned to the caller and stored next to the ciphertext.
//! - The ciphertext carries the 16-byte GCM tag appended.
//! - [`open`] fails closed with [`CryptoError::Authentication`] on any tag,
//!   key or nonce mismatch and never releases partial plaintext.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, rand_core::RngCore};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Nonce length for AES-256-GCM (96 bits).
pub const NONCE_LEN: usize = 12;

/// Length of the GCM authentication tag appended to every ciphertext.
pub const TAG_LEN: usize = 16;

/// Length of a symmetric key (AES-256).
pub const KEY_LEN: usize = 32;

/// A 256-bit symmetric key that is zeroized on drop.
///
/// Used for the 2SKD root key and for the per-user symmetric key that wraps
/// the private key. The bytes never appear in `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Create a key from a slice, failing if it is not exactly 32 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Authentication`]: a wrong-length key only ever
    /// comes out of a successfully opened envelope that was not ours.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::Authentication)?;
        Ok(Self(array))
    }

    /// Generate a new random key using the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&key);
        Self(bytes)
    }

    /// Borrow the raw key bytes.
    ///
    /// The caller must not log or persist these bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Ciphertext produced by [`seal`], with its nonce kept separate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// The 96-bit nonce used for this encryption.
    pub iv: [u8; NONCE_LEN],
    /// Ciphertext with the GCM tag appended.
    pub data: Vec<u8>,
}

/// Fill a fixed-size array from the OS CSPRNG.
#[must_use]
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn seal(key: &EncryptionKey, plaintext: &[u8]) -> Result<Sealed, CryptoError> {
    seal_with_aad(key, plaintext, &[])
}

/// Encrypt with additional authenticated data.
///
/// # Errors
///
/// Returns [`CryptoError::Encryption`] if the AEAD operation fails.
pub fn seal_with_aad(
    key: &EncryptionKey,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Sealed, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let data = cipher
        .encrypt(
            &nonce,
            aes_gcm::aead::Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::Encryption {
            reason: e.to_string(),
        })?;

    let mut iv = [0u8; NONCE_LEN];
    iv.copy_from_slice(&nonce);
    Ok(Sealed { iv, data })
}

/// Decrypt and authenticate `data` produced by [`seal`].
///
/// # Errors
///
/// Returns [`CryptoError::Authentication`] if the nonce has the wrong length,
/// the ciphertext is shorter than a tag, or authentication fails.
pub fn open(key: &EncryptionKey, iv: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    open_with_aad(key, iv, data, &[])
}

/// Decrypt and authenticate `data` with additional authenticated data.
///
/// # Errors
///
/// Same as [`open`].
pub fn open_with_aad(
    key: &EncryptionKey,
    iv: &[u8],
    data: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if iv.len() != NONCE_LEN || data.len() < TAG_LEN {
        return Err(CryptoError::Authentication);
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .decrypt(Nonce::from_slice(iv), aes_gcm::aead::Payload { msg: data, aad })
        .map_err(|_| CryptoError::Authentication)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = EncryptionKey::generate();
        let sealed = seal(&key, b"bundle key material").unwrap();
        let opened = open(&key, &sealed.iv, &sealed.data).unwrap();
        assert_eq!(opened, b"bundle key material");
    }

    #[test]
    fn ciphertext_carries_tag() {
        let key = EncryptionKey::generate();
        let sealed = seal(&key, b"abcd").unwrap();
        assert_eq!(sealed.data.len(), 4 + TAG_LEN);
    }

    #[test]
    fn open_with_wrong_key_fails_generically() {
        let sealed = seal(&EncryptionKey::generate(), b"secret").unwrap();
        let result = open(&EncryptionKey::generate(), &sealed.iv, &sealed.data);
        assert!(matches!(result, Err(CryptoError::Authentication)));
    }

    #[test]
    fn every_single_bit_flip_is_rejected() {
        let key = EncryptionKey::generate();
        let sealed = seal(&key, b"0123456789").unwrap();

        for byte in 0..sealed.data.len() {
            for bit in 0..8 {
                let mut data = sealed.data.clone();
                data[byte] ^= 1 << bit;
                assert!(matches!(
                    open(&key, &sealed.iv, &data),
                    Err(CryptoError::Authentication)
                ));
            }
        }

        for byte in 0..NONCE_LEN {
            for bit in 0..8 {
                let mut iv = sealed.iv;
                iv[byte] ^= 1 << bit;
                assert!(matches!(
                    open(&key, &iv, &sealed.data),
                    Err(CryptoError::Authentication)
                ));
            }
        }
    }

    #[test]
    fn truncated_inputs_are_rejected() {
        let key = EncryptionKey::generate();
        let sealed = seal(&key, b"x").unwrap();
        assert!(open(&key, &sealed.iv[..8], &sealed.data).is_err());
        assert!(open(&key, &sealed.iv, &sealed.data[..TAG_LEN - 1]).is_err());
    }

    #[test]
    fn aad_is_authenticated() {
        let key = EncryptionKey::generate();
        let sealed = seal_with_aad(&key, b"payload", b"header-a").unwrap();
        assert!(open_with_aad(&key, &sealed.iv, &sealed.data, b"header-a").is_ok());
        assert!(open_with_aad(&key, &sealed.iv, &sealed.data, b"header-b").is_err());
    }

    #[test]
    fn nonces_do_not_repeat_across_ten_thousand_seals() {
        let key = EncryptionKey::generate();
        let mut seen = HashSet::with_capacity(10_000);
        for _ in 0..10_000 {
            let sealed = seal(&key, b"").unwrap();
            assert!(seen.insert(sealed.iv), "nonce reused");
        }
    }

    #[test]
    fn key_from_wrong_length_slice_is_rejected() {
        assert!(EncryptionKey::try_from_slice(&[0u8; 31]).is_err());
        assert!(EncryptionKey::try_from_slice(&[0u8; 32]).is_ok());
    }

    #[test]
    fn encryption_key_debug_redacts_bytes() {
        let key = EncryptionKey::from_bytes([0xAB; KEY_LEN]);
        let debug = format!("{key:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("171"));
    }
}
