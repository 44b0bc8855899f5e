//! Two-source key derivation (2SKD).
//!
//! Combines a password and an offline secret key into one 256-bit root key.
//! Each source is stretched independently and the two results are XORed, so
//! knowing only one of them yields nothing about the root key.
//!
//! ```text
//! salt_key     = HKDF-SHA256(ikm = p2s,        salt = entity_id)
//! password_key = PBKDF2-HMAC-SHA1(password, salt_key, p2c, 32)
//! secret_key   = HKDF-SHA256(ikm = secret,     salt = mount)
//! root         = password_key XOR secret_key
//! ```
//!
//! The HKDF argument order and the SHA-1 PRF are part of the stored format
//! tagged `alg = "pbkdf2-hkdf"`. Changing either requires a new `alg` value.

use hkdf::Hkdf;
use sha1::Sha1;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypto::{EncryptionKey, KEY_LEN};
use crate::error::CryptoError;

/// Identifier stored in `EncSymKey.alg` for this derivation.
pub const ALG: &str = "pbkdf2-hkdf";

/// PBKDF2 iteration count used for new unlock keys.
pub const DEFAULT_ITERATIONS: u32 = 650_000;

/// Length of the random initial salt (`p2s`).
pub const SALT_LEN: usize = 16;

/// Inputs that together identify one user's derivation context.
///
/// The password and secret key are borrowed and never copied into
/// long-lived state.
#[derive(Clone, Copy)]
pub struct Credentials<'a> {
    /// The user's master password.
    pub password: &'a [u8],
    /// Mount context, for example `pwmanager`.
    pub mount: &'a [u8],
    /// The offline secret key the user keeps locally.
    pub secret_key: &'a [u8],
    /// The host-issued entity id of the user.
    pub entity_id: &'a [u8],
}

impl std::fmt::Debug for Credentials<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("mount", &String::from_utf8_lossy(self.mount))
            .field("entity_id", &String::from_utf8_lossy(self.entity_id))
            .finish_non_exhaustive()
    }
}

/// Derive the 2SKD root key.
///
/// Deterministic: identical credentials, salt and iteration count always
/// produce the same key.
///
/// # Errors
///
/// Returns [`CryptoError::Derivation`] if `iterations` is zero or the salt is
/// empty.
pub fn derive(
    creds: &Credentials<'_>,
    initial_salt: &[u8],
    iterations: u32,
) -> Result<EncryptionKey, CryptoError> {
    if iterations == 0 {
        return Err(CryptoError::Derivation {
            reason: "iteration count must be positive".to_owned(),
        });
    }
    if initial_salt.is_empty() {
        return Err(CryptoError::Derivation {
            reason: "initial salt is empty".to_owned(),
        });
    }

    let salt_key = hkdf_expand(creds.entity_id, initial_salt)?;

    let mut password_key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha1>(
        creds.password,
        salt_key.as_slice(),
        iterations,
        password_key.as_mut_slice(),
    );

    let secret_key = hkdf_expand(creds.mount, creds.secret_key)?;

    let mut root = [0u8; KEY_LEN];
    for (out, (p, s)) in root
        .iter_mut()
        .zip(password_key.iter().zip(secret_key.iter()))
    {
        *out = p ^ s;
    }
    Ok(EncryptionKey::from_bytes(root))
}

/// Decode a hex `p2s` value and check its length.
///
/// # Errors
///
/// Returns [`CryptoError::Derivation`] on bad hex or a salt that is not
/// [`SALT_LEN`] bytes.
pub fn decode_salt(p2s: &str) -> Result<[u8; SALT_LEN], CryptoError> {
    let bytes = hex::decode(p2s).map_err(|e| CryptoError::Derivation {
        reason: format!("p2s is not hex: {e}"),
    })?;
    bytes.try_into().map_err(|b: Vec<u8>| CryptoError::Derivation {
        reason: format!("p2s must be {SALT_LEN} bytes, got {}", b.len()),
    })
}

fn hkdf_expand(salt: &[u8], ikm: &[u8]) -> Result<Zeroizing<[u8; KEY_LEN]>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(&[], okm.as_mut_slice())
        .map_err(|e| CryptoError::Derivation {
            reason: format!("hkdf expand: {e}"),
        })?;
    Ok(okm)
}
