//! Persisted envelopes: `EncSymKey` and `EncPriKey`.
//!
//! `EncSymKey` holds the per-user symmetric key sealed under the 2SKD root
//! key, together with the non-secret derivation parameters (`p2c`, `p2s`).
//! `EncPriKey` holds the user's RSA private key, serialized as JWK JSON and
//! sealed under that symmetric key. Binary fields are lowercase hex.

use serde::{Deserialize, Serialize};

use crate::crypto::{self, EncryptionKey, NONCE_LEN, TAG_LEN};
use crate::error::CryptoError;
use crate::jwk::PrivateJwk;
use crate::kdf::{self, Credentials, SALT_LEN};

/// Content encryption identifier for both envelopes.
pub const ENC_A256GCM: &str = "A256GCM";

/// Content type of a sealed private key.
pub const CTY_JWK: &str = "jwk+json";

/// The sealed symmetric key and the parameters needed to re-derive its
/// wrapping key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncSymKey {
    pub kid: String,
    pub enc: String,
    pub iv: String,
    pub data: String,
    #[serde(default)]
    pub cty: String,
    pub alg: String,
    pub p2c: u32,
    pub p2s: String,
}

impl EncSymKey {
    /// Derive a root key from `creds` with a fresh salt and seal `sym_key`
    /// under it.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Derivation`] for a zero iteration count and
    /// [`CryptoError::Encryption`] if sealing fails.
    pub fn seal(
        creds: &Credentials<'_>,
        sym_key: &EncryptionKey,
        kid: &str,
        iterations: u32,
    ) -> Result<Self, CryptoError> {
        let salt: [u8; SALT_LEN] = crypto::random_array();
        let root = kdf::derive(creds, &salt, iterations)?;
        let sealed = crypto::seal(&root, sym_key.as_bytes())?;

        Ok(Self {
            kid: kid.to_owned(),
            enc: ENC_A256GCM.to_owned(),
            iv: hex::encode(sealed.iv),
            data: hex::encode(sealed.data),
            cty: String::new(),
            alg: kdf::ALG.to_owned(),
            p2c: iterations,
            p2s: hex::encode(salt),
        })
    }

    /// Re-derive the root key from the stored parameters and open the
    /// symmetric key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Derivation`] if `p2s`/`p2c` are malformed,
    /// [`CryptoError::Encoding`] for bad hex in `iv`/`data`, and
    /// [`CryptoError::Authentication`] if the credentials are wrong.
    pub fn open(&self, creds: &Credentials<'_>) -> Result<EncryptionKey, CryptoError> {
        let salt = kdf::decode_salt(&self.p2s)?;
        let root = kdf::derive(creds, &salt, self.p2c)?;
        let iv = decode_hex("enc_sym_key.iv", &self.iv)?;
        let data = decode_hex("enc_sym_key.data", &self.data)?;
        let plain = zeroize::Zeroizing::new(crypto::open(&root, &iv, &data)?);
        EncryptionKey::try_from_slice(&plain)
    }

    /// Structural validation for a payload received over the wire.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Derivation`] for bad KDF parameters and
    /// [`CryptoError::Encoding`] for any other malformed field.
    pub fn validate(&self, uuid: &str) -> Result<(), CryptoError> {
        check_common("enc_sym_key", &self.kid, &self.enc, &self.iv, &self.data, uuid)?;
        if self.alg != kdf::ALG {
            return Err(CryptoError::Derivation {
                reason: format!("unsupported alg '{}'", self.alg),
            });
        }
        if self.p2c == 0 {
            return Err(CryptoError::Derivation {
                reason: "p2c must be positive".to_owned(),
            });
        }
        kdf::decode_salt(&self.p2s)?;
        Ok(())
    }
}

/// The sealed RSA private key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncPriKey {
    pub kid: String,
    pub enc: String,
    pub iv: String,
    pub data: String,
    #[serde(default)]
    pub cty: String,
}

impl EncPriKey {
    /// Serialize `key` to JWK JSON and seal it under `sym_key`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encryption`] if serialization or sealing fails.
    pub fn seal(sym_key: &EncryptionKey, key: &PrivateJwk, kid: &str) -> Result<Self, CryptoError> {
        let json = zeroize::Zeroizing::new(serde_json::to_vec(key).map_err(|e| {
            CryptoError::Encryption {
                reason: format!("serialize private key: {e}"),
            }
        })?);
        let sealed = crypto::seal(sym_key, &json)?;

        Ok(Self {
            kid: kid.to_owned(),
            enc: ENC_A256GCM.to_owned(),
            iv: hex::encode(sealed.iv),
            data: hex::encode(sealed.data),
            cty: CTY_JWK.to_owned(),
        })
    }

    /// Open the private key with `sym_key`.
    ///
    /// A plaintext that authenticates but is not a JWK is reported as
    /// [`CryptoError::Authentication`] as well.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encoding`] for bad hex and
    /// [`CryptoError::Authentication`] otherwise.
    pub fn open(&self, sym_key: &EncryptionKey) -> Result<PrivateJwk, CryptoError> {
        let iv = decode_hex("enc_pri_key.iv", &self.iv)?;
        let data = decode_hex("enc_pri_key.data", &self.data)?;
        let plain = zeroize::Zeroizing::new(crypto::open(sym_key, &iv, &data)?);
        serde_json::from_slice(&plain).map_err(|_| CryptoError::Authentication)
    }

    /// Structural validation for a payload received over the wire.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encoding`] describing the first bad field.
    pub fn validate(&self, uuid: &str) -> Result<(), CryptoError> {
        check_common("enc_pri_key", &self.kid, &self.enc, &self.iv, &self.data, uuid)
    }
}

fn check_common(
    envelope: &str,
    kid: &str,
    enc: &str,
    iv: &str,
    data: &str,
    uuid: &str,
) -> Result<(), CryptoError> {
    if kid != uuid {
        return Err(encoding(envelope, "kid", "does not match uuid".to_owned()));
    }
    if enc != ENC_A256GCM {
        return Err(encoding(envelope, "enc", format!("unsupported value '{enc}'")));
    }
    let iv = hex::decode(iv).map_err(|e| encoding(envelope, "iv", e.to_string()))?;
    if iv.len() != NONCE_LEN {
        return Err(encoding(envelope, "iv", format!("must be {NONCE_LEN} bytes")));
    }
    let data = hex::decode(data).map_err(|e| encoding(envelope, "data", e.to_string()))?;
    if data.len() < TAG_LEN {
        return Err(encoding(envelope, "data", "shorter than an authentication tag".to_owned()));
    }
    Ok(())
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    hex::decode(value).map_err(|e| CryptoError::Encoding {
        field: field.to_owned(),
        reason: e.to_string(),
    })
}

fn encoding(envelope: &str, field: &str, reason: String) -> CryptoError {
    CryptoError::Encoding {
        field: format!("{envelope}.{field}"),
        reason,
    }
}
