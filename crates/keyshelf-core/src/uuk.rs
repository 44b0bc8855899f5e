//! User Unlock Key (UUK).
//!
//! A UUK is the only per-user secret state the server ever stores, and it is
//! stored encrypted: a random symmetric key sealed under the 2SKD root key,
//! an RSA-2048 private key sealed under that symmetric key, and the public
//! key in the clear.
//!
//! ```text
//! password + secret key ──2SKD──▶ root key
//!                                    │ seals
//!                                    ▼
//!                             symmetric key ──seals──▶ RSA private key (JWK)
//! ```
//!
//! The public key wraps per-recipient key material as JWE compact tokens
//! (`RSA-OAEP` + `A256GCM`), see [`Uuk::encrypt`] and [`Uuk::decrypt`].
//!
//! # Security model
//!
//! - A built UUK contains no password, no secret key, no root key and no
//!   plaintext private key. It is safe to send to and persist on the server.
//! - Every failure to open a layer is reported as
//!   [`CryptoError::Authentication`]. Callers cannot learn whether the
//!   password, the secret key or the ciphertext was at fault.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use zeroize::Zeroizing;

use aes_gcm::aead::OsRng;

use crate::crypto::{self, EncryptionKey, NONCE_LEN, TAG_LEN};
use crate::envelope::{ENC_A256GCM, EncPriKey, EncSymKey};
use crate::error::CryptoError;
use crate::jwk::{PrivateJwk, PublicJwk};
use crate::kdf::{Credentials, DEFAULT_ITERATIONS};

/// Provenance tag for keys protected by the master password.
pub const ENCRYPTED_BY_MASTER_PASSWORD: &str = "mp";

/// RSA modulus size for newly generated keys.
pub const RSA_BITS: usize = 2048;

/// Key-management algorithm in the JWE protected header.
pub const JWE_ALG: &str = "RSA-OAEP";

/// Tunables for [`Uuk::build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// PBKDF2 iteration count stored as `p2c`.
    pub iterations: u32,
    /// Provenance tag stored as `encrypted_by`.
    pub encrypted_by: String,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            encrypted_by: ENCRYPTED_BY_MASTER_PASSWORD.to_owned(),
        }
    }
}

/// A user unlock key as registered with the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Uuk {
    pub uuid: String,
    pub enc_sym_key: EncSymKey,
    pub encrypted_by: String,
    pub enc_pri_key: EncPriKey,
    #[serde(alias = "pubKey")]
    pub pub_key: PublicJwk,
}

#[derive(Serialize, Deserialize)]
struct JweHeader {
    alg: String,
    enc: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    kid: String,
}

impl Uuk {
    /// Build a new UUK with a freshly generated RSA-2048 keypair.
    ///
    /// Runs entirely client-side. Key generation is slow; callers on an async
    /// runtime should run this on a blocking thread.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Keygen`] if RSA key generation fails,
    /// [`CryptoError::Derivation`] for a zero iteration count, or
    /// [`CryptoError::Encryption`] if sealing fails.
    pub fn build(creds: &Credentials<'_>, opts: &BuildOptions) -> Result<Self, CryptoError> {
        let key = generate_rsa_key()?;
        Self::from_private_key(creds, &key, opts)
    }

    /// Build a UUK around an existing RSA private key.
    ///
    /// # Errors
    ///
    /// Same as [`Uuk::build`], minus key generation.
    pub fn from_private_key(
        creds: &Credentials<'_>,
        key: &RsaPrivateKey,
        opts: &BuildOptions,
    ) -> Result<Self, CryptoError> {
        Self::assemble(uuid::Uuid::new_v4().to_string(), creds, key, opts)
    }

    fn assemble(
        uuid: String,
        creds: &Credentials<'_>,
        key: &RsaPrivateKey,
        opts: &BuildOptions,
    ) -> Result<Self, CryptoError> {
        let sym_key = EncryptionKey::generate();
        let enc_sym_key = EncSymKey::seal(creds, &sym_key, &uuid, opts.iterations)?;
        let private = PrivateJwk::from_key(key, &uuid)?;
        let enc_pri_key = EncPriKey::seal(&sym_key, &private, &uuid)?;
        let pub_key = PublicJwk::from_key(&key.to_public_key(), &uuid);

        Ok(Self {
            uuid,
            enc_sym_key,
            encrypted_by: opts.encrypted_by.clone(),
            enc_pri_key,
            pub_key,
        })
    }

    /// Re-derive the root key and recover the private key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Derivation`] if the stored parameters are
    /// malformed and [`CryptoError::Authentication`] for every other failure,
    /// including a decrypted key that does not match `pub_key`.
    pub fn decrypt_enc_pri_key(&self, creds: &Credentials<'_>) -> Result<RsaPrivateKey, CryptoError> {
        let (_, _, key) = self.unlock(creds)?;
        Ok(key)
    }

    fn unlock(
        &self,
        creds: &Credentials<'_>,
    ) -> Result<(EncryptionKey, PrivateJwk, RsaPrivateKey), CryptoError> {
        // Every stored field is checked before derivation, so the outcome of
        // opening one layer never decides which error the caller sees.
        self.check_stored()?;

        let (sym_key, private) = self
            .enc_sym_key
            .open(creds)
            .and_then(|sym| self.enc_pri_key.open(&sym).map(|jwk| (sym, jwk)))
            .map_err(|e| match e {
                CryptoError::Derivation { reason } => CryptoError::Derivation { reason },
                _ => CryptoError::Authentication,
            })?;

        let key = private.to_key().map_err(|_| CryptoError::Authentication)?;
        let expected = self.pub_key.to_key().map_err(|_| CryptoError::Authentication)?;
        if key.to_public_key() != expected {
            return Err(CryptoError::Authentication);
        }
        Ok((sym_key, private, key))
    }

    /// Structural checks on both envelopes, reported as
    /// [`CryptoError::Derivation`] since they mean corrupt stored data.
    fn check_stored(&self) -> Result<(), CryptoError> {
        self.enc_sym_key
            .validate(&self.uuid)
            .and_then(|()| self.enc_pri_key.validate(&self.uuid))
            .map_err(|e| match e {
                CryptoError::Encoding { field, reason } => CryptoError::Derivation {
                    reason: format!("{field}: {reason}"),
                },
                other => other,
            })
    }

    /// Re-encrypt under new credentials, keeping the keypair.
    ///
    /// Draws a fresh `p2s` and fresh ivs for both envelopes. `uuid`,
    /// `pub_key` and the iteration count are kept.
    ///
    /// # Errors
    ///
    /// Fails like [`Uuk::decrypt_enc_pri_key`] if `old` does not open this
    /// UUK, or with [`CryptoError::Encryption`] if resealing fails.
    pub fn change_password(
        &self,
        old: &Credentials<'_>,
        new: &Credentials<'_>,
    ) -> Result<Self, CryptoError> {
        let (sym_key, private, _) = self.unlock(old)?;

        Ok(Self {
            uuid: self.uuid.clone(),
            enc_sym_key: EncSymKey::seal(new, &sym_key, &self.uuid, self.enc_sym_key.p2c)?,
            encrypted_by: self.encrypted_by.clone(),
            enc_pri_key: EncPriKey::seal(&sym_key, &private, &self.uuid)?,
            pub_key: self.pub_key.clone(),
        })
    }

    /// Full rotation: a new keypair and symmetric key under `new`, same
    /// `uuid`.
    ///
    /// Anything previously wrapped to the old public key must be re-wrapped
    /// by its owner.
    ///
    /// # Errors
    ///
    /// Fails like [`Uuk::decrypt_enc_pri_key`] if `old` does not open this
    /// UUK, or like [`Uuk::build`].
    pub fn rotate(
        &self,
        old: &Credentials<'_>,
        new: &Credentials<'_>,
        opts: &BuildOptions,
    ) -> Result<Self, CryptoError> {
        self.decrypt_enc_pri_key(old)?;
        let key = generate_rsa_key()?;
        Self::assemble(self.uuid.clone(), new, &key, opts)
    }

    /// Boundary validation of a registration payload.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Derivation`] for bad KDF parameters and
    /// [`CryptoError::Encoding`] naming any other malformed field.
    pub fn validate(&self) -> Result<(), CryptoError> {
        if self.uuid.trim().is_empty() {
            return Err(CryptoError::Encoding {
                field: "uuid".to_owned(),
                reason: "must not be empty".to_owned(),
            });
        }
        self.enc_sym_key.validate(&self.uuid)?;
        self.enc_pri_key.validate(&self.uuid)?;

        if self.pub_key.kid != self.uuid {
            return Err(CryptoError::Encoding {
                field: "pub_key.kid".to_owned(),
                reason: "does not match uuid".to_owned(),
            });
        }
        self.pub_key.to_key()?;
        let bits = self.pub_key.modulus_bits()?;
        if bits < RSA_BITS {
            return Err(CryptoError::Encoding {
                field: "pub_key.n".to_owned(),
                reason: format!("modulus is {bits} bits, need at least {RSA_BITS}"),
            });
        }
        Ok(())
    }

    /// Encrypt `payload` to this UUK's public key as a JWE compact token.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encoding`] if `pub_key` is malformed or
    /// [`CryptoError::Encryption`] if wrapping fails.
    pub fn encrypt(&self, payload: &[u8]) -> Result<String, CryptoError> {
        encrypt_to(&self.pub_key, payload)
    }

    /// Decrypt a JWE compact token produced by [`Uuk::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encoding`] for a structurally invalid token and
    /// [`CryptoError::Authentication`] if it was not encrypted to `key` for
    /// this UUK or was tampered with.
    pub fn decrypt(&self, token: &str, key: &RsaPrivateKey) -> Result<Vec<u8>, CryptoError> {
        let header = parse_header(token)?;
        if !header.kid.is_empty() && header.kid != self.uuid {
            return Err(CryptoError::Authentication);
        }
        decrypt_with(token, key)
    }
}

/// Generate an RSA-2048 private key from the OS CSPRNG.
///
/// # Errors
///
/// Returns [`CryptoError::Keygen`] if generation fails.
pub fn generate_rsa_key() -> Result<RsaPrivateKey, CryptoError> {
    RsaPrivateKey::new(&mut OsRng, RSA_BITS).map_err(|e| CryptoError::Keygen {
        reason: e.to_string(),
    })
}

/// Encrypt `payload` to `recipient` as a JWE compact token.
///
/// A random 256-bit content key is wrapped with RSA-OAEP (SHA-1) and the
/// payload sealed with AES-256-GCM, authenticating the protected header.
///
/// # Errors
///
/// Returns [`CryptoError::Encoding`] if `recipient` is malformed or
/// [`CryptoError::Encryption`] if wrapping or sealing fails.
pub fn encrypt_to(recipient: &PublicJwk, payload: &[u8]) -> Result<String, CryptoError> {
    let public: RsaPublicKey = recipient.to_key()?;
    let header = JweHeader {
        alg: JWE_ALG.to_owned(),
        enc: ENC_A256GCM.to_owned(),
        kid: recipient.kid.clone(),
    };
    let header_json = serde_json::to_vec(&header).map_err(|e| CryptoError::Encryption {
        reason: format!("serialize header: {e}"),
    })?;
    let protected = URL_SAFE_NO_PAD.encode(header_json);

    let cek = EncryptionKey::generate();
    let wrapped = public
        .encrypt(&mut OsRng, Oaep::new::<Sha1>(), cek.as_bytes())
        .map_err(|e| CryptoError::Encryption {
            reason: format!("wrap content key: {e}"),
        })?;

    let sealed = crypto::seal_with_aad(&cek, payload, protected.as_bytes())?;
    let (ciphertext, tag) = sealed.data.split_at(sealed.data.len() - TAG_LEN);

    Ok(format!(
        "{protected}.{}.{}.{}.{}",
        URL_SAFE_NO_PAD.encode(wrapped),
        URL_SAFE_NO_PAD.encode(sealed.iv),
        URL_SAFE_NO_PAD.encode(ciphertext),
        URL_SAFE_NO_PAD.encode(tag),
    ))
}

/// Decrypt a JWE compact token with `key`.
///
/// # Errors
///
/// Returns [`CryptoError::Encoding`] for a token that is not five
/// base64url segments with a supported header, and
/// [`CryptoError::Authentication`] for every cryptographic failure.
pub fn decrypt_with(token: &str, key: &RsaPrivateKey) -> Result<Vec<u8>, CryptoError> {
    let header = parse_header(token)?;
    if header.alg != JWE_ALG || header.enc != ENC_A256GCM {
        return Err(jwe_encoding(format!(
            "unsupported alg/enc '{}'/'{}'",
            header.alg, header.enc
        )));
    }

    let parts: Vec<&str> = token.split('.').collect();
    let [protected, wrapped, iv, ciphertext, tag] = parts.as_slice() else {
        return Err(jwe_encoding("expected five segments".to_owned()));
    };
    let wrapped = decode_segment(wrapped)?;
    let iv = decode_segment(iv)?;
    let mut data = decode_segment(ciphertext)?;
    let tag = decode_segment(tag)?;
    if iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
        return Err(CryptoError::Authentication);
    }
    data.extend_from_slice(&tag);

    let cek = Zeroizing::new(
        key.decrypt(Oaep::new::<Sha1>(), &wrapped)
            .map_err(|_| CryptoError::Authentication)?,
    );
    let cek = EncryptionKey::try_from_slice(&cek)?;
    crypto::open_with_aad(&cek, &iv, &data, protected.as_bytes())
}

fn parse_header(token: &str) -> Result<JweHeader, CryptoError> {
    let protected = token
        .split('.')
        .next()
        .ok_or_else(|| jwe_encoding("empty token".to_owned()))?;
    let json = decode_segment(protected)?;
    serde_json::from_slice(&json).map_err(|e| jwe_encoding(format!("protected header: {e}")))
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| jwe_encoding(e.to_string()))
}

fn jwe_encoding(reason: String) -> CryptoError {
    CryptoError::Encoding {
        field: "jwe".to_owned(),
        reason,
    }
}
