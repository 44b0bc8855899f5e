//! RSA keys as JSON Web Keys.
//!
//! Public keys travel inside the registration payload as `pub_key`; private
//! keys are serialized to JWK JSON before being sealed into `EncPriKey`.
//! Integers are big-endian, base64url without padding.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Key type for every key in this crate.
pub const KTY_RSA: &str = "RSA";

/// An RSA public key in JWK form, tagged with the owning unlock key's id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicJwk {
    pub kty: String,
    pub n: String,
    pub e: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kid: String,
}

impl PublicJwk {
    /// Encode `key` and tag it with `kid`.
    #[must_use]
    pub fn from_key(key: &RsaPublicKey, kid: &str) -> Self {
        Self {
            kty: KTY_RSA.to_owned(),
            n: encode_uint(key.n()),
            e: encode_uint(key.e()),
            kid: kid.to_owned(),
        }
    }

    /// Decode into an `rsa` public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encoding`] if `kty` is not `RSA`, a component is
    /// not base64url, or the components do not form a valid key.
    pub fn to_key(&self) -> Result<RsaPublicKey, CryptoError> {
        if self.kty != KTY_RSA {
            return Err(encoding("pub_key.kty", format!("unsupported key type '{}'", self.kty)));
        }
        let n = decode_uint("pub_key.n", &self.n)?;
        let e = decode_uint("pub_key.e", &self.e)?;
        RsaPublicKey::new(n, e).map_err(|err| encoding("pub_key", err.to_string()))
    }

    /// Size of the modulus in bits.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encoding`] if `n` is not base64url.
    pub fn modulus_bits(&self) -> Result<usize, CryptoError> {
        Ok(decode_uint("pub_key.n", &self.n)?.bits())
    }
}

/// An RSA private key in JWK form. Zeroized on drop and redacted in `Debug`.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct PrivateJwk {
    pub kty: String,
    pub n: String,
    pub e: String,
    pub d: String,
    pub p: String,
    pub q: String,
    pub dp: String,
    pub dq: String,
    pub qi: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kid: String,
}

impl fmt::Debug for PrivateJwk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateJwk")
            .field("kty", &self.kty)
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

impl PrivateJwk {
    /// Encode a two-prime private key with its CRT parameters.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encoding`] if the key is not a two-prime key or
    /// its CRT values are missing.
    pub fn from_key(key: &RsaPrivateKey, kid: &str) -> Result<Self, CryptoError> {
        let [p, q] = key.primes() else {
            return Err(encoding("private key", "expected exactly two primes".to_owned()));
        };
        let missing = || encoding("private key", "CRT parameters not precomputed".to_owned());
        let dp = key.dp().ok_or_else(missing)?;
        let dq = key.dq().ok_or_else(missing)?;
        let qi = key.crt_coefficient().ok_or_else(missing)?;

        Ok(Self {
            kty: KTY_RSA.to_owned(),
            n: encode_uint(key.n()),
            e: encode_uint(key.e()),
            d: encode_uint(key.d()),
            p: encode_uint(p),
            q: encode_uint(q),
            dp: encode_uint(dp),
            dq: encode_uint(dq),
            qi: encode_uint(&qi),
            kid: kid.to_owned(),
        })
    }

    /// Rebuild and validate the private key.
    ///
    /// The CRT values are recomputed from the primes rather than trusted.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encoding`] if any component is malformed or the
    /// components are inconsistent.
    pub fn to_key(&self) -> Result<RsaPrivateKey, CryptoError> {
        if self.kty != KTY_RSA {
            return Err(encoding("private key", format!("unsupported key type '{}'", self.kty)));
        }
        let mut key = RsaPrivateKey::from_components(
            decode_uint("n", &self.n)?,
            decode_uint("e", &self.e)?,
            decode_uint("d", &self.d)?,
            vec![decode_uint("p", &self.p)?, decode_uint("q", &self.q)?],
        )
        .map_err(|err| encoding("private key", err.to_string()))?;
        key.precompute()
            .map_err(|err| encoding("private key", err.to_string()))?;
        key.validate()
            .map_err(|err| encoding("private key", err.to_string()))?;
        Ok(key)
    }

    /// The matching public JWK.
    #[must_use]
    pub fn public(&self) -> PublicJwk {
        PublicJwk {
            kty: self.kty.clone(),
            n: self.n.clone(),
            e: self.e.clone(),
            kid: self.kid.clone(),
        }
    }
}

fn encode_uint(value: &BigUint) -> String {
    URL_SAFE_NO_PAD.encode(value.to_bytes_be())
}

fn decode_uint(field: &str, value: &str) -> Result<BigUint, CryptoError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| encoding(field, e.to_string()))?;
    if bytes.is_empty() {
        return Err(encoding(field, "empty integer".to_owned()));
    }
    Ok(BigUint::from_bytes_be(&bytes))
}

fn encoding(field: &str, reason: String) -> CryptoError {
    CryptoError::Encoding {
        field: field.to_owned(),
        reason,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_support::test_rsa_key;

    #[test]
    fn public_jwk_roundtrip() {
        let key = test_rsa_key();
        let jwk = PublicJwk::from_key(&key.to_public_key(), "kid-1");
        assert_eq!(jwk.kty, "RSA");
        assert_eq!(jwk.e, "AQAB");
        assert_eq!(jwk.modulus_bits().unwrap(), 2048);
        assert_eq!(jwk.to_key().unwrap(), key.to_public_key());
    }

    #[test]
    fn public_jwk_json_shape() {
        let jwk = PublicJwk::from_key(&test_rsa_key().to_public_key(), "kid-1");
        let value = serde_json::to_value(&jwk).unwrap();
        assert_eq!(value["kty"], "RSA");
        assert_eq!(value["kid"], "kid-1");
        assert!(value["n"].as_str().unwrap().chars().all(|c| c != '=' && c != '+'));
    }

    #[test]
    fn untagged_public_jwk_omits_kid() {
        let jwk = PublicJwk::from_key(&test_rsa_key().to_public_key(), "");
        let json = serde_json::to_string(&jwk).unwrap();
        assert!(!json.contains("kid"));
    }

    #[test]
    fn private_jwk_roundtrip_preserves_key() {
        let key = test_rsa_key();
        let jwk = PrivateJwk::from_key(key, "kid-1").unwrap();
        let json = serde_json::to_vec(&jwk).unwrap();
        let parsed: PrivateJwk = serde_json::from_slice(&json).unwrap();
        let restored = parsed.to_key().unwrap();
        assert_eq!(&restored, key);
        assert_eq!(parsed.public().to_key().unwrap(), key.to_public_key());
    }

    #[test]
    fn inconsistent_private_components_are_rejected() {
        let mut jwk = PrivateJwk::from_key(test_rsa_key(), "kid").unwrap();
        jwk.d = encode_uint(&BigUint::from(12_345u32));
        assert!(jwk.to_key().is_err());
    }

    #[test]
    fn wrong_kty_is_rejected() {
        let mut jwk = PublicJwk::from_key(&test_rsa_key().to_public_key(), "kid");
        jwk.kty = "EC".to_owned();
        assert!(matches!(
            jwk.to_key(),
            Err(CryptoError::Encoding { .. })
        ));
    }

    #[test]
    fn bad_base64_is_rejected() {
        let mut jwk = PublicJwk::from_key(&test_rsa_key().to_public_key(), "kid");
        jwk.n = "not base64!".to_owned();
        assert!(jwk.to_key().is_err());
        assert!(jwk.modulus_bits().is_err());
    }

    #[test]
    fn private_jwk_debug_is_redacted() {
        let jwk = PrivateJwk::from_key(test_rsa_key(), "kid-9").unwrap();
        let debug = format!("{jwk:?}");
        assert!(debug.contains("kid-9"));
        assert!(!debug.contains(&jwk.d));
    }
}
