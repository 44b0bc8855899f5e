//! Offline secret key generation and storage.
//!
//! The secret key is the second input to key derivation next to the
//! password. It never leaves the client: it is written to a local file and
//! read back whenever the unlock key is built or opened.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use keyshelf_core::crypto::random_array;

/// Version tag at the start of every key.
const PREFIX: &str = "A3";

/// Unambiguous uppercase alphabet, 32 symbols (no `I`, `O`, `0`, `1`).
const ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

const GROUPS: usize = 6;
const GROUP_LEN: usize = 5;

/// Generate a key like `A3-7KQ2M-...`, 150 bits of randomness.
pub fn generate() -> String {
    let bytes: [u8; GROUPS * GROUP_LEN] = random_array();
    let mut key = String::from(PREFIX);
    for group in bytes.chunks(GROUP_LEN) {
        key.push('-');
        key.extend(group.iter().map(|b| char::from(ALPHABET[usize::from(b & 31)])));
    }
    key
}

/// Check the shape of a key read from disk.
pub fn validate(key: &str) -> Result<()> {
    let mut parts = key.split('-');
    if parts.next() != Some(PREFIX) {
        bail!("secret key must start with '{PREFIX}-'");
    }
    let groups: Vec<&str> = parts.collect();
    let well_formed = groups.len() == GROUPS
        && groups
            .iter()
            .all(|g| g.len() == GROUP_LEN && g.bytes().all(|b| ALPHABET.contains(&b)));
    if !well_formed {
        bail!("secret key is malformed");
    }
    Ok(())
}

/// Write `key` to `path`, readable only by the owner on Unix.
pub fn write(path: &Path, key: &str) -> Result<()> {
    if path.exists() {
        bail!("{} already exists, refusing to overwrite a secret key", path.display());
    }
    fs::write(path, format!("{key}\n"))
        .with_context(|| format!("failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to restrict permissions on {}", path.display()))?;
    }
    Ok(())
}

/// Read and validate the key stored at `path`.
pub fn read(path: &Path) -> Result<String> {
    let key = fs::read_to_string(path)
        .with_context(|| format!("failed to read secret key from {}", path.display()))?
        .trim()
        .to_owned();
    validate(&key)?;
    Ok(key)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_validate_and_differ() {
        let a = generate();
        let b = generate();
        assert_eq!(a.len(), PREFIX.len() + GROUPS * (GROUP_LEN + 1));
        validate(&a).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!(validate("B3-AAAAA-AAAAA-AAAAA-AAAAA-AAAAA-AAAAA").is_err());
        assert!(validate("A3-AAAAA").is_err());
        assert!(validate("A3-AAAA0-AAAAA-AAAAA-AAAAA-AAAAA-AAAAA").is_err());
    }

    #[test]
    fn write_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.key");
        let key = generate();
        write(&path, &key).unwrap();
        assert_eq!(read(&path).unwrap(), key);
        assert!(write(&path, &generate()).is_err());
    }
}
