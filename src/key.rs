//! Component A: the key codec.
//!
//! A blob key is `sha512-` followed by the first 64 hex characters of
//! the SHA-512 digest of the uncompressed blob bytes — half of the
//! full 128-character hex digest. Truncating the digest is a
//! deliberate path-length concession (see §3) and is part of the
//! on-disk contract, not an implementation detail callers can ignore.

use crate::error::CasError;

pub const KEY_PREFIX: &str = "sha512-";
/// Length of the truncated hex digest carried in a key.
pub const DIGEST_HEX_LEN: usize = 64;
/// `len("sha512-") + 64`.
pub const FULL_KEY_LEN: usize = KEY_PREFIX.len() + DIGEST_HEX_LEN;
/// `len("sha512-") + 2`.
pub const MIN_PARTIAL_KEY_LEN: usize = KEY_PREFIX.len() + 2;

/// The raw SHA-512 digest is 64 bytes long.
pub const RAW_DIGEST_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyValidity {
    Full,
    Partial,
    Invalid,
}

/// Derive the full key from a raw 64-byte SHA-512 digest.
pub fn digest_to_key(digest: &[u8]) -> Result<String, CasError> {
    if digest.len() != RAW_DIGEST_LEN {
        return Err(CasError::InvalidKey(format!(
            "digest has {} bytes, expected {}",
            digest.len(),
            RAW_DIGEST_LEN
        )));
    }
    let full_hex = hex::encode(digest);
    Ok(format!("{}{}", KEY_PREFIX, &full_hex[..DIGEST_HEX_LEN]))
}

/// Classify a key string by shape alone (no store lookup).
///
/// Keys longer than [`FULL_KEY_LEN`] are *not* `Full` here — callers
/// that accept over-long raw-digest strings from external tools must
/// truncate first (see [`truncate_to_full_length`] and `resolve_key`
/// in `blob_store`), this function only validates the canonical shapes.
pub fn validate_key(s: &str) -> KeyValidity {
    if !s.starts_with(KEY_PREFIX) {
        return KeyValidity::Invalid;
    }
    let hex_part = &s[KEY_PREFIX.len()..];
    if hex_part.is_empty() || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return KeyValidity::Invalid;
    }
    if s.len() == FULL_KEY_LEN {
        KeyValidity::Full
    } else if s.len() >= MIN_PARTIAL_KEY_LEN && s.len() < FULL_KEY_LEN {
        KeyValidity::Partial
    } else {
        KeyValidity::Invalid
    }
}

/// Truncate an over-long key (e.g. a raw 128-char sha512 hex string
/// some external tool handed us) down to [`FULL_KEY_LEN`]. Does not
/// check that the prefix is sane; callers that need that should run
/// [`validate_key`] on the result.
pub fn truncate_to_full_length(s: &str) -> String {
    if s.len() > FULL_KEY_LEN {
        s[..FULL_KEY_LEN].to_string()
    } else {
        s.to_string()
    }
}

/// The two leading hex-group components used to shard a key's blob
/// and manifest files across the on-disk fanout (component C).
pub fn shard_components(key: &str) -> Result<(String, String), CasError> {
    let hex_part = if key.starts_with(KEY_PREFIX) {
        &key[KEY_PREFIX.len()..]
    } else {
        key
    };
    if hex_part.len() < 4 {
        return Err(CasError::InvalidKey(key.to_string()));
    }
    Ok((hex_part[0..2].to_string(), hex_part[2..4].to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(byte: u8) -> [u8; 64] {
        [byte; 64]
    }

    #[test]
    fn digest_to_key_shape() {
        let key = digest_to_key(&digest(0xab)).unwrap();
        assert_eq!(key.len(), FULL_KEY_LEN);
        assert!(key.starts_with(KEY_PREFIX));
        assert_eq!(&key[KEY_PREFIX.len()..], &"ab".repeat(32));
    }

    #[test]
    fn digest_to_key_rejects_wrong_length() {
        assert!(digest_to_key(&[0u8; 32]).is_err());
    }

    #[test]
    fn digest_to_key_is_injective_over_sample() {
        let a = digest_to_key(&digest(0x01)).unwrap();
        let b = digest_to_key(&digest(0x02)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn validate_key_classifies_shapes() {
        let full = digest_to_key(&digest(0xcd)).unwrap();
        assert_eq!(validate_key(&full), KeyValidity::Full);
        assert_eq!(validate_key("sha512-aabbcc"), KeyValidity::Partial);
        assert_eq!(validate_key("sha512-a"), KeyValidity::Invalid);
        assert_eq!(validate_key("md5-aabbcc"), KeyValidity::Invalid);
        assert_eq!(validate_key("sha512-zz"), KeyValidity::Invalid);
    }

    #[test]
    fn truncate_over_long_key() {
        let long = format!("{}{}", KEY_PREFIX, "a".repeat(128));
        let truncated = truncate_to_full_length(&long);
        assert_eq!(truncated.len(), FULL_KEY_LEN);
    }

    #[test]
    fn shard_components_split_leading_hex() {
        let full = digest_to_key(&digest(0xab)).unwrap();
        let (a, b) = shard_components(&full).unwrap();
        assert_eq!(a, "ab");
        assert_eq!(b, "ab");
    }
}
