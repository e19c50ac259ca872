//! Hashing helpers shared by key derivation and diagnostics.

use sha2::{Digest, Sha256};

/// Length of the short fingerprint printed in logs.
const FINGERPRINT_HEX_LEN: usize = 8;

/// Produces a raw SHA-256 digest of the provided bytes.
pub fn sha256_digest(data: &[u8]) -> [u8; 32] {
    sha256_concat(&[data])
}

/// Hashes several byte strings as if they were one contiguous buffer.
///
/// Device keys are `SHA-256(identity || salt)`.
pub fn sha256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Returns the hexadecimal representation of a SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256_digest(data))
}

/// Short, non-reversible tag for key material so logs can tell two keys
/// apart without ever printing them.
pub fn fingerprint(material: &[u8]) -> String {
    let mut hex = sha256_hex(material);
    hex.truncate(FINGERPRINT_HEX_LEN);
    hex
}

#[cfg(test)]
mod tests {
    use super::{fingerprint, sha256_concat, sha256_digest, sha256_hex};

    #[test]
    fn hashes_to_hex() {
        assert_eq!(
            sha256_hex(b"haiot"),
            "884539e9510c2a727680b1c78586a23ad209babb9476e897975c069d1ab70c4d"
        );
    }

    #[test]
    fn concatenated_parts_match_single_buffer() {
        let joined = sha256_digest(b"serialHAIoT_SALT");
        let parts = sha256_concat(&[b"serial".as_slice(), b"HAIoT_SALT".as_slice()]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn fingerprint_is_short_prefix() {
        let fp = fingerprint(b"haiot");
        assert_eq!(fp, "884539e9");
    }
}
