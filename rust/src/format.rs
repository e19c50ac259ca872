//! On-disk value encodings.
//!
//! ```text
//! <raw>          legacy, untagged plaintext
//! p1:<value>     plaintext, version 1
//! s1:<base64>    secret, version 1: base64(IV(16) || AES-256-CBC ciphertext)
//! ```
//!
//! Empty values are always written as `p1:`, including for secret parameters.

use thiserror::Error;

use crate::crypto::codec::{self, DecodeFailure, EncryptError};
use crate::crypto::key::{KeyDeriver, KeyError};

pub const PLAIN_TAG: &str = "p1:";
pub const SECRET_TAG: &str = "s1:";

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("device key unavailable: {0}")]
    Key(#[from] KeyError),
    #[error("encryption failed: {0}")]
    Encrypt(#[from] EncryptError),
}

/// How a stored entry was encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Absent,
    Legacy,
    TaggedPlain,
    TaggedSecret,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Absent => "absent",
            SourceKind::Legacy => "legacy",
            SourceKind::TaggedPlain => "p1",
            SourceKind::TaggedSecret => "s1",
        }
    }
}

/// Result of reading one stored entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Plaintext value, empty when absent or undecryptable.
    pub value: String,
    pub kind: SourceKind,
    /// Set when an `s1:` entry could not be decrypted.
    pub failure: Option<DecodeFailure>,
}

impl Decoded {
    fn ok(value: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            value: value.into(),
            kind,
            failure: None,
        }
    }
}

/// Classifies and unwraps a raw stored string.
///
/// The key is derived only when an `s1:` entry is met. A secret that fails
/// to decrypt comes back empty but still tagged `TaggedSecret`, so the caller
/// re-prompts and overwrites it.
pub fn decode(raw: Option<&str>, keys: &KeyDeriver) -> Result<Decoded, KeyError> {
    let raw = match raw {
        None | Some("") => return Ok(Decoded::ok("", SourceKind::Absent)),
        Some(raw) => raw,
    };

    if let Some(payload) = raw.strip_prefix(SECRET_TAG) {
        let key = keys.derive()?;
        return Ok(match codec::decrypt_string(key, payload) {
            Ok(value) => Decoded::ok(value, SourceKind::TaggedSecret),
            Err(failure) => Decoded {
                value: String::new(),
                kind: SourceKind::TaggedSecret,
                failure: Some(failure),
            },
        });
    }

    if let Some(value) = raw.strip_prefix(PLAIN_TAG) {
        return Ok(Decoded::ok(value, SourceKind::TaggedPlain));
    }

    Ok(Decoded::ok(raw, SourceKind::Legacy))
}

/// Whether an entry read as `kind` has to be rewritten for a parameter whose
/// secrecy is `desired_secret`.
pub fn needs_migration(kind: SourceKind, desired_secret: bool) -> bool {
    match kind {
        SourceKind::Absent | SourceKind::Legacy => true,
        SourceKind::TaggedPlain => desired_secret,
        SourceKind::TaggedSecret => !desired_secret,
    }
}

/// Produces the canonical stored form of `value`.
pub fn encode(value: &str, desired_secret: bool, keys: &KeyDeriver) -> Result<String, FormatError> {
    if desired_secret && !value.is_empty() {
        let key = keys.derive()?;
        let packet = codec::encrypt(key, value.as_bytes())?;
        Ok(format!("{SECRET_TAG}{packet}"))
    } else {
        Ok(format!("{PLAIN_TAG}{value}"))
    }
}
