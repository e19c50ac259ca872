//! AES-256-CBC secret codec.
//!
//! Packets are `base64(IV || ciphertext)` with a fresh 16-byte IV per call and
//! PKCS7 padding. There is no authentication tag: the format is fixed by
//! entries already stored on deployed devices.
//!
//! IVs come from the operating system RNG. When that fails, a time-seeded
//! PRNG is used instead and a warning is logged; such IVs are predictable and
//! weaker than the OS source.

use std::time::{SystemTime, UNIX_EPOCH};

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine};
use cbc::cipher::block_padding::{NoPadding, Pkcs7};
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};
use thiserror::Error;

use crate::crypto::key::DerivedKey;

pub const IV_LEN: usize = 16;
pub const BLOCK_LEN: usize = 16;

/// Largest plaintext accepted by `encrypt`.
pub const MAX_PLAINTEXT_LEN: usize = 4096;

const SELF_TEST_PLAINTEXT: &str = "Password!123";

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Reasons a stored packet cannot be turned back into plaintext.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeFailure {
    #[error("packet is not valid base64")]
    BadEncoding,
    #[error("packet shorter than IV plus one block")]
    Truncated,
    #[error("ciphertext is not a whole number of blocks")]
    Misaligned,
    #[error("invalid PKCS7 padding")]
    BadPadding,
    #[error("plaintext is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug, Error)]
pub enum EncryptError {
    #[error("plaintext of {len} bytes exceeds the {max} byte limit")]
    TooLong { len: usize, max: usize },
}

fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    match OsRng.try_fill_bytes(&mut iv) {
        Ok(()) => iv,
        Err(err) => {
            tracing::warn!(
                op = "codec.iv",
                error = %err,
                "OS RNG unavailable, falling back to weak seeded IV"
            );
            let seed = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or_default()
                ^ u64::from(std::process::id());
            StdRng::seed_from_u64(seed).fill_bytes(&mut iv);
            iv
        }
    }
}

/// Encrypts `plaintext` under `key` and returns the base64 packet.
pub fn encrypt(key: &DerivedKey, plaintext: &[u8]) -> Result<String, EncryptError> {
    let iv = generate_iv();
    encrypt_with_iv(key, &iv, plaintext)
}

/// Encrypts with a caller-chosen IV. Reusing an IV under the same key leaks
/// plaintext equality, so only `encrypt` should be used for stored values.
pub fn encrypt_with_iv(
    key: &DerivedKey,
    iv: &[u8; IV_LEN],
    plaintext: &[u8],
) -> Result<String, EncryptError> {
    if plaintext.len() > MAX_PLAINTEXT_LEN {
        return Err(EncryptError::TooLong {
            len: plaintext.len(),
            max: MAX_PLAINTEXT_LEN,
        });
    }

    let ciphertext = Aes256CbcEnc::new(key.as_bytes().into(), iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut packet = Vec::with_capacity(IV_LEN + ciphertext.len());
    packet.extend_from_slice(iv);
    packet.extend_from_slice(&ciphertext);
    Ok(STANDARD.encode(packet))
}

/// Decrypts a base64 packet produced by `encrypt`.
///
/// Only the final pad byte is validated (1..=16), so any block whose last byte
/// falls in range is accepted. A wrong key therefore usually, but not always,
/// surfaces as `BadPadding`.
pub fn decrypt(key: &DerivedKey, packet: &str) -> Result<Vec<u8>, DecodeFailure> {
    let payload = STANDARD
        .decode(packet.as_bytes())
        .map_err(|_| DecodeFailure::BadEncoding)?;

    if payload.len() < IV_LEN + BLOCK_LEN {
        return Err(DecodeFailure::Truncated);
    }
    let (iv, ciphertext) = payload.split_at(IV_LEN);
    if ciphertext.len() % BLOCK_LEN != 0 {
        return Err(DecodeFailure::Misaligned);
    }
    let iv: &[u8; IV_LEN] = iv.try_into().map_err(|_| DecodeFailure::Truncated)?;

    let mut plaintext = Aes256CbcDec::new(key.as_bytes().into(), iv.into())
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|_| DecodeFailure::Misaligned)?;

    let pad = plaintext.last().copied().unwrap_or_default() as usize;
    if pad == 0 || pad > BLOCK_LEN {
        return Err(DecodeFailure::BadPadding);
    }
    plaintext.truncate(plaintext.len() - pad);
    Ok(plaintext)
}

/// `decrypt` followed by UTF-8 validation.
pub fn decrypt_string(key: &DerivedKey, packet: &str) -> Result<String, DecodeFailure> {
    let bytes = decrypt(key, packet)?;
    String::from_utf8(bytes).map_err(|_| DecodeFailure::InvalidUtf8)
}

/// Round-trips a fixed string under `key` and reports whether it survived.
pub fn self_test(key: &DerivedKey) -> bool {
    let packet = match encrypt(key, SELF_TEST_PLAINTEXT.as_bytes()) {
        Ok(packet) => packet,
        Err(err) => {
            tracing::error!(op = "codec.self_test", error = %err, "Encryption failed");
            return false;
        }
    };
    let passed = matches!(
        decrypt_string(key, &packet),
        Ok(ref text) if text == SELF_TEST_PLAINTEXT
    );
    if passed {
        tracing::info!(op = "codec.self_test", passed, "Encryption integrity verified");
    } else {
        tracing::error!(op = "codec.self_test", passed, "Decrypted data mismatch");
    }
    passed
}
