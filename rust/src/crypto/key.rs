//! Device-bound key derivation.
//!
//! The storage key is never written anywhere. It is recomputed on every boot as
//! `SHA-256(identity || salt)`, where the identity comes from the secure
//! element serial number when one is fitted and from the platform MAC
//! otherwise. Both paths share the same hash shape, so losing the secure
//! element only changes which identity bytes feed the digest.

use std::cell::OnceCell;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use zeroize::Zeroize;

use crate::crypto::integrity::{fingerprint, sha256_concat};

/// Salt used by devices provisioned before build-time injection existed.
pub const LEGACY_SALT: &str = "HAIoT_SALT";

/// Secure element serial numbers are 9 bytes long.
pub const SECURE_ELEMENT_SERIAL_LEN: usize = 9;

const MAC_LEN: usize = 6;

pub const KEY_LEN: usize = 32;

/// Salt compiled into this binary. `HAIOT_KEY_SALT` injects a per-fleet value
/// at build time; without it the legacy salt keeps existing devices readable.
pub fn build_salt() -> &'static [u8] {
    option_env!("HAIOT_KEY_SALT").unwrap_or(LEGACY_SALT).as_bytes()
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("{0} is not present")]
    Unavailable(String),
    #[error("{source_name} unreadable: {reason}")]
    Unreadable { source_name: String, reason: String },
    #[error("{source_name} returned malformed identity: {reason}")]
    Malformed { source_name: String, reason: String },
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("no device identity available (hardware: {hardware}; platform: {platform})")]
    NoIdentity {
        hardware: IdentityError,
        platform: IdentityError,
    },
}

/// Anything that can yield stable identity bytes for this device.
pub trait IdentitySource {
    fn name(&self) -> &str;
    fn read_identity(&self) -> Result<Vec<u8>, IdentityError>;
}

/// Secure element serial exported by the provisioning service as a hex string.
pub struct SecureElementSerial {
    path: PathBuf,
}

impl SecureElementSerial {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl IdentitySource for SecureElementSerial {
    fn name(&self) -> &str {
        "secure-element"
    }

    fn read_identity(&self) -> Result<Vec<u8>, IdentityError> {
        let text = read_identity_file(self.name(), &self.path)?;
        let serial = hex::decode(text.trim()).map_err(|e| IdentityError::Malformed {
            source_name: self.name().to_string(),
            reason: format!("{e}"),
        })?;
        if serial.len() != SECURE_ELEMENT_SERIAL_LEN {
            return Err(IdentityError::Malformed {
                source_name: self.name().to_string(),
                reason: format!(
                    "expected {SECURE_ELEMENT_SERIAL_LEN} bytes, got {}",
                    serial.len()
                ),
            });
        }
        Ok(serial)
    }
}

/// Platform identity derived from a network MAC address.
///
/// The six MAC octets are laid out as a little-endian 64-bit integer (eFuse
/// MAC layout), giving eight identity bytes.
pub struct PlatformMac {
    path: PathBuf,
}

impl PlatformMac {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl IdentitySource for PlatformMac {
    fn name(&self) -> &str {
        "platform-mac"
    }

    fn read_identity(&self) -> Result<Vec<u8>, IdentityError> {
        let text = read_identity_file(self.name(), &self.path)?;
        let mac = parse_mac(text.trim()).ok_or_else(|| IdentityError::Malformed {
            source_name: self.name().to_string(),
            reason: format!("not a MAC address: {:?}", text.trim()),
        })?;
        if mac.iter().all(|b| *b == 0) {
            return Err(IdentityError::Malformed {
                source_name: self.name().to_string(),
                reason: "all-zero MAC address".to_string(),
            });
        }
        let mut bytes = [0u8; 8];
        bytes[..MAC_LEN].copy_from_slice(&mac);
        Ok(bytes.to_vec())
    }
}

/// Fixed identity bytes, used for simulated devices.
pub struct FixedIdentity {
    name: String,
    bytes: Vec<u8>,
}

impl FixedIdentity {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

impl IdentitySource for FixedIdentity {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_identity(&self) -> Result<Vec<u8>, IdentityError> {
        Ok(self.bytes.clone())
    }
}

/// An identity source that is not fitted on this board.
pub struct AbsentIdentity(pub &'static str);

impl IdentitySource for AbsentIdentity {
    fn name(&self) -> &str {
        self.0
    }

    fn read_identity(&self) -> Result<Vec<u8>, IdentityError> {
        Err(IdentityError::Unavailable(self.0.to_string()))
    }
}

fn read_identity_file(name: &str, path: &Path) -> Result<String, IdentityError> {
    if !path.exists() {
        return Err(IdentityError::Unavailable(format!("{name} ({})", path.display())));
    }
    fs::read_to_string(path).map_err(|e| IdentityError::Unreadable {
        source_name: name.to_string(),
        reason: format!("{e}"),
    })
}

fn parse_mac(text: &str) -> Option<[u8; MAC_LEN]> {
    let mut mac = [0u8; MAC_LEN];
    let mut octets = text.split(|c| c == ':' || c == '-');
    for slot in mac.iter_mut() {
        let octet = octets.next()?;
        if octet.len() != 2 {
            return None;
        }
        *slot = u8::from_str_radix(octet, 16).ok()?;
    }
    if octets.next().is_some() {
        return None;
    }
    Some(mac)
}

/// Eight-digit uppercase hex chip id, as used for default device names.
///
/// Mirrors the firmware convention of taking bits 32..48 of the eFuse MAC.
pub fn unique_chip_id(source: &dyn IdentitySource) -> Result<String, IdentityError> {
    let bytes = source.read_identity()?;
    let mut raw = [0u8; 8];
    let len = bytes.len().min(raw.len());
    raw[..len].copy_from_slice(&bytes[..len]);
    let chip = (u64::from_le_bytes(raw) >> 32) as u16;
    Ok(format!("{:08X}", chip))
}

/// 256-bit symmetric key. Lives in memory only and is wiped on drop.
pub struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DerivedKey({})", self.fingerprint())
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

fn hash_identity(identity: &[u8], salt: &[u8]) -> DerivedKey {
    DerivedKey(sha256_concat(&[identity, salt]))
}

/// Derives the device key once and hands out the cached copy afterwards.
///
/// Not `Sync`: the cache is meant to live inside the single configuration
/// context that owns the boot sequence.
pub struct KeyDeriver {
    hardware: Box<dyn IdentitySource>,
    platform: Box<dyn IdentitySource>,
    salt: Vec<u8>,
    cache: OnceCell<DerivedKey>,
}

impl KeyDeriver {
    pub fn new(hardware: Box<dyn IdentitySource>, platform: Box<dyn IdentitySource>) -> Self {
        Self {
            hardware,
            platform,
            salt: build_salt().to_vec(),
            cache: OnceCell::new(),
        }
    }

    /// Replaces the compiled-in salt. Only meaningful before the first `derive`.
    pub fn with_salt(mut self, salt: &[u8]) -> Self {
        self.salt = salt.to_vec();
        self
    }

    /// Returns the device key, computing it on first use.
    pub fn derive(&self) -> Result<&DerivedKey, KeyError> {
        if let Some(key) = self.cache.get() {
            return Ok(key);
        }
        let key = self.compute()?;
        Ok(self.cache.get_or_init(|| key))
    }

    fn compute(&self) -> Result<DerivedKey, KeyError> {
        let hardware_err = match self.hardware.read_identity() {
            Ok(mut identity) => {
                let key = hash_identity(&identity, &self.salt);
                identity.zeroize();
                tracing::info!(
                    op = "key.derive",
                    source = self.hardware.name(),
                    fingerprint = %key.fingerprint(),
                    "Device key derived"
                );
                return Ok(key);
            }
            Err(err) => err,
        };

        tracing::warn!(
            op = "key.derive",
            source = self.hardware.name(),
            error = %hardware_err,
            "Hardware identity unavailable, using platform identity"
        );

        match self.platform.read_identity() {
            Ok(mut identity) => {
                let key = hash_identity(&identity, &self.salt);
                identity.zeroize();
                tracing::info!(
                    op = "key.derive",
                    source = self.platform.name(),
                    fingerprint = %key.fingerprint(),
                    "Device key derived"
                );
                Ok(key)
            }
            Err(platform_err) => Err(KeyError::NoIdentity {
                hardware: hardware_err,
                platform: platform_err,
            }),
        }
    }
}
