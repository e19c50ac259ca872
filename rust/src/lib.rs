//! Persistent device configuration with transparently encrypted secrets.
//!
//! Values live in a namespaced key-value backend as tagged strings (`p1:` for
//! plaintext, `s1:` for AES-256-CBC ciphertext under a key derived from the
//! device identity). Loading a parameter migrates legacy or mis-tagged entries
//! to their canonical form and falls back to operator input when a value is
//! missing or a reconfiguration was requested.

pub mod config;
pub mod crypto;
pub mod format;
pub mod params;
pub mod prompt;
pub mod storage;
pub mod store;
