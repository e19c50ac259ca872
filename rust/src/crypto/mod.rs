//! Device-bound cryptography: key derivation from hardware identity, the
//! AES-256-CBC secret codec, and the hashing helpers both rely on.

pub mod codec;
pub mod integrity;
pub mod key;
