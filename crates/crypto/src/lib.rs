//! veilbox-crypto: zero-knowledge hybrid encryption for pairwise messaging.
//!
//! Provides the NaCl box/secretbox primitive layer, per-device X25519 key
//! storage in encrypted SQLite (SQLCipher), a key-directory client with a
//! local peer-key cache, the hybrid encryption engine, text/audio/video
//! adapters over a blob store, and SAS emoji verification.

pub mod config;
pub mod device_keys;
pub mod diagnostics;
pub mod directory;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod media;
pub mod primitives;
pub mod sas;
pub mod storage;
pub mod verification;

pub use error::CryptoError;
