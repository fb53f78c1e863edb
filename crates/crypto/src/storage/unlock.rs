//! Opening the key database under local encryption.
//!
//! A 32-byte storage key comes from the OS keychain or, where no keychain is
//! available, from a user passphrase via Argon2id. The SQLCipher key is
//! HKDF-SHA256-expanded from it so the raw storage key never reaches SQLite.

use std::path::Path;

use hkdf::Hkdf;
use rusqlite::Connection;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::primitives;
use crate::storage::SharedConnection;

pub const KEYCHAIN_SERVICE: &str = "com.veilbox.crypto";
const KEYCHAIN_ACCOUNT: &str = "storage_key";
const DB_KEY_INFO: &[u8] = b"veilbox-key-db-v1";
const MIN_SALT_LEN: usize = 16;

/// Root key protecting the local database.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct StorageKey {
    key: [u8; 32],
}

impl std::fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageKey")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl StorageKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

/// How the storage key is obtained.
pub enum Unlock<'a> {
    /// Platform secure storage.
    Keychain,
    /// Best-effort local encryption from a user secret.
    Passphrase { passphrase: &'a str, salt: &'a [u8] },
    /// No encryption; only for tests and throwaway databases.
    Plaintext,
}

/// Whether a database file is encrypted.
#[derive(Debug, PartialEq, Eq)]
pub enum EncryptionStatus {
    Unencrypted,
    Encrypted,
}

/// Fetch the storage key from the keychain, creating one on first run.
pub fn storage_key_from_keychain() -> Result<StorageKey, CryptoError> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, KEYCHAIN_ACCOUNT)
        .map_err(|_| CryptoError::KeychainUnavailable)?;

    match entry.get_password() {
        Ok(hex_string) => {
            let hex_string = Zeroizing::new(hex_string);
            let bytes = Zeroizing::new(hex_decode(&hex_string).ok_or_else(|| {
                CryptoError::KeychainError("malformed storage key in keychain".into())
            })?);
            let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                CryptoError::KeychainError("malformed storage key in keychain".into())
            })?;
            Ok(StorageKey { key })
        }
        Err(keyring::Error::NoEntry) => {
            let key = primitives::random_array::<32>()?;
            let hex_string = Zeroizing::new(hex_encode(&key));
            entry.set_password(&hex_string)?;
            tracing::info!("created new storage key in OS keychain");
            Ok(StorageKey { key })
        }
        Err(e) => Err(CryptoError::from(e)),
    }
}

/// Derive the storage key from a passphrase and salt via Argon2id.
pub fn storage_key_from_passphrase(passphrase: &str, salt: &[u8]) -> Result<StorageKey, CryptoError> {
    if salt.len() < MIN_SALT_LEN {
        return Err(CryptoError::InvalidKey("salt too short".into()));
    }

    let params = argon2::Params::new(65536, 3, 4, Some(32))
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let argon2 = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    Ok(StorageKey { key })
}

pub fn generate_salt() -> Result<[u8; MIN_SALT_LEN], CryptoError> {
    primitives::random_array::<MIN_SALT_LEN>()
}

/// SQLCipher raw-key literal (`x'<64 hex>'`) derived from the storage key.
pub fn derive_db_key(storage_key: &StorageKey) -> Result<Zeroizing<String>, CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, storage_key.as_bytes());
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(DB_KEY_INFO, okm.as_mut())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let hex = Zeroizing::new(hex_encode(okm.as_ref()));
    Ok(Zeroizing::new(format!("x'{}'", hex.as_str())))
}

/// Apply a SQLCipher key to a freshly opened connection.
///
/// The `x'...'` raw-key form is a SQL literal; binding it as a parameter would
/// make SQLCipher run PBKDF2 over it as a passphrase instead.
pub fn apply_db_key(conn: &Connection, db_key: &str) -> Result<(), CryptoError> {
    conn.execute_batch(&format!("PRAGMA key = \"{db_key}\";"))?;

    let cipher_version: String = conn
        .pragma_query_value(None, "cipher_version", |row| row.get(0))
        .map_err(|_| CryptoError::StorageError("SQLCipher not available".into()))?;
    if cipher_version.is_empty() {
        return Err(CryptoError::StorageError("SQLCipher not available".into()));
    }
    Ok(())
}

pub fn detect_encryption_status(conn: &Connection) -> Result<EncryptionStatus, CryptoError> {
    match conn.execute_batch("SELECT count(*) FROM sqlite_master") {
        Ok(()) => Ok(EncryptionStatus::Unencrypted),
        // SQLITE_NOTADB
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.extended_code == 26 => {
            Ok(EncryptionStatus::Encrypted)
        }
        Err(e) => Err(CryptoError::StorageError(e.to_string())),
    }
}

/// Open (or create) the key database at `path` and run migrations.
pub fn open_key_database(path: &Path, unlock: Unlock<'_>) -> Result<SharedConnection, CryptoError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;

    match unlock {
        Unlock::Keychain => {
            let key = storage_key_from_keychain()?;
            apply_db_key(&conn, &derive_db_key(&key)?)?;
        }
        Unlock::Passphrase { passphrase, salt } => {
            let key = storage_key_from_passphrase(passphrase, salt)?;
            apply_db_key(&conn, &derive_db_key(&key)?)?;
        }
        Unlock::Plaintext => {
            tracing::warn!(path = %path.display(), "opening key database without encryption");
        }
    }

    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA foreign_keys=ON;
         PRAGMA busy_timeout=5000;",
    )?;
    SharedConnection::new(conn)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passphrase_key(passphrase: &str, salt: &[u8]) -> StorageKey {
        storage_key_from_passphrase(passphrase, salt).unwrap()
    }

    #[test]
    fn same_passphrase_same_salt_same_key() {
        let a = passphrase_key("pass", &[1u8; 16]);
        let b = passphrase_key("pass", &[1u8; 16]);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn different_salt_different_key() {
        let a = passphrase_key("pass", &[2u8; 16]);
        let b = passphrase_key("pass", &[3u8; 16]);
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn short_salt_is_rejected() {
        assert!(storage_key_from_passphrase("pass", &[0u8; 8]).is_err());
    }

    #[test]
    fn db_key_is_sqlcipher_raw_literal() {
        let key = passphrase_key("x", &[4u8; 16]);
        let db_key = derive_db_key(&key).unwrap();
        assert!(db_key.starts_with("x'"));
        assert!(db_key.ends_with('\''));
        assert_eq!(db_key.len(), 67);
    }

    #[test]
    fn storage_key_debug_is_redacted() {
        let key = passphrase_key("x", &[5u8; 16]);
        assert!(format!("{key:?}").contains("REDACTED"));
    }

    #[test]
    fn hex_helpers_roundtrip() {
        let bytes = [0x00, 0x7f, 0xff, 0x10];
        assert_eq!(hex_decode(&hex_encode(&bytes)).unwrap(), bytes);
        assert!(hex_decode("abc").is_none());
        assert!(hex_decode("zz").is_none());
    }

    #[test]
    fn passphrase_database_cannot_be_read_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.db");
        let salt = [6u8; 16];

        {
            let shared = open_key_database(
                &path,
                Unlock::Passphrase {
                    passphrase: "correct horse",
                    salt: &salt,
                },
            )
            .unwrap();
            let conn = shared.lock().unwrap();
            crate::storage::CryptoStore::new(&conn)
                .store_config("probe", b"1")
                .unwrap();
        }

        let conn = Connection::open(&path).unwrap();
        assert_eq!(
            detect_encryption_status(&conn).unwrap(),
            EncryptionStatus::Encrypted
        );

        let reopened = open_key_database(
            &path,
            Unlock::Passphrase {
                passphrase: "correct horse",
                salt: &salt,
            },
        )
        .unwrap();
        let conn = reopened.lock().unwrap();
        assert_eq!(
            crate::storage::CryptoStore::new(&conn)
                .get_config("probe")
                .unwrap(),
            Some(b"1".to_vec())
        );
    }

    #[test]
    fn plaintext_database_is_detected_unencrypted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.db");
        drop(open_key_database(&path, Unlock::Plaintext).unwrap());
        let conn = Connection::open(&path).unwrap();
        assert_eq!(
            detect_encryption_status(&conn).unwrap(),
            EncryptionStatus::Unencrypted
        );
    }
}
