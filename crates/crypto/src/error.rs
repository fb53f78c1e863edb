//! Error types for the veilbox-crypto crate.

use thiserror::Error;

/// Errors that can occur during cryptographic, storage, or transport operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The OS random number generator could not produce bytes.
    #[error("entropy unavailable: {0}")]
    EntropyUnavailable(String),

    /// An AEAD `open` rejected its input (tampered, wrong key, wrong nonce, truncated).
    #[error("authentication failure")]
    AuthenticationFailure,

    /// The recipient has not published a key yet (or the requested record is gone).
    #[error("no published key for {user_id}")]
    KeyNotFound { user_id: String },

    /// The wrapped content key could not be opened.
    #[error("decryption failed")]
    KeyUnwrapFailed,

    /// The payload could not be opened with the unwrapped content key.
    #[error("decryption failed")]
    ContentAuthenticationFailed,

    /// The envelope uses a retired scheme and must be re-sent.
    #[error("unsupported legacy envelope version {version}")]
    UnsupportedLegacyVersion { version: u32 },

    /// Decrypted bytes and bytes on disk disagree after writing.
    #[error("integrity mismatch: expected {expected} bytes, found {actual}")]
    IntegrityMismatch { expected: u64, actual: u64 },

    /// Every write attempt failed the length check; the output was discarded.
    #[error("integrity mismatch after {attempts} attempts: expected {expected} bytes, found {actual}")]
    IntegrityRetriesExhausted { expected: u64, actual: u64, attempts: u32 },

    /// The envelope or its wire form is structurally invalid.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The provided key material is invalid (wrong length, malformed, etc.).
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// No keypair exists for the device.
    #[error("device key not initialized for {device_id}")]
    DeviceKeyNotInitialized { device_id: String },

    /// A payload exceeded the caller-supplied bound.
    #[error("payload too large: limit is {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// Database storage error.
    #[error("storage error: {0}")]
    StorageError(String),

    /// OS keychain operation failed.
    #[error("keychain error: {0}")]
    KeychainError(String),

    /// No credential found in OS keychain for the requested entry.
    #[error("keychain entry not found")]
    KeychainEntryNotFound,

    /// OS keychain is not available on this platform; triggers passphrase fallback.
    #[error("keychain unavailable")]
    KeychainUnavailable,

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// The key directory returned an unexpected response.
    #[error("key directory error: {0}")]
    DirectoryError(String),

    /// The key directory could not be reached.
    #[error("key directory unreachable: {0}")]
    DirectoryUnavailable(String),

    /// Blob store operation failed.
    #[error("blob store error: {0}")]
    BlobStoreError(String),

    /// The requested blob does not exist.
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Local file I/O error.
    #[error("io error: {0}")]
    Io(String),

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    ConfigError(String),

    /// A verification transition was requested from a state that does not allow it.
    #[error("invalid verification transition: {0}")]
    InvalidVerificationTransition(String),
}

impl CryptoError {
    /// Whether the operation may be retried with the same inputs.
    ///
    /// Authentication failures are never retryable: a retry with identical
    /// inputs either replays attacker-controlled data or hides a local key bug.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CryptoError::IntegrityMismatch { .. }
                | CryptoError::DirectoryUnavailable(_)
                | CryptoError::BlobStoreError(_)
        )
    }

    /// Short text suitable for showing to an end user.
    pub fn user_message(&self) -> &'static str {
        match self {
            CryptoError::EntropyUnavailable(_) => "cannot initialize security, try a full restart",
            CryptoError::KeyNotFound { .. } => "wait for recipient to open the app",
            CryptoError::UnsupportedLegacyVersion { .. } => {
                "this message uses an old format and must be sent again"
            }
            CryptoError::AuthenticationFailure
            | CryptoError::KeyUnwrapFailed
            | CryptoError::ContentAuthenticationFailed => "message could not be decrypted",
            CryptoError::IntegrityMismatch { .. } | CryptoError::IntegrityRetriesExhausted { .. } => {
                "saving the decrypted file failed"
            }
            CryptoError::DirectoryUnavailable(_) => "key server unreachable, try again later",
            _ => "a security error occurred",
        }
    }
}

impl From<rusqlite::Error> for CryptoError {
    fn from(err: rusqlite::Error) -> Self {
        CryptoError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for CryptoError {
    fn from(err: serde_json::Error) -> Self {
        CryptoError::SerializationError(err.to_string())
    }
}

impl From<base64::DecodeError> for CryptoError {
    fn from(err: base64::DecodeError) -> Self {
        CryptoError::MalformedEnvelope(format!("invalid base64: {err}"))
    }
}

impl From<std::io::Error> for CryptoError {
    fn from(err: std::io::Error) -> Self {
        CryptoError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for CryptoError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            CryptoError::DirectoryUnavailable(err.to_string())
        } else if err.is_decode() {
            CryptoError::SerializationError(err.to_string())
        } else {
            CryptoError::DirectoryError(err.to_string())
        }
    }
}

impl From<object_store::Error> for CryptoError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => CryptoError::BlobNotFound(path),
            other => CryptoError::BlobStoreError(other.to_string()),
        }
    }
}

impl From<CryptoError> for veilbox_shared::error::VeilboxError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::KeyNotFound { .. } | CryptoError::BlobNotFound(_) => {
                veilbox_shared::error::VeilboxError::NotFound
            }
            CryptoError::DirectoryUnavailable(detail) => {
                veilbox_shared::error::VeilboxError::ServiceUnavailable(detail)
            }
            other => veilbox_shared::error::VeilboxError::Crypto(other.to_string()),
        }
    }
}

impl From<keyring::Error> for CryptoError {
    fn from(err: keyring::Error) -> Self {
        match err {
            keyring::Error::NoEntry => CryptoError::KeychainEntryNotFound,
            keyring::Error::NoStorageAccess(_) | keyring::Error::PlatformFailure(_) => {
                CryptoError::KeychainUnavailable
            }
            other => CryptoError::KeychainError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decryption_failures_do_not_reveal_stage() {
        assert_eq!(
            CryptoError::KeyUnwrapFailed.to_string(),
            CryptoError::ContentAuthenticationFailed.to_string()
        );
    }

    #[test]
    fn display_messages_are_human_readable() {
        let err = CryptoError::KeyNotFound {
            user_id: "bob-123".into(),
        };
        assert!(err.to_string().contains("bob-123"));

        let err = CryptoError::UnsupportedLegacyVersion { version: 2 };
        assert!(err.to_string().contains('2'));

        let err = CryptoError::IntegrityMismatch {
            expected: 10,
            actual: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("10") && msg.contains('7'));
    }

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(CryptoError::IntegrityMismatch {
            expected: 1,
            actual: 0
        }
        .is_retryable());
        assert!(!CryptoError::IntegrityRetriesExhausted {
            expected: 1,
            actual: 0,
            attempts: 3
        }
        .is_retryable());
        assert!(CryptoError::DirectoryUnavailable("x".into()).is_retryable());
        assert!(!CryptoError::KeyUnwrapFailed.is_retryable());
        assert!(!CryptoError::ContentAuthenticationFailed.is_retryable());
        assert!(!CryptoError::UnsupportedLegacyVersion { version: 1 }.is_retryable());
        assert!(!CryptoError::EntropyUnavailable("x".into()).is_retryable());
    }

    #[test]
    fn user_messages_follow_taxonomy() {
        assert_eq!(
            CryptoError::EntropyUnavailable("rng".into()).user_message(),
            "cannot initialize security, try a full restart"
        );
        assert_eq!(
            CryptoError::KeyNotFound {
                user_id: "u".into()
            }
            .user_message(),
            "wait for recipient to open the app"
        );
    }

    #[test]
    fn from_rusqlite_error_converts_to_storage_error() {
        let crypto_err: CryptoError = rusqlite::Error::QueryReturnedNoRows.into();
        match crypto_err {
            CryptoError::StorageError(_) => {}
            other => panic!("expected StorageError, got: {other:?}"),
        }
    }

    #[test]
    fn from_serde_json_error_converts_to_serialization_error() {
        let json_err: serde_json::Error = serde_json::from_str::<String>("not json").unwrap_err();
        let crypto_err: CryptoError = json_err.into();
        assert!(matches!(crypto_err, CryptoError::SerializationError(_)));
    }

    #[test]
    fn from_object_store_not_found_converts_to_blob_not_found() {
        let err = object_store::Error::NotFound {
            path: "audio/abc".into(),
            source: "missing".into(),
        };
        match CryptoError::from(err) {
            CryptoError::BlobNotFound(path) => assert_eq!(path, "audio/abc"),
            other => panic!("expected BlobNotFound, got: {other:?}"),
        }
    }

    #[test]
    fn from_keyring_no_entry_converts_to_entry_not_found() {
        let crypto_err: CryptoError = keyring::Error::NoEntry.into();
        assert!(matches!(crypto_err, CryptoError::KeychainEntryNotFound));
    }

    #[test]
    fn from_keyring_platform_failure_converts_to_unavailable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "test");
        let crypto_err: CryptoError = keyring::Error::PlatformFailure(Box::new(io_err)).into();
        assert!(matches!(crypto_err, CryptoError::KeychainUnavailable));
    }

    #[test]
    fn key_not_found_maps_to_shared_not_found() {
        let shared: veilbox_shared::error::VeilboxError = CryptoError::KeyNotFound {
            user_id: "u".into(),
        }
        .into();
        assert!(matches!(shared, veilbox_shared::error::VeilboxError::NotFound));

        let shared: veilbox_shared::error::VeilboxError = CryptoError::KeyUnwrapFailed.into();
        assert!(matches!(shared, veilbox_shared::error::VeilboxError::Crypto(_)));
    }
}
