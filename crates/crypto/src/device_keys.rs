//! Device key store: the long-term X25519 keypair of each local device.
//!
//! One keypair per device, reused across every conversation. Records carry a
//! key-format version; a record in any other format is discarded and replaced,
//! which leaves older conversations undecryptable on this device. Key material
//! found in legacy locations is deleted, never imported.

use rusqlite::{Connection, OptionalExtension};
use veilbox_shared::ids::DeviceId;

use crate::error::CryptoError;
use crate::primitives::{self, KeyPair, PublicKey, SecretKey};
use crate::storage::{unix_now, with_transaction, CryptoStore, SharedConnection};

/// Format of rows in `crypto_device_keys` written by this version.
pub const KEY_FORMAT_VERSION: u32 = 2;

const LEGACY_SCAN_PREFIX: &str = "legacy_scan:";

/// How `get_or_create_key_pair_with_outcome` obtained the keypair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyProvisioning {
    Existing,
    Created,
    Regenerated(RegenerationReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegenerationReason {
    /// The stored record used a different key format.
    FormatVersionMismatch { found: u32 },
    /// Legacy key material was found and destroyed.
    LegacyMaterialDiscarded { sources: Vec<String> },
}

/// Result of comparing a stored public key with one derived from the stored private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyConsistency {
    Consistent,
    Mismatch { stored: PublicKey, derived: PublicKey },
}

/// A place where an older release kept device key material.
pub trait LegacyKeySource: Send + Sync {
    fn name(&self) -> &str;

    fn contains(&self, conn: &Connection, device_id: &DeviceId) -> Result<bool, CryptoError>;

    fn purge(&self, conn: &Connection, device_id: &DeviceId) -> Result<(), CryptoError>;
}

/// Single-identity table written by releases that used a shared-secret scheme.
pub struct LegacyIdentityTable;

impl LegacyIdentityTable {
    const TABLE: &'static str = "crypto_legacy_identity";

    fn table_exists(conn: &Connection) -> Result<bool, CryptoError> {
        let exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
            [Self::TABLE],
            |row| row.get(0),
        )?;
        Ok(exists)
    }
}

impl LegacyKeySource for LegacyIdentityTable {
    fn name(&self) -> &str {
        Self::TABLE
    }

    fn contains(&self, conn: &Connection, _device_id: &DeviceId) -> Result<bool, CryptoError> {
        if !Self::table_exists(conn)? {
            return Ok(false);
        }
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM crypto_legacy_identity",
            [],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn purge(&self, conn: &Connection, _device_id: &DeviceId) -> Result<(), CryptoError> {
        conn.execute_batch("DROP TABLE IF EXISTS crypto_legacy_identity")?;
        Ok(())
    }
}

/// Keychain entry that held the old secret key, one per device.
pub struct LegacyKeychainEntry {
    service: String,
}

impl LegacyKeychainEntry {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, device_id: &DeviceId) -> Result<keyring::Entry, CryptoError> {
        Ok(keyring::Entry::new(
            &self.service,
            &format!("secret_key:{device_id}"),
        )?)
    }
}

impl LegacyKeySource for LegacyKeychainEntry {
    fn name(&self) -> &str {
        "keychain"
    }

    fn contains(&self, _conn: &Connection, device_id: &DeviceId) -> Result<bool, CryptoError> {
        match self.entry(device_id)?.get_password() {
            Ok(_) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn purge(&self, _conn: &Connection, device_id: &DeviceId) -> Result<(), CryptoError> {
        match self.entry(device_id)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Legacy locations to scan: the old identity table, plus the old per-device
/// keychain entries when a keychain service is available.
pub fn legacy_sources(keychain_service: Option<&str>) -> Vec<Box<dyn LegacyKeySource>> {
    let mut sources: Vec<Box<dyn LegacyKeySource>> = vec![Box::new(LegacyIdentityTable)];
    if let Some(service) = keychain_service {
        sources.push(Box::new(LegacyKeychainEntry::new(service)));
    }
    sources
}

/// Owns device keypairs across restarts.
///
/// Every read and the single create-if-absent write run under the connection
/// mutex and an IMMEDIATE transaction, so two callers can never both generate
/// a keypair for the same device.
pub struct DeviceKeyStore {
    db: SharedConnection,
    legacy_sources: Vec<Box<dyn LegacyKeySource>>,
}

impl DeviceKeyStore {
    pub fn new(db: SharedConnection) -> Self {
        Self {
            db,
            legacy_sources: legacy_sources(None),
        }
    }

    pub fn with_legacy_sources(db: SharedConnection, sources: Vec<Box<dyn LegacyKeySource>>) -> Self {
        Self {
            db,
            legacy_sources: sources,
        }
    }

    pub fn get_or_create_key_pair(&self, device_id: &DeviceId) -> Result<KeyPair, CryptoError> {
        self.get_or_create_key_pair_with_outcome(device_id)
            .map(|(pair, _)| pair)
    }

    pub fn get_or_create_key_pair_with_outcome(
        &self,
        device_id: &DeviceId,
    ) -> Result<(KeyPair, KeyProvisioning), CryptoError> {
        let conn = self.db.lock()?;
        let (pair, outcome) = with_transaction(&conn, |store| {
            let discarded = self.scan_legacy_locations(store, device_id)?;

            let mut outcome = match load_row(store.conn, device_id)? {
                Some(row) if row.format_version == KEY_FORMAT_VERSION => {
                    return Ok((row.into_key_pair()?, KeyProvisioning::Existing));
                }
                Some(row) => {
                    tracing::warn!(
                        device_id = %device_id,
                        found = row.format_version,
                        expected = KEY_FORMAT_VERSION,
                        "device key format changed, discarding old keypair"
                    );
                    delete_row(store.conn, device_id)?;
                    KeyProvisioning::Regenerated(RegenerationReason::FormatVersionMismatch {
                        found: row.format_version,
                    })
                }
                None => KeyProvisioning::Created,
            };

            if !discarded.is_empty() && outcome == KeyProvisioning::Created {
                outcome = KeyProvisioning::Regenerated(RegenerationReason::LegacyMaterialDiscarded {
                    sources: discarded,
                });
            }

            let pair = KeyPair::generate()?;
            insert_row(store.conn, device_id, &pair)?;
            Ok((pair, outcome))
        })?;

        if outcome != KeyProvisioning::Existing {
            tracing::info!(device_id = %device_id, outcome = ?outcome, "provisioned device keypair");
        }
        Ok((pair, outcome))
    }

    /// The stored keypair, without creating one.
    pub fn key_pair(&self, device_id: &DeviceId) -> Result<KeyPair, CryptoError> {
        let conn = self.db.lock()?;
        match load_row(&conn, device_id)? {
            Some(row) if row.format_version == KEY_FORMAT_VERSION => row.into_key_pair(),
            _ => Err(CryptoError::DeviceKeyNotInitialized {
                device_id: device_id.to_string(),
            }),
        }
    }

    pub fn public_key(&self, device_id: &DeviceId) -> Result<PublicKey, CryptoError> {
        Ok(self.key_pair(device_id)?.public)
    }

    pub fn derive_public_key(&self, private_key: &SecretKey) -> PublicKey {
        primitives::derive_public_key(private_key)
    }

    /// Recompute the public key from the stored private key and compare it with
    /// the stored public key. Callers run this before trusting stored keys.
    pub fn verify_consistency(&self, device_id: &DeviceId) -> Result<KeyConsistency, CryptoError> {
        let conn = self.db.lock()?;
        let row = load_row(&conn, device_id)?.ok_or_else(|| CryptoError::DeviceKeyNotInitialized {
            device_id: device_id.to_string(),
        })?;
        drop(conn);

        let stored = PublicKey::from_slice(&row.public_key)?;
        let secret = SecretKey::from_slice(&row.private_key)?;
        let derived = primitives::derive_public_key(&secret);
        if stored == derived {
            Ok(KeyConsistency::Consistent)
        } else {
            tracing::error!(device_id = %device_id, "stored device public key does not match private key");
            Ok(KeyConsistency::Mismatch { stored, derived })
        }
    }

    /// Destroy the device keypair (device reset).
    pub fn reset_device(&self, device_id: &DeviceId) -> Result<bool, CryptoError> {
        let conn = self.db.lock()?;
        let removed = delete_row(&conn, device_id)?;
        if removed {
            tracing::info!(device_id = %device_id, "device keypair destroyed");
        }
        Ok(removed)
    }

    fn scan_legacy_locations(
        &self,
        store: &CryptoStore<'_>,
        device_id: &DeviceId,
    ) -> Result<Vec<String>, CryptoError> {
        let marker = format!("{LEGACY_SCAN_PREFIX}{device_id}");
        if store.get_config(&marker)?.is_some() {
            return Ok(Vec::new());
        }

        let mut discarded = Vec::new();
        for source in &self.legacy_sources {
            if source.contains(store.conn, device_id)? {
                source.purge(store.conn, device_id)?;
                tracing::warn!(
                    device_id = %device_id,
                    source = source.name(),
                    "deleted legacy key material"
                );
                discarded.push(source.name().to_string());
            }
        }
        store.store_config(&marker, &unix_now().to_be_bytes())?;
        Ok(discarded)
    }
}

struct DeviceKeyRow {
    public_key: Vec<u8>,
    private_key: Vec<u8>,
    format_version: u32,
}

impl DeviceKeyRow {
    fn into_key_pair(self) -> Result<KeyPair, CryptoError> {
        let secret = SecretKey::from_slice(&self.private_key)
            .map_err(|e| CryptoError::StorageError(format!("stored private key: {e}")))?;
        let public = PublicKey::from_slice(&self.public_key)
            .map_err(|e| CryptoError::StorageError(format!("stored public key: {e}")))?;
        Ok(KeyPair { public, secret })
    }
}

impl Drop for DeviceKeyRow {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.private_key);
    }
}

fn load_row(conn: &Connection, device_id: &DeviceId) -> Result<Option<DeviceKeyRow>, CryptoError> {
    let row = conn
        .query_row(
            "SELECT public_key, private_key, format_version FROM crypto_device_keys WHERE device_id = ?1",
            [device_id.to_string()],
            |row| {
                Ok(DeviceKeyRow {
                    public_key: row.get(0)?,
                    private_key: row.get(1)?,
                    format_version: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn insert_row(conn: &Connection, device_id: &DeviceId, pair: &KeyPair) -> Result<(), CryptoError> {
    conn.execute(
        "INSERT INTO crypto_device_keys (device_id, public_key, private_key, format_version, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            device_id.to_string(),
            pair.public.as_bytes().as_slice(),
            pair.secret.as_bytes().as_slice(),
            KEY_FORMAT_VERSION,
            unix_now()
        ],
    )?;
    Ok(())
}

fn delete_row(conn: &Connection, device_id: &DeviceId) -> Result<bool, CryptoError> {
    let n = conn.execute(
        "DELETE FROM crypto_device_keys WHERE device_id = ?1",
        [device_id.to_string()],
    )?;
    Ok(n > 0)
}
