//! Local cache of peer public keys with versioning and verification state.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};
use veilbox_shared::ids::{DeviceId, KeyRecordId, UserId};

use crate::directory::PublicKeyRecord;
use crate::error::CryptoError;
use crate::primitives::PublicKey;
use crate::sas::{derive_key_fingerprint, SasFingerprint};
use crate::storage::{unix_now, SharedConnection};
use crate::verification::{
    KeyChangeDetected, KeyChangeKind, VerificationRecord, VerificationState,
};

/// What the cache concluded about a freshly fetched record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyObservation {
    FirstSeen,
    Unchanged,
    Changed(KeyChangeDetected),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPeerKey {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub record_id: KeyRecordId,
    pub public_key: PublicKey,
    pub record_created_at: DateTime<Utc>,
    /// Bumped every time the cached key for this device changes.
    pub key_version: i64,
    pub verification: VerificationRecord,
}

#[derive(Clone)]
pub struct PeerKeyCache {
    db: SharedConnection,
}

impl PeerKeyCache {
    pub fn new(db: SharedConnection) -> Self {
        Self { db }
    }

    pub fn get(&self, user_id: &UserId, device_id: &DeviceId) -> Result<Option<CachedPeerKey>, CryptoError> {
        let conn = self.db.lock()?;
        load(&conn, user_id, device_id)
    }

    pub fn list_for_user(&self, user_id: &UserId) -> Result<Vec<CachedPeerKey>, CryptoError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT device_id FROM crypto_peer_keys WHERE user_id = ?1 ORDER BY record_created_at",
        )?;
        let devices = stmt
            .query_map([user_id.to_string()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut out = Vec::with_capacity(devices.len());
        for device in devices {
            let device_id: DeviceId = device
                .parse()
                .map_err(|_| CryptoError::StorageError("invalid cached device_id".into()))?;
            if let Some(cached) = load(&conn, user_id, &device_id)? {
                out.push(cached);
            }
        }
        Ok(out)
    }

    /// Record a directory result and classify any change against the cache.
    pub fn observe(
        &self,
        record: &PublicKeyRecord,
        own_public_key: &PublicKey,
    ) -> Result<(KeyObservation, CachedPeerKey), CryptoError> {
        let fingerprint = derive_key_fingerprint(own_public_key, &record.public_key);
        let conn = self.db.lock()?;
        let tx = conn.unchecked_transaction()?;

        let result = match load(&tx, &record.user_id, &record.device_id)? {
            None => {
                let cached = CachedPeerKey {
                    user_id: record.user_id,
                    device_id: record.device_id,
                    record_id: record.record_id,
                    public_key: record.public_key,
                    record_created_at: record.created_at,
                    key_version: 1,
                    verification: VerificationRecord::new(fingerprint),
                };
                insert(&tx, &cached)?;
                tracing::debug!(user_id = %record.user_id, device_id = %record.device_id, "first sighting of peer key");
                (KeyObservation::FirstSeen, cached)
            }
            Some(mut cached) => {
                let peer_key_changed = cached.public_key != record.public_key;
                let kind = if !peer_key_changed {
                    KeyChangeKind::LocalRotation
                } else if record.record_id != cached.record_id
                    && record.created_at > cached.record_created_at
                {
                    KeyChangeKind::PeerRotation
                } else {
                    KeyChangeKind::Unexplained
                };

                match cached.verification.observe_key_fingerprint(&fingerprint, kind) {
                    None => (KeyObservation::Unchanged, cached),
                    Some(event) => {
                        if peer_key_changed {
                            cached.key_version += 1;
                        }
                        cached.record_id = record.record_id;
                        cached.public_key = record.public_key;
                        cached.record_created_at = record.created_at;
                        update(&tx, &cached)?;
                        tracing::warn!(
                            user_id = %record.user_id,
                            device_id = %record.device_id,
                            key_version = cached.key_version,
                            kind = ?event.kind,
                            "KeyChangeDetected"
                        );
                        (KeyObservation::Changed(event), cached)
                    }
                }
            }
        };

        tx.commit()?;
        Ok(result)
    }

    /// The user confirmed matching sequences for this peer device.
    pub fn confirm_verification(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        derived: &SasFingerprint,
    ) -> Result<VerificationState, CryptoError> {
        self.transition(user_id, device_id, |record| record.confirm_match(derived))
    }

    /// The user reported mismatching sequences for this peer device.
    pub fn report_mismatch(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<VerificationState, CryptoError> {
        self.transition(user_id, device_id, |record| Ok(record.report_mismatch()))
    }

    pub fn forget(&self, user_id: &UserId, device_id: &DeviceId) -> Result<bool, CryptoError> {
        let conn = self.db.lock()?;
        let n = conn.execute(
            "DELETE FROM crypto_peer_keys WHERE user_id = ?1 AND device_id = ?2",
            [user_id.to_string(), device_id.to_string()],
        )?;
        Ok(n > 0)
    }

    fn transition(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        f: impl FnOnce(&mut VerificationRecord) -> Result<VerificationState, CryptoError>,
    ) -> Result<VerificationState, CryptoError> {
        let conn = self.db.lock()?;
        let mut cached = load(&conn, user_id, device_id)?.ok_or_else(|| CryptoError::KeyNotFound {
            user_id: user_id.to_string(),
        })?;
        let state = f(&mut cached.verification)?;
        update(&conn, &cached)?;
        Ok(state)
    }
}

fn load(
    conn: &Connection,
    user_id: &UserId,
    device_id: &DeviceId,
) -> Result<Option<CachedPeerKey>, CryptoError> {
    let row = conn
        .query_row(
            "SELECT record_id, public_key, record_created_at, key_fingerprint, key_version,
                    verification_state, verified_at
             FROM crypto_peer_keys WHERE user_id = ?1 AND device_id = ?2",
            [user_id.to_string(), device_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                ))
            },
        )
        .optional()?;

    let Some((record_id, public_key, created_ms, fingerprint, key_version, state, verified_at)) = row
    else {
        return Ok(None);
    };

    let record_id: KeyRecordId = record_id
        .parse()
        .map_err(|_| CryptoError::StorageError("invalid cached record_id".into()))?;
    let state = VerificationState::parse(&state)
        .ok_or_else(|| CryptoError::StorageError(format!("unknown verification state {state}")))?;

    Ok(Some(CachedPeerKey {
        user_id: *user_id,
        device_id: *device_id,
        record_id,
        public_key: PublicKey::from_slice(&public_key)?,
        record_created_at: from_millis(created_ms)?,
        key_version,
        verification: VerificationRecord::restore(
            state,
            fingerprint,
            verified_at.map(from_millis).transpose()?,
        ),
    }))
}

fn insert(conn: &Connection, cached: &CachedPeerKey) -> Result<(), CryptoError> {
    let now = unix_now();
    conn.execute(
        "INSERT INTO crypto_peer_keys
            (user_id, device_id, record_id, public_key, record_created_at, key_fingerprint,
             key_version, verification_state, verified_at, first_seen_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        rusqlite::params![
            cached.user_id.to_string(),
            cached.device_id.to_string(),
            cached.record_id.to_string(),
            cached.public_key.as_bytes().as_slice(),
            cached.record_created_at.timestamp_millis(),
            cached.verification.key_fingerprint(),
            cached.key_version,
            cached.verification.state().as_str(),
            cached.verification.verified_at().map(|t| t.timestamp_millis()),
            now,
        ],
    )?;
    Ok(())
}

fn update(conn: &Connection, cached: &CachedPeerKey) -> Result<(), CryptoError> {
    conn.execute(
        "UPDATE crypto_peer_keys SET
            record_id = ?3, public_key = ?4, record_created_at = ?5, key_fingerprint = ?6,
            key_version = ?7, verification_state = ?8, verified_at = ?9, updated_at = ?10
         WHERE user_id = ?1 AND device_id = ?2",
        rusqlite::params![
            cached.user_id.to_string(),
            cached.device_id.to_string(),
            cached.record_id.to_string(),
            cached.public_key.as_bytes().as_slice(),
            cached.record_created_at.timestamp_millis(),
            cached.verification.key_fingerprint(),
            cached.key_version,
            cached.verification.state().as_str(),
            cached.verification.verified_at().map(|t| t.timestamp_millis()),
            unix_now(),
        ],
    )?;
    Ok(())
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, CryptoError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| CryptoError::StorageError(format!("invalid timestamp {ms}")))
}
