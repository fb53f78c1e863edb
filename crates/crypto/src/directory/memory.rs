//! In-process key directory for tests, demos, and offline use.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use veilbox_shared::ids::{DeviceId, KeyRecordId, UserId};

use super::{KeyDirectoryService, PublicKeyRecord};
use crate::error::CryptoError;
use crate::primitives::PublicKey;

#[derive(Default)]
pub struct InMemoryKeyDirectory {
    records: Mutex<Vec<PublicKeyRecord>>,
}

impl InMemoryKeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<PublicKeyRecord>>, CryptoError> {
        self.records
            .lock()
            .map_err(|e| CryptoError::DirectoryError(format!("directory lock poisoned: {e}")))
    }

    /// Every record ever published for the user, oldest first.
    pub fn records_for(&self, user_id: &UserId) -> Result<Vec<PublicKeyRecord>, CryptoError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|r| r.user_id == *user_id)
            .cloned()
            .collect())
    }

    /// Overwrite a record's key in place. Simulates a directory serving a
    /// substituted key under an existing record id.
    pub fn tamper_with_record(&self, record_id: &KeyRecordId, key: PublicKey) -> Result<(), CryptoError> {
        let mut records = self.lock()?;
        let record = records
            .iter_mut()
            .find(|r| r.record_id == *record_id)
            .ok_or_else(|| CryptoError::DirectoryError(format!("no record {record_id}")))?;
        record.public_key = key;
        Ok(())
    }
}

fn not_found(user_id: &UserId) -> CryptoError {
    CryptoError::KeyNotFound {
        user_id: user_id.to_string(),
    }
}

#[async_trait]
impl KeyDirectoryService for InMemoryKeyDirectory {
    async fn publish(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        public_key: &PublicKey,
    ) -> Result<PublicKeyRecord, CryptoError> {
        let mut records = self.lock()?;

        let current = records
            .iter()
            .filter(|r| r.user_id == *user_id && r.device_id == *device_id)
            .max_by_key(|r| (r.created_at, r.record_id));
        if let Some(existing) = current {
            if existing.public_key == *public_key {
                return Ok(existing.clone());
            }
        }

        // Keep creation times strictly increasing so "latest" is unambiguous.
        let mut created_at = Utc::now();
        if let Some(last) = records.iter().map(|r| r.created_at).max() {
            if created_at <= last {
                created_at = last + Duration::milliseconds(1);
            }
        }

        let record = PublicKeyRecord {
            record_id: KeyRecordId::new(),
            user_id: *user_id,
            device_id: *device_id,
            public_key: *public_key,
            created_at,
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn fetch_latest(
        &self,
        user_id: &UserId,
        _requesting_user_id: &UserId,
    ) -> Result<PublicKeyRecord, CryptoError> {
        self.lock()?
            .iter()
            .filter(|r| r.user_id == *user_id)
            .max_by_key(|r| (r.created_at, r.record_id))
            .cloned()
            .ok_or_else(|| not_found(user_id))
    }

    async fn fetch_record(
        &self,
        user_id: &UserId,
        record_id: &KeyRecordId,
    ) -> Result<PublicKeyRecord, CryptoError> {
        self.lock()?
            .iter()
            .find(|r| r.user_id == *user_id && r.record_id == *record_id)
            .cloned()
            .ok_or_else(|| not_found(user_id))
    }

    async fn fetch_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<PublicKeyRecord, CryptoError> {
        self.lock()?
            .iter()
            .filter(|r| r.user_id == *user_id && r.device_id == *device_id)
            .max_by_key(|r| (r.created_at, r.record_id))
            .cloned()
            .ok_or_else(|| not_found(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::KeyPair;

    #[tokio::test]
    async fn publish_is_idempotent_for_same_key() {
        let directory = InMemoryKeyDirectory::new();
        let user = UserId::new();
        let device = DeviceId::new();
        let key = KeyPair::generate().unwrap().public;

        let first = directory.publish(&user, &device, &key).await.unwrap();
        let second = directory.publish(&user, &device, &key).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(directory.records_for(&user).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn new_key_creates_newer_record() {
        let directory = InMemoryKeyDirectory::new();
        let user = UserId::new();
        let device = DeviceId::new();

        let old = directory
            .publish(&user, &device, &KeyPair::generate().unwrap().public)
            .await
            .unwrap();
        let new = directory
            .publish(&user, &device, &KeyPair::generate().unwrap().public)
            .await
            .unwrap();
        assert!(new.created_at > old.created_at);
        assert_eq!(
            directory.fetch_device(&user, &device).await.unwrap(),
            new
        );
    }

    #[tokio::test]
    async fn fetch_record_scoped_to_user() {
        let directory = InMemoryKeyDirectory::new();
        let owner = UserId::new();
        let record = directory
            .publish(&owner, &DeviceId::new(), &KeyPair::generate().unwrap().public)
            .await
            .unwrap();
        let result = directory.fetch_record(&UserId::new(), &record.record_id).await;
        assert!(matches!(result, Err(CryptoError::KeyNotFound { .. })));
    }

    #[tokio::test]
    async fn tamper_replaces_key_under_same_record() {
        let directory = InMemoryKeyDirectory::new();
        let user = UserId::new();
        let record = directory
            .publish(&user, &DeviceId::new(), &KeyPair::generate().unwrap().public)
            .await
            .unwrap();
        let evil = KeyPair::generate().unwrap().public;
        directory.tamper_with_record(&record.record_id, evil).unwrap();
        let fetched = directory.fetch_record(&user, &record.record_id).await.unwrap();
        assert_eq!(fetched.public_key, evil);
        assert_eq!(fetched.created_at, record.created_at);
    }
}
