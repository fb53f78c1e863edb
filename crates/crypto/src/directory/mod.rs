//! Key directory client.
//!
//! The directory is the only source of peer public keys. Several devices per
//! user may be published; callers that need a specific device's key must ask
//! for it by record or device id rather than taking the latest one.

pub mod http;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use veilbox_shared::api::keys::PublicKeyRecordResponse;
use veilbox_shared::ids::{DeviceId, KeyRecordId, UserId};

use crate::device_keys::DeviceKeyStore;
use crate::error::CryptoError;
use crate::primitives::PublicKey;
use crate::storage::peer_keys::{KeyObservation, PeerKeyCache};

pub use http::HttpKeyDirectory;
pub use memory::InMemoryKeyDirectory;

/// One published device key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyRecord {
    pub record_id: KeyRecordId,
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub public_key: PublicKey,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<PublicKeyRecordResponse> for PublicKeyRecord {
    type Error = CryptoError;

    fn try_from(resp: PublicKeyRecordResponse) -> Result<Self, Self::Error> {
        Ok(Self {
            record_id: resp.record_id,
            user_id: resp.user_id,
            device_id: resp.device_id,
            public_key: PublicKey::from_base64(&resp.public_key)?,
            created_at: resp.created_at,
        })
    }
}

impl From<&PublicKeyRecord> for PublicKeyRecordResponse {
    fn from(record: &PublicKeyRecord) -> Self {
        Self {
            record_id: record.record_id,
            user_id: record.user_id,
            device_id: record.device_id,
            public_key: record.public_key.to_base64(),
            created_at: record.created_at,
        }
    }
}

/// The external key-directory service.
#[async_trait]
pub trait KeyDirectoryService: Send + Sync {
    /// Idempotent upsert of a device key.
    async fn publish(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        public_key: &PublicKey,
    ) -> Result<PublicKeyRecord, CryptoError>;

    /// Most recently created record across all of the user's devices.
    async fn fetch_latest(
        &self,
        user_id: &UserId,
        requesting_user_id: &UserId,
    ) -> Result<PublicKeyRecord, CryptoError>;

    async fn fetch_record(
        &self,
        user_id: &UserId,
        record_id: &KeyRecordId,
    ) -> Result<PublicKeyRecord, CryptoError>;

    /// Most recent record for one device.
    async fn fetch_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<PublicKeyRecord, CryptoError>;
}

/// Which of a peer's records to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySelector {
    Latest,
    Record(KeyRecordId),
    Device(DeviceId),
}

/// A fetched record together with what the local cache made of it.
#[derive(Debug, Clone)]
pub struct TrackedKey {
    pub record: PublicKeyRecord,
    pub observation: KeyObservation,
}

/// Directory access on behalf of one local user.
#[derive(Clone)]
pub struct KeyDirectoryClient {
    service: Arc<dyn KeyDirectoryService>,
    user_id: UserId,
    cache: Option<PeerKeyCache>,
}

impl KeyDirectoryClient {
    pub fn new(service: Arc<dyn KeyDirectoryService>, user_id: UserId) -> Self {
        Self {
            service,
            user_id,
            cache: None,
        }
    }

    /// Attach a local cache so fetched keys are versioned and changes detected.
    pub fn with_cache(mut self, cache: PeerKeyCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub async fn publish(
        &self,
        device_id: &DeviceId,
        public_key: &PublicKey,
    ) -> Result<PublicKeyRecord, CryptoError> {
        let record = self
            .service
            .publish(&self.user_id, device_id, public_key)
            .await?;
        tracing::info!(
            user_id = %self.user_id,
            device_id = %device_id,
            record_id = %record.record_id,
            "published device key"
        );
        Ok(record)
    }

    /// Publish this device's own public key, provisioning it if needed.
    pub async fn publish_device_key(
        &self,
        store: &DeviceKeyStore,
        device_id: &DeviceId,
    ) -> Result<PublicKeyRecord, CryptoError> {
        let public_key = store.get_or_create_key_pair(device_id)?.public;
        self.publish(device_id, &public_key).await
    }

    /// Latest record for `user_id`, requested as this client's user.
    pub async fn fetch_latest(&self, user_id: &UserId) -> Result<PublicKeyRecord, CryptoError> {
        self.service.fetch_latest(user_id, &self.user_id).await
    }

    pub async fn fetch_specific(
        &self,
        user_id: &UserId,
        record_id: &KeyRecordId,
    ) -> Result<PublicKeyRecord, CryptoError> {
        let record = self.service.fetch_record(user_id, record_id).await?;
        if record.user_id != *user_id {
            return Err(CryptoError::DirectoryError(format!(
                "record {record_id} belongs to another user"
            )));
        }
        Ok(record)
    }

    pub async fn fetch_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<PublicKeyRecord, CryptoError> {
        self.service.fetch_device(user_id, device_id).await
    }

    pub async fn fetch(
        &self,
        user_id: &UserId,
        selector: KeySelector,
    ) -> Result<PublicKeyRecord, CryptoError> {
        match selector {
            KeySelector::Latest => self.fetch_latest(user_id).await,
            KeySelector::Record(record_id) => self.fetch_specific(user_id, &record_id).await,
            KeySelector::Device(device_id) => self.fetch_device(user_id, &device_id).await,
        }
    }

    /// Fetch a peer key and compare it with what the cache last saw.
    ///
    /// A changed key is reported, not refused: the peer may simply have
    /// rotated devices. Without a cache every fetch is `FirstSeen`.
    pub async fn fetch_and_track(
        &self,
        user_id: &UserId,
        selector: KeySelector,
        own_public_key: &PublicKey,
    ) -> Result<TrackedKey, CryptoError> {
        let record = self.fetch(user_id, selector).await?;
        let observation = match &self.cache {
            Some(cache) => cache.observe(&record, own_public_key)?.0,
            None => KeyObservation::FirstSeen,
        };
        Ok(TrackedKey {
            record,
            observation,
        })
    }
}
