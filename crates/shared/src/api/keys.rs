use crate::ids::{DeviceId, KeyRecordId, UserId};
use serde::{Deserialize, Serialize};

/// Header carrying the id of the user asking for a peer's key.
pub const REQUESTING_USER_HEADER: &str = "x-requesting-user";

/// Body of `PUT /api/keys/{user_id}/devices/{device_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishKeyRequest {
    /// Base64 (standard alphabet) X25519 public key.
    pub public_key: String,
}

/// A published device key as returned by every directory read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyRecordResponse {
    pub record_id: KeyRecordId,
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub public_key: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Error body returned by the directory on non-success statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryErrorResponse {
    pub error: String,
}
