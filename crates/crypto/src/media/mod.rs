//! Per-payload-type drivers around the hybrid engine.
//!
//! Text ciphertext travels inline in the message metadata. Audio and video
//! ciphertext goes to a [`BlobStore`]; the metadata then holds only the blob
//! key and the envelope header.

pub mod adapter;
pub mod blob;
pub mod strategies;
pub mod text;

use serde::{Deserialize, Serialize};
use veilbox_shared::ids::KeyRecordId;

use crate::directory::PublicKeyRecord;
use crate::envelope::EnvelopeHeader;
use crate::primitives::PublicKey;

pub use adapter::MediaAdapter;
pub use blob::{blob_key, BlobStore, ObjectBlobStore};
pub use strategies::{ReadStrategy, WriteStrategy};
pub use text::TextAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Text,
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Text => "text",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The key a payload is sealed to, plus the directory record it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recipient {
    pub public_key: PublicKey,
    pub record_id: Option<KeyRecordId>,
}

impl From<&PublicKeyRecord> for Recipient {
    fn from(record: &PublicKeyRecord) -> Self {
        Self {
            public_key: record.public_key,
            record_id: Some(record.record_id),
        }
    }
}

impl From<PublicKey> for Recipient {
    fn from(public_key: PublicKey) -> Self {
        Self {
            public_key,
            record_id: None,
        }
    }
}

/// What the message layer stores alongside a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    pub kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_key: Option<String>,
    /// Base64 ciphertext, for text only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_ciphertext: Option<String>,
    #[serde(flatten)]
    pub envelope: EnvelopeHeader,
    pub plaintext_len: u64,
    /// Directory record the sender encrypted to; feeds failure diagnosis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_key_record_id: Option<KeyRecordId>,
}
