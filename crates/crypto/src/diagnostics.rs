//! Caller-owned diagnostics for encryption and decryption.
//!
//! Nothing here is needed for normal operation. A [`DiagnosticContext`] is
//! passed by reference into the `*_with_diagnostics` engine calls, and
//! [`diagnose_decryption_failure`] narrows down why a decrypt failed without
//! changing the error the engine returned.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use veilbox_shared::ids::{DeviceId, KeyRecordId, MessageId};

use crate::device_keys::{DeviceKeyStore, KeyConsistency};
use crate::directory::KeyDirectoryClient;
use crate::error::CryptoError;
use crate::primitives::PublicKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Encrypt,
    Decrypt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticEvent {
    pub operation: Operation,
    pub outcome: Outcome,
    pub message_id: Option<MessageId>,
    pub payload_len: usize,
    pub version: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    Encrypted,
    Decrypted,
    Failed { reason: String },
}

#[derive(Debug, Default)]
pub struct DiagnosticContext {
    events: Vec<DiagnosticEvent>,
    statuses: HashMap<MessageId, MessageStatus>,
}

impl DiagnosticContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(
        &mut self,
        operation: Operation,
        message_id: Option<MessageId>,
        payload_len: usize,
        version: u32,
        result: Result<(), &CryptoError>,
    ) {
        let outcome = match result {
            Ok(()) => Outcome::Ok,
            Err(e) => Outcome::Failed(e.to_string()),
        };
        if let Some(id) = message_id {
            let status = match (&outcome, operation) {
                (Outcome::Failed(reason), _) => MessageStatus::Failed {
                    reason: reason.clone(),
                },
                (Outcome::Ok, Operation::Encrypt) => MessageStatus::Encrypted,
                (Outcome::Ok, Operation::Decrypt) => MessageStatus::Decrypted,
            };
            self.statuses.insert(id, status);
        }
        tracing::trace!(?operation, ?outcome, payload_len, version, "crypto diagnostic event");
        self.events.push(DiagnosticEvent {
            operation,
            outcome,
            message_id,
            payload_len,
            version,
            at: Utc::now(),
        });
    }

    pub fn events(&self) -> &[DiagnosticEvent] {
        &self.events
    }

    pub fn status(&self, message_id: &MessageId) -> Option<&MessageStatus> {
        self.statuses.get(message_id)
    }

    pub fn failures(&self) -> impl Iterator<Item = &DiagnosticEvent> {
        self.events
            .iter()
            .filter(|e| matches!(e.outcome, Outcome::Failed(_)))
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.statuses.clear();
    }
}

/// How the key the sender encrypted to compares with the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderKeyCheck {
    /// The sender used this device's current directory record.
    MatchesLatest,
    /// The sender used an older record for this user.
    StaleRecord { used: KeyRecordId, latest: KeyRecordId },
    /// The directory holds a different key than this device does.
    DirectoryKeyMismatch { directory: PublicKey, local: PublicKey },
    /// This device has never published its key.
    NotPublished,
    /// The message carried no record id to compare.
    RecordUnknown,
    DirectoryUnreachable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionDiagnosis {
    pub device_key: KeyConsistency,
    pub sender_key: SenderKeyCheck,
}

impl DecryptionDiagnosis {
    /// One-line summary for logs and support tooling.
    pub fn likely_cause(&self) -> &'static str {
        if let KeyConsistency::Mismatch { .. } = self.device_key {
            return "local device key storage is corrupted";
        }
        match self.sender_key {
            SenderKeyCheck::StaleRecord { .. } => "sender encrypted to an outdated key",
            SenderKeyCheck::DirectoryKeyMismatch { .. } => {
                "directory key differs from this device's key"
            }
            SenderKeyCheck::NotPublished => "this device's key was never published",
            SenderKeyCheck::MatchesLatest | SenderKeyCheck::RecordUnknown => {
                "keys look consistent; envelope was likely corrupted or tampered with"
            }
            SenderKeyCheck::DirectoryUnreachable(_) => "undetermined, key directory unreachable",
        }
    }
}

/// Run the post-failure checks in order: (a) local key consistency, then
/// (b) whether the sender's target record is this device's current one.
pub async fn diagnose_decryption_failure(
    store: &DeviceKeyStore,
    device_id: &DeviceId,
    directory: &KeyDirectoryClient,
    used_record_id: Option<KeyRecordId>,
) -> Result<DecryptionDiagnosis, CryptoError> {
    let device_key = store.verify_consistency(device_id)?;
    let local = store.public_key(device_id)?;

    let sender_key = match directory.fetch_device(directory.user_id(), device_id).await {
        Err(CryptoError::KeyNotFound { .. }) => SenderKeyCheck::NotPublished,
        Err(e) if e.is_retryable() => SenderKeyCheck::DirectoryUnreachable(e.to_string()),
        Err(e) => return Err(e),
        Ok(record) if record.public_key != local => SenderKeyCheck::DirectoryKeyMismatch {
            directory: record.public_key,
            local,
        },
        Ok(record) => match used_record_id {
            None => SenderKeyCheck::RecordUnknown,
            Some(used) if used == record.record_id => SenderKeyCheck::MatchesLatest,
            Some(used) => SenderKeyCheck::StaleRecord {
                used,
                latest: record.record_id,
            },
        },
    };

    let diagnosis = DecryptionDiagnosis {
        device_key,
        sender_key,
    };
    tracing::info!(
        device_id = %device_id,
        cause = diagnosis.likely_cause(),
        "decryption failure diagnosed"
    );
    Ok(diagnosis)
}
