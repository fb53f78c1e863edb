//! Per-peer verification state.
//!
//! `Unverified` is the initial state. A user confirming matching SAS sequences
//! moves it to `Verified`; a reported mismatch or an unexplained key change
//! moves it to `Compromised`. Leaving `Compromised` needs a fingerprint freshly
//! derived over the current keys and another explicit confirmation.

use chrono::{DateTime, Utc};

use crate::error::CryptoError;
use crate::sas::SasFingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationState {
    Unverified,
    Verified,
    Compromised,
}

impl VerificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationState::Unverified => "unverified",
            VerificationState::Verified => "verified",
            VerificationState::Compromised => "compromised",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unverified" => Some(VerificationState::Unverified),
            "verified" => Some(VerificationState::Verified),
            "compromised" => Some(VerificationState::Compromised),
            _ => None,
        }
    }
}

/// Why a key fingerprint changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyChangeKind {
    /// The peer published a newer record (new device or rotation).
    PeerRotation,
    /// Our own device key changed, so the pair fingerprint changed with it.
    LocalRotation,
    /// The key changed without a newer directory record to account for it.
    Unexplained,
}

/// Raised whenever a stored key fingerprint differs from a newly computed one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyChangeDetected {
    pub previous_fingerprint: String,
    pub current_fingerprint: String,
    pub kind: KeyChangeKind,
    pub previous_state: VerificationState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRecord {
    state: VerificationState,
    key_fingerprint: String,
    verified_at: Option<DateTime<Utc>>,
}

impl VerificationRecord {
    pub fn new(key_fingerprint: impl Into<String>) -> Self {
        Self {
            state: VerificationState::Unverified,
            key_fingerprint: key_fingerprint.into(),
            verified_at: None,
        }
    }

    pub(crate) fn restore(
        state: VerificationState,
        key_fingerprint: String,
        verified_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            state,
            key_fingerprint,
            verified_at,
        }
    }

    pub fn state(&self) -> VerificationState {
        self.state
    }

    pub fn key_fingerprint(&self) -> &str {
        &self.key_fingerprint
    }

    pub fn verified_at(&self) -> Option<DateTime<Utc>> {
        self.verified_at
    }

    /// The user confirmed that both screens show the same sequence.
    ///
    /// `derived` must have been computed over the keys this record tracks; a
    /// sequence derived before a key change is refused.
    pub fn confirm_match(&mut self, derived: &SasFingerprint) -> Result<VerificationState, CryptoError> {
        if derived.key_fingerprint() != self.key_fingerprint {
            return Err(CryptoError::InvalidVerificationTransition(
                "sequence was derived over different keys; derive it again".into(),
            ));
        }
        if self.state != VerificationState::Verified {
            tracing::info!(from = self.state.as_str(), "peer verified");
        }
        self.state = VerificationState::Verified;
        self.verified_at = Some(Utc::now());
        Ok(self.state)
    }

    /// The user reported that the sequences differ.
    pub fn report_mismatch(&mut self) -> VerificationState {
        tracing::warn!(from = self.state.as_str(), "SAS mismatch reported");
        self.state = VerificationState::Compromised;
        self.verified_at = None;
        self.state
    }

    /// Record a freshly computed key fingerprint.
    ///
    /// A rotation drops a verified peer back to `Unverified`; an unexplained
    /// change marks it `Compromised`. `Compromised` is never left here.
    pub fn observe_key_fingerprint(
        &mut self,
        current: &str,
        kind: KeyChangeKind,
    ) -> Option<KeyChangeDetected> {
        if current == self.key_fingerprint {
            return None;
        }

        let event = KeyChangeDetected {
            previous_fingerprint: std::mem::replace(&mut self.key_fingerprint, current.to_string()),
            current_fingerprint: current.to_string(),
            kind,
            previous_state: self.state,
        };

        self.state = match (self.state, kind) {
            (VerificationState::Compromised, _) => VerificationState::Compromised,
            (_, KeyChangeKind::Unexplained) => VerificationState::Compromised,
            (_, KeyChangeKind::PeerRotation | KeyChangeKind::LocalRotation) => {
                VerificationState::Unverified
            }
        };
        self.verified_at = None;

        tracing::warn!(
            kind = ?kind,
            from = event.previous_state.as_str(),
            to = self.state.as_str(),
            "key change detected"
        );
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::KeyPair;
    use crate::sas::derive_fingerprint;

    fn setup() -> (SasFingerprint, VerificationRecord) {
        let a = KeyPair::generate().unwrap().public;
        let b = KeyPair::generate().unwrap().public;
        let fp = derive_fingerprint(&a, &b, Some("ctx"));
        let record = VerificationRecord::new(fp.key_fingerprint());
        (fp, record)
    }

    #[test]
    fn starts_unverified() {
        let (_, record) = setup();
        assert_eq!(record.state(), VerificationState::Unverified);
        assert!(record.verified_at().is_none());
    }

    #[test]
    fn confirm_moves_to_verified() {
        let (fp, mut record) = setup();
        assert_eq!(record.confirm_match(&fp).unwrap(), VerificationState::Verified);
        assert!(record.verified_at().is_some());
    }

    #[test]
    fn mismatch_moves_to_compromised() {
        let (fp, mut record) = setup();
        record.confirm_match(&fp).unwrap();
        assert_eq!(record.report_mismatch(), VerificationState::Compromised);
    }

    #[test]
    fn stale_sequence_cannot_confirm() {
        let (stale, mut record) = setup();
        record.observe_key_fingerprint("NEWFINGERPRINT", KeyChangeKind::Unexplained);
        let result = record.confirm_match(&stale);
        assert!(matches!(
            result,
            Err(CryptoError::InvalidVerificationTransition(_))
        ));
        assert_eq!(record.state(), VerificationState::Compromised);
    }

    #[test]
    fn compromised_needs_fresh_derivation_and_confirmation() {
        let a = KeyPair::generate().unwrap().public;
        let b = KeyPair::generate().unwrap().public;
        let c = KeyPair::generate().unwrap().public;
        let old = derive_fingerprint(&a, &b, None);
        let mut record = VerificationRecord::new(old.key_fingerprint());
        record.confirm_match(&old).unwrap();

        let fresh = derive_fingerprint(&a, &c, None);
        record.observe_key_fingerprint(fresh.key_fingerprint(), KeyChangeKind::Unexplained);
        assert_eq!(record.state(), VerificationState::Compromised);

        // A second observation of the same key does not clear anything.
        assert!(record
            .observe_key_fingerprint(fresh.key_fingerprint(), KeyChangeKind::PeerRotation)
            .is_none());
        assert_eq!(record.state(), VerificationState::Compromised);

        assert_eq!(
            record.confirm_match(&fresh).unwrap(),
            VerificationState::Verified
        );
    }

    #[test]
    fn rotation_resets_verified_to_unverified() {
        let (fp, mut record) = setup();
        record.confirm_match(&fp).unwrap();
        let event = record
            .observe_key_fingerprint("ROTATED", KeyChangeKind::PeerRotation)
            .unwrap();
        assert_eq!(event.previous_state, VerificationState::Verified);
        assert_eq!(event.previous_fingerprint, fp.key_fingerprint());
        assert_eq!(record.state(), VerificationState::Unverified);
    }

    #[test]
    fn rotation_never_clears_compromised() {
        let (_, mut record) = setup();
        record.report_mismatch();
        record.observe_key_fingerprint("ROTATED", KeyChangeKind::PeerRotation);
        assert_eq!(record.state(), VerificationState::Compromised);
    }

    #[test]
    fn state_string_roundtrip() {
        for state in [
            VerificationState::Unverified,
            VerificationState::Verified,
            VerificationState::Compromised,
        ] {
            assert_eq!(VerificationState::parse(state.as_str()), Some(state));
        }
        assert_eq!(VerificationState::parse("trusted"), None);
    }
}
