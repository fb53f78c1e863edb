//! Envelope versions and their wire form.
//!
//! Decryption dispatches on the [`Envelope`] tag, never on a raw version
//! number. Envelopes older than version 3 wrapped their content key with a
//! derived shared secret; they are parsed only so they can be rejected with a
//! precise error.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use veilbox_shared::constants::{CURRENT_ENVELOPE_VERSION, MIN_SUPPORTED_ENVELOPE_VERSION};

use crate::error::CryptoError;
use crate::primitives::{Nonce, PublicKey, KEY_SIZE, MAC_SIZE};

/// Output of hybrid-encrypting one payload under the current scheme.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedEnvelope {
    pub ciphertext: Vec<u8>,
    pub wrapped_key: Vec<u8>,
    pub key_nonce: Nonce,
    pub content_nonce: Nonce,
    /// Single-use unless the sender explicitly supplied a long-term key.
    pub ephemeral_public_key: PublicKey,
}

impl SealedEnvelope {
    pub fn version(&self) -> u32 {
        CURRENT_ENVELOPE_VERSION
    }
}

impl std::fmt::Debug for SealedEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedEnvelope")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("wrapped_key_len", &self.wrapped_key.len())
            .field("ephemeral_public_key", &self.ephemeral_public_key)
            .finish()
    }
}

/// An envelope from a retired scheme. Kept only for the error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyEnvelope {
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Legacy(LegacyEnvelope),
    V3(SealedEnvelope),
}

impl Envelope {
    pub fn version(&self) -> u32 {
        match self {
            Envelope::Legacy(legacy) => legacy.version,
            Envelope::V3(sealed) => sealed.version(),
        }
    }

    pub fn to_json(&self) -> Result<String, CryptoError> {
        Ok(serde_json::to_string(&WireEnvelope::try_from(self)?)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        let wire: WireEnvelope = serde_json::from_str(json)
            .map_err(|e| CryptoError::MalformedEnvelope(e.to_string()))?;
        Envelope::try_from(wire)
    }
}

impl From<SealedEnvelope> for Envelope {
    fn from(sealed: SealedEnvelope) -> Self {
        Envelope::V3(sealed)
    }
}

/// JSON shape exchanged with the message layer. All byte fields are standard base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    pub ciphertext: String,
    #[serde(default)]
    pub wrapped_key: String,
    #[serde(default)]
    pub key_nonce: String,
    #[serde(default)]
    pub content_nonce: String,
    #[serde(default)]
    pub ephemeral_public_key: String,
    pub version: u32,
}

impl From<&SealedEnvelope> for WireEnvelope {
    fn from(sealed: &SealedEnvelope) -> Self {
        let header = EnvelopeHeader::of(sealed);
        Self {
            ciphertext: STANDARD.encode(&sealed.ciphertext),
            wrapped_key: header.wrapped_key,
            key_nonce: header.key_nonce,
            content_nonce: header.content_nonce,
            ephemeral_public_key: header.ephemeral_public_key,
            version: header.version,
        }
    }
}

impl TryFrom<&Envelope> for WireEnvelope {
    type Error = CryptoError;

    fn try_from(envelope: &Envelope) -> Result<Self, Self::Error> {
        match envelope {
            Envelope::V3(sealed) => Ok(WireEnvelope::from(sealed)),
            Envelope::Legacy(legacy) => Err(CryptoError::UnsupportedLegacyVersion {
                version: legacy.version,
            }),
        }
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = CryptoError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        if wire.version < MIN_SUPPORTED_ENVELOPE_VERSION {
            return Ok(Envelope::Legacy(LegacyEnvelope {
                version: wire.version,
            }));
        }
        let ciphertext = decode("ciphertext", &wire.ciphertext)?;
        EnvelopeHeader {
            wrapped_key: wire.wrapped_key,
            key_nonce: wire.key_nonce,
            content_nonce: wire.content_nonce,
            ephemeral_public_key: wire.ephemeral_public_key,
            version: wire.version,
        }
        .with_ciphertext(ciphertext)
    }
}

/// Every wire field except the ciphertext, for payloads whose ciphertext
/// lives elsewhere (a blob store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeHeader {
    #[serde(default)]
    pub wrapped_key: String,
    #[serde(default)]
    pub key_nonce: String,
    #[serde(default)]
    pub content_nonce: String,
    #[serde(default)]
    pub ephemeral_public_key: String,
    pub version: u32,
}

impl EnvelopeHeader {
    pub fn of(sealed: &SealedEnvelope) -> Self {
        Self {
            wrapped_key: STANDARD.encode(&sealed.wrapped_key),
            key_nonce: STANDARD.encode(sealed.key_nonce),
            content_nonce: STANDARD.encode(sealed.content_nonce),
            ephemeral_public_key: sealed.ephemeral_public_key.to_base64(),
            version: sealed.version(),
        }
    }

    /// Rebuild the envelope around ciphertext fetched separately.
    pub fn with_ciphertext(&self, ciphertext: Vec<u8>) -> Result<Envelope, CryptoError> {
        match self.version {
            v if v < MIN_SUPPORTED_ENVELOPE_VERSION => {
                Ok(Envelope::Legacy(LegacyEnvelope { version: v }))
            }
            CURRENT_ENVELOPE_VERSION => {
                if ciphertext.len() < MAC_SIZE {
                    return Err(CryptoError::MalformedEnvelope(format!(
                        "ciphertext: expected at least {MAC_SIZE} bytes, got {}",
                        ciphertext.len()
                    )));
                }
                Ok(Envelope::V3(SealedEnvelope {
                    ciphertext,
                    wrapped_key: decode_exact("wrappedKey", &self.wrapped_key, KEY_SIZE + MAC_SIZE)?,
                    key_nonce: decode_array("keyNonce", &self.key_nonce)?,
                    content_nonce: decode_array("contentNonce", &self.content_nonce)?,
                    ephemeral_public_key: PublicKey::from_bytes(decode_array(
                        "ephemeralPublicKey",
                        &self.ephemeral_public_key,
                    )?),
                }))
            }
            other => Err(CryptoError::MalformedEnvelope(format!(
                "unknown envelope version {other}"
            ))),
        }
    }
}

fn decode(field: &str, value: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(value)
        .map_err(|e| CryptoError::MalformedEnvelope(format!("{field}: {e}")))
}

fn decode_exact(field: &str, value: &str, len: usize) -> Result<Vec<u8>, CryptoError> {
    let bytes = decode(field, value)?;
    if bytes.len() != len {
        return Err(CryptoError::MalformedEnvelope(format!(
            "{field}: expected {len} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn decode_array<const N: usize>(field: &str, value: &str) -> Result<[u8; N], CryptoError> {
    let bytes = decode_exact(field, value, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}
