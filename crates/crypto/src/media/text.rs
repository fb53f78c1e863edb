use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use zeroize::{Zeroize, Zeroizing};

use super::{MediaKind, MediaMetadata, Recipient};
use crate::engine;
use crate::envelope::EnvelopeHeader;
use crate::error::CryptoError;
use crate::primitives::SecretKey;

/// Text messages: UTF-8 in, UTF-8 out, ciphertext inline.
pub struct TextAdapter;

impl TextAdapter {
    pub fn encrypt(text: &str, recipient: impl Into<Recipient>) -> Result<MediaMetadata, CryptoError> {
        let recipient = recipient.into();
        let sealed = engine::encrypt(text.as_bytes(), &recipient.public_key)?;
        Ok(MediaMetadata {
            kind: MediaKind::Text,
            blob_key: None,
            inline_ciphertext: Some(STANDARD.encode(&sealed.ciphertext)),
            envelope: EnvelopeHeader::of(&sealed),
            plaintext_len: text.len() as u64,
            recipient_key_record_id: recipient.record_id,
        })
    }

    pub fn decrypt(metadata: &MediaMetadata, recipient: &SecretKey) -> Result<Zeroizing<String>, CryptoError> {
        if metadata.kind != MediaKind::Text {
            return Err(CryptoError::MalformedEnvelope(format!(
                "expected text metadata, got {}",
                metadata.kind
            )));
        }
        let encoded = metadata
            .inline_ciphertext
            .as_deref()
            .ok_or_else(|| CryptoError::MalformedEnvelope("text metadata has no ciphertext".into()))?;
        let ciphertext = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::MalformedEnvelope(format!("ciphertext: {e}")))?;

        let envelope = metadata.envelope.with_ciphertext(ciphertext)?;
        let mut plaintext = engine::decrypt(&envelope, recipient)?;
        match String::from_utf8(std::mem::take(&mut *plaintext)) {
            Ok(text) => Ok(Zeroizing::new(text)),
            Err(e) => {
                e.into_bytes().zeroize();
                Err(CryptoError::MalformedEnvelope("plaintext is not UTF-8".into()))
            }
        }
    }
}
