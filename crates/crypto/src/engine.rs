//! Hybrid encryption engine.
//!
//! Each payload is sealed with a fresh content key (secretbox), and that key
//! is wrapped for the recipient with an asymmetric box from a single-use
//! ephemeral keypair. The engine is stateless: everything needed to decrypt
//! travels in the envelope, so decrypt is idempotent and safe to retry.
//!
//! Large payloads use the same protocol. Only I/O is streamed; the AEAD seal
//! and open always run over the whole buffer at once.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use veilbox_shared::ids::MessageId;
use zeroize::Zeroizing;

use crate::diagnostics::{DiagnosticContext, Operation};
use crate::envelope::{Envelope, SealedEnvelope};
use crate::error::CryptoError;
use crate::primitives::{self, ContentKey, KeyPair, PublicKey, SecretKey};

/// Writes to the sink happen in pieces of this size.
const WRITE_CHUNK_SIZE: usize = 64 * 1024;

/// Decrypted bytes, wiped when dropped.
pub type Plaintext = Zeroizing<Vec<u8>>;

/// Encrypt `plaintext` for `recipient` with a fresh ephemeral sender key.
pub fn encrypt(plaintext: &[u8], recipient: &PublicKey) -> Result<SealedEnvelope, CryptoError> {
    let ephemeral = KeyPair::generate()?;
    seal_with(plaintext, recipient, &ephemeral)
}

/// Encrypt with a caller-supplied long-term sender key instead of an ephemeral one.
///
/// Compromise of `sender` later exposes every envelope sealed this way.
pub fn encrypt_with_sender_key(
    plaintext: &[u8],
    recipient: &PublicKey,
    sender: &KeyPair,
) -> Result<SealedEnvelope, CryptoError> {
    tracing::debug!(len = plaintext.len(), "encrypting with long-term sender key");
    seal_with(plaintext, recipient, sender)
}

fn seal_with(
    plaintext: &[u8],
    recipient: &PublicKey,
    sender: &KeyPair,
) -> Result<SealedEnvelope, CryptoError> {
    let content_key = ContentKey::generate()?;
    let content_nonce = primitives::random_nonce()?;
    let ciphertext = primitives::symmetric_seal(plaintext, &content_nonce, &content_key)?;

    let key_nonce = primitives::random_nonce()?;
    let wrapped_key = primitives::seal(content_key.as_bytes(), &key_nonce, recipient, &sender.secret)?;

    Ok(SealedEnvelope {
        ciphertext,
        wrapped_key,
        key_nonce,
        content_nonce,
        ephemeral_public_key: sender.public,
    })
}

/// Decrypt an envelope with the recipient's private key.
///
/// Both AEAD failures surface as "decryption failed"; the variants only say
/// which stage rejected the input, not why.
pub fn decrypt(envelope: &Envelope, recipient: &SecretKey) -> Result<Plaintext, CryptoError> {
    let sealed = match envelope {
        Envelope::Legacy(legacy) => {
            tracing::warn!(version = legacy.version, "rejecting legacy envelope");
            return Err(CryptoError::UnsupportedLegacyVersion {
                version: legacy.version,
            });
        }
        Envelope::V3(sealed) => sealed,
    };

    if !sealed.ephemeral_public_key.is_canonical() {
        return Err(CryptoError::KeyUnwrapFailed);
    }
    let key_bytes = Zeroizing::new(
        primitives::open(
            &sealed.wrapped_key,
            &sealed.key_nonce,
            &sealed.ephemeral_public_key,
            recipient,
        )
        .map_err(|_| CryptoError::KeyUnwrapFailed)?,
    );
    let content_key = ContentKey::from_slice(&key_bytes).map_err(|_| CryptoError::KeyUnwrapFailed)?;

    let plaintext =
        primitives::symmetric_open(&sealed.ciphertext, &sealed.content_nonce, &content_key)
            .map_err(|_| CryptoError::ContentAuthenticationFailed)?;
    Ok(Zeroizing::new(plaintext))
}

/// [`encrypt`], recording the outcome in `ctx`.
pub fn encrypt_with_diagnostics(
    plaintext: &[u8],
    recipient: &PublicKey,
    ctx: &mut DiagnosticContext,
    message_id: Option<MessageId>,
) -> Result<SealedEnvelope, CryptoError> {
    let result = encrypt(plaintext, recipient);
    ctx.record(
        Operation::Encrypt,
        message_id,
        plaintext.len(),
        veilbox_shared::constants::CURRENT_ENVELOPE_VERSION,
        result.as_ref().map(|_| ()),
    );
    result
}

/// [`decrypt`], recording the outcome in `ctx`.
pub fn decrypt_with_diagnostics(
    envelope: &Envelope,
    recipient: &SecretKey,
    ctx: &mut DiagnosticContext,
    message_id: Option<MessageId>,
) -> Result<Plaintext, CryptoError> {
    let result = decrypt(envelope, recipient);
    let len = match &result {
        Ok(plaintext) => plaintext.len(),
        Err(_) => 0,
    };
    ctx.record(
        Operation::Decrypt,
        message_id,
        len,
        envelope.version(),
        result.as_ref().map(|_| ()),
    );
    result
}

/// Read up to `max_bytes` from `source` and encrypt it as one payload.
pub async fn encrypt_large_payload<R>(
    source: R,
    recipient: &PublicKey,
    max_bytes: usize,
) -> Result<SealedEnvelope, CryptoError>
where
    R: AsyncRead + Unpin,
{
    let plaintext = read_bounded(source, max_bytes).await?;
    tracing::debug!(len = plaintext.len(), "encrypting large payload");
    encrypt(&plaintext, recipient)
}

/// Decrypt `envelope` and stream the plaintext into `sink`.
///
/// Returns the number of bytes written. Nothing is written unless the whole
/// payload authenticated.
pub async fn decrypt_large_payload<W>(
    envelope: &Envelope,
    recipient: &SecretKey,
    mut sink: W,
) -> Result<u64, CryptoError>
where
    W: AsyncWrite + Unpin,
{
    let plaintext = decrypt(envelope, recipient)?;
    for chunk in plaintext.chunks(WRITE_CHUNK_SIZE) {
        sink.write_all(chunk).await?;
    }
    sink.flush().await?;
    tracing::debug!(len = plaintext.len(), "decrypted large payload");
    Ok(plaintext.len() as u64)
}

/// Read all of `source`, failing once more than `max_bytes` arrive.
pub(crate) async fn read_bounded<R>(source: R, max_bytes: usize) -> Result<Plaintext, CryptoError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Zeroizing::new(Vec::new());
    let limit = (max_bytes as u64).saturating_add(1);
    source.take(limit).read_to_end(&mut *buf).await?;
    if buf.len() > max_bytes {
        return Err(CryptoError::PayloadTooLarge { limit: max_bytes });
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::MessageStatus;
    use crate::envelope::LegacyEnvelope;
    use crate::primitives::KEY_SIZE;

    fn flip_bit(bytes: &mut [u8], index: usize) {
        bytes[index] ^= 0x01;
    }

    #[test]
    fn roundtrip_various_sizes() {
        let bob = KeyPair::generate().unwrap();
        for len in [0usize, 1, 1024, 10 * 1024 * 1024] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let envelope = Envelope::from(encrypt(&plaintext, &bob.public).unwrap());
            let decrypted = decrypt(&envelope, &bob.secret).unwrap();
            assert_eq!(decrypted.as_slice(), plaintext.as_slice(), "len {len}");
        }
    }

    #[test]
    fn nonces_and_ephemeral_keys_are_fresh() {
        let bob = KeyPair::generate().unwrap();
        let a = encrypt(b"same", &bob.public).unwrap();
        let b = encrypt(b"same", &bob.public).unwrap();
        assert_ne!(a.key_nonce, b.key_nonce);
        assert_ne!(a.content_nonce, b.content_nonce);
        assert_ne!(a.ephemeral_public_key, b.ephemeral_public_key);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn tampering_any_field_fails() {
        let bob = KeyPair::generate().unwrap();
        let original = encrypt(b"do not alter", &bob.public).unwrap();

        let mut cases = Vec::new();
        let mut e = original.clone();
        flip_bit(&mut e.ciphertext, 0);
        cases.push(("ciphertext", e, true));
        let mut e = original.clone();
        flip_bit(&mut e.wrapped_key, 3);
        cases.push(("wrapped_key", e, false));
        let mut e = original.clone();
        flip_bit(&mut e.key_nonce, 23);
        cases.push(("key_nonce", e, false));
        let mut e = original.clone();
        flip_bit(&mut e.content_nonce, 0);
        cases.push(("content_nonce", e, true));
        for bit in 0..KEY_SIZE * 8 {
            let mut e = original.clone();
            let mut pk = *e.ephemeral_public_key.as_bytes();
            pk[bit / 8] ^= 1 << (bit % 8);
            e.ephemeral_public_key = PublicKey::from_bytes(pk);
            cases.push(("ephemeral_public_key", e, false));
        }

        for (field, tampered, content_stage) in cases {
            let result = decrypt(&Envelope::from(tampered), &bob.secret);
            if content_stage {
                assert!(
                    matches!(result, Err(CryptoError::ContentAuthenticationFailed)),
                    "{field}"
                );
            } else {
                assert!(matches!(result, Err(CryptoError::KeyUnwrapFailed)), "{field}");
            }
        }
    }

    #[test]
    fn wrong_recipient_key_fails() {
        let bob = KeyPair::generate().unwrap();
        let eve = KeyPair::generate().unwrap();
        let envelope = Envelope::from(encrypt(b"for bob", &bob.public).unwrap());
        assert!(matches!(
            decrypt(&envelope, &eve.secret),
            Err(CryptoError::KeyUnwrapFailed)
        ));
    }

    #[test]
    fn legacy_envelope_is_rejected() {
        let bob = KeyPair::generate().unwrap();
        for version in [0, 1, 2] {
            let envelope = Envelope::Legacy(LegacyEnvelope { version });
            let err = decrypt(&envelope, &bob.secret).unwrap_err();
            assert!(matches!(err, CryptoError::UnsupportedLegacyVersion { version: v } if v == version));
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn decrypt_is_idempotent() {
        let bob = KeyPair::generate().unwrap();
        let envelope = Envelope::from(encrypt(b"twice", &bob.public).unwrap());
        let first = decrypt(&envelope, &bob.secret).unwrap();
        let second = decrypt(&envelope, &bob.secret).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn long_term_sender_key_is_carried_in_envelope() {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap();
        let sealed = encrypt_with_sender_key(b"signed-ish", &bob.public, &alice).unwrap();
        assert_eq!(sealed.ephemeral_public_key, alice.public);
        let plaintext = decrypt(&Envelope::from(sealed), &bob.secret).unwrap();
        assert_eq!(plaintext.as_slice(), b"signed-ish");
    }

    #[test]
    fn diagnostics_record_both_directions() {
        let bob = KeyPair::generate().unwrap();
        let eve = KeyPair::generate().unwrap();
        let mut ctx = DiagnosticContext::new();
        let id = MessageId::new();

        let sealed = encrypt_with_diagnostics(b"hi", &bob.public, &mut ctx, Some(id)).unwrap();
        assert_eq!(ctx.status(&id), Some(&MessageStatus::Encrypted));

        let envelope = Envelope::from(sealed);
        assert!(decrypt_with_diagnostics(&envelope, &eve.secret, &mut ctx, Some(id)).is_err());
        assert!(matches!(ctx.status(&id), Some(MessageStatus::Failed { .. })));

        decrypt_with_diagnostics(&envelope, &bob.secret, &mut ctx, Some(id)).unwrap();
        assert_eq!(ctx.status(&id), Some(&MessageStatus::Decrypted));
        assert_eq!(ctx.events().len(), 3);
    }

    #[tokio::test]
    async fn large_payload_roundtrip() {
        let bob = KeyPair::generate().unwrap();
        let payload = vec![0x5Au8; 300 * 1024];
        let sealed = encrypt_large_payload(payload.as_slice(), &bob.public, payload.len())
            .await
            .unwrap();

        let mut sink = Vec::new();
        let written = decrypt_large_payload(&Envelope::from(sealed), &bob.secret, &mut sink)
            .await
            .unwrap();
        assert_eq!(written, payload.len() as u64);
        assert_eq!(sink, payload);
    }

    #[tokio::test]
    async fn large_payload_over_limit_is_rejected() {
        let bob = KeyPair::generate().unwrap();
        let payload = vec![0u8; 1025];
        let result = encrypt_large_payload(payload.as_slice(), &bob.public, 1024).await;
        assert!(matches!(result, Err(CryptoError::PayloadTooLarge { limit: 1024 })));
    }

    #[tokio::test]
    async fn failed_large_decrypt_writes_nothing() {
        let bob = KeyPair::generate().unwrap();
        let mut sealed = encrypt(&[1u8; 4096], &bob.public).unwrap();
        let last = sealed.ciphertext.len() - 1;
        flip_bit(&mut sealed.ciphertext, last);

        let mut sink = Vec::new();
        let result = decrypt_large_payload(&Envelope::from(sealed), &bob.secret, &mut sink).await;
        assert!(matches!(result, Err(CryptoError::ContentAuthenticationFailed)));
        assert!(sink.is_empty());
    }
}
