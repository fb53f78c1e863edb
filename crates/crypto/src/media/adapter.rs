//! Audio and video adapters: blob upload, file I/O strategies, and verified writes.

use std::path::Path;
use std::sync::Arc;

use super::strategies::{default_read_strategies, default_write_strategies, ReadStrategy, WriteStrategy};
use super::{blob_key, BlobStore, MediaKind, MediaMetadata, Recipient};
use crate::config::{BlobNaming, MediaConfig};
use crate::engine::{self, Plaintext};
use crate::envelope::EnvelopeHeader;
use crate::error::CryptoError;
use crate::primitives::SecretKey;

/// Audio or video driver: engine + blob store + local file I/O.
pub struct MediaAdapter {
    kind: MediaKind,
    blobs: Arc<dyn BlobStore>,
    naming: BlobNaming,
    readers: Vec<Box<dyn ReadStrategy>>,
    writers: Vec<Box<dyn WriteStrategy>>,
    write_retries: u32,
    max_payload_bytes: usize,
}

impl MediaAdapter {
    pub fn audio(blobs: Arc<dyn BlobStore>) -> Self {
        Self::new(MediaKind::Audio, blobs)
    }

    pub fn video(blobs: Arc<dyn BlobStore>) -> Self {
        Self::new(MediaKind::Video, blobs)
    }

    fn new(kind: MediaKind, blobs: Arc<dyn BlobStore>) -> Self {
        let media = MediaConfig::default();
        Self {
            kind,
            blobs,
            naming: BlobNaming::default(),
            readers: default_read_strategies(),
            writers: default_write_strategies(),
            write_retries: media.write_retries,
            max_payload_bytes: media.max_payload_bytes,
        }
    }

    pub fn with_config(mut self, media: &MediaConfig, naming: BlobNaming) -> Self {
        self.write_retries = media.write_retries.max(1);
        self.max_payload_bytes = media.max_payload_bytes;
        self.naming = naming;
        self
    }

    pub fn with_read_strategies(mut self, readers: Vec<Box<dyn ReadStrategy>>) -> Self {
        self.readers = readers;
        self
    }

    pub fn with_write_strategies(mut self, writers: Vec<Box<dyn WriteStrategy>>) -> Self {
        self.writers = writers;
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Encrypt a local media file and upload its ciphertext.
    pub async fn encrypt_file(
        &self,
        source: &Path,
        recipient: impl Into<Recipient>,
    ) -> Result<MediaMetadata, CryptoError> {
        let plaintext = self.read_source(source).await?;
        self.encrypt_bytes(&plaintext, recipient).await
    }

    /// Encrypt in-memory media and upload its ciphertext.
    pub async fn encrypt_bytes(
        &self,
        plaintext: &[u8],
        recipient: impl Into<Recipient>,
    ) -> Result<MediaMetadata, CryptoError> {
        if plaintext.len() > self.max_payload_bytes {
            return Err(CryptoError::PayloadTooLarge {
                limit: self.max_payload_bytes,
            });
        }
        let recipient = recipient.into();
        let sealed = engine::encrypt(plaintext, &recipient.public_key)?;
        let key = blob_key(self.kind, self.naming, &sealed.ciphertext);
        let envelope = EnvelopeHeader::of(&sealed);
        self.blobs.put(&key, sealed.ciphertext).await?;

        tracing::info!(kind = %self.kind, blob_key = %key, len = plaintext.len(), "uploaded encrypted media");
        Ok(MediaMetadata {
            kind: self.kind,
            blob_key: Some(key),
            inline_ciphertext: None,
            envelope,
            plaintext_len: plaintext.len() as u64,
            recipient_key_record_id: recipient.record_id,
        })
    }

    /// Fetch and decrypt into memory.
    pub async fn decrypt_bytes(
        &self,
        metadata: &MediaMetadata,
        recipient: &SecretKey,
    ) -> Result<Plaintext, CryptoError> {
        let key = self.blob_key_of(metadata)?;
        let ciphertext = self.blobs.get(key).await?;
        let envelope = metadata.envelope.with_ciphertext(ciphertext)?;
        engine::decrypt(&envelope, recipient)
    }

    /// Fetch, decrypt, and write to `sink`, checking the written length.
    ///
    /// Returns the number of bytes written.
    pub async fn decrypt_to_file(
        &self,
        metadata: &MediaMetadata,
        recipient: &SecretKey,
        sink: &Path,
    ) -> Result<u64, CryptoError> {
        let plaintext = self.decrypt_bytes(metadata, recipient).await?;
        self.write_verified(sink, &plaintext).await
    }

    fn blob_key_of<'m>(&self, metadata: &'m MediaMetadata) -> Result<&'m str, CryptoError> {
        if metadata.kind != self.kind {
            return Err(CryptoError::MalformedEnvelope(format!(
                "expected {} metadata, got {}",
                self.kind, metadata.kind
            )));
        }
        metadata
            .blob_key
            .as_deref()
            .ok_or_else(|| CryptoError::MalformedEnvelope("media metadata has no blob key".into()))
    }

    async fn read_source(&self, source: &Path) -> Result<Plaintext, CryptoError> {
        let mut last_err = CryptoError::Io(format!("no read strategy for {}", source.display()));
        for reader in &self.readers {
            match reader.read(source, self.max_payload_bytes).await {
                Ok(bytes) => return Ok(bytes),
                Err(e @ CryptoError::PayloadTooLarge { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(strategy = reader.name(), error = %e, "read strategy failed, trying next");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn write_verified(&self, sink: &Path, bytes: &[u8]) -> Result<u64, CryptoError> {
        if self.writers.is_empty() {
            return Err(CryptoError::Io("no write strategy configured".into()));
        }
        let expected = bytes.len() as u64;
        let mut last_err = None;

        for attempt in 0..self.write_retries as usize {
            let writer = &self.writers[attempt % self.writers.len()];
            let result = match writer.write(sink, bytes).await {
                Ok(()) => check_length(sink, expected).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    tracing::debug!(strategy = writer.name(), len = expected, "decrypted media written");
                    return Ok(expected);
                }
                Err(e) => {
                    tracing::warn!(
                        strategy = writer.name(),
                        attempt = attempt + 1,
                        error = %e,
                        "media write failed verification"
                    );
                    last_err = Some(e);
                }
            }
        }

        let err = match last_err {
            Some(CryptoError::IntegrityMismatch { actual, .. }) => CryptoError::IntegrityRetriesExhausted {
                expected,
                actual,
                attempts: self.write_retries,
            },
            Some(other) => other,
            None => CryptoError::IntegrityRetriesExhausted {
                expected,
                actual: 0,
                attempts: self.write_retries,
            },
        };
        discard_partial(sink).await;
        tracing::error!(error = %err, retries = self.write_retries, "giving up on media write");
        Err(err)
    }
}

/// Remove whatever the failed attempts left at `sink`.
async fn discard_partial(sink: &Path) {
    match tokio::fs::remove_file(sink).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::error!(path = %sink.display(), error = %e, "could not remove partial media file");
        }
    }
}

async fn check_length(sink: &Path, expected: u64) -> Result<(), CryptoError> {
    let actual = tokio::fs::metadata(sink).await?.len();
    if actual != expected {
        return Err(CryptoError::IntegrityMismatch { expected, actual });
    }
    Ok(())
}
