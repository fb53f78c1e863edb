//! Interchangeable ways of reading source media and writing decrypted media.
//!
//! Adapters try read strategies in order until one succeeds, and cycle
//! through write strategies until a write passes the length check.

use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use zeroize::Zeroizing;

use crate::engine::Plaintext;
use crate::error::CryptoError;

const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

#[async_trait]
pub trait ReadStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Read the whole file, refusing anything over `max_bytes`.
    async fn read(&self, path: &Path, max_bytes: usize) -> Result<Plaintext, CryptoError>;
}

#[async_trait]
pub trait WriteStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), CryptoError>;
}

/// Single `fs::read` after a size check.
pub struct WholeFileRead;

#[async_trait]
impl ReadStrategy for WholeFileRead {
    fn name(&self) -> &'static str {
        "whole-file"
    }

    async fn read(&self, path: &Path, max_bytes: usize) -> Result<Plaintext, CryptoError> {
        let len = tokio::fs::metadata(path).await?.len();
        if len > max_bytes as u64 {
            return Err(CryptoError::PayloadTooLarge { limit: max_bytes });
        }
        Ok(Zeroizing::new(tokio::fs::read(path).await?))
    }
}

/// Streamed read in fixed-size chunks, bounded as it goes.
pub struct ChunkedRead {
    chunk_size: usize,
}

impl ChunkedRead {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Default for ChunkedRead {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

#[async_trait]
impl ReadStrategy for ChunkedRead {
    fn name(&self) -> &'static str {
        "chunked"
    }

    async fn read(&self, path: &Path, max_bytes: usize) -> Result<Plaintext, CryptoError> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut out = Zeroizing::new(Vec::new());
        let mut chunk = Zeroizing::new(vec![0u8; self.chunk_size]);
        loop {
            let n = file.read(&mut chunk[..]).await?;
            if n == 0 {
                break;
            }
            if out.len() + n > max_bytes {
                return Err(CryptoError::PayloadTooLarge { limit: max_bytes });
            }
            out.extend_from_slice(&chunk[..n]);
        }
        Ok(out)
    }
}

/// Single `fs::write`.
pub struct DirectWrite;

#[async_trait]
impl WriteStrategy for DirectWrite {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), CryptoError> {
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }
}

/// Chunked write followed by flush and fsync.
pub struct ChunkedWrite {
    chunk_size: usize,
}

impl ChunkedWrite {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Default for ChunkedWrite {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

#[async_trait]
impl WriteStrategy for ChunkedWrite {
    fn name(&self) -> &'static str {
        "chunked-sync"
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), CryptoError> {
        let mut file = tokio::fs::File::create(path).await?;
        for chunk in bytes.chunks(self.chunk_size) {
            file.write_all(chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

pub fn default_read_strategies() -> Vec<Box<dyn ReadStrategy>> {
    vec![Box::new(WholeFileRead), Box::new(ChunkedRead::default())]
}

pub fn default_write_strategies() -> Vec<Box<dyn WriteStrategy>> {
    vec![Box::new(DirectWrite), Box::new(ChunkedWrite::default())]
}
