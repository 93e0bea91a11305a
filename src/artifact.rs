use crate::error::SyncError;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// A finished capture artifact: path, length, and its SHA-256 over the
/// full content. The hash is computed exactly once, after capture stops.
#[derive(Debug, Clone)]
pub struct ArtifactRef {
    pub local_path: PathBuf,
    pub byte_length: u64,
    pub content_hash: String,
}

impl ArtifactRef {
    /// Read the finished capture file once, hash it, and keep the bytes
    /// for the upload pipeline. Missing or zero-length files are invalid.
    pub async fn from_file(path: &Path) -> Result<(ArtifactRef, Bytes), SyncError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| SyncError::Validation(format!("cannot read {}: {}", path.display(), e)))?;
        if data.is_empty() {
            return Err(SyncError::Validation(format!(
                "artifact {} is zero-length",
                path.display()
            )));
        }
        let artifact = ArtifactRef {
            local_path: path.to_path_buf(),
            byte_length: data.len() as u64,
            content_hash: content_hash(&data),
        };
        Ok((artifact, Bytes::from(data)))
    }
}

/// SHA-256 of the full content, as 64 lowercase hex chars.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// One contiguous byte range of the artifact, sent in a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub length: u64,
}

impl Chunk {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Partition `[0, total_length)` into fixed-size chunks. The last chunk
/// may be shorter; a single chunk covers the whole artifact when
/// `total_length < chunk_size`. `chunk_size` must be positive.
pub fn plan_chunks(total_length: u64, chunk_size: u64) -> Vec<Chunk> {
    assert!(chunk_size > 0, "chunk_size must be positive");
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < total_length {
        let length = chunk_size.min(total_length - offset);
        chunks.push(Chunk { offset, length });
        offset += length;
    }
    chunks
}
