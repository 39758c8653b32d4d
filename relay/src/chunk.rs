//! Chunk codec.
//!
//! Splits raw bytes into fixed-size, individually hashed chunks and merges them back while checking
//! order, completeness and total length.

use std::num::NonZeroUsize;

use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Default chunk size: 5 MiB.
pub const DEFAULT_CHUNK_SIZE: NonZeroUsize = match NonZeroUsize::new(5 * 1_024 * 1_024) {
    Some(size) => size,
    None => unreachable!(),
};

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// One slice of a transferred file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// 0-based position within the transfer.
    pub index: usize,
    /// Raw bytes, at most one chunk size long.
    pub data: Bytes,
    /// Hex-encoded SHA-256 of `data`.
    pub hash: String,
}

impl Chunk {
    /// Build a chunk, hashing its content.
    pub fn new(index: usize, data: Bytes) -> Self {
        let hash = checksum(&data);
        Self { index, data, hash }
    }

    /// Check the chunk content against an expected digest.
    pub fn verify(&self, expected: &str) -> Result<()> {
        let actual = checksum(&self.data);
        if actual.eq_ignore_ascii_case(expected) {
            Ok(())
        } else {
            Err(Error::HashMismatch {
                index: self.index,
                expected: expected.to_owned(),
                actual,
            })
        }
    }
}

/// Number of chunks needed for `size` bytes.
#[inline]
pub fn chunk_count(size: u64, chunk_size: NonZeroUsize) -> usize {
    size.div_ceil(chunk_size.get() as u64) as usize
}

/// Split `data` into chunks of `chunk_size` bytes, the last one possibly shorter.
///
/// Chunks share the input buffer, no byte is copied.
///
/// ```
/// # use relay::chunk::split;
/// let chunks = split("ABCDEFG", 3.try_into().unwrap());
///
/// let data: Vec<_> = chunks.iter().map(|chunk| &chunk.data[..]).collect();
/// assert_eq!(data, [&b"ABC"[..], b"DEF", b"G"]);
/// ```
pub fn split(data: impl Into<Bytes>, chunk_size: NonZeroUsize) -> Vec<Chunk> {
    let data = data.into();
    let size = chunk_size.get();

    (0..data.len())
        .step_by(size)
        .enumerate()
        .map(|(index, start)| Chunk::new(index, data.slice(start..data.len().min(start + size))))
        .collect()
}

/// Concatenate chunks by ascending index.
///
/// Chunks may be given in any order. Every index of `0..total_chunks` must be present exactly once and the
/// concatenated length must equal `expected_size`.
pub fn merge(chunks: impl IntoIterator<Item = Chunk>, total_chunks: usize, expected_size: u64) -> Result<Bytes> {
    let mut slots: Vec<Option<Bytes>> = vec![None; total_chunks];

    for chunk in chunks {
        match slots.get_mut(chunk.index) {
            Some(slot @ None) => *slot = Some(chunk.data),
            _ => return Err(Error::InvalidChunkIndex(chunk.index)),
        }
    }

    if let Some(index) = slots.iter().position(Option::is_none) {
        return Err(Error::MissingChunk(index));
    }

    let actual: u64 = slots.iter().flatten().map(|data| data.len() as u64).sum();
    if actual != expected_size {
        return Err(Error::SizeMismatch {
            expected: expected_size,
            actual,
        });
    }

    let mut merged = BytesMut::with_capacity(actual as usize);
    for data in slots.into_iter().flatten() {
        merged.extend_from_slice(&data);
    }

    Ok(merged.freeze())
}
