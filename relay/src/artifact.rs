//! Artifact payload model.
//!
//! Every published artifact carries a [`ArtifactDescriptor`] (`package.json`) next to its payload: the coordinator
//! stores a [`CoordinatorIndex`] (`index.json`), each chunk stores its raw bytes (`chunk.bin`).

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ident::{ArtifactId, TransferCode};
use crate::{Error, Result};

pub const DESCRIPTOR_FILE: &str = "package.json";
pub const INDEX_FILE: &str = "index.json";
pub const CHUNK_FILE: &str = "chunk.bin";

/// Description of a transferred file, immutable once published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Original file name.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub total_chunks: usize,
    pub transfer_code: TransferCode,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FileMetadata {
    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Location and digest of one chunk artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub index: usize,
    pub name: String,
    pub version: String,
    pub hash: String,
}

impl ManifestEntry {
    pub fn id(&self) -> ArtifactId {
        ArtifactId::new(&self.name, &self.version)
    }
}

/// Ordered list of the chunk artifacts making a transfer.
///
/// Serialized as a plain array. Entries are sorted by index on the way in, whatever order the publisher wrote them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<ManifestEntry>", into = "Vec<ManifestEntry>")]
pub struct ChunkManifest(Vec<ManifestEntry>);

impl ChunkManifest {
    /// Build a manifest, sorting entries by index.
    pub fn new(mut entries: Vec<ManifestEntry>) -> Self {
        entries.sort_by_key(|entry| entry.index);
        Self(entries)
    }

    /// Check that indices are exactly `0..total_chunks`, without gaps nor duplicates.
    pub fn validate(&self, total_chunks: usize) -> Result<()> {
        if self.0.len() != total_chunks {
            return Err(Error::IncompleteManifest(format!(
                "{} entries for {total_chunks} chunks",
                self.0.len()
            )));
        }

        let mut seen = BTreeSet::new();
        for entry in &self.0 {
            if entry.index >= total_chunks || !seen.insert(entry.index) {
                return Err(Error::IncompleteManifest(format!("unexpected chunk index {}", entry.index)));
            }
        }

        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, ManifestEntry> {
        self.0.iter()
    }
}

impl From<Vec<ManifestEntry>> for ChunkManifest {
    fn from(entries: Vec<ManifestEntry>) -> Self {
        Self::new(entries)
    }
}

impl From<ChunkManifest> for Vec<ManifestEntry> {
    fn from(manifest: ChunkManifest) -> Self {
        manifest.0
    }
}

impl<'a> IntoIterator for &'a ChunkManifest {
    type Item = &'a ManifestEntry;
    type IntoIter = std::slice::Iter<'a, ManifestEntry>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Payload of the coordinator artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorIndex {
    pub metadata: FileMetadata,
    pub chunks: ChunkManifest,
}

impl CoordinatorIndex {
    /// Parse and validate a coordinator payload.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let index: Self = serde_json::from_slice(bytes)?;
        index.chunks.validate(index.metadata.total_chunks)?;
        Ok(index)
    }
}

/// Chunk details recorded in a chunk artifact descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    pub index: usize,
    pub hash: String,
    pub transfer_code: TransferCode,
    pub total_chunks: usize,
    pub original_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Descriptor staged next to every artifact payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub name: String,
    pub version: String,
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkDescriptor>,
}

impl ArtifactDescriptor {
    pub fn coordinator(id: &ArtifactId) -> Self {
        Self {
            name: id.name.clone(),
            version: id.version.clone(),
            files: vec![INDEX_FILE.to_owned()],
            chunk: None,
        }
    }

    pub fn chunk(id: &ArtifactId, chunk: ChunkDescriptor) -> Self {
        Self {
            name: id.name.clone(),
            version: id.version.clone(),
            files: vec![CHUNK_FILE.to_owned()],
            chunk: Some(chunk),
        }
    }
}
