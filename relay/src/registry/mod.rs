//! Registry client contract.
//!
//! The registry is treated as an append-only, eventually-consistent, versioned blob store keyed by
//! `(name, version)`. The engine only relies on three operations and on the classification of their failures
//! (see [`RegistryError`]).

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use crate::artifact::DESCRIPTOR_FILE;
use crate::error::RegistryError;
use crate::ident::ArtifactId;

mod http;
pub use http::*;

mod memory;
pub use memory::*;

/// Files of one artifact, by file name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    files: BTreeMap<String, Bytes>,
}

impl Payload {
    #[inline]
    pub fn insert(&mut self, name: impl Into<String>, data: impl Into<Bytes>) {
        self.files.insert(name.into(), data.into());
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.files.get(name)
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Bytes)> {
        self.files.iter()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Read one field of the artifact descriptor, addressed by a JSON pointer (eg. `/version`).
    pub fn descriptor_field(&self, id: &ArtifactId, pointer: &str) -> Result<serde_json::Value, RegistryError> {
        let descriptor = self.get(DESCRIPTOR_FILE).ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        let descriptor: serde_json::Value = serde_json::from_slice(descriptor)
            .map_err(|err| RegistryError::Fatal(format!("malformed descriptor for {id}: {err}")))?;

        descriptor.pointer(pointer).cloned().ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    /// Read staged files from the local file system.
    pub async fn read(files: &[PathBuf]) -> Result<Self, RegistryError> {
        let mut payload = Payload::default();

        for path in files {
            let name = path
                .file_name()
                .and_then(|name| name.to_str())
                .ok_or_else(|| RegistryError::Fatal(format!("invalid staged file: `{}`", path.display())))?;
            let data = tokio::fs::read(path)
                .await
                .map_err(|err| RegistryError::Fatal(format!("cannot read staged file `{}`: {err}", path.display())))?;

            payload.insert(name, data);
        }

        Ok(payload)
    }
}

impl FromIterator<(String, Bytes)> for Payload {
    fn from_iter<I: IntoIterator<Item = (String, Bytes)>>(iter: I) -> Self {
        Self {
            files: FromIterator::from_iter(iter),
        }
    }
}

/// Versioned artifact registry interface.
pub trait Registry: Send + Sync {
    /// Publish the staged `files` as artifact `id`.
    fn push(&self, id: &ArtifactId, files: &[PathBuf]) -> impl Future<Output = Result<(), RegistryError>> + Send;

    /// Fetch every file of artifact `id`.
    fn fetch(&self, id: &ArtifactId) -> impl Future<Output = Result<Payload, RegistryError>> + Send;

    /// Fetch one field of the descriptor of artifact `id`, addressed by a JSON pointer.
    fn fetch_field(&self, id: &ArtifactId, pointer: &str) -> impl Future<Output = Result<serde_json::Value, RegistryError>> + Send;
}

impl<R: Registry> Registry for Arc<R> {
    #[inline]
    fn push(&self, id: &ArtifactId, files: &[PathBuf]) -> impl Future<Output = Result<(), RegistryError>> + Send {
        (**self).push(id, files)
    }

    #[inline]
    fn fetch(&self, id: &ArtifactId) -> impl Future<Output = Result<Payload, RegistryError>> + Send {
        (**self).fetch(id)
    }

    #[inline]
    fn fetch_field(&self, id: &ArtifactId, pointer: &str) -> impl Future<Output = Result<serde_json::Value, RegistryError>> + Send {
        (**self).fetch_field(id, pointer)
    }
}
