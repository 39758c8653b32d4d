//! Publishing side of the relay.
//!
//! A transfer is published as one coordinator artifact, carrying the file metadata and the chunk manifest, followed
//! by one artifact per chunk. The coordinator always goes first: a coordinator visible before its chunks is an
//! accepted consistency window that the receiving side retries through, while chunks without coordinator are simply
//! never looked up.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use tokio::fs;

use crate::artifact::{
    ArtifactDescriptor, ChunkDescriptor, ChunkManifest, CoordinatorIndex, FileMetadata, ManifestEntry, CHUNK_FILE,
    DESCRIPTOR_FILE, INDEX_FILE,
};
use crate::chunk::{self, Chunk};
use crate::config::Settings;
use crate::error::RegistryError;
use crate::ident::{ArtifactId, Scheme, TransferCode, MAX_CHUNKS};
use crate::registry::Registry;
use crate::retry::{RetryPolicy, VisibilityPolicy};
use crate::{Error, Result};

const CODE_DRAWS: usize = 8;
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Outcome of a publish.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Published {
    pub transfer_code: TransferCode,
    pub metadata: FileMetadata,
    /// Artifacts pushed but not confirmed visible before the polling gave up.
    pub unconfirmed: Vec<ArtifactId>,
}

/// Publishes files as registry artifacts.
#[derive(Debug)]
pub struct Publisher<R> {
    registry: R,
    scheme: Scheme,
    chunk_size: NonZeroUsize,
    max_file_size: u64,
    expiry: chrono::Duration,
    /// Days a previous transfer may still hold a code for.
    lookback: u64,
    push_concurrency: usize,
    push_pacing: Duration,
    retry: RetryPolicy,
    visibility: Option<VisibilityPolicy>,
    scratch_dir: PathBuf,
    clock: fn() -> DateTime<Utc>,
}

impl<R: Registry> Publisher<R> {
    pub fn new(registry: R, settings: &Settings) -> Result<Self> {
        settings.validate()?;

        let expiry = chrono::Duration::from_std(settings.expiry).map_err(|_| Error::Config("expiry is out of range".into()))?;

        Ok(Self {
            registry,
            scheme: settings.scheme(),
            chunk_size: settings.chunk_size()?,
            max_file_size: settings.max_file_size,
            expiry,
            lookback: settings.lookback_days(),
            push_concurrency: settings.push_concurrency,
            push_pacing: settings.push_pacing,
            retry: settings.retry_policy(),
            visibility: settings.visibility_policy(),
            scratch_dir: settings.scratch_dir.clone(),
            clock: Utc::now,
        })
    }

    /// Use another clock to date transfers.
    #[inline]
    pub fn with_clock(self, clock: fn() -> DateTime<Utc>) -> Self {
        Self { clock, ..self }
    }

    #[inline]
    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Publish a local file.
    ///
    /// `name` defaults to the file name and `mime_type` to `application/octet-stream`.
    pub async fn publish_file(&self, path: impl AsRef<Path>, name: Option<&str>, mime_type: Option<&str>) -> Result<Published> {
        let path = path.as_ref();

        let size = fs::metadata(path).await?.len();
        if size > self.max_file_size {
            return Err(Error::FileTooLarge {
                size,
                max: self.max_file_size,
            });
        }

        let name = match name {
            Some(name) => name.to_owned(),
            None => path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default(),
        };

        let data = fs::read(path).await?;

        self.publish(&name, mime_type.unwrap_or(DEFAULT_MIME_TYPE), data).await
    }

    /// Publish in-memory content under `name`.
    pub async fn publish(&self, name: &str, mime_type: &str, data: impl Into<Bytes>) -> Result<Published> {
        let data = data.into();
        let size = data.len() as u64;

        if size > self.max_file_size {
            return Err(Error::FileTooLarge {
                size,
                max: self.max_file_size,
            });
        }

        let total_chunks = chunk::chunk_count(size, self.chunk_size);
        if total_chunks > MAX_CHUNKS {
            return Err(Error::TooManyChunks(total_chunks - 1));
        }

        let now = (self.clock)();
        let date = now.date_naive();
        let transfer_code = self.allocate_code(date).await?;

        let chunks = chunk::split(data, self.chunk_size);

        let metadata = FileMetadata {
            name: name.to_owned(),
            size,
            mime_type: mime_type.to_owned(),
            total_chunks: chunks.len(),
            transfer_code: transfer_code.clone(),
            created_at: now,
            expires_at: now + self.expiry,
        };

        let entries = chunks
            .iter()
            .map(|chunk| {
                let id = self.scheme.chunk_id(&transfer_code, chunk.index, date)?;
                Ok(ManifestEntry {
                    index: chunk.index,
                    name: id.name,
                    version: id.version,
                    hash: chunk.hash.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let index = CoordinatorIndex {
            metadata,
            chunks: ChunkManifest::new(entries),
        };

        fs::create_dir_all(&self.scratch_dir).await?;
        let scratch = tempfile::Builder::new().prefix("publish-").tempdir_in(&self.scratch_dir)?;

        tracing::debug!("Publishing transfer {transfer_code} ({size} bytes, {} chunks)", chunks.len());

        let result = self.publish_staged(scratch.path(), date, &index, chunks, now).await;

        // always remove the scratch area, whatever the outcome
        if let Err(err) = scratch.close() {
            tracing::warn!("Cannot remove publish scratch area: {err}");
        }

        let unconfirmed = result?;

        tracing::info!("Published transfer {transfer_code}: `{}` ({size} bytes)", index.metadata.name);

        Ok(Published {
            transfer_code,
            metadata: index.metadata,
            unconfirmed,
        })
    }

    async fn publish_staged(
        &self,
        scratch: &Path,
        date: NaiveDate,
        index: &CoordinatorIndex,
        chunks: Vec<Chunk>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ArtifactId>> {
        let metadata = &index.metadata;
        let coordinator = self.scheme.coordinator_id(&metadata.transfer_code, date);

        let descriptor = serde_json::to_vec_pretty(&ArtifactDescriptor::coordinator(&coordinator))?;
        let payload = serde_json::to_vec_pretty(index)?;

        let mut unconfirmed = vec![];

        unconfirmed.extend(
            self.push(scratch, "coordinator", &coordinator, [(DESCRIPTOR_FILE, &descriptor[..]), (INDEX_FILE, &payload[..])])
                .await?,
        );

        // both are sorted by index
        let pending = chunks.into_iter().zip(index.chunks.iter().map(ManifestEntry::id));

        let push_chunk = |(chunk, id): (Chunk, ArtifactId)| async move {
            let descriptor = ArtifactDescriptor::chunk(
                &id,
                ChunkDescriptor {
                    index: chunk.index,
                    hash: chunk.hash.clone(),
                    transfer_code: metadata.transfer_code.clone(),
                    total_chunks: metadata.total_chunks,
                    original_name: metadata.name.clone(),
                    timestamp: now,
                },
            );
            let descriptor = serde_json::to_vec_pretty(&descriptor)?;

            let role = format!("chunk-{}", chunk.index);

            self.push(scratch, &role, &id, [(DESCRIPTOR_FILE, &descriptor[..]), (CHUNK_FILE, &chunk.data[..])]).await
        };

        if self.push_concurrency <= 1 {
            for pending in pending {
                // pace sequential pushes to stay under registry rate limits
                tokio::time::sleep(self.push_pacing).await;

                unconfirmed.extend(push_chunk(pending).await?);
            }
        } else {
            let pushed: Vec<_> = stream::iter(pending)
                .map(push_chunk)
                .buffer_unordered(self.push_concurrency)
                .try_collect()
                .await?;

            unconfirmed.extend(pushed.into_iter().flatten());
        }

        Ok(unconfirmed)
    }

    /// Stage `files` in the `role` subdirectory of `scratch`, push them as artifact `id` and wait for their visibility.
    ///
    /// Return the artifact id back if it could not be confirmed visible.
    async fn push<const N: usize>(
        &self,
        scratch: &Path,
        role: &str,
        id: &ArtifactId,
        files: [(&str, &[u8]); N],
    ) -> Result<Option<ArtifactId>> {
        let dir = scratch.join(role);
        fs::create_dir_all(&dir).await?;

        let mut paths = Vec::with_capacity(N);
        for (name, data) in files {
            let path = dir.join(name);
            fs::write(&path, data).await?;
            paths.push(path);
        }

        tracing::debug!("Pushing {role} artifact {id}");

        self.retry.run(id, || self.registry.push(id, &paths)).await?;

        // staged chunks are not needed anymore, do not wait for the end of the transfer to free disk space
        fs::remove_dir_all(&dir).await?;

        let Some(visibility) = self.visibility else {
            return Ok(None);
        };

        if visibility.wait_visible(&self.registry, id).await? {
            Ok(None)
        } else {
            tracing::warn!("{id} pushed but still not visible after {} polls", visibility.attempts);
            Ok(Some(id.clone()))
        }
    }

    /// Draw a transfer code that no coordinator within the receivers' lookback window still holds.
    async fn allocate_code(&self, today: NaiveDate) -> Result<TransferCode> {
        'draws: for _ in 0..CODE_DRAWS {
            let code = TransferCode::generate();

            for (_, id) in self.scheme.coordinator_window(&code, today, self.lookback) {
                match self.retry.run(&id, || self.registry.fetch_field(&id, "/version")).await {
                    Ok(_) => {
                        tracing::debug!("Transfer code {code} still held by {id}");
                        continue 'draws;
                    }
                    Err(Error::Registry(RegistryError::NotFound(_))) => {}
                    Err(err) => return Err(err),
                }
            }

            return Ok(code);
        }

        Err(Error::CodeExhausted(CODE_DRAWS))
    }
}
