//! Receiving side of the relay: resolve a transfer code, fetch its chunks and reassemble the file.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use futures::future;
use serde::Serialize;

use crate::artifact::{ChunkManifest, CoordinatorIndex, FileMetadata, ManifestEntry, CHUNK_FILE, INDEX_FILE};
use crate::chunk::{self, Chunk};
use crate::config::Settings;
use crate::error::RegistryError;
use crate::ident::{Scheme, TransferCode};
use crate::registry::Registry;
use crate::retry::RetryPolicy;
use crate::store::DownloadStore;
use crate::{Error, Result};

/// A transfer located in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub metadata: FileMetadata,
    pub manifest: ChunkManifest,
    /// Publish date the coordinator was found at.
    pub date: NaiveDate,
}

/// A transfer reassembled in local storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Downloaded {
    pub path: PathBuf,
    pub metadata: FileMetadata,
}

/// Downloads transfers into a [`DownloadStore`].
#[derive(Debug)]
pub struct Downloader<R> {
    registry: R,
    scheme: Scheme,
    fetch_concurrency: usize,
    retry: RetryPolicy,
    /// Days to look back for a coordinator.
    lookback: u64,
    store: DownloadStore,
    clock: fn() -> DateTime<Utc>,
}

impl<R: Registry> Downloader<R> {
    pub fn new(registry: R, settings: &Settings) -> Result<Self> {
        settings.validate()?;

        Ok(Self {
            registry,
            scheme: settings.scheme(),
            fetch_concurrency: settings.fetch_concurrency,
            retry: settings.retry_policy(),
            lookback: settings.lookback_days(),
            store: DownloadStore::new(&settings.download_dir),
            clock: Utc::now,
        })
    }

    /// Use another clock to resolve transfers.
    #[inline]
    pub fn with_clock(self, clock: fn() -> DateTime<Utc>) -> Self {
        Self { clock, ..self }
    }

    #[inline]
    pub fn registry(&self) -> &R {
        &self.registry
    }

    #[inline]
    pub fn store(&self) -> &DownloadStore {
        &self.store
    }

    /// Locate the coordinator of transfer `code`.
    ///
    /// Coordinators are looked up from today back to the oldest date a live transfer could have been published at,
    /// most recent first. Unreadable coordinators are skipped; expired transfers are reported as not found.
    pub async fn resolve(&self, code: &TransferCode) -> Result<Resolved> {
        let now = (self.clock)();
        let today = now.date_naive();

        for (date, id) in self.scheme.coordinator_window(code, today, self.lookback) {
            let payload = match self.retry.run(&id, || self.registry.fetch(&id)).await {
                Ok(payload) => payload,
                Err(Error::Registry(RegistryError::NotFound(_))) => {
                    tracing::trace!("No coordinator at {id}");
                    continue;
                }
                Err(err) => return Err(err),
            };

            let Some(bytes) = payload.get(INDEX_FILE) else {
                tracing::debug!("Skip coordinator {id}: no `{INDEX_FILE}`");
                continue;
            };

            let index = match CoordinatorIndex::from_slice(bytes) {
                Ok(index) if index.metadata.transfer_code == *code => index,
                Ok(index) => {
                    tracing::debug!("Skip coordinator {id}: describes transfer {}", index.metadata.transfer_code);
                    continue;
                }
                Err(Error::Json(err)) => {
                    tracing::debug!("Skip coordinator {id}: {err}");
                    continue;
                }
                Err(err) => return Err(err),
            };

            if index.metadata.is_expired(now) {
                tracing::debug!("Transfer {code} expired at {}", index.metadata.expires_at);
                return Err(Error::NotFound(code.clone()));
            }

            self.check_manifest(code, date, &index.chunks)?;

            tracing::debug!("Resolved transfer {code} at {id}");

            return Ok(Resolved {
                metadata: index.metadata,
                manifest: index.chunks,
                date,
            });
        }

        Err(Error::NotFound(code.clone()))
    }

    /// Every manifest entry must point at the chunk artifact of its own index.
    fn check_manifest(&self, code: &TransferCode, date: NaiveDate, manifest: &ChunkManifest) -> Result<()> {
        for entry in manifest {
            match self.scheme.parse_chunk(&entry.id()) {
                Ok((d, c, index)) if d == date && c == *code && index == entry.index => {}
                _ => {
                    return Err(Error::IncompleteManifest(format!(
                        "chunk {} points at {}",
                        entry.index,
                        entry.id()
                    )))
                }
            }
        }

        Ok(())
    }

    /// Fetch every chunk of a resolved transfer, `fetch_concurrency` at a time.
    ///
    /// A batch completes once all of its fetches completed or failed. Chunks are returned in index order.
    pub async fn fetch_chunks(&self, resolved: &Resolved) -> Result<Vec<Chunk>> {
        let entries: Vec<_> = resolved.manifest.iter().collect();
        let mut chunks = Vec::with_capacity(entries.len());

        for batch in entries.chunks(self.fetch_concurrency) {
            let results = future::join_all(batch.iter().map(|entry| self.fetch_chunk(entry))).await;

            for (entry, result) in batch.iter().zip(results) {
                match result {
                    Ok(chunk) => chunks.push(chunk),
                    Err(err @ (Error::Registry(RegistryError::NotFound(_)) | Error::RetriesExhausted { .. })) => {
                        tracing::debug!("Chunk {} of transfer {} unavailable: {err}", entry.index, resolved.metadata.transfer_code);
                        return Err(Error::MissingChunk(entry.index));
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(chunks)
    }

    async fn fetch_chunk(&self, entry: &ManifestEntry) -> Result<Chunk> {
        let id = entry.id();

        let payload = self.retry.run(&id, || self.registry.fetch(&id)).await?;

        let data = payload
            .get(CHUNK_FILE)
            .cloned()
            .ok_or_else(|| Error::Registry(RegistryError::NotFound(id.clone())))?;

        let chunk = Chunk::new(entry.index, data);
        chunk.verify(&entry.hash)?;

        tracing::trace!("Fetched chunk {} ({} bytes) from {id}", entry.index, chunk.data.len());

        Ok(chunk)
    }

    /// Download transfer `code` into the local storage.
    ///
    /// Nothing is written unless every chunk was fetched and the reassembled file has the announced size.
    pub async fn download(&self, code: &TransferCode) -> Result<Downloaded> {
        let resolved = self.resolve(code).await?;

        let chunks = self.fetch_chunks(&resolved).await?;
        let data = chunk::merge(chunks, resolved.metadata.total_chunks, resolved.metadata.size)?;

        let staged = self.store.stage(code).await?;
        let path = staged.commit(&resolved.metadata, &data).await?;

        tracing::info!("Downloaded transfer {code}: `{}` ({} bytes)", resolved.metadata.name, data.len());

        Ok(Downloaded {
            path,
            metadata: resolved.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::ident::ArtifactId;
    use crate::publish::{Published, Publisher};
    use crate::registry::{MemoryRegistry, Payload};

    struct Setup {
        registry: Arc<MemoryRegistry>,
        downloader: Downloader<Arc<MemoryRegistry>>,
        scratch: tempfile::TempDir,
        downloads: tempfile::TempDir,
    }

    fn settings(scratch: &Path, downloads: &Path) -> Settings {
        Settings {
            chunk_size: 3,
            push_pacing: Duration::ZERO,
            confirm_visibility: false,
            scratch_dir: scratch.to_path_buf(),
            download_dir: downloads.to_path_buf(),
            ..Settings::default()
        }
    }

    fn published_at() -> DateTime<Utc> {
        "2024-03-09T23:00:00Z".parse().unwrap()
    }

    fn next_day() -> DateTime<Utc> {
        "2024-03-10T01:00:00Z".parse().unwrap()
    }

    fn too_late() -> DateTime<Utc> {
        "2024-03-12T23:00:00Z".parse().unwrap()
    }

    fn setup() -> Setup {
        let scratch = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();
        let registry = Arc::new(MemoryRegistry::new());
        let downloader = Downloader::new(Arc::clone(&registry), &settings(scratch.path(), downloads.path()))
            .unwrap()
            .with_clock(published_at);

        Setup {
            registry,
            downloader,
            scratch,
            downloads,
        }
    }

    impl Setup {
        async fn publish(&self, data: &'static str) -> Published {
            Publisher::new(Arc::clone(&self.registry), &settings(self.scratch.path(), self.downloads.path()))
                .unwrap()
                .with_clock(published_at)
                .publish("letters.txt", "text/plain", data)
                .await
                .unwrap()
        }

        fn chunk_id(&self, published: &Published, index: usize) -> ArtifactId {
            Scheme::default().chunk_id(&published.transfer_code, index, published_at().date_naive()).unwrap()
        }

        fn coordinator_id(&self, published: &Published) -> ArtifactId {
            Scheme::default().coordinator_id(&published.transfer_code, published_at().date_naive())
        }

        /// Rewrite one file of an already published artifact.
        fn tamper(&self, id: &ArtifactId, file: &str, data: Vec<u8>) {
            let mut payload = self.registry.remove(id).unwrap();
            payload.insert(file, data);
            self.registry.insert(id.clone(), payload);
        }

        fn is_untouched(&self, code: &TransferCode) -> bool {
            let dir = self.downloader.store().transfer_dir(code);
            !dir.exists() && !dir.with_extension("tmp").exists()
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_download() {
        let setup = setup();
        let published = setup.publish("ABCDEFG").await;

        let downloaded = setup.downloader.download(&published.transfer_code).await.unwrap();

        assert_eq!(downloaded.metadata, published.metadata);
        assert_eq!(downloaded.path, setup.downloads.path().join(published.transfer_code.as_str()).join("letters.txt"));
        assert_eq!(std::fs::read(&downloaded.path).unwrap(), b"ABCDEFG");
        assert_eq!(
            setup.downloader.store().load(&published.transfer_code).await.unwrap(),
            Some(published.metadata)
        );
        assert!(logs_contain("Downloaded transfer"));
    }

    #[tokio::test]
    async fn test_download_empty_file() {
        let setup = setup();
        let published = setup.publish("").await;

        let downloaded = setup.downloader.download(&published.transfer_code).await.unwrap();

        assert_eq!(std::fs::read(&downloaded.path).unwrap(), b"");
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_completion() {
        let setup = setup();
        let published = setup.publish("ABCDEFG").await;

        // chunk 0 completes last
        setup.registry.set_fetch_delay(setup.chunk_id(&published, 0), Duration::from_secs(5));
        setup.registry.set_fetch_delay(setup.chunk_id(&published, 1), Duration::from_secs(1));

        let downloaded = setup.downloader.download(&published.transfer_code).await.unwrap();

        assert_eq!(std::fs::read(&downloaded.path).unwrap(), b"ABCDEFG");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_in_batches() {
        let setup = setup();
        let published = setup.publish("ABCDEFGHIJKL").await;
        for index in 0..4 {
            setup.registry.set_fetch_delay(setup.chunk_id(&published, index), Duration::from_secs(1));
        }

        let resolved = setup.downloader.resolve(&published.transfer_code).await.unwrap();
        assert_eq!(resolved.manifest.len(), 4);

        // 3 then 1
        let start = Instant::now();
        let chunks = setup.downloader.fetch_chunks(&resolved).await.unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3), "{elapsed:?}");
        assert_eq!(chunks.iter().map(|chunk| chunk.index).collect::<Vec<_>>(), [0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_missing_chunk() {
        let setup = setup();
        let published = setup.publish("ABCDEFG").await;

        setup.registry.remove(&setup.chunk_id(&published, 1));

        let result = setup.downloader.download(&published.transfer_code).await;

        assert!(matches!(result, Err(Error::MissingChunk(1))));
        assert!(setup.is_untouched(&published.transfer_code));
    }

    #[tokio::test]
    async fn test_unordered_manifest() {
        let setup = setup();
        let published = setup.publish("ABCDEFG").await;
        let coordinator = setup.coordinator_id(&published);

        let payload = setup.registry.get(&coordinator).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(payload.get(INDEX_FILE).unwrap()).unwrap();
        value["chunks"].as_array_mut().unwrap().reverse();
        setup.tamper(&coordinator, INDEX_FILE, serde_json::to_vec(&value).unwrap());

        let resolved = setup.downloader.resolve(&published.transfer_code).await.unwrap();
        let chunks = setup.downloader.fetch_chunks(&resolved).await.unwrap();
        assert_eq!(chunks.iter().map(|chunk| chunk.index).collect::<Vec<_>>(), [0, 1, 2]);

        // the lowest gap is reported
        setup.registry.remove(&setup.chunk_id(&published, 2));
        setup.registry.remove(&setup.chunk_id(&published, 1));

        let result = setup.downloader.download(&published.transfer_code).await;
        assert!(matches!(result, Err(Error::MissingChunk(1))), "{result:?}");
    }

    #[tokio::test]
    async fn test_hash_mismatch() {
        let setup = setup();
        let published = setup.publish("ABCDEFG").await;

        setup.tamper(&setup.chunk_id(&published, 2), CHUNK_FILE, b"Z".to_vec());

        let result = setup.downloader.download(&published.transfer_code).await;

        assert!(matches!(result, Err(Error::HashMismatch { index: 2, .. })));
        assert!(setup.is_untouched(&published.transfer_code));
    }

    #[tokio::test]
    async fn test_size_mismatch() {
        let setup = setup();
        let published = setup.publish("ABCDEFG").await;
        let coordinator = setup.coordinator_id(&published);

        let payload = setup.registry.get(&coordinator).unwrap();
        let mut index = CoordinatorIndex::from_slice(payload.get(INDEX_FILE).unwrap()).unwrap();
        index.metadata.size = 8;
        setup.tamper(&coordinator, INDEX_FILE, serde_json::to_vec(&index).unwrap());

        let result = setup.downloader.download(&published.transfer_code).await;

        assert!(matches!(result, Err(Error::SizeMismatch { expected: 8, actual: 7 })));
        assert!(setup.is_untouched(&published.transfer_code));
    }

    #[tokio::test]
    async fn test_not_found() {
        let setup = setup();

        let result = setup.downloader.resolve(&"4821".parse().unwrap()).await;

        assert!(matches!(result, Err(Error::NotFound(code)) if code.as_str() == "4821"));
    }

    #[tokio::test]
    async fn test_unreadable_coordinator_is_skipped() {
        let setup = setup();
        let code: TransferCode = "4821".parse().unwrap();
        let id = Scheme::default().coordinator_id(&code, published_at().date_naive());

        let mut payload = Payload::default();
        payload.insert(INDEX_FILE, "not json");
        setup.registry.insert(id, payload);

        assert!(matches!(setup.downloader.resolve(&code).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_foreign_manifest_entry() {
        let setup = setup();
        let published = setup.publish("ABCDEFG").await;
        let coordinator = setup.coordinator_id(&published);

        let payload = setup.registry.get(&coordinator).unwrap();
        let mut value: serde_json::Value = serde_json::from_slice(payload.get(INDEX_FILE).unwrap()).unwrap();
        value["chunks"][1]["version"] = "2024.03.09-9999.0001".into();
        setup.tamper(&coordinator, INDEX_FILE, serde_json::to_vec(&value).unwrap());

        let result = setup.downloader.resolve(&published.transfer_code).await;

        assert!(matches!(result, Err(Error::IncompleteManifest(_))));
    }

    #[tokio::test]
    async fn test_previous_day_lookup() {
        let setup = setup();
        let published = setup.publish("ABCDEFG").await;

        let downloader = Downloader::new(
            Arc::clone(&setup.registry),
            &settings(setup.scratch.path(), setup.downloads.path()),
        )
        .unwrap()
        .with_clock(next_day);

        let resolved = downloader.resolve(&published.transfer_code).await.unwrap();

        assert_eq!(resolved.date, published_at().date_naive());
        assert_eq!(resolved.metadata, published.metadata);
    }

    #[tokio::test]
    async fn test_expired() {
        let setup = setup();
        let published = setup.publish("ABCDEFG").await;

        let downloader = Downloader::new(
            Arc::clone(&setup.registry),
            &settings(setup.scratch.path(), setup.downloads.path()),
        )
        .unwrap()
        .with_clock(too_late);

        assert!(matches!(downloader.resolve(&published.transfer_code).await, Err(Error::NotFound(_))));
    }
}
