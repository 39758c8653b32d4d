//! Local storage of completed downloads.
//!
//! Here is the flat layout of the download directory:
//!
//! ```text
//!     - root local storage
//!       L {transfer_code}
//!         L metadata.json
//!         L {original file name}
//!       L {transfer_code}.tmp
//!         L partial download
//! ```
//!
//! A transfer is written in its `.tmp` directory then renamed once complete, so that a transfer directory without
//! the `.tmp` extension is always whole. Leftover `.tmp` directories come from interrupted downloads and are cleaned
//! when walking the storage.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{fs, io};

use crate::artifact::FileMetadata;
use crate::ident::TransferCode;
use crate::Result;

const TEMP_EXT: &str = "tmp";
const METADATA_FILE: &str = "metadata.json";
const FALLBACK_NAME: &str = "download.bin";

/// A completed download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub transfer_code: TransferCode,
    pub metadata: FileMetadata,
    /// Path of the reassembled file.
    pub path: PathBuf,
    pub downloaded_at: DateTime<Utc>,
}

/// Download storage rooted at a local directory.
#[derive(Debug, Clone)]
pub struct DownloadStore {
    root: PathBuf,
}

impl DownloadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the expected directory of a completed transfer.
    pub fn transfer_dir(&self, code: &TransferCode) -> PathBuf {
        self.root.join(code.as_str())
    }

    /// Prepare an empty `.tmp` directory to write transfer `code` in.
    pub async fn stage(&self, code: &TransferCode) -> Result<StagedDownload> {
        let tmp = self.transfer_dir(code).with_extension(TEMP_EXT);

        if fs::try_exists(&tmp).await? {
            tracing::debug!("Clean incomplete download from local storage: `{}`", tmp.display());
            fs::remove_dir_all(&tmp).await?;
        }

        fs::create_dir_all(&tmp).await?;

        Ok(StagedDownload {
            tmp: Some(tmp),
            dir: self.transfer_dir(code),
        })
    }

    /// Read the metadata of a completed transfer, if any.
    pub async fn load(&self, code: &TransferCode) -> Result<Option<FileMetadata>> {
        match fs::read(self.transfer_dir(code).join(METADATA_FILE)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Walk through the local storage and return all completed transfers, most recent first.
    pub async fn history(&self) -> Result<Vec<HistoryRecord>> {
        let mut records = vec![];

        if !fs::try_exists(&self.root).await? {
            return Ok(records);
        }

        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }

            let dir = entry.path();

            if dir.extension().is_some_and(|ext| ext == TEMP_EXT) {
                tracing::trace!("Clean incomplete download from local storage: `{}`", dir.display());

                fs::remove_dir_all(&dir).await?;
                continue;
            }

            match Self::record(&dir).await {
                Ok(record) => records.push(record),
                Err(err) => tracing::trace!("Skip `{}`: {err}", dir.display()),
            }
        }

        records.sort_by(|a, b| b.downloaded_at.cmp(&a.downloaded_at));

        Ok(records)
    }

    async fn record(dir: &Path) -> Result<HistoryRecord> {
        let path = dir.join(METADATA_FILE);

        let metadata: FileMetadata = serde_json::from_slice(&fs::read(&path).await?)?;
        let downloaded_at = fs::metadata(&path).await?.modified()?.into();

        Ok(HistoryRecord {
            transfer_code: metadata.transfer_code.clone(),
            path: dir.join(file_name(&metadata.name)),
            metadata,
            downloaded_at,
        })
    }
}

/// A download being written in its `.tmp` directory.
///
/// The directory is removed on drop unless committed.
#[derive(Debug)]
pub struct StagedDownload {
    tmp: Option<PathBuf>,
    dir: PathBuf,
}

impl StagedDownload {
    /// Temporary directory of this download.
    pub fn path(&self) -> &Path {
        self.tmp.as_deref().unwrap_or(&self.dir)
    }

    /// Write the file and its metadata, then move the transfer to its final directory.
    ///
    /// An already existing transfer directory is replaced.
    pub async fn commit(mut self, metadata: &FileMetadata, data: &[u8]) -> Result<PathBuf> {
        let tmp = self.path().to_path_buf();
        let name = file_name(&metadata.name);

        write_synced(&tmp.join(name), data).await?;
        write_synced(&tmp.join(METADATA_FILE), &serde_json::to_vec_pretty(metadata)?).await?;

        if fs::try_exists(&self.dir).await? {
            tracing::debug!("Replace previous download in local storage: `{}`", self.dir.display());
            fs::remove_dir_all(&self.dir).await?;
        }

        fs::rename(&tmp, &self.dir).await?;
        self.tmp = None;

        tracing::debug!("Stored download to local storage: `{}`", self.dir.display());

        Ok(self.dir.join(name))
    }
}

impl Drop for StagedDownload {
    fn drop(&mut self) {
        if let Some(ref tmp) = self.tmp {
            tracing::debug!("Deleting incomplete download from local storage: `{}`", tmp.display());

            // no async drop, runs once per failed download
            if let Err(err) = std::fs::remove_dir_all(tmp) {
                tracing::warn!("Cannot delete incomplete download `{}`: {err}", tmp.display());
            }
        }
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> Result<()> {
    use io::AsyncWriteExt;

    let mut writer = io::BufWriter::new(fs::File::create(path).await?);

    writer.write_all(data).await?;
    writer.shutdown().await?;
    writer.into_inner().sync_all().await?;

    Ok(())
}

/// Keep only the last component of an untrusted file name.
fn file_name(name: &str) -> &str {
    match name.rsplit(['/', '\\']).next() {
        Some(name) if !name.is_empty() && name != "." && name != ".." => name,
        _ => FALLBACK_NAME,
    }
}
