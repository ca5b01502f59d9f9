use std::{
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::paths::{DESCRIPTOR_EXT, PathError, descriptor_file, staged_file};
use crate::storage::CipherError;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload directory has not been configured")]
    NoUploadDir,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("descriptor error: {0}")]
    Descriptor(#[from] serde_json::Error),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("local file {0} has no usable file name")]
    NoFileName(PathBuf),
}

/// Progress of one upload.
///
/// Moves forward through `Waiting`, `ContentId`, `Uploading` and
/// `Finishing`; `Failed` can be reached from any of them and goes back to
/// `Waiting` when the failure is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Waiting,
    ContentId,
    Uploading,
    Finishing,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    NoResultNode,
    NoFolderNode,
    NoOverwriteNode,
    Conflict,
    Unexpected,
    Cancelled,
    FileNotFound,
    ContentIdMismatch,
}

impl FailReason {
    /// Terminal failures drop the upload; the rest are retried.
    pub fn is_terminal(self) -> bool {
        !matches!(self, FailReason::NoResultNode | FailReason::Unexpected)
    }
}

/// One pending upload, persisted as `<id>.info` next to its staged payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadInfo {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub source_path: PathBuf,
    pub length: u64,
    #[serde(default)]
    pub content_id: Option<String>,
    #[serde(default)]
    pub overwrite: bool,
    /// Remote node replaced by an overwrite, when it differs from `id`.
    #[serde(default)]
    pub target_id: Option<String>,
    /// Plaintext copy owned by the queue, promoted into the download cache
    /// once the upload finishes.
    #[serde(default)]
    pub plain_path: Option<PathBuf>,
    #[serde(default = "OffsetDateTime::now_utc", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(skip)]
    pub attempt: u32,
    #[serde(skip)]
    pub cancellation: CancellationToken,
}

impl UploadInfo {
    pub fn new(
        id: impl Into<String>,
        path: impl Into<String>,
        source_path: PathBuf,
        length: u64,
    ) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            parent_id: None,
            source_path,
            length,
            content_id: None,
            overwrite: false,
            target_id: None,
            plain_path: None,
            created_at: OffsetDateTime::now_utc(),
            attempt: 0,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn overwrite_target(&self) -> &str {
        self.target_id.as_deref().unwrap_or(&self.id)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

pub async fn write_descriptor(dir: &Path, info: &UploadInfo) -> Result<(), UploadError> {
    let path = descriptor_file(dir, &info.id)?;
    let scratch = path.with_extension(format!("{DESCRIPTOR_EXT}.partial"));
    tokio::fs::write(&scratch, serde_json::to_vec_pretty(info)?).await?;
    tokio::fs::rename(&scratch, &path).await?;
    Ok(())
}

pub async fn read_descriptor(path: &Path) -> Result<UploadInfo, UploadError> {
    let raw = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&raw)?)
}

pub async fn read_descriptors(dir: &Path) -> io::Result<Vec<UploadInfo>> {
    let mut found = Vec::new();
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(found),
        Err(err) => return Err(err),
    };
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(DESCRIPTOR_EXT) {
            continue;
        }
        match read_descriptor(&path).await {
            Ok(info) => found.push(info),
            Err(err) => warn!(path = %path.display(), "skipping unreadable upload descriptor: {err}"),
        }
    }
    found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(found)
}

pub async fn remove_upload_files(dir: &Path, info: &UploadInfo, with_plain: bool) {
    let mut paths = vec![info.source_path.clone()];
    if let Ok(descriptor) = descriptor_file(dir, &info.id) {
        paths.push(descriptor);
    }
    if let Ok(staged) = staged_file(dir, &info.id) {
        paths.push(staged);
    }
    if with_plain {
        paths.extend(info.plain_path.clone());
    }
    paths.sort();
    paths.dedup();

    for path in paths {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed upload file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), "cannot remove upload file: {err}"),
        }
    }
}
