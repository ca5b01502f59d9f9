use std::{
    io,
    path::{Path, PathBuf},
    pin::Pin,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use thiserror::Error;

use crate::{fingerprint::file_fingerprint, node::RemoteNode};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, CloudError>> + Send>>;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("store returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Conflict,
    NotFound,
    GatewayTimeout,
    Other,
}

impl CloudError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        CloudError::Status {
            status,
            message: message.into(),
        }
    }

    pub fn conflict() -> Self {
        Self::status(409, "node already exists")
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            CloudError::Status { status, .. } => classify_status(*status),
            _ => ErrorClass::Other,
        }
    }

    pub fn is_file_not_found(&self) -> bool {
        matches!(self, CloudError::Io(err) if err.kind() == io::ErrorKind::NotFound)
    }
}

fn classify_status(status: u16) -> ErrorClass {
    match status {
        409 => ErrorClass::Conflict,
        404 => ErrorClass::NotFound,
        504 => ErrorClass::GatewayTimeout,
        _ => ErrorClass::Other,
    }
}

/// Local file handed to the store for upload; opened lazily so that a store
/// can reopen it when it restarts a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSource {
    path: PathBuf,
}

impl UploadSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn open(&self) -> io::Result<tokio::fs::File> {
        tokio::fs::File::open(&self.path).await
    }
}

/// Receives the number of bytes sent so far during an upload.
///
/// Returning an error aborts the transfer; stores must surface that error
/// to their caller unchanged.
#[async_trait]
pub trait UploadProgress: Send + Sync {
    async fn on_progress(&self, done: u64) -> Result<(), CloudError>;
}

#[async_trait]
pub trait CloudStore: Send + Sync {
    fn id(&self) -> &str;

    async fn get_node(&self, id: &str) -> Result<Option<RemoteNode>, CloudError>;

    async fn get_child(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<RemoteNode>, CloudError>;

    async fn download(&self, id: &str, offset: u64) -> Result<ByteStream, CloudError>;

    async fn upload_new(
        &self,
        parent_id: &str,
        name: &str,
        source: &UploadSource,
        progress: &dyn UploadProgress,
    ) -> Result<RemoteNode, CloudError>;

    async fn overwrite(
        &self,
        id: &str,
        source: &UploadSource,
        progress: &dyn UploadProgress,
    ) -> Result<RemoteNode, CloudError>;

    /// Fingerprint comparable with [`RemoteNode::content_id`].
    async fn content_fingerprint(&self, path: &Path) -> Result<String, CloudError> {
        Ok(file_fingerprint(path).await?)
    }
}
