use std::{
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use clouddrive_core::{CloudStore, RemoteNode};
use thiserror::Error;
use tokio::{
    fs::File,
    io::AsyncWriteExt,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    cache::{CacheConfig, CacheError, DownloadCache},
    events::{EventSink, SyncEvent},
    paths::{PathError, item_file},
    reader::CachedFile,
    upload::{UploadError, UploadInfo},
    upload_service::{UploadConfig, UploadService},
};

const NEW_FILE_EXT: &str = "new";
const PARTIAL_EXT: &str = "partial";

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

type Subscribers = Arc<Mutex<Vec<UnboundedSender<SyncEvent>>>>;

/// Entry point for the filesystem layer: reads go through the download
/// cache, writes become uploads, and finished uploads land back in the cache.
pub struct SyncCore {
    cache: DownloadCache,
    uploads: Arc<UploadService>,
    subscribers: Subscribers,
    pump: JoinHandle<()>,
}

impl SyncCore {
    /// Must be called from within a Tokio runtime.
    pub fn new(
        cloud: Arc<dyn CloudStore>,
        cache_config: CacheConfig,
        upload_config: UploadConfig,
    ) -> Self {
        let (sink, events) = EventSink::channel();
        let cache = DownloadCache::new(cloud.clone(), cache_config, sink.clone());
        let uploads = Arc::new(UploadService::new(cloud, upload_config, sink));
        let subscribers = Subscribers::default();
        let pump = tokio::spawn(pump_events(events, cache.clone(), subscribers.clone()));
        Self {
            cache,
            uploads,
            subscribers,
            pump,
        }
    }

    pub async fn set_cache_root(&self, root: &Path) -> Result<usize, CoreError> {
        self.cache.set_cache_root(root).await?;
        Ok(self.uploads.set_cache_root(root).await?)
    }

    pub fn cache(&self) -> &DownloadCache {
        &self.cache
    }

    pub fn uploads(&self) -> &UploadService {
        &self.uploads
    }

    pub fn start(&self) {
        self.uploads.start();
    }

    pub async fn stop(&self) {
        self.uploads.stop().await;
    }

    pub fn subscribe(&self) -> UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub async fn open_read(&self, item: &RemoteNode) -> Result<CachedFile, CoreError> {
        Ok(self.cache.open_read_with_download(item).await?)
    }

    /// Opens the cached copy for in-place edits; hand it back to
    /// [`Self::close`] to upload the changes.
    pub async fn open_read_write(&self, item: &RemoteNode) -> Result<CachedFile, CoreError> {
        Ok(self.cache.open_read_write(item).await?)
    }

    pub async fn close(&self, file: CachedFile) -> Result<Option<UploadInfo>, CoreError> {
        if !file.is_modified() {
            return Ok(None);
        }
        let item = file.item().clone();
        let path = file.path().to_path_buf();
        let length = file.len().await?;
        drop(file);
        self.cache.resize(&item.id, length);
        debug!(id = %item.id, length, "cached copy modified, uploading");
        Ok(Some(self.uploads.enqueue_overwrite_from(&item, &path).await?))
    }

    pub async fn open_new_write(
        &self,
        parent: &RemoteNode,
        name: &str,
    ) -> Result<NewFileWriter, CoreError> {
        let dir = self.upload_dir()?;
        let scratch = Uuid::new_v4().to_string();
        let path = item_file(&dir, &format!("{scratch}.{NEW_FILE_EXT}"))?;
        let target = WriteTarget::New {
            parent: parent.clone(),
            name: name.to_string(),
        };
        NewFileWriter::create(self.uploads.clone(), target, path.clone(), path).await
    }

    /// Replaces the whole content of `item`. The writer fills
    /// `<upload dir>/<id>` and queues the overwrite on close.
    pub async fn open_truncate_write(&self, item: &RemoteNode) -> Result<NewFileWriter, CoreError> {
        let dir = self.upload_dir()?;
        let path = item_file(&dir, &item.id)?;
        let scratch = item_file(&dir, &format!("{}.{PARTIAL_EXT}", item.id))?;
        NewFileWriter::create(
            self.uploads.clone(),
            WriteTarget::Overwrite(item.clone()),
            scratch,
            path,
        )
        .await
    }

    pub async fn delete(&self, item: &RemoteNode) {
        if self.uploads.cancel(&item.id).await {
            info!(id = %item.id, "pending upload dropped with deleted item");
        }
        self.cache.delete(item).await;
    }

    fn upload_dir(&self) -> Result<PathBuf, CoreError> {
        Ok(self.uploads.upload_dir().ok_or(UploadError::NoUploadDir)?)
    }
}

impl Drop for SyncCore {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump_events(
    mut events: UnboundedReceiver<SyncEvent>,
    cache: DownloadCache,
    subscribers: Subscribers,
) {
    while let Some(event) = events.recv().await {
        if let SyncEvent::UploadFinished { upload, node } = &event {
            promote_upload(&cache, upload, node).await;
        }
        subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

async fn promote_upload(cache: &DownloadCache, upload: &UploadInfo, node: &RemoteNode) {
    let Some(plain) = &upload.plain_path else {
        return;
    };
    if upload.overwrite {
        cache.delete(node).await;
    }
    if !cache.move_to_cache(plain, node).await {
        debug!(id = %node.id, "cache already held the uploaded file");
    }
}

#[derive(Debug, Clone)]
enum WriteTarget {
    New { parent: RemoteNode, name: String },
    Overwrite(RemoteNode),
}

pub struct NewFileWriter {
    uploads: Arc<UploadService>,
    target: WriteTarget,
    scratch: PathBuf,
    path: PathBuf,
    file: File,
    written: u64,
}

impl NewFileWriter {
    async fn create(
        uploads: Arc<UploadService>,
        target: WriteTarget,
        scratch: PathBuf,
        path: PathBuf,
    ) -> Result<Self, CoreError> {
        if let Some(parent) = scratch.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&scratch).await?;
        Ok(Self {
            uploads,
            target,
            scratch,
            path,
            file,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.scratch
    }

    pub fn len(&self) -> u64 {
        self.written
    }

    pub fn is_empty(&self) -> bool {
        self.written == 0
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    pub async fn close(mut self) -> Result<UploadInfo, CoreError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        if self.scratch != self.path {
            tokio::fs::rename(&self.scratch, &self.path).await?;
        }
        let info = match &self.target {
            WriteTarget::New { parent, name } => {
                self.uploads
                    .enqueue_new_owned(parent, &self.path, name)
                    .await
            }
            WriteTarget::Overwrite(item) => self.uploads.enqueue_overwrite(item).await,
        };
        match info {
            Ok(info) => Ok(info),
            Err(err) => {
                warn!(path = %self.path.display(), "could not queue written file: {err}");
                remove_quietly(&self.path).await;
                Err(err.into())
            }
        }
    }

    pub async fn cancel(self) {
        let Self { file, scratch, .. } = self;
        drop(file);
        debug!(path = %scratch.display(), "write cancelled");
        remove_quietly(&scratch).await;
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), "cannot remove file: {err}");
        }
    }
}
