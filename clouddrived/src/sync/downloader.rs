use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use clouddrive_core::{CloudError, CloudStore, RemoteNode};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::{Mutex, watch},
};
use tracing::{debug, error, trace, warn};

use crate::storage::FileCipher;

/// Progress is published to readers after this many unflushed bytes.
const COMMIT_SIZE: u64 = 512 * 1024;
const WRITE_BUFFER: usize = 64 * 1024;
const SLOW_DOWNLOAD: Duration = Duration::from_secs(29);

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("store error: {0}")]
    Cloud(#[from] CloudError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("download stalled at {downloaded} of {expected} bytes")]
    Stalled { downloaded: u64, expected: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("download failed")]
pub struct DownloadFailed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    downloaded: u64,
    status: Status,
}

/// One fetch of a remote item into a local file, shared by every reader
/// that asked for the same item while it was running.
#[derive(Debug)]
pub struct Downloader {
    item: RemoteNode,
    path: PathBuf,
    progress: watch::Sender<Progress>,
}

impl Downloader {
    fn running(item: RemoteNode, path: PathBuf, present: u64) -> Self {
        Self::with_progress(item, path, present, Status::Running)
    }

    pub fn completed(item: RemoteNode, path: PathBuf) -> Self {
        let length = item.length;
        Self::with_progress(item, path, length, Status::Completed)
    }

    fn with_progress(item: RemoteNode, path: PathBuf, downloaded: u64, status: Status) -> Self {
        let (progress, _) = watch::channel(Progress { downloaded, status });
        Self {
            item,
            path,
            progress,
        }
    }

    pub fn item(&self) -> &RemoteNode {
        &self.item
    }

    pub fn item_id(&self) -> &str {
        &self.item.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes known to be on disk; trails the real position by up to one
    /// commit interval while the fetch runs.
    pub fn downloaded(&self) -> u64 {
        self.progress.borrow().downloaded
    }

    pub fn is_complete(&self) -> bool {
        self.progress.borrow().status == Status::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.progress.borrow().status == Status::Failed
    }

    pub async fn wait_for(&self, offset: u64) -> Result<u64, DownloadFailed> {
        let mut rx = self.progress.subscribe();
        let progress = *rx
            .wait_for(|p| p.downloaded >= offset || p.status != Status::Running)
            .await
            .map_err(|_| DownloadFailed)?;
        match progress.status {
            Status::Failed => Err(DownloadFailed),
            _ => Ok(progress.downloaded),
        }
    }

    pub async fn finished(&self) -> Result<(), DownloadFailed> {
        let mut rx = self.progress.subscribe();
        let progress = *rx
            .wait_for(|p| p.status != Status::Running)
            .await
            .map_err(|_| DownloadFailed)?;
        match progress.status {
            Status::Completed => Ok(()),
            _ => Err(DownloadFailed),
        }
    }

    fn publish(&self, downloaded: u64) {
        self.progress.send_modify(|p| p.downloaded = downloaded);
    }

    fn complete(&self, downloaded: u64) {
        self.progress.send_replace(Progress {
            downloaded,
            status: Status::Completed,
        });
    }

    fn fail(&self) {
        self.progress.send_modify(|p| p.status = Status::Failed);
    }
}

pub trait FetchObserver: Send + Sync {
    fn fetch_started(&self, item: &RemoteNode);
    fn fetch_finished(&self, item: &RemoteNode, path: &Path);
    fn fetch_failed(&self, item: &RemoteNode, err: &DownloadError);
}

type LiveDownloads = Arc<Mutex<HashMap<String, Arc<Downloader>>>>;

pub struct DownloadCoordinator {
    cloud: Arc<dyn CloudStore>,
    cipher: FileCipher,
    live: LiveDownloads,
    fetches_started: Arc<AtomicUsize>,
}

impl DownloadCoordinator {
    pub fn new(cloud: Arc<dyn CloudStore>, cipher: FileCipher) -> Self {
        Self {
            cloud,
            cipher,
            live: Arc::default(),
            fetches_started: Arc::default(),
        }
    }

    pub fn fetches_started(&self) -> usize {
        self.fetches_started.load(Ordering::SeqCst)
    }

    pub async fn live_count(&self) -> usize {
        self.live.lock().await.len()
    }

    pub async fn start_download(
        &self,
        item: &RemoteNode,
        dest: &Path,
        observer: Arc<dyn FetchObserver>,
    ) -> io::Result<Arc<Downloader>> {
        let mut live = self.live.lock().await;
        if let Some(existing) = live.get(&item.path) {
            trace!(id = %item.id, path = %item.path, "joining running download");
            return Ok(existing.clone());
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let existing_len = match tokio::fs::metadata(dest).await {
            Ok(metadata) => Some(metadata.len()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err),
        };
        if existing_len == Some(item.length) {
            return Ok(Arc::new(Downloader::completed(
                item.clone(),
                dest.to_path_buf(),
            )));
        }

        let (file, present) = match existing_len {
            Some(len) if len < item.length => {
                warn!(
                    id = %item.id,
                    path = %item.path,
                    expected = item.length,
                    present = len,
                    "resuming partially downloaded file"
                );
                let file = OpenOptions::new().append(true).open(dest).await?;
                (file, len)
            }
            None => (File::create(dest).await?, 0),
            Some(_) => (File::create(dest).await?, 0),
        };

        let downloader = Arc::new(Downloader::running(
            item.clone(),
            dest.to_path_buf(),
            present,
        ));
        live.insert(item.path.clone(), downloader.clone());
        self.fetches_started.fetch_add(1, Ordering::SeqCst);

        let task = FetchTask {
            cloud: self.cloud.clone(),
            cipher: self.cipher.clone(),
            live: self.live.clone(),
            downloader: downloader.clone(),
            observer,
        };
        tokio::spawn(task.run(file, present));

        Ok(downloader)
    }
}

struct FetchTask {
    cloud: Arc<dyn CloudStore>,
    cipher: FileCipher,
    live: LiveDownloads,
    downloader: Arc<Downloader>,
    observer: Arc<dyn FetchObserver>,
}

impl FetchTask {
    async fn run(self, file: File, present: u64) {
        let item = self.downloader.item().clone();
        let started = Instant::now();
        debug!(id = %item.id, path = %item.path, "download started");
        self.observer.fetch_started(&item);

        match self.fetch(file, present).await {
            Ok(downloaded) => {
                debug!(id = %item.id, path = %item.path, downloaded, "download finished");
                self.observer.fetch_finished(&item, self.downloader.path());
                self.downloader.complete(downloaded);
                let elapsed = started.elapsed();
                if elapsed > SLOW_DOWNLOAD {
                    warn!(path = %item.path, ?elapsed, "slow download");
                }
            }
            Err(err) => {
                error!(id = %item.id, path = %item.path, "download failed: {err}");
                self.downloader.fail();
                self.observer.fetch_failed(&item, &err);
            }
        }

        let mut live = self.live.lock().await;
        if live
            .get(&item.path)
            .is_some_and(|current| Arc::ptr_eq(current, &self.downloader))
        {
            live.remove(&item.path);
        }
    }

    async fn fetch(&self, file: File, present: u64) -> Result<u64, DownloadError> {
        let item = self.downloader.item();
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER, file);
        let mut written = present;
        let mut uncommitted = 0u64;

        while written < item.length {
            let pass_start = written;
            let mut keystream = self.cipher.keystream_at(written);
            let mut stream = self.cloud.download(&item.id, written).await?;

            while let Some(chunk) = stream.next().await {
                let mut chunk = chunk?.to_vec();
                if written == 0 && !chunk.is_empty() {
                    trace!(id = %item.id, "received first chunk");
                }
                keystream.apply(&mut chunk);
                writer.write_all(&chunk).await?;
                written += chunk.len() as u64;
                uncommitted += chunk.len() as u64;
                if uncommitted > COMMIT_SIZE {
                    uncommitted = 0;
                    writer.flush().await?;
                    self.downloader.publish(written);
                }
            }

            if written == pass_start {
                return Err(DownloadError::Stalled {
                    downloaded: written,
                    expected: item.length,
                });
            }
        }

        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        self.downloader.publish(written);
        Ok(written)
    }
}

#[cfg(test)]
#[path = "downloader_tests.rs"]
mod tests;
