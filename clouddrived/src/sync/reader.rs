use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use clouddrive_core::RemoteNode;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};

use super::downloader::Downloader;

/// Handle on a cached file, possibly still being filled by a download.
///
/// Reads never run ahead of the bytes the downloader has published, so a
/// reader of a large file can start before the fetch is done.
pub struct CachedFile {
    item: RemoteNode,
    path: PathBuf,
    downloader: Option<Arc<Downloader>>,
    file: Mutex<File>,
    writable: bool,
    modified: AtomicBool,
}

impl CachedFile {
    pub(crate) async fn open_readonly(
        item: &RemoteNode,
        path: &Path,
        downloader: Option<Arc<Downloader>>,
    ) -> io::Result<Self> {
        let file = File::open(path).await?;
        Ok(Self::new(item, path, downloader, file, false))
    }

    pub(crate) async fn open_writable(
        item: &RemoteNode,
        path: &Path,
        downloader: Option<Arc<Downloader>>,
    ) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path).await?;
        Ok(Self::new(item, path, downloader, file, true))
    }

    fn new(
        item: &RemoteNode,
        path: &Path,
        downloader: Option<Arc<Downloader>>,
        file: File,
        writable: bool,
    ) -> Self {
        Self {
            item: item.clone(),
            path: path.to_path_buf(),
            downloader,
            file: Mutex::new(file),
            writable,
            modified: AtomicBool::new(false),
        }
    }

    pub fn item(&self) -> &RemoteNode {
        &self.item
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn downloader(&self) -> Option<&Arc<Downloader>> {
        self.downloader.as_ref()
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_modified(&self) -> bool {
        self.modified.load(Ordering::Acquire)
    }

    pub async fn len(&self) -> io::Result<u64> {
        Ok(self.file.lock().await.metadata().await?.len())
    }

    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut limit = buf.len();
        if let Some(downloader) = self.running_downloader() {
            let wanted = (offset + buf.len() as u64).min(self.item.length);
            let available = downloader.wait_for(wanted).await.map_err(io::Error::other)?;
            if !downloader.is_complete() {
                if available <= offset {
                    return Ok(0);
                }
                limit = limit.min((available - offset) as usize);
            }
        }

        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut filled = 0;
        while filled < limit {
            let read = file.read(&mut buf[filled..limit]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        Ok(filled)
    }

    pub async fn read_to_end(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let read = self.read_at(out.len() as u64, &mut buf).await?;
            if read == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..read]);
        }
    }

    pub async fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "cached file opened read-only",
            ));
        }
        if let Some(downloader) = self.running_downloader() {
            downloader.finished().await.map_err(io::Error::other)?;
        }
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        self.modified.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn set_len(&self, len: u64) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "cached file opened read-only",
            ));
        }
        if let Some(downloader) = self.running_downloader() {
            downloader.finished().await.map_err(io::Error::other)?;
        }
        self.file.lock().await.set_len(len).await?;
        self.modified.store(true, Ordering::Release);
        Ok(())
    }

    fn running_downloader(&self) -> Option<&Arc<Downloader>> {
        self.downloader.as_ref().filter(|d| !d.is_complete())
    }
}
