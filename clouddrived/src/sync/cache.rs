use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use clouddrive_core::{CloudStore, RemoteNode};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::{
    downloader::{DownloadCoordinator, DownloadError, Downloader, FetchObserver},
    events::{EventSink, SyncEvent},
    paths::{CACHE_DIR, PathError, item_file},
    reader::CachedFile,
    registry::{CacheEntry, CacheRegistry, scan_cache_dir},
    sweep::UniqueWorker,
};
use crate::storage::FileCipher;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache directory has not been configured")]
    NoCacheRoot,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("path error: {0}")]
    Path(#[from] PathError),
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub max_bytes: u64,
}

#[derive(Clone)]
pub struct DownloadCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    registry: CacheRegistry,
    coordinator: DownloadCoordinator,
    cache_dir: RwLock<Option<PathBuf>>,
    max_bytes: AtomicU64,
    clear_all_worker: UniqueWorker,
    clear_size_worker: UniqueWorker,
    events: EventSink,
}

impl DownloadCache {
    pub fn new(cloud: Arc<dyn CloudStore>, config: CacheConfig, events: EventSink) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                registry: CacheRegistry::new(),
                coordinator: DownloadCoordinator::new(cloud, FileCipher::global().clone()),
                cache_dir: RwLock::new(None),
                max_bytes: AtomicU64::new(config.max_bytes),
                clear_all_worker: UniqueWorker::new("clear-all"),
                clear_size_worker: UniqueWorker::new("clear-to-size"),
                events,
            }),
        }
    }

    /// Points the cache at `<root>/SmallFiles`.
    ///
    /// The first assignment rebuilds the registry from disk in the
    /// background and returns that task; moving to another root deletes the
    /// previous directory.
    pub async fn set_cache_root(&self, root: &Path) -> Result<Option<JoinHandle<()>>, CacheError> {
        let dir = root.join(CACHE_DIR);
        let previous = {
            let mut current = self
                .inner
                .cache_dir
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if current.as_deref() == Some(dir.as_path()) {
                return Ok(None);
            }
            current.replace(dir.clone())
        };
        tokio::fs::create_dir_all(&dir).await?;

        match previous {
            Some(old) => {
                if let Err(err) = tokio::fs::remove_dir_all(&old).await {
                    warn!(path = %old.display(), "cannot delete old cache: {err}");
                }
                Ok(None)
            }
            None => {
                let inner = self.inner.clone();
                Ok(Some(tokio::spawn(async move {
                    inner.recalculate_total_size().await;
                })))
            }
        }
    }

    pub fn cache_dir(&self) -> Option<PathBuf> {
        self.inner.dir().ok()
    }

    pub fn registry(&self) -> &CacheRegistry {
        &self.inner.registry
    }

    pub fn coordinator(&self) -> &DownloadCoordinator {
        &self.inner.coordinator
    }

    pub fn total_size(&self) -> u64 {
        self.inner.registry.total_size()
    }

    pub fn max_bytes(&self) -> u64 {
        self.inner.max_bytes.load(Ordering::Relaxed)
    }

    pub fn set_max_bytes(&self, max_bytes: u64) {
        self.inner.max_bytes.store(max_bytes, Ordering::Relaxed);
    }

    pub async fn open_read_only(&self, item: &RemoteNode) -> Result<Option<CachedFile>, CacheError> {
        let Some(path) = self.resolve_path(item).await? else {
            return Ok(None);
        };
        trace!(id = %item.id, "opened cached");
        Ok(Some(CachedFile::open_readonly(item, &path, None).await?))
    }

    pub async fn open_read_with_download(&self, item: &RemoteNode) -> Result<CachedFile, CacheError> {
        let (path, downloader) = self.prepare_download(item).await?;
        Ok(CachedFile::open_readonly(item, &path, Some(downloader)).await?)
    }

    pub async fn open_read_write(&self, item: &RemoteNode) -> Result<CachedFile, CacheError> {
        let (path, downloader) = self.prepare_download(item).await?;
        trace!(id = %item.id, "opened read-write cached");
        Ok(CachedFile::open_writable(item, &path, Some(downloader)).await?)
    }

    pub fn add_existing(&self, item: &RemoteNode, source_path: Option<PathBuf>) -> Option<CacheEntry> {
        self.inner.add_existing(item, source_path)
    }

    pub async fn add_as_link(
        &self,
        item: &RemoteNode,
        path: impl Into<PathBuf>,
    ) -> Result<Option<CacheEntry>, CacheError> {
        tokio::fs::create_dir_all(self.inner.dir()?).await?;
        Ok(self.inner.add_existing(item, Some(path.into())))
    }

    pub async fn delete(&self, item: &RemoteNode) {
        let result = async {
            let path = item_file(&self.inner.dir()?, &item.id)?;
            remove_if_exists(&path).await?;
            Ok::<_, CacheError>(())
        }
        .await;
        if let Err(err) = result {
            warn!(id = %item.id, name = %item.name, "could not delete cached file: {err}");
        }
        self.inner.registry.remove(&item.id);
    }

    /// Moves a freshly uploaded file into the cache as the copy of `item`,
    /// or drops it when the cache already holds one. Returns whether the
    /// file was adopted.
    pub async fn move_to_cache(&self, temp_path: &Path, item: &RemoteNode) -> bool {
        let result = async {
            let dest = item_file(&self.inner.dir()?, &item.id)?;
            if tokio::fs::try_exists(&dest).await? {
                tokio::fs::remove_file(temp_path).await?;
                return Ok::<_, CacheError>(false);
            }
            if let Err(err) = tokio::fs::rename(temp_path, &dest).await {
                debug!("rename into cache failed, copying instead: {err}");
                tokio::fs::copy(temp_path, &dest).await?;
                tokio::fs::remove_file(temp_path).await?;
            }
            self.inner.add_existing(item, None);
            Ok(true)
        }
        .await;
        result.unwrap_or_else(|err| {
            error!(id = %item.id, path = %temp_path.display(), "move to cache failed: {err}");
            false
        })
    }

    pub fn resize(&self, item_id: &str, length: u64) {
        if self.inner.registry.resize(item_id, length) {
            debug!(id = item_id, length, "cached file resized");
            self.inner.enforce_cap();
        }
    }

    pub async fn item_info(&self, item: &RemoteNode) -> Option<std::fs::Metadata> {
        let path = self.resolve_path(item).await.ok()??;
        tokio::fs::metadata(path).await.ok()
    }

    pub fn clear_all_in_background(&self) -> Option<JoinHandle<()>> {
        let inner = self.inner.clone();
        self.inner
            .clear_all_worker
            .run(async move { inner.clear_all().await })
    }

    pub fn clear_to_size_in_background(&self, bytes_to_free: u64) -> Option<JoinHandle<()>> {
        self.inner.clone().trigger_clear_to_size(bytes_to_free)
    }

    async fn prepare_download(
        &self,
        item: &RemoteNode,
    ) -> Result<(PathBuf, Arc<Downloader>), CacheError> {
        if let Some(link) = self.live_link(item).await {
            let downloader = Downloader::completed(item.clone(), link.clone());
            return Ok((link, Arc::new(downloader)));
        }

        let path = item_file(&self.inner.dir()?, &item.id)?;
        let observer: Arc<dyn FetchObserver> = Arc::new(CacheObserver(self.inner.clone()));
        let downloader = self
            .inner
            .coordinator
            .start_download(item, &path, observer)
            .await?;
        if downloader.is_complete() && !self.inner.registry.contains(&item.id) {
            self.inner.add_existing(item, None);
        }
        Ok((path, downloader))
    }

    async fn live_link(&self, item: &RemoteNode) -> Option<PathBuf> {
        let link = self.inner.registry.touch(&item.id)?.link_path?;
        match tokio::fs::try_exists(&link).await {
            Ok(true) => Some(link),
            _ => None,
        }
    }

    /// Finds the on-disk copy of `item`, adopting a complete unregistered
    /// file and forgetting entries whose file disappeared.
    async fn resolve_path(&self, item: &RemoteNode) -> Result<Option<PathBuf>, CacheError> {
        let path = item_file(&self.inner.dir()?, &item.id)?;
        let registry = &self.inner.registry;
        if !registry.contains(&item.id) {
            match tokio::fs::metadata(&path).await {
                Ok(metadata) if metadata.len() == item.length => {
                    self.inner.add_existing(item, None);
                }
                Ok(_) => return Ok(None),
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }

        if let Some(link) = self.live_link(item).await {
            return Ok(Some(link));
        }
        if !registry.contains(&item.id) || !tokio::fs::try_exists(&path).await? {
            registry.remove(&item.id);
            return Ok(None);
        }
        Ok(Some(path))
    }
}

impl CacheInner {
    fn dir(&self) -> Result<PathBuf, CacheError> {
        self.cache_dir
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(CacheError::NoCacheRoot)
    }

    fn add_existing(&self, item: &RemoteNode, source_path: Option<PathBuf>) -> Option<CacheEntry> {
        let entry = CacheEntry {
            link_path: source_path,
            ..CacheEntry::new(&item.id, item.length)
        };
        self.registry.try_add(entry.clone()).then_some(entry)
    }

    fn trigger_clear_to_size(self: Arc<Self>, bytes_to_free: u64) -> Option<JoinHandle<()>> {
        let inner = self.clone();
        self.clear_size_worker
            .run(async move { inner.clear_to_size(bytes_to_free).await })
    }

    async fn clear_all(&self) {
        let Ok(dir) = self.dir() else {
            return;
        };
        let removal = match remove_cached_files(&dir).await {
            Ok(removal) => removal,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(path = %dir.display(), "cache folder was already gone");
                Removal::default()
            }
            Err(err) => {
                error!(path = %dir.display(), "cannot access cache folder: {err}");
                return;
            }
        };

        self.recalculate_total_size().await;

        if removal.failed > 0 {
            warn!(failed = removal.failed, "some cached files are still in use and were kept");
        } else {
            info!(removed = removal.removed, "cache cleared");
        }
    }

    fn enforce_cap(self: &Arc<Self>) {
        let total = self.registry.total_size();
        let max = self.max_bytes.load(Ordering::Relaxed);
        if total > max {
            self.clone().trigger_clear_to_size(total - max);
        }
    }

    async fn clear_to_size(&self, bytes_to_free: u64) {
        let Ok(dir) = self.dir() else {
            return;
        };
        let mut freed = 0u64;
        let mut evicted = 0usize;
        for entry in self.registry.eviction_candidates() {
            if freed >= bytes_to_free {
                break;
            }
            let path = match item_file(&dir, &entry.id) {
                Ok(path) => path,
                Err(err) => {
                    warn!(id = %entry.id, "skipping eviction: {err}");
                    continue;
                }
            };
            match remove_if_exists(&path).await {
                Ok(()) => {
                    self.registry.remove(&entry.id);
                    freed += entry.length;
                    evicted += 1;
                }
                Err(err) => {
                    debug!(path = %path.display(), "eviction skipped file: {err}");
                }
            }
        }
        info!(
            evicted,
            freed,
            requested = bytes_to_free,
            total = self.registry.total_size(),
            "cache trimmed"
        );
    }

    async fn recalculate_total_size(&self) {
        let Ok(dir) = self.dir() else {
            return;
        };
        let mut entries = match scan_cache_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %dir.display(), "cannot scan cache folder: {err}");
                return;
            }
        };
        let scanned: std::collections::HashSet<String> =
            entries.iter().map(|entry| entry.id.clone()).collect();
        entries.extend(
            self.registry
                .snapshot()
                .into_iter()
                .filter(|entry| entry.is_linked() && !scanned.contains(&entry.id)),
        );
        self.registry.replace_all(entries);
        debug!(
            entries = self.registry.len(),
            total = self.registry.total_size(),
            "cache registry rebuilt"
        );
    }
}

struct CacheObserver(Arc<CacheInner>);

impl FetchObserver for CacheObserver {
    fn fetch_started(&self, item: &RemoteNode) {
        self.0
            .events
            .emit(SyncEvent::DownloadStarted { item: item.clone() });
    }

    fn fetch_finished(&self, item: &RemoteNode, _path: &Path) {
        let inner = &self.0;
        inner.registry.remove(&item.id);
        inner.registry.try_add(CacheEntry::new(&item.id, item.length));
        inner.events.emit(SyncEvent::Downloaded { item: item.clone() });
        inner.enforce_cap();
    }

    fn fetch_failed(&self, item: &RemoteNode, err: &DownloadError) {
        self.0.events.emit(SyncEvent::DownloadFailed {
            item: item.clone(),
            message: err.to_string(),
        });
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    pub removed: usize,
    pub failed: usize,
}

/// Deletes every regular file directly in `dir`, keeping the directory.
/// Files that cannot be removed (still open elsewhere) are counted and kept.
pub async fn remove_cached_files(dir: &Path) -> io::Result<Removal> {
    let mut removal = Removal::default();
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removal.removed += 1,
            Err(err) => {
                debug!(path = %entry.path().display(), "cannot delete cached file: {err}");
                removal.failed += 1;
            }
        }
    }
    Ok(removal)
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
