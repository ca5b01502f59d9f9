use std::{
    collections::{HashMap, HashSet},
    io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use clouddrive_core::{CloudStore, RemoteNode};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    events::{EventSink, SyncEvent},
    paths::{Layout, item_file, staged_file},
    queue::UploadQueue,
    retry::RetryPolicy,
    upload::{
        FailReason, UploadError, UploadInfo, UploadState, read_descriptors, remove_upload_files,
        write_descriptor,
    },
    upload_task::{Outcome, UploadContext},
};
use crate::storage::{Direction, FileCipher};

const DRAIN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct UploadConfig {
    pub concurrency: usize,
    pub verify_content_id: bool,
    pub retry_delay: Duration,
    pub timeout_recheck: Duration,
    pub duplicate_check_interval: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            verify_content_id: true,
            retry_delay: Duration::from_secs(5),
            timeout_recheck: Duration::from_secs(30),
            duplicate_check_interval: Duration::from_secs(600),
        }
    }
}

/// Durable upload queue: every accepted upload has a descriptor and an
/// encrypted payload under `<root>/Upload/<cloud id>` until it finishes or
/// fails terminally.
pub struct UploadService {
    shared: Arc<Shared>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

struct Dispatcher {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

struct Shared {
    ctx: UploadContext,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    queue: UploadQueue<UploadInfo>,
    tracked: Mutex<Tracked>,
    upload_dir: RwLock<Option<PathBuf>>,
    outstanding: AtomicUsize,
}

impl UploadService {
    pub fn new(cloud: Arc<dyn CloudStore>, config: UploadConfig, events: EventSink) -> Self {
        let shared = Shared {
            ctx: UploadContext {
                cloud,
                events,
                verify_content_id: config.verify_content_id,
                timeout_recheck: config.timeout_recheck,
                duplicate_check_interval: config.duplicate_check_interval,
            },
            retry: RetryPolicy::new(config.retry_delay),
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            queue: UploadQueue::new(),
            tracked: Mutex::new(Tracked::default()),
            upload_dir: RwLock::new(None),
            outstanding: AtomicUsize::new(0),
        };
        Self {
            shared: Arc::new(shared),
            dispatcher: Mutex::new(None),
        }
    }

    pub async fn set_cache_root(&self, root: &Path) -> Result<usize, UploadError> {
        let dir = Layout::new(root).upload_dir(self.shared.ctx.cloud.id());
        {
            let mut current = self
                .shared
                .upload_dir
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if current.as_deref() == Some(dir.as_path()) {
                return Ok(0);
            }
            debug!(previous = ?current.as_deref(), to = %dir.display(), "upload directory changed");
            *current = Some(dir.clone());
        }
        tokio::fs::create_dir_all(&dir).await?;
        self.recover().await
    }

    pub fn upload_dir(&self) -> Option<PathBuf> {
        self.shared.dir().ok()
    }

    /// Re-enqueues every descriptor not already tracked, oldest first.
    /// Descriptors whose payload is gone are discarded.
    pub async fn recover(&self) -> Result<usize, UploadError> {
        let dir = self.shared.dir()?;
        let found = read_descriptors(&dir).await?;
        if found.is_empty() {
            return Ok(0);
        }
        warn!(count = found.len(), "unfinished uploads found, resuming");

        let mut resumed = 0;
        for info in found {
            if self.shared.tracked().uploads.contains_key(&info.id) {
                debug!(id = %info.id, "upload already queued");
                continue;
            }
            if !tokio::fs::try_exists(&info.source_path).await.unwrap_or(false) {
                error!(
                    id = %info.id,
                    path = %info.path,
                    "cached upload file not found, dropping upload"
                );
                remove_upload_files(&dir, &info, true).await;
                continue;
            }
            self.shared.admit(info);
            resumed += 1;
        }
        Ok(resumed)
    }

    pub async fn enqueue_new(
        &self,
        parent: &RemoteNode,
        local_file: &Path,
    ) -> Result<UploadInfo, UploadError> {
        let name = local_file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| UploadError::NoFileName(local_file.to_path_buf()))?;
        self.enqueue_new_named(parent, local_file, name).await
    }

    pub async fn enqueue_new_named(
        &self,
        parent: &RemoteNode,
        local_file: &Path,
        name: &str,
    ) -> Result<UploadInfo, UploadError> {
        self.stage_new(parent, local_file, name, None).await
    }

    /// Like [`Self::enqueue_new_named`], but the queue takes ownership of
    /// `plain_file` and hands it to the cache once the upload finishes.
    pub(crate) async fn enqueue_new_owned(
        &self,
        parent: &RemoteNode,
        plain_file: &Path,
        name: &str,
    ) -> Result<UploadInfo, UploadError> {
        self.stage_new(parent, plain_file, name, Some(plain_file.to_path_buf()))
            .await
    }

    pub async fn enqueue_overwrite(&self, item: &RemoteNode) -> Result<UploadInfo, UploadError> {
        let plain = item_file(&self.shared.dir()?, &item.id)?;
        self.stage_overwrite(item, &plain, Some(plain.clone())).await
    }

    pub async fn enqueue_overwrite_from(
        &self,
        item: &RemoteNode,
        source: &Path,
    ) -> Result<UploadInfo, UploadError> {
        self.stage_overwrite(item, source, None).await
    }

    /// Cancels a queued or running upload and removes its files. Returns
    /// `false` if `id` is not tracked.
    ///
    /// A running upload is reported by its worker once the attempt stops.
    pub async fn cancel(&self, id: &str) -> bool {
        let Some((info, running)) = self.shared.detach(id) else {
            return false;
        };
        info!(id, path = %info.path, running, "cancelling upload");
        info.cancellation.cancel();
        if !running {
            self.shared.fail(&info, FailReason::Cancelled, "Upload cancelled");
        }
        if let Ok(dir) = self.shared.dir() {
            remove_upload_files(&dir, &info, true).await;
        }
        true
    }

    pub fn start(&self) {
        let mut dispatcher = self.lock_dispatcher();
        if dispatcher.is_some() {
            return;
        }
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(self.shared.clone().dispatch(shutdown.clone()));
        *dispatcher = Some(Dispatcher { shutdown, handle });
    }

    /// Stops the dispatcher. Running uploads are interrupted at their next
    /// progress report and stay queued.
    pub async fn stop(&self) {
        let Some(dispatcher) = self.lock_dispatcher().take() else {
            return;
        };
        dispatcher.shutdown.cancel();
        if let Err(err) = dispatcher.handle.await {
            if err.is_panic() {
                error!("upload dispatcher panicked: {err}");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_dispatcher().is_some()
    }

    /// Waits until nothing is queued and every worker slot is free.
    /// Uploads sleeping before a retry do not count.
    pub async fn wait_for_drain(&self) {
        while self.shared.outstanding.load(Ordering::Acquire) > 0 {
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    pub fn pending(&self) -> Vec<UploadInfo> {
        let mut pending: Vec<UploadInfo> =
            self.shared.tracked().uploads.values().cloned().collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        pending
    }

    async fn stage_new(
        &self,
        parent: &RemoteNode,
        local_file: &Path,
        name: &str,
        plain_path: Option<PathBuf>,
    ) -> Result<UploadInfo, UploadError> {
        let dir = self.shared.dir()?;
        tokio::fs::create_dir_all(&dir).await?;
        let id = Uuid::new_v4().to_string();
        let source_path = staged_file(&dir, &id)?;
        let length = self.shared.encrypt(local_file, &source_path).await?;
        let info = UploadInfo {
            parent_id: Some(parent.id.clone()),
            plain_path,
            ..UploadInfo::new(id, parent.child_path(name), source_path, length)
        };
        self.shared.submit(info).await
    }

    async fn stage_overwrite(
        &self,
        item: &RemoteNode,
        source: &Path,
        plain_path: Option<PathBuf>,
    ) -> Result<UploadInfo, UploadError> {
        let dir = self.shared.dir()?;
        tokio::fs::create_dir_all(&dir).await?;
        // Payload and descriptor of a pending upload for the item share its
        // names, so they stay untouched until the new payload is complete.
        let scratch = staged_file(&dir, &format!("{}.{}", item.id, Uuid::new_v4()))?;
        let length = self.shared.encrypt(source, &scratch).await?;

        if let Some((previous, running)) = self.shared.detach(&item.id) {
            info!(id = %item.id, running, "newer content supersedes pending upload");
            previous.cancellation.cancel();
            if !running {
                self.shared.fail(
                    &previous,
                    FailReason::Cancelled,
                    "Superseded by newer content",
                );
            }
        }
        let source_path = staged_file(&dir, &item.id)?;
        if let Err(err) = tokio::fs::rename(&scratch, &source_path).await {
            remove_partial(&scratch).await;
            return Err(err.into());
        }
        let info = UploadInfo {
            parent_id: item.parent_id.clone(),
            overwrite: true,
            plain_path,
            ..UploadInfo::new(&item.id, &item.path, source_path, length)
        };
        self.shared.submit(info).await
    }

    fn lock_dispatcher(&self) -> MutexGuard<'_, Option<Dispatcher>> {
        self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for UploadService {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.lock_dispatcher().take() {
            dispatcher.shutdown.cancel();
        }
    }
}

impl Shared {
    fn dir(&self) -> Result<PathBuf, UploadError> {
        self.upload_dir
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(UploadError::NoUploadDir)
    }

    fn tracked(&self) -> MutexGuard<'_, Tracked> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stops tracking `id`. Also returns whether a worker holds the upload,
    /// in which case that worker reports its end.
    fn detach(&self, id: &str) -> Option<(UploadInfo, bool)> {
        let mut tracked = self.tracked();
        let info = tracked.uploads.remove(id)?;
        let running = tracked.running.remove(id);
        Some((info, running))
    }

    fn claim(&self, info: &UploadInfo) -> bool {
        let mut tracked = self.tracked();
        if !tracked.owns(info) {
            return false;
        }
        tracked.running.insert(info.id.clone());
        true
    }

    /// Forgets `info` if it is still the tracked instance for its id.
    /// Whoever succeeds reports the upload's end.
    fn untrack(&self, info: &UploadInfo) -> bool {
        let mut tracked = self.tracked();
        if !tracked.owns(info) {
            return false;
        }
        tracked.uploads.remove(&info.id);
        tracked.running.remove(&info.id);
        true
    }

    fn refresh(&self, info: &UploadInfo) -> bool {
        let mut tracked = self.tracked();
        if !tracked.owns(info) {
            return false;
        }
        tracked.uploads.insert(info.id.clone(), info.clone());
        true
    }

    /// Takes `info` back from its worker; a later `cancel` reports it.
    fn park(&self, info: &UploadInfo) -> bool {
        let mut tracked = self.tracked();
        if !tracked.owns(info) {
            return false;
        }
        tracked.uploads.insert(info.id.clone(), info.clone());
        tracked.running.remove(&info.id);
        true
    }

    fn report_detached(&self, info: &UploadInfo) {
        debug!(id = %info.id, "upload cancelled while running");
        self.fail(info, FailReason::Cancelled, "Upload cancelled");
    }

    fn fail(&self, info: &UploadInfo, reason: FailReason, message: &str) {
        self.ctx.events.emit(SyncEvent::UploadFailed {
            upload: info.clone(),
            reason,
            message: message.to_string(),
        });
    }

    async fn encrypt(&self, source: &Path, staged: &Path) -> Result<u64, UploadError> {
        match FileCipher::global()
            .transform(source, staged, Direction::Encrypt)
            .await
        {
            Ok(length) => Ok(length),
            Err(err) => {
                remove_partial(staged).await;
                Err(err.into())
            }
        }
    }

    async fn submit(&self, info: UploadInfo) -> Result<UploadInfo, UploadError> {
        let dir = self.dir()?;
        if let Err(err) = write_descriptor(&dir, &info).await {
            remove_upload_files(&dir, &info, false).await;
            return Err(err);
        }
        info!(id = %info.id, path = %info.path, length = info.length, "upload queued");
        self.admit(info.clone());
        Ok(info)
    }

    fn admit(&self, info: UploadInfo) {
        self.tracked().uploads.insert(info.id.clone(), info.clone());
        self.ctx.events.emit(SyncEvent::UploadAdded {
            upload: info.clone(),
        });
        self.enqueue(info, false);
    }

    fn enqueue(&self, info: UploadInfo, front: bool) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        if front {
            self.queue.push_front(info);
        } else {
            self.queue.push(info);
        }
    }

    fn release(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    async fn dispatch(self: Arc<Self>, shutdown: CancellationToken) {
        info!("upload service started");
        while let Some(upload) = self.queue.pop(&shutdown).await {
            if upload.is_cancelled() {
                debug!(id = %upload.id, "skipping cancelled upload");
                self.release();
                continue;
            }
            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => permit,
                _ = shutdown.cancelled() => {
                    self.queue.push_front(upload);
                    break;
                }
            };
            let Ok(permit) = permit else {
                self.queue.push_front(upload);
                break;
            };
            if !self.claim(&upload) {
                debug!(id = %upload.id, "skipping cancelled upload");
                self.release();
                continue;
            }
            tokio::spawn(self.clone().process(upload, permit, shutdown.clone()));
        }
        info!("upload service stopped");
    }

    async fn process(
        self: Arc<Self>,
        mut upload: UploadInfo,
        permit: OwnedSemaphorePermit,
        shutdown: CancellationToken,
    ) {
        let outcome = self.ctx.run(&mut upload, &shutdown).await;
        drop(permit);
        self.release();

        match outcome {
            Outcome::Finished(node) => {
                if !self.untrack(&upload) {
                    self.report_detached(&upload);
                    return;
                }
                info!(path = %upload.path, node = %node.id, "upload finished");
                if let Ok(dir) = self.dir() {
                    remove_upload_files(&dir, &upload, false).await;
                }
                self.ctx
                    .events
                    .emit(SyncEvent::UploadFinished { upload, node });
            }
            Outcome::Failed { reason, message } if reason.is_terminal() => {
                if !self.untrack(&upload) {
                    self.report_detached(&upload);
                    return;
                }
                warn!(path = %upload.path, ?reason, "upload failed: {message}");
                self.fail(&upload, reason, &message);
                if let Ok(dir) = self.dir() {
                    remove_upload_files(&dir, &upload, true).await;
                }
            }
            Outcome::Failed { reason, message } => {
                if !self.refresh(&upload) {
                    self.report_detached(&upload);
                    return;
                }
                warn!(
                    path = %upload.path,
                    attempt = upload.attempt,
                    ?reason,
                    "upload failed, will retry: {message}"
                );
                self.fail(&upload, reason, &message);
                self.ctx.set_state(&upload, UploadState::Failed);
                if let Ok(dir) = self.dir() {
                    if let Err(err) = write_descriptor(&dir, &upload).await {
                        warn!(id = %upload.id, "cannot update upload descriptor: {err}");
                    }
                }
                if !self.park(&upload) {
                    self.report_detached(&upload);
                    return;
                }

                let waited = self.retry.wait(upload.attempt, &shutdown).await;
                upload.attempt += 1;
                if upload.is_cancelled() || !self.refresh(&upload) {
                    return;
                }
                if waited {
                    warn!(path = %upload.path, attempt = upload.attempt, "repeating upload");
                    self.ctx.set_state(&upload, UploadState::Waiting);
                }
                self.enqueue(upload, !waited);
            }
            Outcome::Stopped => {
                if !self.park(&upload) {
                    self.report_detached(&upload);
                    return;
                }
                debug!(id = %upload.id, "upload interrupted by shutdown");
                self.enqueue(upload, true);
            }
        }
    }
}

#[derive(Default)]
struct Tracked {
    uploads: HashMap<String, UploadInfo>,
    running: HashSet<String>,
}

impl Tracked {
    fn owns(&self, info: &UploadInfo) -> bool {
        self.uploads
            .get(&info.id)
            .is_some_and(|current| current.created_at == info.created_at)
    }
}

async fn remove_partial(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), "cannot remove partial payload: {err}");
        }
    }
}

#[cfg(test)]
#[path = "upload_service_tests.rs"]
mod tests;
