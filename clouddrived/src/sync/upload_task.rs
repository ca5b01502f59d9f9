use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use clouddrive_core::{
    CloudError, CloudStore, ErrorClass, RemoteNode, UploadProgress, UploadSource,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    events::{EventSink, SyncEvent},
    upload::{FailReason, UploadInfo, UploadState},
};

#[derive(Debug)]
pub(super) enum Outcome {
    Finished(RemoteNode),
    Failed { reason: FailReason, message: String },
    /// The service shut down mid-transfer; the upload stays queued.
    Stopped,
}

impl Outcome {
    fn failed(reason: FailReason, message: impl Into<String>) -> Self {
        Outcome::Failed {
            reason,
            message: message.into(),
        }
    }
}

pub(super) struct UploadContext {
    pub cloud: Arc<dyn CloudStore>,
    pub events: EventSink,
    pub verify_content_id: bool,
    pub timeout_recheck: Duration,
    pub duplicate_check_interval: Duration,
}

impl UploadContext {
    pub fn set_state(&self, info: &UploadInfo, state: UploadState) {
        self.events.emit(SyncEvent::UploadState {
            upload: info.clone(),
            state,
        });
    }

    /// Runs one attempt of `info`. May flip `info.overwrite` and fill in
    /// `content_id` for the next attempt.
    pub async fn run(&self, info: &mut UploadInfo, shutdown: &CancellationToken) -> Outcome {
        debug!(id = %info.id, path = %info.path, attempt = info.attempt, "upload started");
        match self.attempt(info, shutdown).await {
            Ok(outcome) => outcome,
            Err(err) => self.recover(info, err, shutdown).await,
        }
    }

    async fn attempt(
        &self,
        info: &mut UploadInfo,
        shutdown: &CancellationToken,
    ) -> Result<Outcome, CloudError> {
        if self.verify_content_id && info.content_id.is_none() {
            self.set_state(info, UploadState::ContentId);
            info.content_id = Some(self.cloud.content_fingerprint(&info.source_path).await?);
        }

        let source = UploadSource::new(&info.source_path);
        let node = if info.overwrite {
            let target = info.overwrite_target().to_string();
            let Some(current) = self.cloud.get_node(&target).await? else {
                error!(path = %info.path, "file to overwrite no longer exists");
                return Ok(Outcome::failed(FailReason::NoOverwriteNode, "No file to overwrite"));
            };
            if info.content_id.is_some() && info.content_id == current.content_id {
                warn!(path = %info.path, "file content is the same, skipping overwrite");
                current
            } else {
                self.set_state(info, UploadState::Uploading);
                let reporter = Reporter::new(self, info, shutdown, None);
                self.cloud.overwrite(&target, &source, &reporter).await?
            }
        } else {
            let Some(parent_id) = info.parent_id.clone() else {
                return Ok(Outcome::failed(FailReason::NoFolderNode, "Upload has no parent folder"));
            };
            let parent = self.cloud.get_node(&parent_id).await?;
            if !parent.is_some_and(|parent| parent.is_dir) {
                error!(path = %info.path, "folder to upload into does not exist");
                return Ok(Outcome::failed(FailReason::NoFolderNode, "Parent folder is missing"));
            }
            if self.cloud.get_child(&parent_id, info.name()).await?.is_some() {
                warn!(path = %info.path, "file with this name already exists");
                return Ok(Outcome::failed(FailReason::Conflict, "File already exists"));
            }

            self.set_state(info, UploadState::Uploading);
            let reporter = Reporter::new(self, info, shutdown, Some(parent_id.as_str()));
            match self
                .cloud
                .upload_new(&parent_id, info.name(), &source, &reporter)
                .await
            {
                Ok(node) => node,
                Err(_) if reporter.found_conflict() => {
                    return Ok(Outcome::failed(
                        FailReason::Conflict,
                        "A different file with the same name appeared during upload",
                    ));
                }
                Err(err) => return Err(err),
            }
        };

        if node.length != info.length {
            info.overwrite = true;
            info.target_id = Some(node.id.clone());
            return Ok(Outcome::failed(
                FailReason::Unexpected,
                format!(
                    "Uploaded file size is not correct: expected {}, got {}",
                    info.length, node.length
                ),
            ));
        }
        if info.content_id.is_some() && info.content_id != node.content_id {
            error!(
                path = %info.path,
                local = info.content_id.as_deref().unwrap_or_default(),
                remote = node.content_id.as_deref().unwrap_or_default(),
                "upload finished with content id mismatch"
            );
            return Ok(Outcome::failed(
                FailReason::ContentIdMismatch,
                "Uploaded content id does not match the local file, check the remote copy and upload again",
            ));
        }
        Ok(Outcome::Finished(node))
    }

    async fn recover(
        &self,
        info: &UploadInfo,
        err: CloudError,
        shutdown: &CancellationToken,
    ) -> Outcome {
        if info.is_cancelled() {
            info!(path = %info.path, "upload cancelled");
            return Outcome::failed(FailReason::Cancelled, "Upload cancelled");
        }
        if shutdown.is_cancelled() {
            return Outcome::Stopped;
        }
        if err.is_file_not_found() {
            error!(path = %info.path, "staged upload file not found: {err}");
            return Outcome::failed(FailReason::FileNotFound, "Cached upload file is not found");
        }

        match err.class() {
            ErrorClass::Conflict => match self.find_existing(info).await {
                Ok(Some(node)) => {
                    warn!(path = %info.path, "upload conflicted but the file is there");
                    Outcome::Finished(node)
                }
                Ok(None) => {
                    error!(path = %info.path, "upload conflict but no file: {err}");
                    Outcome::failed(
                        FailReason::Unexpected,
                        "Upload conflict but there is no file in the same place",
                    )
                }
                Err(lookup) => Outcome::failed(FailReason::Unexpected, lookup.to_string()),
            },
            ErrorClass::NotFound if info.overwrite => {
                error!(path = %info.path, "file to overwrite disappeared: {err}");
                Outcome::failed(FailReason::NoOverwriteNode, "No file to overwrite")
            }
            ErrorClass::NotFound => {
                error!(path = %info.path, "folder for new file is not found: {err}");
                Outcome::failed(FailReason::NoFolderNode, "Folder node for new file is not found")
            }
            ErrorClass::GatewayTimeout => {
                warn!(
                    path = %info.path,
                    wait = ?self.timeout_recheck,
                    "gateway timeout, checking later whether the file arrived"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return Outcome::Stopped,
                    _ = info.cancellation.cancelled() => {
                        return Outcome::failed(FailReason::Cancelled, "Upload cancelled");
                    }
                    _ = tokio::time::sleep(self.timeout_recheck) => {}
                }
                match self.find_existing(info).await {
                    Ok(Some(node)) => {
                        warn!(path = %info.path, "file appeared after gateway timeout");
                        Outcome::Finished(node)
                    }
                    Ok(None) => Outcome::failed(
                        FailReason::NoResultNode,
                        "Gateway timeout happened and the file still did not appear",
                    ),
                    Err(lookup) => Outcome::failed(FailReason::Unexpected, lookup.to_string()),
                }
            }
            ErrorClass::Other => {
                error!(path = %info.path, "upload failed: {err}");
                Outcome::failed(
                    FailReason::Unexpected,
                    format!("Unexpected error, upload will retry: {err}"),
                )
            }
        }
    }

    async fn find_existing(&self, info: &UploadInfo) -> Result<Option<RemoteNode>, CloudError> {
        if info.overwrite {
            let node = self.cloud.get_node(info.overwrite_target()).await?;
            return Ok(node.filter(|node| {
                info.content_id.is_some() && node.content_id == info.content_id
            }));
        }
        match &info.parent_id {
            Some(parent_id) => self.cloud.get_child(parent_id, info.name()).await,
            None => Ok(None),
        }
    }
}

struct SiblingWatch<'a> {
    parent_id: &'a str,
    last_check: Mutex<Instant>,
    conflict: AtomicBool,
}

/// Progress callback handed to the store: publishes progress, watches for
/// same-named files appearing out of band and aborts on cancellation.
struct Reporter<'a> {
    ctx: &'a UploadContext,
    info: &'a UploadInfo,
    shutdown: &'a CancellationToken,
    siblings: Option<SiblingWatch<'a>>,
}

impl<'a> Reporter<'a> {
    fn new(
        ctx: &'a UploadContext,
        info: &'a UploadInfo,
        shutdown: &'a CancellationToken,
        parent_id: Option<&'a str>,
    ) -> Self {
        Self {
            ctx,
            info,
            shutdown,
            siblings: parent_id.map(|parent_id| SiblingWatch {
                parent_id,
                last_check: Mutex::new(Instant::now()),
                conflict: AtomicBool::new(false),
            }),
        }
    }

    fn found_conflict(&self) -> bool {
        self.siblings
            .as_ref()
            .is_some_and(|watch| watch.conflict.load(Ordering::Acquire))
    }

    async fn check_siblings(&self, watch: &SiblingWatch<'_>) -> Result<(), CloudError> {
        let due = {
            let mut last = watch.last_check.lock().unwrap_or_else(PoisonError::into_inner);
            if last.elapsed() >= self.ctx.duplicate_check_interval {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if !due {
            return Ok(());
        }

        let Some(sibling) = self
            .ctx
            .cloud
            .get_child(watch.parent_id, self.info.name())
            .await?
        else {
            return Ok(());
        };
        if self.info.content_id.is_some() && sibling.content_id == self.info.content_id {
            warn!(path = %self.info.path, "same file already exists, cancelling upload");
            self.info.cancellation.cancel();
            Ok(())
        } else {
            warn!(path = %self.info.path, "different file with the same name appeared");
            watch.conflict.store(true, Ordering::Release);
            Err(CloudError::conflict())
        }
    }
}

#[async_trait]
impl UploadProgress for Reporter<'_> {
    async fn on_progress(&self, done: u64) -> Result<(), CloudError> {
        if self.shutdown.is_cancelled() || self.info.is_cancelled() {
            return Err(CloudError::Cancelled);
        }
        if let Some(watch) = &self.siblings {
            self.check_siblings(watch).await?;
        }

        self.ctx.events.emit(SyncEvent::UploadProgress {
            upload: self.info.clone(),
            done,
        });
        if done == self.info.length {
            self.ctx.set_state(self.info, UploadState::Finishing);
        }
        Ok(())
    }
}
