use clouddrive_core::RemoteNode;
use tokio::sync::mpsc;
use tracing::trace;

use super::upload::{FailReason, UploadInfo, UploadState};

/// Notifications published by the cache and the upload queue.
///
/// Events go over one FIFO channel. While a worker holds an upload only that
/// worker reports it, so `UploadFailed` or `UploadFinished` is the last event
/// of each upload.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    DownloadStarted {
        item: RemoteNode,
    },
    Downloaded {
        item: RemoteNode,
    },
    DownloadFailed {
        item: RemoteNode,
        message: String,
    },
    UploadAdded {
        upload: UploadInfo,
    },
    UploadState {
        upload: UploadInfo,
        state: UploadState,
    },
    UploadProgress {
        upload: UploadInfo,
        done: u64,
    },
    UploadFinished {
        upload: UploadInfo,
        node: RemoteNode,
    },
    UploadFailed {
        upload: UploadInfo,
        reason: FailReason,
        message: String,
    },
}

impl SyncEvent {
    pub fn subject_id(&self) -> &str {
        match self {
            SyncEvent::DownloadStarted { item }
            | SyncEvent::Downloaded { item }
            | SyncEvent::DownloadFailed { item, .. } => &item.id,
            SyncEvent::UploadAdded { upload }
            | SyncEvent::UploadState { upload, .. }
            | SyncEvent::UploadProgress { upload, .. }
            | SyncEvent::UploadFinished { upload, .. }
            | SyncEvent::UploadFailed { upload, .. } => &upload.id,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SyncEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SyncEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        if let Err(err) = tx.send(event) {
            trace!(subject = err.0.subject_id(), "event receiver dropped");
        }
    }
}
