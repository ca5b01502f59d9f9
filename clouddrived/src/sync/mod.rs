pub mod cache;
pub mod core;
pub mod downloader;
pub mod events;
pub mod paths;
pub mod queue;
pub mod reader;
pub mod registry;
pub mod retry;
mod sweep;
pub mod upload;
pub mod upload_service;
mod upload_task;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheConfig, CacheError, DownloadCache};
pub use self::core::{CoreError, NewFileWriter, SyncCore};
pub use events::{EventSink, SyncEvent};
pub use reader::CachedFile;
pub use upload::{FailReason, UploadError, UploadInfo, UploadState};
pub use upload_service::{UploadConfig, UploadService};
