use clouddrive_core::CloudError;
use tempfile::{TempDir, tempdir};
use tokio::sync::mpsc::UnboundedReceiver;

use super::*;
use crate::sync::testing::{MemoryCloud, Sibling, pattern, sealed, write_file};

const PATIENCE: Duration = Duration::from_secs(20);

fn config() -> UploadConfig {
    UploadConfig {
        concurrency: 2,
        verify_content_id: true,
        retry_delay: Duration::from_millis(30),
        timeout_recheck: Duration::from_millis(10),
        duplicate_check_interval: Duration::from_secs(600),
    }
}

struct Fixture {
    dir: TempDir,
    cloud: Arc<MemoryCloud>,
    root: RemoteNode,
    service: UploadService,
    events: UnboundedReceiver<SyncEvent>,
}

impl Fixture {
    async fn new(config: UploadConfig) -> Self {
        let dir = tempdir().unwrap();
        let cloud = MemoryCloud::new();
        let root = cloud.add_dir("root", "/");
        let (sink, events) = EventSink::channel();
        let service = UploadService::new(cloud.clone(), config, sink);
        assert_eq!(service.set_cache_root(dir.path()).await.unwrap(), 0);
        Self {
            dir,
            cloud,
            root,
            service,
            events,
        }
    }

    fn local(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.dir.path().join("local").join(name);
        write_file(&path, content);
        path
    }

    fn upload_file(&self, name: &str) -> PathBuf {
        self.service.upload_dir().unwrap().join(name)
    }

    async fn next_event(&mut self) -> SyncEvent {
        tokio::time::timeout(PATIENCE, self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    async fn until_done(&mut self) -> Vec<SyncEvent> {
        let mut seen = Vec::new();
        loop {
            let event = self.next_event().await;
            let done = match &event {
                SyncEvent::UploadFinished { .. } => true,
                SyncEvent::UploadFailed { reason, .. } => reason.is_terminal(),
                _ => false,
            };
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    async fn next_failure(&mut self) -> FailReason {
        loop {
            if let SyncEvent::UploadFailed { reason, .. } = self.next_event().await {
                return reason;
            }
        }
    }

    async fn drain(&self) {
        tokio::time::timeout(PATIENCE, self.service.wait_for_drain())
            .await
            .expect("queue never drained");
    }
}

fn finished(events: &[SyncEvent]) -> (UploadInfo, RemoteNode) {
    match events.last() {
        Some(SyncEvent::UploadFinished { upload, node }) => (upload.clone(), node.clone()),
        other => panic!("expected a finished upload, got {other:?}"),
    }
}

fn upload_of(event: &SyncEvent) -> Option<&UploadInfo> {
    match event {
        SyncEvent::UploadAdded { upload }
        | SyncEvent::UploadState { upload, .. }
        | SyncEvent::UploadProgress { upload, .. }
        | SyncEvent::UploadFinished { upload, .. }
        | SyncEvent::UploadFailed { upload, .. } => Some(upload),
        _ => None,
    }
}

fn failure(events: &[SyncEvent]) -> FailReason {
    match events.last() {
        Some(SyncEvent::UploadFailed { reason, .. }) => *reason,
        other => panic!("expected a failed upload, got {other:?}"),
    }
}

#[tokio::test]
async fn new_upload_reaches_remote_and_cleans_up() {
    let mut fx = Fixture::new(config()).await;
    let content = pattern(200_000);
    let local = fx.local("report.txt", &content);

    let info = fx.service.enqueue_new(&fx.root, &local).await.unwrap();
    assert_eq!(info.path, "/report.txt");
    assert_eq!(info.length, 200_000);
    assert!(fx.upload_file(&format!("{}.info", info.id)).exists());
    assert!(info.source_path.exists());

    fx.service.start();
    let events = fx.until_done().await;
    let (upload, node) = finished(&events);

    assert_eq!(upload.id, info.id);
    assert_eq!(node.name, "report.txt");
    assert_eq!(fx.cloud.content(&node.id).unwrap(), sealed(&content));
    assert!(matches!(events[0], SyncEvent::UploadAdded { .. }));
    let states: Vec<UploadState> = events
        .iter()
        .filter_map(|event| match event {
            SyncEvent::UploadState { state, .. } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        [UploadState::ContentId, UploadState::Uploading, UploadState::Finishing]
    );

    assert!(!fx.upload_file(&format!("{}.info", info.id)).exists());
    assert!(!info.source_path.exists());
    assert!(local.exists());
    assert!(fx.service.pending().is_empty());
    fx.service.stop().await;
    assert!(!fx.service.is_running());
}

#[tokio::test]
async fn same_content_sibling_cancels_redundant_upload() {
    let mut fx = Fixture::new(UploadConfig {
        duplicate_check_interval: Duration::ZERO,
        ..config()
    })
    .await;
    let content = pattern(10 * 1024 * 1024);
    let local = fx.local("movie.bin", &content);
    fx.cloud.inject_sibling(Sibling::SameContent);

    let info = fx.service.enqueue_new(&fx.root, &local).await.unwrap();
    fx.service.start();
    let events = fx.until_done().await;

    assert_eq!(failure(&events), FailReason::Cancelled);
    let children = fx.cloud.children("root");
    assert_eq!(children.len(), 1);
    assert_eq!(fx.cloud.content(&children[0].id).unwrap(), sealed(&content));
    let progress_reports = events
        .iter()
        .filter(|event| matches!(event, SyncEvent::UploadProgress { .. }))
        .count();
    assert!(progress_reports < 10);
    assert!(!info.source_path.exists());
    assert!(fx.service.pending().is_empty());
}

#[tokio::test]
async fn different_sibling_aborts_with_conflict() {
    let mut fx = Fixture::new(UploadConfig {
        duplicate_check_interval: Duration::ZERO,
        ..config()
    })
    .await;
    let local = fx.local("notes.txt", &pattern(300_000));
    fx.cloud.inject_sibling(Sibling::OtherContent);

    fx.service.enqueue_new(&fx.root, &local).await.unwrap();
    fx.service.start();

    assert_eq!(failure(&fx.until_done().await), FailReason::Conflict);
    let children = fx.cloud.children("root");
    assert_eq!(children.len(), 1);
    assert_eq!(
        fx.cloud.content(&children[0].id).unwrap(),
        b"someone else's bytes"
    );
}

#[tokio::test]
async fn length_mismatch_retries_as_overwrite() {
    let mut fx = Fixture::new(UploadConfig {
        retry_delay: Duration::from_millis(200),
        ..config()
    })
    .await;
    let content = pattern(5000);
    let local = fx.local("data.bin", &content);
    fx.cloud.report_length(Some(1));

    fx.service.enqueue_new(&fx.root, &local).await.unwrap();
    fx.service.start();
    assert_eq!(fx.next_failure().await, FailReason::Unexpected);
    fx.cloud.report_length(None);

    let (upload, node) = finished(&fx.until_done().await);
    assert!(upload.overwrite);
    assert_eq!(upload.target_id.as_deref(), Some(node.id.as_str()));
    assert_eq!(upload.attempt, 1);
    assert_eq!(node.length, 5000);
    assert_eq!(fx.cloud.uploads.load(Ordering::SeqCst), 1);
    assert_eq!(fx.cloud.children("root").len(), 1);
}

#[tokio::test]
async fn content_id_mismatch_is_terminal() {
    let mut fx = Fixture::new(config()).await;
    let local = fx.local("a.txt", b"payload");
    fx.cloud.report_content_id(Some("0123456789abcdef"));

    let info = fx.service.enqueue_new(&fx.root, &local).await.unwrap();
    fx.service.start();

    assert_eq!(failure(&fx.until_done().await), FailReason::ContentIdMismatch);
    assert!(!fx.upload_file(&format!("{}.info", info.id)).exists());
    assert!(!info.source_path.exists());
    assert!(fx.service.pending().is_empty());
}

#[tokio::test]
async fn missing_parent_fails_with_no_folder_node() {
    let mut fx = Fixture::new(config()).await;
    let local = fx.local("a.txt", b"payload");
    let ghost = RemoteNode::dir("ghost", "/ghost");

    fx.service.enqueue_new(&ghost, &local).await.unwrap();
    fx.service.start();

    assert_eq!(failure(&fx.until_done().await), FailReason::NoFolderNode);
    assert_eq!(fx.cloud.uploads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn existing_name_conflicts_before_sending() {
    let mut fx = Fixture::new(config()).await;
    fx.cloud.add_file("old", &fx.root, "a.txt", b"x");
    let local = fx.local("a.txt", b"payload");

    fx.service.enqueue_new(&fx.root, &local).await.unwrap();
    fx.service.start();

    assert_eq!(failure(&fx.until_done().await), FailReason::Conflict);
    assert_eq!(fx.cloud.uploads.load(Ordering::SeqCst), 0);
    assert_eq!(fx.cloud.content("old").unwrap(), b"x");
}

#[tokio::test]
async fn conflict_reply_converges_when_file_exists() {
    let mut fx = Fixture::new(config()).await;
    let local = fx.local("a.txt", b"payload");
    fx.cloud.store_then_fail(409);

    fx.service.enqueue_new(&fx.root, &local).await.unwrap();
    fx.service.start();

    let (_, node) = finished(&fx.until_done().await);
    assert_eq!(node.name, "a.txt");
    assert_eq!(fx.cloud.children("root").len(), 1);
    assert_eq!(fx.cloud.uploads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn gateway_timeout_recheck_finds_stored_file() {
    let mut fx = Fixture::new(config()).await;
    let local = fx.local("a.txt", b"payload");
    fx.cloud.store_then_fail(504);

    fx.service.enqueue_new(&fx.root, &local).await.unwrap();
    fx.service.start();

    let (_, node) = finished(&fx.until_done().await);
    assert_eq!(fx.cloud.content(&node.id).unwrap(), sealed(b"payload"));
    assert_eq!(fx.cloud.uploads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn gateway_timeout_without_file_is_retried() {
    let mut fx = Fixture::new(config()).await;
    let local = fx.local("a.txt", b"payload");
    fx.cloud
        .push_upload_error(CloudError::status(504, "gateway timeout"));

    fx.service.enqueue_new(&fx.root, &local).await.unwrap();
    fx.service.start();

    assert_eq!(fx.next_failure().await, FailReason::NoResultNode);
    finished(&fx.until_done().await);
    assert_eq!(fx.cloud.uploads.load(Ordering::SeqCst), 2);
    assert_eq!(fx.cloud.children("root").len(), 1);
}

#[tokio::test]
async fn transient_error_is_retried_until_success() {
    let mut fx = Fixture::new(config()).await;
    let local = fx.local("a.txt", b"payload");
    fx.cloud
        .push_upload_error(CloudError::status(500, "internal error"));
    fx.cloud
        .push_upload_error(CloudError::status(503, "unavailable"));

    fx.service.enqueue_new(&fx.root, &local).await.unwrap();
    fx.service.start();

    assert_eq!(fx.next_failure().await, FailReason::Unexpected);
    assert_eq!(fx.next_failure().await, FailReason::Unexpected);
    let (upload, _) = finished(&fx.until_done().await);
    assert_eq!(upload.attempt, 2);
    assert_eq!(fx.cloud.uploads.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn overwrite_replaces_remote_content() {
    let mut fx = Fixture::new(config()).await;
    let item = fx.cloud.add_file("doc", &fx.root, "doc.txt", &sealed(b"old"));
    let plain = fx.upload_file("doc");
    write_file(&plain, b"new content");

    let info = fx.service.enqueue_overwrite(&item).await.unwrap();
    assert!(info.overwrite);
    assert_eq!(info.plain_path.as_deref(), Some(plain.as_path()));
    fx.service.start();

    let (upload, node) = finished(&fx.until_done().await);
    assert_eq!(node.id, "doc");
    assert_eq!(fx.cloud.content("doc").unwrap(), sealed(b"new content"));
    assert_eq!(fx.cloud.overwrites.load(Ordering::SeqCst), 1);
    assert_eq!(upload.plain_path.as_deref(), Some(plain.as_path()));
    assert!(plain.exists());
    assert!(!fx.upload_file("doc.temp").exists());
    assert!(!fx.upload_file("doc.info").exists());
}

#[tokio::test]
async fn overwrite_with_identical_content_skips_transfer() {
    let mut fx = Fixture::new(config()).await;
    let item = fx.cloud.add_file("doc", &fx.root, "doc.txt", &sealed(b"same"));
    let local = fx.local("doc.txt", b"same");

    fx.service.enqueue_overwrite_from(&item, &local).await.unwrap();
    fx.service.start();

    let (_, node) = finished(&fx.until_done().await);
    assert_eq!(node.id, "doc");
    assert_eq!(fx.cloud.overwrites.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn overwrite_of_missing_node_is_terminal() {
    let mut fx = Fixture::new(config()).await;
    let item = RemoteNode::file("gone", "/", "gone.txt", 3);
    let local = fx.local("gone.txt", b"abc");

    fx.service.enqueue_overwrite_from(&item, &local).await.unwrap();
    fx.service.start();

    assert_eq!(failure(&fx.until_done().await), FailReason::NoOverwriteNode);
    assert_eq!(fx.cloud.overwrites.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_payload_fails_with_file_not_found() {
    let mut fx = Fixture::new(config()).await;
    let local = fx.local("a.txt", b"payload");
    let info = fx.service.enqueue_new(&fx.root, &local).await.unwrap();
    std::fs::remove_file(&info.source_path).unwrap();

    fx.service.start();

    assert_eq!(failure(&fx.until_done().await), FailReason::FileNotFound);
    assert!(!fx.upload_file(&format!("{}.info", info.id)).exists());
}

#[tokio::test]
async fn recovery_resumes_each_upload_once_oldest_first() {
    let dir = tempdir().unwrap();
    let cloud = MemoryCloud::new();
    let root = cloud.add_dir("root", "/");

    let first = UploadService::new(cloud.clone(), config(), EventSink::disabled());
    first.set_cache_root(dir.path()).await.unwrap();
    let mut ids = Vec::new();
    for name in ["a.txt", "b.txt", "c.txt", "d.txt"] {
        let local = dir.path().join(name);
        write_file(&local, name.as_bytes());
        ids.push(first.enqueue_new(&root, &local).await.unwrap().id);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    let upload_dir = first.upload_dir().unwrap();
    drop(first);
    std::fs::remove_file(upload_dir.join(format!("{}.temp", ids[3]))).unwrap();

    let second = UploadService::new(cloud.clone(), config(), EventSink::disabled());
    assert_eq!(second.set_cache_root(dir.path()).await.unwrap(), 3);
    assert_eq!(second.recover().await.unwrap(), 0);
    assert_eq!(second.set_cache_root(dir.path()).await.unwrap(), 0);

    let pending: Vec<String> = second.pending().into_iter().map(|info| info.id).collect();
    assert_eq!(pending, ids[..3]);
    assert!(!upload_dir.join(format!("{}.info", ids[3])).exists());

    second.start();
    tokio::time::timeout(PATIENCE, second.wait_for_drain())
        .await
        .unwrap();
    let mut names: Vec<String> = cloud
        .children("root")
        .into_iter()
        .map(|node| node.name)
        .collect();
    names.sort();
    assert_eq!(names, ["a.txt", "b.txt", "c.txt"]);
    assert_eq!(cloud.uploads.load(Ordering::SeqCst), 3);
    second.stop().await;
}

#[tokio::test]
async fn cancel_removes_upload_and_reports_once() {
    let mut fx = Fixture::new(config()).await;
    let gate = fx.cloud.gate_uploads();
    let local = fx.local("a.txt", &pattern(100_000));
    let info = fx.service.enqueue_new(&fx.root, &local).await.unwrap();
    fx.service.start();
    loop {
        if let SyncEvent::UploadState {
            state: UploadState::Uploading,
            ..
        } = fx.next_event().await
        {
            break;
        }
    }

    assert!(fx.service.cancel(&info.id).await);
    assert!(!fx.service.cancel(&info.id).await);
    gate.add_permits(1);

    assert_eq!(fx.next_failure().await, FailReason::Cancelled);
    fx.drain().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(fx.events.try_recv().is_err());
    assert!(fx.cloud.children("root").is_empty());
    assert!(!info.source_path.exists());
    assert!(!fx.upload_file(&format!("{}.info", info.id)).exists());
    assert!(fx.service.pending().is_empty());
}

#[tokio::test]
async fn concurrency_limit_bounds_running_uploads() {
    let fx = Fixture::new(config()).await;
    let gate = fx.cloud.gate_uploads();
    for index in 0..4 {
        let local = fx.local(&format!("f{index}.txt"), &pattern(1000 + index));
        fx.service.enqueue_new(&fx.root, &local).await.unwrap();
    }
    fx.service.start();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(fx.cloud.uploads.load(Ordering::SeqCst), 2);
    gate.add_permits(4);
    fx.drain().await;

    assert_eq!(fx.cloud.uploads.load(Ordering::SeqCst), 4);
    assert_eq!(fx.cloud.children("root").len(), 4);
}

#[tokio::test]
async fn stopped_upload_resumes_after_restart() {
    let mut fx = Fixture::new(config()).await;
    let gate = fx.cloud.gate_uploads();
    let local = fx.local("a.txt", b"payload");
    fx.service.enqueue_new(&fx.root, &local).await.unwrap();
    fx.service.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    fx.service.stop().await;
    assert!(!fx.service.is_running());
    gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fx.service.pending().len(), 1);
    assert!(fx.cloud.children("root").is_empty());

    gate.add_permits(1);
    fx.service.start();
    finished(&fx.until_done().await);
    assert_eq!(fx.cloud.uploads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn enqueue_without_root_is_rejected() {
    let service = UploadService::new(MemoryCloud::new(), config(), EventSink::disabled());
    let parent = RemoteNode::dir("root", "/");
    let result = service
        .enqueue_new(&parent, Path::new("/tmp/whatever.txt"))
        .await;
    assert!(matches!(result, Err(UploadError::NoUploadDir)));
}

#[tokio::test]
async fn superseded_running_upload_ends_with_its_failure() {
    let mut fx = Fixture::new(config()).await;
    let gate = fx.cloud.gate_uploads();
    let item = fx.cloud.add_file("doc", &fx.root, "doc.txt", &sealed(b"old"));
    let first_edit = fx.local("first.txt", &pattern(50_000));
    let second_edit = fx.local("second.txt", b"second edit");

    let first = fx.service.enqueue_overwrite_from(&item, &first_edit).await.unwrap();
    fx.service.start();
    loop {
        if let SyncEvent::UploadState {
            state: UploadState::Uploading,
            ..
        } = fx.next_event().await
        {
            break;
        }
    }
    let second = fx.service.enqueue_overwrite_from(&item, &second_edit).await.unwrap();
    gate.add_permits(2);

    let mut seen = Vec::new();
    let mut first_done = false;
    let mut second_done = false;
    while !(first_done && second_done) {
        let event = fx.next_event().await;
        if let Some(upload) = upload_of(&event) {
            match &event {
                SyncEvent::UploadFailed { reason, .. } if upload.created_at == first.created_at => {
                    assert_eq!(*reason, FailReason::Cancelled);
                    first_done = true;
                }
                SyncEvent::UploadFinished { .. } if upload.created_at == second.created_at => {
                    second_done = true;
                }
                _ if upload.created_at == first.created_at => {
                    assert!(!first_done, "event after the upload ended: {event:?}");
                }
                _ => {}
            }
        }
        seen.push(event);
    }
    fx.drain().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(fx.events.try_recv().is_err());

    let first_failures = seen
        .iter()
        .filter(|event| {
            matches!(event, SyncEvent::UploadFailed { upload, .. } if upload.created_at == first.created_at)
        })
        .count();
    assert_eq!(first_failures, 1);
    assert_eq!(fx.cloud.content("doc").unwrap(), sealed(b"second edit"));
    assert!(fx.service.pending().is_empty());
}

#[tokio::test]
async fn failed_restaging_keeps_pending_overwrite() {
    let mut fx = Fixture::new(config()).await;
    let item = fx.cloud.add_file("doc", &fx.root, "doc.txt", &sealed(b"old"));
    let local = fx.local("doc.txt", b"first edit");
    let first = fx.service.enqueue_overwrite_from(&item, &local).await.unwrap();
    let payload = std::fs::read(&first.source_path).unwrap();
    let descriptor = std::fs::read(fx.upload_file("doc.info")).unwrap();

    // A directory opens but cannot be read, so encryption fails midway.
    let unreadable = fx.dir.path().join("local");
    assert!(
        fx.service
            .enqueue_overwrite_from(&item, &unreadable)
            .await
            .is_err()
    );

    let pending = fx.service.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].created_at, first.created_at);
    assert_eq!(std::fs::read(&first.source_path).unwrap(), payload);
    assert_eq!(std::fs::read(fx.upload_file("doc.info")).unwrap(), descriptor);
    let mut files: Vec<String> = std::fs::read_dir(fx.service.upload_dir().unwrap())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    assert_eq!(files, ["doc.info", "doc.temp"]);

    fx.service.start();
    let events = fx.until_done().await;
    finished(&events);
    assert!(
        !events
            .iter()
            .any(|event| matches!(event, SyncEvent::UploadFailed { .. }))
    );
    assert_eq!(fx.cloud.content("doc").unwrap(), sealed(b"first edit"));
}
