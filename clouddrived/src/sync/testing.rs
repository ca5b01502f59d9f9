use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use clouddrive_core::{
    ByteStream, CloudError, CloudStore, Fingerprinter, RemoteNode, UploadProgress, UploadSource,
};
use futures_util::stream;
use tokio::{io::AsyncReadExt, sync::Semaphore};

pub const CLOUD_ID: &str = "mem-account";
const CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sibling {
    SameContent,
    OtherContent,
}

/// In-memory object store with knobs for the failure modes the sync core
/// has to survive.
#[derive(Default)]
pub struct MemoryCloud {
    nodes: Mutex<HashMap<String, (RemoteNode, Vec<u8>)>>,
    next_id: AtomicU64,
    pub downloads_started: AtomicUsize,
    pub uploads: AtomicUsize,
    pub overwrites: AtomicUsize,
    pub get_child_calls: AtomicUsize,
    download_gate: Mutex<Option<Arc<Semaphore>>>,
    download_cut: Mutex<Option<usize>>,
    fail_downloads: AtomicBool,
    upload_errors: Mutex<VecDeque<CloudError>>,
    store_then_fail: Mutex<Option<u16>>,
    report_length: Mutex<Option<u64>>,
    report_content_id: Mutex<Option<String>>,
    sibling: Mutex<Option<Sibling>>,
    upload_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MemoryCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_dir(&self, id: &str, path: &str) -> RemoteNode {
        let node = RemoteNode::dir(id, path);
        self.lock().insert(id.to_string(), (node.clone(), Vec::new()));
        node
    }

    /// Stores `content` as-is, i.e. already in its at-rest form.
    pub fn add_file(
        &self,
        id: &str,
        parent: &RemoteNode,
        name: &str,
        content: &[u8],
    ) -> RemoteNode {
        let mut fp = Fingerprinter::new();
        fp.update(content);
        let node = RemoteNode::file(id, &parent.path, name, content.len() as u64)
            .with_parent(&parent.id)
            .with_content_id(fp.finish());
        self.lock()
            .insert(id.to_string(), (node.clone(), content.to_vec()));
        node
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.lock().get(id).map(|(_, data)| data.clone())
    }

    pub fn children(&self, parent_id: &str) -> Vec<RemoteNode> {
        self.lock()
            .values()
            .filter(|(node, _)| node.parent_id.as_deref() == Some(parent_id))
            .map(|(node, _)| node.clone())
            .collect()
    }

    pub fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    pub fn gate_downloads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.download_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Uploads block before sending anything until the semaphore gets permits.
    pub fn gate_uploads(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.upload_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn cut_downloads_at(&self, bytes: usize) {
        *self.download_cut.lock().unwrap() = Some(bytes);
    }

    pub fn fail_downloads(&self, fail: bool) {
        self.fail_downloads.store(fail, Ordering::SeqCst);
    }

    pub fn push_upload_error(&self, err: CloudError) {
        self.upload_errors.lock().unwrap().push_back(err);
    }

    pub fn store_then_fail(&self, status: u16) {
        *self.store_then_fail.lock().unwrap() = Some(status);
    }

    pub fn report_length(&self, length: Option<u64>) {
        *self.report_length.lock().unwrap() = length;
    }

    pub fn report_content_id(&self, content_id: Option<&str>) {
        *self.report_content_id.lock().unwrap() = content_id.map(str::to_string);
    }

    pub fn inject_sibling(&self, sibling: Sibling) {
        *self.sibling.lock().unwrap() = Some(sibling);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (RemoteNode, Vec<u8>)>> {
        self.nodes.lock().unwrap()
    }

    fn find_child(&self, parent_id: &str, name: &str) -> Option<RemoteNode> {
        self.lock()
            .values()
            .find(|(node, _)| node.parent_id.as_deref() == Some(parent_id) && node.name == name)
            .map(|(node, _)| node.clone())
    }

    fn fresh_id(&self) -> String {
        format!("node-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn wait_gate(gate: &Mutex<Option<Arc<Semaphore>>>) {
        let gate = gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
    }

    async fn send(
        &self,
        source: &UploadSource,
        progress: &dyn UploadProgress,
        mut after_first_chunk: impl FnMut(&[u8]),
    ) -> Result<Vec<u8>, CloudError> {
        Self::wait_gate(&self.upload_gate).await;
        let mut file = source.open().await?;
        let mut all = Vec::new();
        file.read_to_end(&mut all).await?;

        progress.on_progress(0).await?;
        let mut sent = 0usize;
        for (index, chunk) in all.chunks(CHUNK).enumerate() {
            sent += chunk.len();
            if index == 0 {
                after_first_chunk(&all);
            }
            progress.on_progress(sent as u64).await?;
        }
        Ok(all)
    }

    fn finish_node(&self, mut node: RemoteNode, content: Vec<u8>) -> Result<RemoteNode, CloudError> {
        let mut fp = Fingerprinter::new();
        fp.update(&content);
        node.content_id = Some(fp.finish());
        node.length = content.len() as u64;
        self.lock()
            .insert(node.id.clone(), (node.clone(), content));

        if let Some(status) = self.store_then_fail.lock().unwrap().take() {
            return Err(CloudError::status(status, "injected after store"));
        }
        if let Some(length) = *self.report_length.lock().unwrap() {
            node.length = length;
        }
        if let Some(content_id) = self.report_content_id.lock().unwrap().clone() {
            node.content_id = Some(content_id);
        }
        Ok(node)
    }
}

#[async_trait]
impl CloudStore for MemoryCloud {
    fn id(&self) -> &str {
        CLOUD_ID
    }

    async fn get_node(&self, id: &str) -> Result<Option<RemoteNode>, CloudError> {
        Ok(self.lock().get(id).map(|(node, _)| node.clone()))
    }

    async fn get_child(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<Option<RemoteNode>, CloudError> {
        self.get_child_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.find_child(parent_id, name))
    }

    async fn download(&self, id: &str, offset: u64) -> Result<ByteStream, CloudError> {
        self.downloads_started.fetch_add(1, Ordering::SeqCst);
        Self::wait_gate(&self.download_gate).await;
        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(CloudError::status(500, "injected download failure"));
        }
        let data = self
            .content(id)
            .ok_or_else(|| CloudError::status(404, "no such node"))?;
        let start = (offset as usize).min(data.len());
        let end = match *self.download_cut.lock().unwrap() {
            Some(cut) => (start + cut).min(data.len()),
            None => data.len(),
        };
        let chunks: Vec<Result<Bytes, CloudError>> = data[start..end]
            .chunks(CHUNK)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn upload_new(
        &self,
        parent_id: &str,
        name: &str,
        source: &UploadSource,
        progress: &dyn UploadProgress,
    ) -> Result<RemoteNode, CloudError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.upload_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        if self.find_child(parent_id, name).is_some() {
            return Err(CloudError::conflict());
        }
        let parent_path = self
            .get_node(parent_id)
            .await?
            .map(|node| node.path)
            .ok_or_else(|| CloudError::status(404, "no parent"))?;

        let sibling = self.sibling.lock().unwrap().take();
        let content = self
            .send(source, progress, |all| {
                if let Some(kind) = sibling {
                    let content = match kind {
                        Sibling::SameContent => all.to_vec(),
                        Sibling::OtherContent => b"someone else's bytes".to_vec(),
                    };
                    let parent = RemoteNode::dir(parent_id, parent_path.clone());
                    self.add_file(&self.fresh_id(), &parent, name, &content);
                }
            })
            .await?;

        let node = RemoteNode::file(self.fresh_id(), &parent_path, name, 0).with_parent(parent_id);
        self.finish_node(node, content)
    }

    async fn overwrite(
        &self,
        id: &str,
        source: &UploadSource,
        progress: &dyn UploadProgress,
    ) -> Result<RemoteNode, CloudError> {
        self.overwrites.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.upload_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let node = self
            .get_node(id)
            .await?
            .ok_or_else(|| CloudError::status(404, "no such node"))?;
        let content = self.send(source, progress, |_| {}).await?;
        self.finish_node(node, content)
    }
}

pub fn write_file(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}

pub fn sealed(content: &[u8]) -> Vec<u8> {
    let mut data = content.to_vec();
    crate::storage::FileCipher::global()
        .keystream_at(0)
        .apply(&mut data);
    data
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}
