use std::path::{Component, Path, PathBuf};

use thiserror::Error;

pub const CACHE_DIR: &str = "SmallFiles";
pub const UPLOAD_DIR: &str = "Upload";
pub const DESCRIPTOR_EXT: &str = "info";
pub const STAGED_EXT: &str = "temp";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("item id is empty")]
    Empty,
    #[error("item id {0:?} is not a single file name")]
    UnsupportedComponent(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join(CACHE_DIR)
    }

    pub fn upload_dir(&self, cloud_id: &str) -> PathBuf {
        self.root.join(UPLOAD_DIR).join(cloud_id)
    }
}

/// Maps an item id to a file directly under `dir`.
///
/// Ids come from the remote store and name files verbatim, so anything that
/// would escape `dir` or create subdirectories is rejected.
pub fn item_file(dir: &Path, id: &str) -> Result<PathBuf, PathError> {
    if id.is_empty() {
        return Err(PathError::Empty);
    }
    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(part)), None) if part == id => Ok(dir.join(part)),
        _ => Err(PathError::UnsupportedComponent(id.to_string())),
    }
}

pub fn descriptor_file(dir: &Path, upload_id: &str) -> Result<PathBuf, PathError> {
    with_ext(dir, upload_id, DESCRIPTOR_EXT)
}

pub fn staged_file(dir: &Path, upload_id: &str) -> Result<PathBuf, PathError> {
    with_ext(dir, upload_id, STAGED_EXT)
}

fn with_ext(dir: &Path, id: &str, ext: &str) -> Result<PathBuf, PathError> {
    let base = item_file(dir, id)?;
    let mut name = base.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(ext);
    Ok(base.with_file_name(name))
}
