use serde::{Deserialize, Serialize};

/// Metadata of one remote file or folder as reported by the object store.
///
/// The sync core only reads `id`, `path` and `length`; everything else is
/// carried through to callbacks untouched.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RemoteNode {
    pub id: String,
    pub name: String,
    pub path: String,
    pub length: u64,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub content_id: Option<String>,
    #[serde(default)]
    pub is_dir: bool,
}

impl RemoteNode {
    pub fn file(
        id: impl Into<String>,
        parent_path: &str,
        name: impl Into<String>,
        length: u64,
    ) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            path: join_remote(parent_path, &name),
            name,
            length,
            parent_id: None,
            content_id: None,
            is_dir: false,
        }
    }

    pub fn dir(id: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        Self {
            id: id.into(),
            name,
            path,
            length: 0,
            parent_id: None,
            content_id: None,
            is_dir: true,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_content_id(mut self, content_id: impl Into<String>) -> Self {
        self.content_id = Some(content_id.into());
        self
    }

    pub fn child_path(&self, name: &str) -> String {
        join_remote(&self.path, name)
    }

    /// Remote path of the parent folder, `/` for top-level items.
    pub fn parent_path(&self) -> &str {
        match self.path.rsplit_once('/') {
            Some(("", _)) | None => "/",
            Some((dir, _)) => dir,
        }
    }
}

pub(crate) fn join_remote(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    format!("{parent}/{name}")
}
