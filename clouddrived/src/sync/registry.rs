use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
    time::SystemTime,
};

use time::OffsetDateTime;
use tracing::warn;

/// Metadata of one cached item.
///
/// Entries without `link_path` own a file named after `id` inside the cache
/// directory; linked entries point at content kept elsewhere and are never
/// evicted or counted towards the cache size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub id: String,
    pub access_time: OffsetDateTime,
    pub length: u64,
    pub link_path: Option<PathBuf>,
}

impl CacheEntry {
    pub fn new(id: impl Into<String>, length: u64) -> Self {
        Self {
            id: id.into(),
            access_time: OffsetDateTime::now_utc(),
            length,
            link_path: None,
        }
    }

    pub fn linked(id: impl Into<String>, length: u64, link_path: impl Into<PathBuf>) -> Self {
        Self {
            link_path: Some(link_path.into()),
            ..Self::new(id, length)
        }
    }

    pub fn is_linked(&self) -> bool {
        self.link_path.is_some()
    }

    fn counted_length(&self) -> u64 {
        if self.is_linked() { 0 } else { self.length }
    }
}

/// In-memory index of cached items plus the running size of managed files.
///
/// The map and the size counter change together under one lock, so the
/// counter always equals the sum of the non-linked entries.
#[derive(Debug, Default)]
pub struct CacheRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<String, CacheEntry>,
    total_size: u64,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<CacheEntry> {
        self.state().entries.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state().entries.contains_key(id)
    }

    pub fn touch(&self, id: &str) -> Option<CacheEntry> {
        let mut state = self.state();
        let entry = state.entries.get_mut(id)?;
        entry.access_time = OffsetDateTime::now_utc();
        Some(entry.clone())
    }

    pub fn try_add(&self, entry: CacheEntry) -> bool {
        let mut state = self.state();
        if state.entries.contains_key(&entry.id) {
            return false;
        }
        state.total_size = state.total_size.saturating_add(entry.counted_length());
        state.entries.insert(entry.id.clone(), entry);
        true
    }

    pub fn remove(&self, id: &str) -> Option<CacheEntry> {
        let mut state = self.state();
        let removed = state.entries.remove(id)?;
        state.total_size = state.total_size.saturating_sub(removed.counted_length());
        Some(removed)
    }

    pub fn resize(&self, id: &str, length: u64) -> bool {
        let mut state = self.state();
        let Some(entry) = state.entries.get_mut(id) else {
            return false;
        };
        let before = entry.counted_length();
        entry.length = length;
        let after = entry.counted_length();
        state.total_size = state.total_size.saturating_sub(before).saturating_add(after);
        true
    }

    pub fn replace_all(&self, rebuilt: Vec<CacheEntry>) {
        let total_size = rebuilt.iter().map(CacheEntry::counted_length).sum();
        let entries = rebuilt
            .into_iter()
            .map(|entry| (entry.id.clone(), entry))
            .collect();
        *self.state() = RegistryState {
            entries,
            total_size,
        };
    }

    pub fn eviction_candidates(&self) -> Vec<CacheEntry> {
        let mut candidates: Vec<CacheEntry> = self
            .state()
            .entries
            .values()
            .filter(|entry| !entry.is_linked())
            .cloned()
            .collect();
        candidates.sort_by_key(|entry| entry.access_time);
        candidates
    }

    pub fn snapshot(&self) -> Vec<CacheEntry> {
        self.state().entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().entries.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.state().total_size
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub async fn scan_cache_dir(dir: &Path) -> io::Result<Vec<CacheEntry>> {
    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir).await?;
    while let Some(dir_entry) = read_dir.next_entry().await? {
        let metadata = match dir_entry.metadata().await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            Err(err) => {
                warn!(path = %dir_entry.path().display(), "cannot stat cached file: {err}");
                continue;
            }
        };
        let Some(id) = dir_entry.file_name().to_str().map(str::to_string) else {
            warn!(path = %dir_entry.path().display(), "skipping cached file with non UTF-8 name");
            continue;
        };
        let accessed = metadata
            .accessed()
            .or_else(|_| metadata.modified())
            .unwrap_or_else(|_| SystemTime::now());
        entries.push(CacheEntry {
            id,
            access_time: OffsetDateTime::from(accessed),
            length: metadata.len(),
            link_path: None,
        });
    }
    Ok(entries)
}
