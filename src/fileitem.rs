//! Canonical file handles with lazily cached filesystem state.
//!
//! Every path the engine touches is represented by exactly one [`FileItem`]
//! per [`FileItemCache`], so timestamp probes hit the filesystem once and
//! identity comparisons are cheap pointer-keyed map lookups.

use crate::utils;
use dashmap::DashMap;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::SystemTime,
};

/// Shared handle to a [`FileItem`].
pub type FileRef = Arc<FileItem>;

/// Snapshot of a file's on-disk state.
#[derive(Clone, Copy, Debug)]
pub struct FileInfo {
    pub exists: bool,
    pub last_write_time: Option<SystemTime>,
    pub length: u64,
}

impl FileInfo {
    fn stat(path: &Path) -> Self {
        match fs::metadata(path) {
            Ok(meta) => Self {
                exists: true,
                last_write_time: meta.modified().ok(),
                length: meta.len(),
            },
            Err(_) => Self { exists: false, last_write_time: None, length: 0 },
        }
    }
}

/// A canonical handle for an absolute path.
///
/// Filesystem state is read on first access and cached until
/// [`FileItem::reset_cached_info`] is called.
#[derive(Debug)]
pub struct FileItem {
    path: PathBuf,
    info: RwLock<Option<FileInfo>>,
}

impl FileItem {
    fn new(path: PathBuf) -> Self {
        Self { path, info: RwLock::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The cached state, stat-ing the file on first access.
    pub fn info(&self) -> FileInfo {
        if let Some(info) = *self.info.read().unwrap() {
            return info;
        }
        let mut slot = self.info.write().unwrap();
        // another thread may have filled the slot while we waited
        if let Some(info) = *slot {
            return info;
        }
        let info = FileInfo::stat(&self.path);
        *slot = Some(info);
        info
    }

    pub fn exists(&self) -> bool {
        self.info().exists
    }

    pub fn last_write_time(&self) -> Option<SystemTime> {
        self.info().last_write_time
    }

    pub fn length(&self) -> u64 {
        self.info().length
    }

    /// Drops the cached state so the next access re-stats the file. Invoked
    /// by the produced-outputs sweep after an executor batch returns.
    pub fn reset_cached_info(&self) {
        *self.info.write().unwrap() = None;
    }

    pub fn has_extension(&self, ext: &str) -> bool {
        utils::has_extension(&self.path, ext)
    }
}

impl PartialEq for FileItem {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl Eq for FileItem {}

impl std::hash::Hash for FileItem {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.path.hash(state)
    }
}

/// Interns [`FileItem`]s by normalized absolute path.
///
/// Owned by the build session; at most one item exists per path for the
/// cache's lifetime.
#[derive(Debug, Default)]
pub struct FileItemCache {
    items: DashMap<PathBuf, FileRef>,
}

impl FileItemCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the canonical item for the path, creating it on first
    /// reference.
    pub fn get(&self, path: impl AsRef<Path>) -> FileRef {
        let path = utils::absolutize(path);
        if let Some(item) = self.items.get(&path) {
            return item.clone();
        }
        self.items
            .entry(path.clone())
            .or_insert_with(|| Arc::new(FileItem::new(path)))
            .clone()
    }

    /// Number of interned items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
