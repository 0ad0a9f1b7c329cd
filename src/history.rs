//! Persistent map from produced file to the command-line fingerprint that
//! last produced it.
//!
//! The outdatedness probe swaps the current producing attributes into the
//! history for every produced item; a differing prior value means the
//! command changed and the item must be rebuilt even if timestamps agree.

use crate::{error::Result, utils};
use dashmap::DashMap;
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

const ACTION_HISTORY_VERSION: u32 = 1;

#[derive(serde::Serialize, serde::Deserialize)]
struct HistoryArchive {
    version: u32,
    entries: std::collections::BTreeMap<PathBuf, String>,
}

/// One history partition, anchored at a mount point (the engine root or a
/// project root) and persisted to its own archive.
#[derive(Debug)]
pub struct ActionHistoryPartition {
    base_dir: PathBuf,
    location: PathBuf,
    entries: DashMap<PathBuf, String>,
    modified: AtomicBool,
}

impl ActionHistoryPartition {
    fn new(base_dir: PathBuf, location: PathBuf) -> Self {
        let entries = DashMap::new();
        if location.exists() {
            match utils::read_json_file::<HistoryArchive>(&location) {
                Ok(archive) if archive.version == ACTION_HISTORY_VERSION => {
                    for (file, attributes) in archive.entries {
                        entries.insert(file, attributes);
                    }
                }
                Ok(archive) => {
                    info!(
                        "discarding action history \"{}\": version {} != {}",
                        location.display(),
                        archive.version,
                        ACTION_HISTORY_VERSION
                    );
                }
                Err(err) => {
                    info!("discarding action history \"{}\": {}", location.display(), err);
                }
            }
        }
        Self { base_dir, location, entries, modified: AtomicBool::new(false) }
    }

    /// Atomically records `new_attributes` for the file and reports whether
    /// the previous value differed. The per-key entry lock serializes
    /// concurrent probes of the same file; probes of distinct files proceed
    /// in parallel.
    fn update(&self, file: &Path, new_attributes: &str) -> bool {
        let mut changed = false;
        self.entries
            .entry(file.to_path_buf())
            .and_modify(|prior| {
                if prior != new_attributes {
                    changed = true;
                    *prior = new_attributes.to_string();
                }
            })
            .or_insert_with(|| {
                changed = true;
                new_attributes.to_string()
            });
        if changed {
            self.modified.store(true, Ordering::SeqCst);
        }
        changed
    }

    fn save(&self) -> Result<()> {
        if !self.modified.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let entries =
            self.entries.iter().map(|kv| (kv.key().clone(), kv.value().clone())).collect();
        let archive = HistoryArchive { version: ACTION_HISTORY_VERSION, entries };
        utils::write_json_file(&archive, &self.location)?;
        trace!("wrote action history \"{}\"", self.location.display());
        Ok(())
    }
}

/// Partitioned action history, one partition per mount point.
#[derive(Debug, Default)]
pub struct ActionHistory {
    partitions: Mutex<Vec<Arc<ActionHistoryPartition>>>,
}

impl ActionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_partition(&self, base_dir: impl Into<PathBuf>, location: impl Into<PathBuf>) {
        let partition = Arc::new(ActionHistoryPartition::new(base_dir.into(), location.into()));
        self.partitions.lock().unwrap().push(partition);
    }

    fn route(&self, file: &Path) -> Option<Arc<ActionHistoryPartition>> {
        let partitions = self.partitions.lock().unwrap();
        partitions.iter().find(|p| file.starts_with(&p.base_dir)).cloned()
    }

    /// Swaps the producing attributes recorded for `file`, returning whether
    /// the value changed. Files outside every partition report `false` and
    /// are not tracked.
    pub fn update_producing_attributes(&self, file: &Path, new_attributes: &str) -> bool {
        match self.route(file) {
            Some(partition) => partition.update(file, new_attributes),
            None => false,
        }
    }

    /// The attributes last recorded for the file, if any.
    pub fn producing_attributes(&self, file: &Path) -> Option<String> {
        self.route(file).and_then(|p| p.entries.get(file).map(|v| v.clone()))
    }

    /// Persists every modified partition. Called once at the end of the
    /// build.
    pub fn flush(&self) -> Result<()> {
        let partitions = self.partitions.lock().unwrap().clone();
        for partition in partitions {
            partition.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_update_reports_changed() {
        let dir = tempfile::tempdir().unwrap();
        let history = ActionHistory::new();
        history.add_partition(dir.path(), dir.path().join("ActionHistory.json"));

        let file = dir.path().join("out.bin");
        assert!(history.update_producing_attributes(&file, "tool -o out.bin (ver 1)"));
        assert!(!history.update_producing_attributes(&file, "tool -o out.bin (ver 1)"));
        assert!(history.update_producing_attributes(&file, "tool -o out.bin (ver 2)"));
    }

    #[test]
    fn flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("ActionHistory.json");
        let file = dir.path().join("out.bin");

        let history = ActionHistory::new();
        history.add_partition(dir.path(), &archive);
        history.update_producing_attributes(&file, "tool (ver 1)");
        history.flush().unwrap();

        let reloaded = ActionHistory::new();
        reloaded.add_partition(dir.path(), &archive);
        assert_eq!(reloaded.producing_attributes(&file).as_deref(), Some("tool (ver 1)"));
        // unchanged value, so nothing to write back
        assert!(!reloaded.update_producing_attributes(&file, "tool (ver 1)"));
    }

    #[test]
    fn concurrent_probes_of_one_file_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let history = Arc::new(ActionHistory::new());
        history.add_partition(dir.path(), dir.path().join("ActionHistory.json"));
        let file = dir.path().join("out.bin");

        let changed: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let history = history.clone();
                    let file = file.clone();
                    scope.spawn(move || {
                        history.update_producing_attributes(&file, "tool (ver 1)") as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        // exactly one probe observed the transition from empty
        assert_eq!(changed, 1);
    }
}
