//! Cache of per-translation-unit header and module dependency lists, parsed
//! from compiler-emitted files.
//!
//! Three formats are understood, keyed by extension: Make-style `.d` rules,
//! flat `.txt` lists, and structured source-dependency `.json` documents.
//! Entries are memoized per file and invalidated by last-write time, so the
//! same manifest is parsed at most once per change across a build.
//!
//! The cache is split into partitions, each anchored at a base directory and
//! persisted as its own versioned archive. Queries route to the first
//! partition whose base directory is an ancestor of the queried file.

use crate::{
    error::{BuildError, Result},
    fileitem::{FileItemCache, FileRef},
    utils,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

/// On-disk format version for persisted partitions. Bump when the entry
/// layout changes; mismatched archives are discarded and rebuilt.
const DEPENDENCY_CACHE_VERSION: u32 = 3;

/// A module imported by a translation unit, together with the path of its
/// binary module interface when the emitting compiler provides one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedModule {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bmi_path: Option<PathBuf>,
}

/// Parsed contents of one compiler-emitted dependency file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyInfo {
    /// Last-write time of the dependency file when it was parsed, in unix
    /// milliseconds. Entries with a stale value are reparsed.
    pub last_write_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produced_module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_modules: Option<Vec<ImportedModule>>,
    pub files: Vec<PathBuf>,
}

/// Serialized partition archive.
#[derive(Serialize, Deserialize)]
struct PartitionArchive {
    version: u32,
    entries: std::collections::BTreeMap<PathBuf, DependencyInfo>,
}

/// One partition of the dependency cache, anchored at `base_dir` and backed
/// by the archive at `location`.
#[derive(Debug)]
pub struct DependencyCachePartition {
    base_dir: PathBuf,
    location: PathBuf,
    entries: DashMap<PathBuf, Arc<DependencyInfo>>,
    modified: AtomicBool,
}

impl DependencyCachePartition {
    fn new(base_dir: PathBuf, location: PathBuf) -> Self {
        let entries = DashMap::new();
        match Self::read_archive(&location) {
            Ok(Some(archive)) => {
                for (file, info) in archive {
                    entries.insert(file, Arc::new(info));
                }
            }
            Ok(None) => {}
            Err(err) => {
                // a corrupt or mismatched archive is not fatal; start empty
                info!("discarding dependency cache \"{}\": {}", location.display(), err);
            }
        }
        Self { base_dir, location, entries, modified: AtomicBool::new(false) }
    }

    fn read_archive(
        location: &Path,
    ) -> Result<Option<std::collections::BTreeMap<PathBuf, DependencyInfo>>> {
        if !location.exists() {
            return Ok(None);
        }
        let archive: PartitionArchive = utils::read_json_file(location)?;
        if archive.version != DEPENDENCY_CACHE_VERSION {
            return Err(BuildError::CacheFormat {
                path: location.to_path_buf(),
                found: archive.version,
                expected: DEPENDENCY_CACHE_VERSION,
            });
        }
        Ok(Some(archive.entries))
    }

    /// Writes the partition back to its archive if anything changed.
    fn save(&self) -> Result<()> {
        if !self.modified.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let entries = self
            .entries
            .iter()
            .map(|kv| (kv.key().clone(), (**kv.value()).clone()))
            .collect();
        let archive = PartitionArchive { version: DEPENDENCY_CACHE_VERSION, entries };
        utils::write_json_file(&archive, &self.location)?;
        trace!("wrote dependency cache \"{}\"", self.location.display());
        Ok(())
    }

    fn get(&self, file: &FileRef) -> Result<Option<Arc<DependencyInfo>>> {
        let info = file.info();
        let Some(mtime) = info.last_write_time else {
            return Ok(None);
        };
        let mtime = utils::unix_millis(mtime);

        if let Some(entry) = self.entries.get(file.path()) {
            if entry.last_write_time >= mtime {
                return Ok(Some(entry.clone()));
            }
        }

        // missing or stale; reparse and replace. Concurrent probes of the
        // same file may parse redundantly, the data is idempotent.
        let parsed = Arc::new(parse_dependency_file(file.path(), mtime)?);
        self.entries.insert(file.path().to_path_buf(), parsed.clone());
        self.modified.store(true, Ordering::SeqCst);
        Ok(Some(parsed))
    }
}

/// Partitioned, persistent dependency cache.
#[derive(Debug, Default)]
pub struct DependencyCache {
    // the partition registry is serialized by a single mutex; lookups clone
    // the Arc out and never hold the lock across parsing
    partitions: Mutex<Vec<Arc<DependencyCachePartition>>>,
}

impl DependencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a partition anchored at `base_dir`, loading any persisted
    /// archive at `location`. Partitions are consulted in registration
    /// order.
    pub fn add_partition(&self, base_dir: impl Into<PathBuf>, location: impl Into<PathBuf>) {
        let partition =
            Arc::new(DependencyCachePartition::new(base_dir.into(), location.into()));
        self.partitions.lock().unwrap().push(partition);
    }

    fn route(&self, file: &Path) -> Option<Arc<DependencyCachePartition>> {
        let partitions = self.partitions.lock().unwrap();
        partitions.iter().find(|p| file.starts_with(&p.base_dir)).cloned()
    }

    /// Obtains the parsed info for a dependency file, reparsing when the
    /// file changed since it was last seen. `None` when the file does not
    /// exist or no partition covers it.
    pub fn try_get_dependency_info(&self, file: &FileRef) -> Result<Option<Arc<DependencyInfo>>> {
        match self.route(file.path()) {
            Some(partition) => partition.get(file),
            None => Ok(None),
        }
    }

    /// The module this translation unit produces, if any.
    pub fn try_get_produced_module(&self, file: &FileRef) -> Result<Option<String>> {
        Ok(self.try_get_dependency_info(file)?.and_then(|info| info.produced_module.clone()))
    }

    /// Modules imported by this translation unit.
    pub fn try_get_imported_modules(
        &self,
        file: &FileRef,
    ) -> Result<Option<Vec<ImportedModule>>> {
        Ok(self.try_get_dependency_info(file)?.and_then(|info| info.imported_modules.clone()))
    }

    /// Files this translation unit depends on, as canonical items.
    pub fn try_get_dependencies(
        &self,
        file: &FileRef,
        files: &FileItemCache,
    ) -> Result<Option<Vec<FileRef>>> {
        Ok(self
            .try_get_dependency_info(file)?
            .map(|info| info.files.iter().map(|p| files.get(p)).collect()))
    }

    /// Writes all modified partitions back to their archives. Called once at
    /// the end of the build.
    pub fn flush(&self) -> Result<()> {
        let partitions = self.partitions.lock().unwrap().clone();
        for partition in partitions {
            partition.save()?;
        }
        Ok(())
    }
}

fn parse_dependency_file(path: &Path, mtime: u64) -> Result<DependencyInfo> {
    let text = std::fs::read_to_string(path).map_err(|err| BuildError::io(err, path))?;
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "d" => parse_make_rule(path, &text, mtime),
        "txt" => Ok(parse_flat_list(&text, mtime)),
        "json" => parse_source_dependencies(path, &text, mtime),
        other => Err(BuildError::DependencyFile {
            path: path.to_path_buf(),
            message: format!("unsupported extension \"{other}\""),
        }),
    }
}

#[derive(Debug, PartialEq)]
enum DepToken {
    Newline,
    Colon,
    Filename(String),
}

/// Tokenizes a Make-style dependency rule. Space and tab are separators, a
/// backslash directly before a newline is a line continuation, `:` is its
/// own token and `\ ` escapes a space inside a filename.
fn tokenize_make_rule(text: &str) -> Vec<DepToken> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' => {
                chars.next();
            }
            '\n' => {
                chars.next();
                tokens.push(DepToken::Newline);
            }
            ':' => {
                chars.next();
                tokens.push(DepToken::Colon);
            }
            '\\' => {
                // continuation or the start of an escaped filename
                let mut ahead = chars.clone();
                ahead.next();
                match ahead.peek() {
                    Some('\n') => {
                        chars.next();
                        chars.next();
                    }
                    Some('\r') => {
                        chars.next();
                        chars.next();
                        if chars.peek() == Some(&'\n') {
                            chars.next();
                        }
                    }
                    _ => tokens.push(DepToken::Filename(read_filename(&mut chars))),
                }
            }
            _ => tokens.push(DepToken::Filename(read_filename(&mut chars))),
        }
    }
    tokens
}

fn read_filename(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut name = String::new();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' | ':' => break,
            '\\' => {
                let mut ahead = chars.clone();
                ahead.next();
                match ahead.peek() {
                    // escaped space belongs to the filename
                    Some(' ') => {
                        chars.next();
                        chars.next();
                        name.push(' ');
                    }
                    // continuation ends the token
                    Some('\n') | Some('\r') => break,
                    _ => {
                        chars.next();
                        name.push('\\');
                    }
                }
            }
            _ => {
                chars.next();
                name.push(c);
            }
        }
    }
    name
}

/// Parses a `.d` rule of the shape `target: dep dep … \n`. Anything else is
/// a hard error; a truncated rule means the compile it came from aborted.
fn parse_make_rule(path: &Path, text: &str, mtime: u64) -> Result<DependencyInfo> {
    let error = |message: &str| BuildError::DependencyFile {
        path: path.to_path_buf(),
        message: message.to_string(),
    };

    let tokens = tokenize_make_rule(text);
    let mut iter = tokens.into_iter().peekable();

    while iter.peek() == Some(&DepToken::Newline) {
        iter.next();
    }
    match iter.next() {
        Some(DepToken::Filename(_)) => {}
        _ => return Err(error("expected rule target")),
    }
    match iter.next() {
        Some(DepToken::Colon) => {}
        _ => return Err(error("expected ':' after rule target")),
    }

    let mut files = Vec::new();
    loop {
        match iter.next() {
            Some(DepToken::Filename(name)) => files.push(PathBuf::from(name)),
            Some(DepToken::Newline) | None => break,
            Some(DepToken::Colon) => return Err(error("unexpected ':' in dependency list")),
        }
    }
    for token in iter {
        if token != DepToken::Newline {
            return Err(error("unexpected tokens after dependency list"));
        }
    }

    Ok(DependencyInfo {
        last_write_time: mtime,
        produced_module: None,
        imported_modules: None,
        files,
    })
}

/// Parses a flat list with one path per line. Empty lines and COM artifacts
/// (`.tlh`/`.tli`) are skipped, doubled backslashes are collapsed.
fn parse_flat_list(text: &str, mtime: u64) -> DependencyInfo {
    let files = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| {
            let lower = line.to_ascii_lowercase();
            !lower.ends_with(".tlh") && !lower.ends_with(".tli")
        })
        .map(|line| PathBuf::from(line.replace("\\\\", "\\")))
        .collect();
    DependencyInfo { last_write_time: mtime, produced_module: None, imported_modules: None, files }
}

#[derive(Deserialize)]
struct SourceDependenciesDocument {
    #[serde(rename = "Version")]
    version: String,
    #[serde(rename = "Data")]
    data: SourceDependenciesData,
}

#[derive(Deserialize)]
struct SourceDependenciesData {
    #[serde(rename = "ProvidedModule")]
    provided_module: Option<String>,
    #[serde(rename = "ImportedModules")]
    imported_modules: Option<serde_json::Value>,
    #[serde(rename = "Includes")]
    includes: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct ImportedModuleEntry {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "BMI")]
    bmi: Option<PathBuf>,
}

/// Parses a compiler-emitted source-dependencies document. Versions `1.0`
/// and `1.1` are supported; `1.1` lists imported modules as `{Name, BMI}`
/// objects except in metadata-only `.md.json` files, which carry bare names
/// like `1.0` does.
fn parse_source_dependencies(path: &Path, text: &str, mtime: u64) -> Result<DependencyInfo> {
    let error = |message: String| BuildError::DependencyFile { path: path.to_path_buf(), message };

    let doc: SourceDependenciesDocument = serde_json::from_str(text)
        .map_err(|err| error(format!("malformed document: {err}")))?;
    if doc.version != "1.0" && doc.version != "1.1" {
        return Err(error(format!("unsupported version \"{}\"", doc.version)));
    }

    let is_metadata_only = path
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(false, |n| n.ends_with(".md.json"));

    let imported_modules = match doc.data.imported_modules {
        None => None,
        Some(value) => {
            let modules = if doc.version == "1.1" && !is_metadata_only {
                let entries: Vec<ImportedModuleEntry> = serde_json::from_value(value)
                    .map_err(|err| error(format!("malformed ImportedModules: {err}")))?;
                entries
                    .into_iter()
                    .map(|e| ImportedModule { name: e.name, bmi_path: e.bmi })
                    .collect()
            } else {
                let names: Vec<String> = serde_json::from_value(value)
                    .map_err(|err| error(format!("malformed ImportedModules: {err}")))?;
                names.into_iter().map(|name| ImportedModule { name, bmi_path: None }).collect()
            };
            Some(modules)
        }
    };

    Ok(DependencyInfo {
        last_write_time: mtime,
        produced_module: doc.data.provided_module,
        imported_modules,
        files: doc.data.includes.unwrap_or_default().into_iter().map(PathBuf::from).collect(),
    })
}
