//! Temp storage: archived bundles of a node's tagged outputs, with content
//! manifests, published locally and optionally mirrored to a shared
//! directory so cooperating drivers on other machines can hand artifacts
//! between passes.
//!
//! Layout under a storage directory:
//!
//! ```text
//! manifests/<node>/<output>.json    per-block content manifest
//! blocks/<node>/<output>.tar.gz     archived files, paths relative to the
//!                                   workspace root
//! taglists/<node>/<tag>.json        per-tag file list + source blocks
//! complete/<node>.json              node completion marker
//! ```

use crate::{
    error::{BuildError, Result},
    utils,
};
use md5::{Digest, Md5};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs,
    io::Read,
    path::{Path, PathBuf},
};

/// Files allowed to appear in more than one archive block. Shared runtime
/// libraries get staged next to every binary that needs them.
pub const DUPLICABLE_BUILD_PRODUCTS: &[&str] =
    &["tbb.dll", "tbbmalloc.dll", "concrt140.dll", "msvcp140.dll", "vcruntime140.dll"];

/// Whether a file may legally appear in more than one block.
pub fn is_duplicable_build_product(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map_or(false, |n| {
            let lower = n.to_ascii_lowercase();
            DUPLICABLE_BUILD_PRODUCTS.iter().any(|d| *d == lower)
        })
}

/// Identity of one archived bundle.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TempStorageBlock {
    pub node: String,
    pub output: String,
}

impl TempStorageBlock {
    pub fn new(node: impl Into<String>, output: impl Into<String>) -> Self {
        Self { node: node.into(), output: output.into() }
    }
}

/// One file of a block manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestEntry {
    /// Path relative to the workspace root, forward slashes.
    pub relative_path: String,
    pub size: u64,
    pub hash: String,
}

/// Content manifest of a block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TempStorageManifest {
    pub files: Vec<ManifestEntry>,
}

impl TempStorageManifest {
    pub fn entry(&self, relative_path: &str) -> Option<&ManifestEntry> {
        self.files.iter().find(|f| f.relative_path == relative_path)
    }
}

/// The files published under one tag, plus the blocks those files came
/// from so downstream nodes pull only what they need.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TempStorageFileList {
    /// Paths relative to the workspace root, forward slashes.
    pub files: Vec<String>,
    pub blocks: Vec<TempStorageBlock>,
}

/// Completion marker payload.
#[derive(Serialize, Deserialize)]
struct CompleteMarker {
    node: String,
}

/// Local block storage with an optional shared mirror.
#[derive(Debug)]
pub struct TempStorage {
    /// Workspace root all stored paths are relative to.
    root: PathBuf,
    local_dir: PathBuf,
    shared_dir: Option<PathBuf>,
    write_to_shared: bool,
}

impl TempStorage {
    pub fn new(
        root: impl Into<PathBuf>,
        local_dir: impl Into<PathBuf>,
        shared_dir: Option<PathBuf>,
        write_to_shared: bool,
    ) -> Self {
        Self { root: root.into(), local_dir: local_dir.into(), shared_dir, write_to_shared }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifest_path(base: &Path, block: &TempStorageBlock) -> PathBuf {
        base.join("manifests").join(sanitize(&block.node)).join(format!("{}.json", sanitize(&block.output)))
    }

    fn block_path(base: &Path, block: &TempStorageBlock) -> PathBuf {
        base.join("blocks").join(sanitize(&block.node)).join(format!("{}.tar.gz", sanitize(&block.output)))
    }

    fn file_list_path(base: &Path, node: &str, tag: &str) -> PathBuf {
        base.join("taglists").join(sanitize(node)).join(format!("{}.json", sanitize(tag.trim_start_matches('#'))))
    }

    fn marker_path(&self, node: &str) -> PathBuf {
        self.local_dir.join("complete").join(format!("{}.json", sanitize(node)))
    }

    /// Archives the files as the block `(node, output)`: hashes them into a
    /// manifest, writes the tarball, and mirrors both to shared storage when
    /// enabled.
    pub fn archive(
        &self,
        node: &str,
        output: &str,
        files: &[PathBuf],
    ) -> Result<(TempStorageBlock, TempStorageManifest)> {
        let block = TempStorageBlock::new(node, output);

        let mut entries = files
            .par_iter()
            .map(|file| {
                let metadata = fs::metadata(file).map_err(|err| BuildError::io(err, file))?;
                Ok(ManifestEntry {
                    relative_path: utils::slash_relative(file, &self.root),
                    size: metadata.len(),
                    hash: hash_file(file)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        let manifest = TempStorageManifest { files: entries };

        let archive_path = Self::block_path(&self.local_dir, &block);
        utils::create_parent_dir_all(&archive_path)?;
        let file = fs::File::create(&archive_path)
            .map_err(|err| BuildError::io(err, &archive_path))?;
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for entry in &manifest.files {
            let source = self.root.join(&entry.relative_path);
            builder
                .append_path_with_name(&source, &entry.relative_path)
                .map_err(|err| BuildError::io(err, &source))?;
        }
        builder
            .into_inner()
            .and_then(|encoder| encoder.finish())
            .map_err(|err| BuildError::io(err, &archive_path))?;

        utils::write_json_file(&manifest, Self::manifest_path(&self.local_dir, &block))?;
        debug!(
            "archived {} file(s) as block {}/{}",
            manifest.files.len(),
            block.node,
            block.output
        );

        if let (Some(shared), true) = (&self.shared_dir, self.write_to_shared) {
            copy_into(&archive_path, &Self::block_path(shared, &block))?;
            copy_into(
                &Self::manifest_path(&self.local_dir, &block),
                &Self::manifest_path(shared, &block),
            )?;
        }

        Ok((block, manifest))
    }

    /// Fetches a block's manifest, pulling manifest and archive from the
    /// shared mirror when they are not yet local.
    pub fn retrieve(&self, block: &TempStorageBlock) -> Result<TempStorageManifest> {
        let local_manifest = Self::manifest_path(&self.local_dir, block);
        if !local_manifest.exists() {
            let Some(shared) = &self.shared_dir else {
                return Err(BuildError::msg(format!(
                    "block {}/{} is not in local storage and no shared storage is configured",
                    block.node, block.output
                )));
            };
            debug!("fetching block {}/{} from shared storage", block.node, block.output);
            copy_into(&Self::manifest_path(shared, block), &local_manifest)?;
            copy_into(
                &Self::block_path(shared, block),
                &Self::block_path(&self.local_dir, block),
            )?;
        }
        utils::read_json_file(&local_manifest)
    }

    /// Extracts a block into the workspace, skipping files already present
    /// with matching content. Returns the absolute path of every file the
    /// block provides.
    pub fn stage(
        &self,
        block: &TempStorageBlock,
        manifest: &TempStorageManifest,
    ) -> Result<Vec<PathBuf>> {
        let missing = manifest.files.iter().any(|entry| {
            let target = self.root.join(&entry.relative_path);
            !target.exists() || hash_file(&target).map_or(true, |h| h != entry.hash)
        });
        if missing {
            let archive_path = Self::block_path(&self.local_dir, block);
            let file = fs::File::open(&archive_path)
                .map_err(|err| BuildError::io(err, &archive_path))?;
            let decoder = flate2::read::GzDecoder::new(file);
            let mut archive = tar::Archive::new(decoder);
            archive
                .unpack(&self.root)
                .map_err(|err| BuildError::io(err, &archive_path))?;
            debug!("staged block {}/{} into \"{}\"", block.node, block.output, self.root.display());
        }
        Ok(manifest.files.iter().map(|entry| self.root.join(&entry.relative_path)).collect())
    }

    /// Publishes the file list for one output tag.
    pub fn write_file_list(
        &self,
        node: &str,
        tag: &str,
        files: &BTreeSet<PathBuf>,
        blocks: &BTreeSet<TempStorageBlock>,
    ) -> Result<()> {
        let list = TempStorageFileList {
            files: files.iter().map(|f| utils::slash_relative(f, &self.root)).collect(),
            blocks: blocks.iter().cloned().collect(),
        };
        let path = Self::file_list_path(&self.local_dir, node, tag);
        utils::write_json_file(&list, &path)?;
        if let (Some(shared), true) = (&self.shared_dir, self.write_to_shared) {
            copy_into(&path, &Self::file_list_path(shared, node, tag))?;
        }
        Ok(())
    }

    /// Reads the file list for a tag, consulting shared storage when it is
    /// not local.
    pub fn read_file_list(&self, node: &str, tag: &str) -> Result<TempStorageFileList> {
        let path = Self::file_list_path(&self.local_dir, node, tag);
        if !path.exists() {
            let Some(shared) = &self.shared_dir else {
                return Err(BuildError::msg(format!(
                    "no file list for tag \"{tag}\" of node \"{node}\""
                )));
            };
            copy_into(&Self::file_list_path(shared, node, tag), &path)?;
        }
        utils::read_json_file(&path)
    }

    pub fn is_complete(&self, node: &str) -> bool {
        self.marker_path(node).exists()
    }

    pub fn mark_complete(&self, node: &str) -> Result<()> {
        utils::write_json_file(&CompleteMarker { node: node.to_string() }, self.marker_path(node))
    }

    /// Removes all local storage.
    pub fn clean_local(&self) -> Result<()> {
        if self.local_dir.exists() {
            fs::remove_dir_all(&self.local_dir)
                .map_err(|err| BuildError::io(err, &self.local_dir))?;
            info!("cleaned local temp storage \"{}\"", self.local_dir.display());
        }
        Ok(())
    }

    /// Removes one node's local storage and completion marker so it runs
    /// again.
    pub fn clean_local_node(&self, node: &str) -> Result<()> {
        for dir in ["manifests", "blocks", "taglists"] {
            let path = self.local_dir.join(dir).join(sanitize(node));
            if path.exists() {
                fs::remove_dir_all(&path).map_err(|err| BuildError::io(err, &path))?;
            }
        }
        match fs::remove_file(self.marker_path(node)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(BuildError::io(err, self.marker_path(node))),
        }
        info!("cleaned node \"{node}\"");
        Ok(())
    }

    /// Recomputes the hashes of every file a completed node published under
    /// the given tags. Any drift invalidates the node (the completion
    /// marker is removed) and returns `false`.
    pub fn check_local_integrity(&self, node: &str, tags: &[String]) -> Result<bool> {
        let mut blocks: BTreeSet<TempStorageBlock> = BTreeSet::new();
        let mut listed: BTreeSet<String> = BTreeSet::new();
        for tag in tags {
            let list = match self.read_file_list(node, tag) {
                Ok(list) => list,
                Err(_) => {
                    self.invalidate(node)?;
                    return Ok(false);
                }
            };
            blocks.extend(list.blocks);
            listed.extend(list.files);
        }

        let mut ok = true;
        'outer: for block in &blocks {
            let manifest = match self.retrieve(block) {
                Ok(manifest) => manifest,
                Err(_) => {
                    ok = false;
                    break;
                }
            };
            for entry in &manifest.files {
                if !listed.contains(&entry.relative_path) {
                    continue;
                }
                let target = self.root.join(&entry.relative_path);
                if !target.exists() || hash_file(&target)? != entry.hash {
                    warn!("\"{}\" drifted since node \"{node}\" produced it", target.display());
                    ok = false;
                    break 'outer;
                }
            }
        }

        if !ok {
            self.invalidate(node)?;
        }
        Ok(ok)
    }

    fn invalidate(&self, node: &str) -> Result<()> {
        match fs::remove_file(self.marker_path(node)) {
            Ok(()) => {
                info!("invalidated completed node \"{node}\"");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BuildError::io(err, self.marker_path(node))),
        }
    }
}

/// Hex MD5 digest of the file's contents.
pub fn hash_file(path: &Path) -> Result<String> {
    let file = fs::File::open(path).map_err(|err| BuildError::io(err, path))?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = Md5::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = reader.read(&mut buffer).map_err(|err| BuildError::io(err, path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect()
}

fn copy_into(source: &Path, dest: &Path) -> Result<()> {
    utils::create_parent_dir_all(dest)?;
    fs::copy(source, dest).map_err(|err| BuildError::io(err, source))?;
    Ok(())
}
