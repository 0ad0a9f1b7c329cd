//! Utility functions

use crate::error::{BuildError, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Reads and deserializes a JSON document from the given path.
pub fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let file = fs::File::open(path).map_err(|err| BuildError::io(err, path))?;
    let file = std::io::BufReader::new(file);
    let val: T = serde_json::from_reader(file)?;
    Ok(val)
}

/// Serializes the value as pretty JSON and writes it to the given path,
/// creating parent directories as needed.
pub fn write_json_file<T: Serialize>(value: &T, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    create_parent_dir_all(path)?;
    let file = fs::File::create(path).map_err(|err| BuildError::io(err, path))?;
    let mut writer = std::io::BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush().map_err(|err| BuildError::io(err, path))?;
    Ok(())
}

/// Creates the parent directory of the given file path.
pub fn create_parent_dir_all(file: impl AsRef<Path>) -> Result<()> {
    let file = file.as_ref();
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            BuildError::msg(format!(
                "failed to create parent folder \"{}\": {}",
                parent.display(),
                err
            ))
        })?;
    }
    Ok(())
}

/// Returns the normalized absolute form of the given path without touching
/// the filesystem. Relative paths are resolved against the current directory.
pub fn absolutize(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map(|cwd| cwd.join(path)).unwrap_or_else(|_| path.to_path_buf())
    };
    normalize_components(&abs)
}

/// Removes `.` components and resolves `..` components lexically.
fn normalize_components(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for comp in dunce::simplified(path).components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Last-write time of the file, or `None` if it does not exist.
pub fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Milliseconds since the unix epoch for the given time; `0` for anything
/// before the epoch.
pub fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Inverse of [`unix_millis`].
pub fn from_unix_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

/// Renders the path relative to `base` with forward slashes, suitable for
/// manifests and exports that must match across platforms.
pub fn slash_relative(path: &Path, base: &Path) -> String {
    use path_slash::PathExt;
    path.strip_prefix(base).unwrap_or(path).to_slash_lossy().into_owned()
}

/// Whether the file has the given extension, compared case-insensitively.
pub fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().map_or(false, |e| e.eq_ignore_ascii_case(ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolutize_removes_dot_components() {
        let p = absolutize("/a/b/./c/../d");
        assert_eq!(p, PathBuf::from("/a/b/d"));
    }

    #[test]
    fn slash_relative_strips_base() {
        let s = slash_relative(Path::new("/root/ws/out/a.bin"), Path::new("/root/ws"));
        assert_eq!(s, "out/a.bin");
    }

    #[test]
    fn extension_check_ignores_case() {
        assert!(has_extension(Path::new("x.LIB"), "lib"));
        assert!(!has_extension(Path::new("x.dll"), "lib"));
    }

    #[test]
    fn unix_millis_round_trip() {
        let t = UNIX_EPOCH + Duration::from_millis(1_234_567);
        assert_eq!(from_unix_millis(unix_millis(t)), t);
    }
}
