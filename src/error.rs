//! Error types for the build engine and the pipeline runtime.

use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// A wrapper around an `io::Error` that remembers the path the operation
/// failed on.
#[derive(Debug, Error)]
#[error("\"{}\": {io}", .path.display())]
pub struct BuildIoError {
    io: io::Error,
    path: PathBuf,
}

impl BuildIoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path the operation failed on.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl From<BuildIoError> for io::Error {
    fn from(err: BuildIoError) -> Self {
        err.io
    }
}

/// Various errors raised while planning or executing a build.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Io(#[from] BuildIoError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// A compiler-emitted dependency file could not be parsed.
    #[error("failed to parse dependency file \"{}\": {message}", .path.display())]
    DependencyFile { path: PathBuf, message: String },
    /// A persisted cache carries an unexpected format version.
    #[error("\"{}\": cache format version {found}, expected {expected}", .path.display())]
    CacheFormat { path: PathBuf, found: u32, expected: u32 },
    /// The action set contains one or more cycles.
    #[error("cycle detected in action graph:\n{}", .diagnostics.join("\n"))]
    Cycle { diagnostics: Vec<String> },
    /// Two non-equivalent actions produce the same item.
    #[error("conflicting actions for \"{}\" ({fields}):\n{first}\n{second}", .item.display())]
    Conflict { item: PathBuf, fields: crate::actiongraph::ConflictFields, first: String, second: String },
    #[error("path \"{}\" is {length} characters long, exceeding the limit of {limit}", .path.display())]
    PathTooLong { path: PathBuf, length: usize, limit: usize },
    #[error("{location}: unknown task \"{name}\"")]
    UnknownTask { name: String, location: String },
    #[error("{location}: task \"{task}\" is missing required parameter \"{parameter}\"")]
    MissingParameter { task: String, parameter: String, location: String },
    #[error("{location}: invalid value \"{value}\" for parameter \"{parameter}\": {message}")]
    InvalidParameter { parameter: String, value: String, message: String, location: String },
    #[error("{location}: tag \"{tag}\" is not available here")]
    UnresolvedTag { tag: String, location: String },
    #[error("unknown target \"{0}\"")]
    UnknownTarget(String),
    #[error("token \"{}\" is held by \"{owner}\"", .token.display())]
    TokenContention { token: PathBuf, owner: String },
    /// A node modified files it received as inputs.
    #[error("node \"{node}\" modified {} input file(s):\n{}", .files.len(), format_file_list(.files))]
    Clobbered { node: String, files: Vec<PathBuf> },
    /// The planned action set would modify engine files.
    #[error("building would modify {} engine file(s):\n{}", .files.len(), format_file_list(.files))]
    EngineChanges { files: Vec<PathBuf> },
    /// One or more actions exited nonzero.
    #[error("{failed} of {total} action(s) failed")]
    ExecutionFailed { failed: usize, total: usize },
    /// A linked action finished without producing its declared outputs.
    #[error("action \"{action}\" did not produce:\n{}", format_file_list(.items))]
    MissingOutputs { action: String, items: Vec<PathBuf> },
    #[error("{0}")]
    Message(String),
}

impl BuildError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        BuildIoError::new(err, path).into()
    }

    pub fn msg(msg: impl std::fmt::Display) -> Self {
        BuildError::Message(msg.to_string())
    }

    /// Maps the error to a process exit code. Compilation failures and
    /// engine-change refusals carry distinct codes so callers can tell them
    /// apart from general errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::ExecutionFailed { .. } => 2,
            BuildError::EngineChanges { .. } => 3,
            _ => 1,
        }
    }
}

fn format_file_list(files: &[PathBuf]) -> String {
    files.iter().map(|f| format!("  {}", f.display())).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let exec = BuildError::ExecutionFailed { failed: 1, total: 3 };
        let refusal = BuildError::EngineChanges { files: vec![PathBuf::from("/e/a.cpp")] };
        let other = BuildError::msg("boom");
        assert_eq!(exec.exit_code(), 2);
        assert_eq!(refusal.exit_code(), 3);
        assert_eq!(other.exit_code(), 1);
    }

    #[test]
    fn io_errors_carry_the_path() {
        let err = BuildError::io(io::Error::new(io::ErrorKind::NotFound, "gone"), "/tmp/x");
        assert!(err.to_string().contains("/tmp/x"));
    }
}
