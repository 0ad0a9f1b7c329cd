//! Build configuration shared by the engine components.

use std::path::PathBuf;

/// Identifies one build target: a project name plus the platform and
/// configuration to build it for.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct TargetDescriptor {
    pub name: String,
    pub platform: String,
    pub configuration: String,
}

impl TargetDescriptor {
    pub fn new(
        name: impl Into<String>,
        platform: impl Into<String>,
        configuration: impl Into<String>,
    ) -> Self {
        Self { name: name.into(), platform: platform.into(), configuration: configuration.into() }
    }
}

impl std::fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.name, self.platform, self.configuration)
    }
}

/// Settings controlling how a build is planned and executed.
#[derive(Clone, Debug)]
pub struct BuildConfiguration {
    /// Root directory of the engine checkout. Actions producing files under
    /// this root are "engine changes".
    pub engine_root: PathBuf,
    /// Maximum number of actions executing concurrently.
    pub max_parallel_actions: usize,
    /// Skip execution after planning.
    pub skip_build: bool,
    /// Don't treat a rebuilt static import library alone as a reason to
    /// relink dependents.
    pub ignore_outdated_import_libraries: bool,
    /// Refuse to run if the planned action set would modify engine files.
    pub no_engine_changes: bool,
    /// Don't run the pre-build targets implied by the makefiles.
    pub skip_prebuild_targets: bool,
    /// Dump the full merged action graph as JSON to this path.
    pub export_actions: Option<PathBuf>,
    /// Dump just the outdated subset as JSON to this path.
    pub write_outdated_actions: Option<PathBuf>,
    /// Warn when produced items nest deeper than this many characters under
    /// the engine root.
    pub max_nested_path_length: usize,
    /// Prefer a remote executor when one reports itself available.
    pub allow_remote_executor: bool,
}

impl Default for BuildConfiguration {
    fn default() -> Self {
        Self {
            engine_root: PathBuf::new(),
            max_parallel_actions: num_cpus::get(),
            skip_build: false,
            ignore_outdated_import_libraries: true,
            no_engine_changes: false,
            skip_prebuild_targets: false,
            export_actions: None,
            write_outdated_actions: None,
            max_nested_path_length: 200,
            allow_remote_executor: false,
        }
    }
}

impl BuildConfiguration {
    pub fn new(engine_root: impl Into<PathBuf>) -> Self {
        Self { engine_root: engine_root.into(), ..Default::default() }
    }
}
