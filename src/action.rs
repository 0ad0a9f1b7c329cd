//! Actions: single external process invocations with declared prerequisites
//! and produced files.

use crate::fileitem::{FileItemCache, FileRef};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::Arc,
};

/// The kind of work an action performs. Behavior differences (history
/// participation, output verification, zero-length output handling) key off
/// this variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    Compile,
    CompileModuleInterface,
    GatherModuleDependencies,
    Link,
    WriteMetadata,
    BuildProject,
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActionType::Compile => "Compile",
            ActionType::CompileModuleInterface => "CompileModuleInterface",
            ActionType::GatherModuleDependencies => "GatherModuleDependencies",
            ActionType::Link => "Link",
            ActionType::WriteMetadata => "WriteMetadata",
            ActionType::BuildProject => "BuildProject",
        };
        f.write_str(name)
    }
}

/// An immutable description of one external process invocation.
///
/// Toolchain adapters emit these; the engine never synthesizes its own.
#[derive(Debug)]
pub struct Action {
    pub action_type: ActionType,
    pub working_directory: PathBuf,
    pub command_path: PathBuf,
    pub command_arguments: String,
    /// Opaque marker that changes when the tool's semantics change; part of
    /// the producing attributes so history invalidates even for identical
    /// command lines.
    pub command_version: String,
    pub prerequisite_items: Vec<FileRef>,
    pub produced_items: Vec<FileRef>,
    /// Items removed from disk before the action re-runs.
    pub delete_items: Vec<FileRef>,
    /// Compiler-emitted file listing additional prerequisites discovered
    /// during the previous run.
    pub dependency_list_file: Option<FileRef>,
    pub produces_import_library: bool,
    pub use_action_history: bool,
    pub status_description: String,
}

impl Action {
    /// The command-line fingerprint recorded in the action history for every
    /// produced item.
    pub fn producing_attributes(&self) -> String {
        format!(
            "{} {} (ver {})",
            self.command_path.display(),
            self.command_arguments,
            self.command_version
        )
    }

    /// Short description used in diagnostics.
    pub fn describe(&self) -> String {
        format!(
            "{}: {} {}",
            self.status_description,
            self.command_path.display(),
            self.command_arguments
        )
    }

    pub fn produces(&self, path: &Path) -> bool {
        self.produced_items.iter().any(|item| item.path() == path)
    }

    /// Whether two actions colliding on an output are the same work item and
    /// may legally be merged. Compares every field that affects what the
    /// action does; `command_version` and the descriptive fields are
    /// deliberately excluded.
    pub fn is_equivalent_to(&self, other: &Action) -> bool {
        self.action_type == other.action_type
            && paths_of(&self.prerequisite_items) == paths_of(&other.prerequisite_items)
            && paths_of(&self.delete_items) == paths_of(&other.delete_items)
            && self.dependency_list_file.as_ref().map(|f| f.path())
                == other.dependency_list_file.as_ref().map(|f| f.path())
            && self.working_directory == other.working_directory
            && self.command_path == other.command_path
            && self.command_arguments == other.command_arguments
    }

    pub fn to_record(&self) -> ActionRecord {
        ActionRecord {
            action_type: self.action_type,
            working_directory: self.working_directory.clone(),
            command_path: self.command_path.clone(),
            command_arguments: self.command_arguments.clone(),
            command_version: self.command_version.clone(),
            prerequisite_items: self.prerequisite_items.iter().map(|f| f.path().into()).collect(),
            produced_items: self.produced_items.iter().map(|f| f.path().into()).collect(),
            delete_items: self.delete_items.iter().map(|f| f.path().into()).collect(),
            dependency_list_file: self.dependency_list_file.as_ref().map(|f| f.path().into()),
            produces_import_library: self.produces_import_library,
            use_action_history: self.use_action_history,
            status_description: self.status_description.clone(),
        }
    }
}

fn paths_of(items: &[FileRef]) -> Vec<&Path> {
    items.iter().map(|f| f.path()).collect()
}

/// The serialized form of an [`Action`], stored in makefiles and exports.
/// File references are plain paths and are rebound against the session's
/// [`FileItemCache`] on load.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActionRecord {
    pub action_type: ActionType,
    pub working_directory: PathBuf,
    pub command_path: PathBuf,
    pub command_arguments: String,
    pub command_version: String,
    pub prerequisite_items: Vec<PathBuf>,
    pub produced_items: Vec<PathBuf>,
    #[serde(default)]
    pub delete_items: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_list_file: Option<PathBuf>,
    #[serde(default)]
    pub produces_import_library: bool,
    #[serde(default = "default_true")]
    pub use_action_history: bool,
    #[serde(default)]
    pub status_description: String,
}

fn default_true() -> bool {
    true
}

impl ActionRecord {
    /// Rebinds the record's paths into canonical file items.
    pub fn into_action(self, files: &FileItemCache) -> Action {
        Action {
            action_type: self.action_type,
            working_directory: self.working_directory,
            command_path: self.command_path,
            command_arguments: self.command_arguments,
            command_version: self.command_version,
            prerequisite_items: self.prerequisite_items.iter().map(|p| files.get(p)).collect(),
            produced_items: self.produced_items.iter().map(|p| files.get(p)).collect(),
            delete_items: self.delete_items.iter().map(|p| files.get(p)).collect(),
            dependency_list_file: self.dependency_list_file.as_ref().map(|p| files.get(p)),
            produces_import_library: self.produces_import_library,
            use_action_history: self.use_action_history,
            status_description: self.status_description,
        }
    }
}

/// An [`Action`] wired into the merged graph: its prerequisite producers,
/// its transitive-dependent count and the target groups that contributed it.
#[derive(Debug)]
pub struct LinkedAction {
    pub action: Arc<Action>,
    /// Indices of the actions producing this action's prerequisite items.
    pub prerequisite_actions: Vec<usize>,
    /// Number of actions that transitively depend on this one; used to run
    /// the most-depended-on work first.
    pub total_dependents: usize,
    /// Labels of every target group that contributed this action.
    pub group_names: BTreeSet<String>,
}
