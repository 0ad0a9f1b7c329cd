//! The per-target build plan: every action the toolchain emitted for a
//! target, serialized so later runs can skip planning entirely.
//!
//! A loaded makefile must prove it still applies before it is trusted: the
//! format version, the extra command-line arguments it was produced under,
//! the per-module source sets, the adaptive working set and the contents of
//! generated-code directories all participate. Any drift discards the
//! makefile and the toolchain adapter plans again.

use crate::{
    action::ActionRecord,
    config::TargetDescriptor,
    error::Result,
    utils,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

const MAKEFILE_VERSION: u32 = 1;

/// Files the user is actively editing. Sources inside the working set are
/// compiled adaptively (e.g. without unity blobs), so membership changes
/// invalidate the plan.
pub trait WorkingSet: Sync {
    fn contains(&self, file: &Path) -> bool;
}

/// The empty working set.
pub struct EmptyWorkingSet;

impl WorkingSet for EmptyWorkingSet {
    fn contains(&self, _file: &Path) -> bool {
        false
    }
}

/// Serialized plan for one target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Makefile {
    pub version: u32,
    /// Every action to run for this target.
    pub actions: Vec<ActionRecord>,
    /// Module name to the output items it contributes, in link order.
    pub module_outputs: Vec<(String, Vec<PathBuf>)>,
    /// Targets that must be built before this one.
    pub prebuild_targets: Vec<TargetDescriptor>,
    /// Scripts to run before building.
    pub prebuild_scripts: Vec<PathBuf>,
    /// Environment variables captured when the plan was produced.
    pub environment: BTreeMap<String, String>,
    /// Extra command-line arguments the plan was produced under.
    pub additional_arguments: Vec<String>,
    /// Diagnostic strings from the toolchain, replayed on cached runs.
    pub diagnostics: Vec<String>,
    /// Expected peak memory per action, in gigabytes. Executors use it to
    /// scale down parallelism on small machines.
    pub memory_per_action_gb: f64,
    /// Per-module source sets at planning time.
    pub source_files: BTreeMap<String, BTreeSet<PathBuf>>,
    /// Sources that were inside the adaptive working set at planning time.
    pub adaptive_files: BTreeSet<PathBuf>,
    /// Listing of each generated-code directory at planning time.
    pub generated_code_dirs: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
}

impl Makefile {
    pub fn new(additional_arguments: Vec<String>) -> Self {
        Self {
            version: MAKEFILE_VERSION,
            actions: Vec::new(),
            module_outputs: Vec::new(),
            prebuild_targets: Vec::new(),
            prebuild_scripts: Vec::new(),
            environment: std::env::vars().collect(),
            additional_arguments,
            diagnostics: Vec::new(),
            memory_per_action_gb: 0.0,
            source_files: BTreeMap::new(),
            adaptive_files: BTreeSet::new(),
            generated_code_dirs: BTreeMap::new(),
        }
    }

    /// Records the current contents of a generated-code directory so later
    /// loads can detect drift.
    pub fn snapshot_generated_dir(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        let listing = list_dir(&dir);
        self.generated_code_dirs.insert(dir, listing);
    }

    /// Loads a makefile, or explains why it cannot be used. A missing file,
    /// an unreadable file, a version mismatch and diverging extra arguments
    /// all yield `(None, reason)`.
    pub fn load(path: &Path, additional_arguments: &[String]) -> (Option<Self>, Option<String>) {
        if !path.exists() {
            return (None, Some("no makefile cached for this target".to_string()));
        }
        let makefile: Self = match utils::read_json_file(path) {
            Ok(makefile) => makefile,
            Err(err) => return (None, Some(format!("failed to read makefile: {err}"))),
        };
        if makefile.version != MAKEFILE_VERSION {
            return (
                None,
                Some(format!(
                    "makefile version {} does not match the current version {}",
                    makefile.version, MAKEFILE_VERSION
                )),
            );
        }
        if makefile.additional_arguments != additional_arguments {
            return (None, Some("command line arguments changed".to_string()));
        }
        (Some(makefile), None)
    }

    /// Checks the plan against the current source layout. `Ok(())` means the
    /// plan may be reused; `Err(reason)` means it must be rebuilt.
    pub fn is_valid_for_source_files(
        &self,
        current_sources: &BTreeMap<String, BTreeSet<PathBuf>>,
        working_set: &dyn WorkingSet,
    ) -> std::result::Result<(), String> {
        for (module, sources) in current_sources {
            match self.source_files.get(module) {
                None => return Err(format!("module \"{module}\" was added")),
                Some(recorded) => {
                    if let Some(added) = sources.difference(recorded).next() {
                        return Err(format!(
                            "source file \"{}\" was added to module \"{module}\"",
                            added.display()
                        ));
                    }
                    if let Some(removed) = recorded.difference(sources).next() {
                        return Err(format!(
                            "source file \"{}\" was removed from module \"{module}\"",
                            removed.display()
                        ));
                    }
                }
            }
        }
        for module in self.source_files.keys() {
            if !current_sources.contains_key(module) {
                return Err(format!("module \"{module}\" was removed"));
            }
        }

        // adaptive membership must match what the plan was produced with
        for sources in current_sources.values() {
            for file in sources {
                let in_working_set = working_set.contains(file);
                let was_adaptive = self.adaptive_files.contains(file);
                if in_working_set != was_adaptive {
                    return Err(format!(
                        "working set membership of \"{}\" changed",
                        file.display()
                    ));
                }
            }
        }

        for (dir, recorded) in &self.generated_code_dirs {
            let current = list_dir(dir);
            if current != *recorded {
                return Err(format!(
                    "contents of generated directory \"{}\" changed",
                    dir.display()
                ));
            }
        }

        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        utils::write_json_file(self, path)?;
        trace!("wrote makefile \"{}\" with {} actions", path.display(), self.actions.len());
        Ok(())
    }
}

fn list_dir(dir: &Path) -> BTreeSet<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionType;
    use pretty_assertions::assert_eq;

    fn sample_record() -> ActionRecord {
        ActionRecord {
            action_type: ActionType::Compile,
            working_directory: PathBuf::from("/work"),
            command_path: PathBuf::from("/usr/bin/cc"),
            command_arguments: "-c a.c".to_string(),
            command_version: "1".to_string(),
            prerequisite_items: vec![PathBuf::from("/src/a.c")],
            produced_items: vec![PathBuf::from("/out/a.o")],
            delete_items: Vec::new(),
            dependency_list_file: None,
            produces_import_library: false,
            use_action_history: true,
            status_description: "a.c".to_string(),
        }
    }

    fn sample_makefile() -> Makefile {
        let mut makefile = Makefile::new(vec!["-DFAST".to_string()]);
        makefile.actions.push(sample_record());
        makefile
            .module_outputs
            .push(("Core".to_string(), vec![PathBuf::from("/out/a.o")]));
        makefile.prebuild_scripts.push(PathBuf::from("/scripts/prep.sh"));
        makefile
            .source_files
            .insert("Core".to_string(), BTreeSet::from([PathBuf::from("/src/a.c")]));
        makefile
    }

    #[test]
    fn round_trip_preserves_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Makefile.json");
        let makefile = sample_makefile();
        makefile.save(&path).unwrap();

        let (loaded, reason) = Makefile::load(&path, &["-DFAST".to_string()]);
        assert_eq!(reason, None);
        assert_eq!(loaded.unwrap(), makefile);
    }

    #[test]
    fn missing_and_mismatched_makefiles_report_reasons() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Makefile.json");
        let (none, reason) = Makefile::load(&path, &[]);
        assert!(none.is_none());
        assert!(reason.unwrap().contains("no makefile"));

        let makefile = sample_makefile();
        makefile.save(&path).unwrap();
        let (none, reason) = Makefile::load(&path, &["-DSLOW".to_string()]);
        assert!(none.is_none());
        assert!(reason.unwrap().contains("arguments changed"));
    }

    #[test]
    fn version_mismatch_discards() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Makefile.json");
        let mut makefile = sample_makefile();
        makefile.version = 99;
        makefile.save(&path).unwrap();
        let (none, reason) = Makefile::load(&path, &["-DFAST".to_string()]);
        assert!(none.is_none());
        assert!(reason.unwrap().contains("version"));
    }

    #[test]
    fn source_set_drift_invalidates() {
        let makefile = sample_makefile();
        let current = makefile.source_files.clone();
        assert!(makefile.is_valid_for_source_files(&current, &EmptyWorkingSet).is_ok());

        let mut with_added = current.clone();
        with_added.get_mut("Core").unwrap().insert(PathBuf::from("/src/b.c"));
        let reason = makefile.is_valid_for_source_files(&with_added, &EmptyWorkingSet).unwrap_err();
        assert!(reason.contains("was added"));

        let mut with_removed = current.clone();
        with_removed.get_mut("Core").unwrap().clear();
        let reason =
            makefile.is_valid_for_source_files(&with_removed, &EmptyWorkingSet).unwrap_err();
        assert!(reason.contains("was removed"));
    }

    #[test]
    fn working_set_drift_invalidates() {
        struct OneFile(PathBuf);
        impl WorkingSet for OneFile {
            fn contains(&self, file: &Path) -> bool {
                file == self.0
            }
        }

        let makefile = sample_makefile();
        let current = makefile.source_files.clone();
        let reason = makefile
            .is_valid_for_source_files(&current, &OneFile(PathBuf::from("/src/a.c")))
            .unwrap_err();
        assert!(reason.contains("working set"));
    }

    #[test]
    fn generated_dir_drift_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let generated = dir.path().join("generated");
        std::fs::create_dir_all(&generated).unwrap();
        std::fs::write(generated.join("a.gen.h"), "x").unwrap();

        let mut makefile = sample_makefile();
        makefile.snapshot_generated_dir(&generated);
        let current = makefile.source_files.clone();
        assert!(makefile.is_valid_for_source_files(&current, &EmptyWorkingSet).is_ok());

        std::fs::write(generated.join("b.gen.h"), "y").unwrap();
        let reason = makefile.is_valid_for_source_files(&current, &EmptyWorkingSet).unwrap_err();
        assert!(reason.contains("generated"));
    }
}
