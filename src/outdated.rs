//! Decides which actions must re-run.
//!
//! Phase one probes every action independently and in parallel: produced
//! items are checked for existence, the command-line fingerprint is swapped
//! into the action history, and prerequisite timestamps plus the
//! compiler-emitted dependency list are reconciled against the action's last
//! execution time. Phase two sweeps the graph dependencies-first and marks
//! every action whose prerequisite actions are outdated, modulo the
//! import-library exception.

use crate::{
    actiongraph::ActionGraph,
    action::ActionType,
    depcache::DependencyCache,
    error::Result,
    fileitem::{FileItemCache, FileRef},
    history::ActionHistory,
    utils,
};
use rayon::prelude::*;
use std::{
    collections::HashMap,
    sync::RwLock,
    time::{Duration, SystemTime},
};

/// Clock slack tolerated between a prerequisite and the outputs built from
/// it; copies over the network can land with timestamps slightly in the
/// future.
const TIMESTAMP_SLACK: Duration = Duration::from_secs(1);

/// Computes the outdated subset of an [`ActionGraph`].
pub struct Outdatedness<'a> {
    pub files: &'a FileItemCache,
    pub dependencies: &'a DependencyCache,
    pub history: &'a ActionHistory,
    /// Don't relink dependents just because a static import library
    /// sibling was rebuilt.
    pub ignore_outdated_import_libraries: bool,
}

impl<'a> Outdatedness<'a> {
    /// Returns the indices of all outdated actions, in topological order.
    pub fn compute(&self, graph: &ActionGraph) -> Result<Vec<usize>> {
        // phase one: every action probed independently, in parallel; the
        // shared dictionary is guarded by one read-dominant lock
        let outdated: RwLock<HashMap<usize, bool>> = RwLock::new(HashMap::new());
        (0..graph.len()).into_par_iter().try_for_each(|index| -> Result<()> {
            let is_outdated = self.probe(graph, index)?;
            outdated.write().unwrap().insert(index, is_outdated);
            Ok(())
        })?;

        // phase two: single-threaded sweep in dependencies-first order;
        // phase one memoized the independent answers so this is O(V)
        let mut outdated = outdated.into_inner().unwrap();
        for &index in graph.topological_order() {
            if outdated[&index] {
                continue;
            }
            let stale = graph.actions[index].prerequisite_actions.iter().any(|&p| {
                outdated[&p] && !self.import_library_action_exception(graph, index, p)
            });
            if stale {
                trace!(
                    "action #{index} ({}) outdated: prerequisite action rebuilt",
                    graph.actions[index].action.status_description
                );
                outdated.insert(index, true);
            }
        }

        Ok(graph
            .topological_order()
            .iter()
            .copied()
            .filter(|index| outdated[index])
            .collect())
    }

    /// Phase-one probe of a single action, ignoring the state of its
    /// prerequisite actions.
    fn probe(&self, graph: &ActionGraph, index: usize) -> Result<bool> {
        let action = &graph.actions[index].action;
        let mut outdated = false;

        // last execution time: the oldest produced item that exists.
        // Zero-length compile outputs are leftovers of an aborted compiler
        // and count as missing.
        let mut last_execution_time: Option<SystemTime> = None;
        let mut missing_output = false;
        for item in &action.produced_items {
            if self.is_effectively_missing(action.action_type, item) {
                missing_output = true;
                continue;
            }
            let mtime = item.last_write_time();
            last_execution_time = match (last_execution_time, mtime) {
                (Some(prior), Some(t)) => Some(prior.min(t)),
                (None, t) => t,
                (prior, None) => prior,
            };
        }

        // swap the fingerprint into the history for every produced item,
        // whether or not anything else is stale
        let new_attributes = action.producing_attributes();
        for item in &action.produced_items {
            let changed = self.history.update_producing_attributes(item.path(), &new_attributes);
            if changed && action.use_action_history && item.exists() {
                trace!(
                    "action #{index}: \"{}\" was produced by a different command",
                    item.path().display()
                );
                outdated = true;
            }
        }

        if missing_output {
            trace!("action #{index}: produced item missing");
            outdated = true;
            last_execution_time = None;
        }

        if outdated {
            return Ok(true);
        }

        // compare prerequisite timestamps against the last execution
        for item in &action.prerequisite_items {
            if !item.exists() {
                continue;
            }
            if self.newer_than(item, last_execution_time)
                && !self.import_library_item_exception(graph, item)
            {
                trace!(
                    "action #{index}: prerequisite \"{}\" is newer than the outputs",
                    item.path().display()
                );
                return Ok(true);
            }
        }

        // prerequisites discovered by the compiler on the previous run
        if let Some(list_file) = &action.dependency_list_file {
            match self.dependencies.try_get_dependencies(list_file, self.files)? {
                None => {
                    trace!(
                        "action #{index}: dependency list \"{}\" not present",
                        list_file.path().display()
                    );
                    return Ok(true);
                }
                Some(dependencies) => {
                    for dep in dependencies {
                        if !dep.exists() || self.newer_than(&dep, last_execution_time) {
                            trace!(
                                "action #{index}: discovered dependency \"{}\" changed",
                                dep.path().display()
                            );
                            return Ok(true);
                        }
                    }
                }
            }
        }

        Ok(false)
    }

    /// Whether a produced item should be treated as missing. Compile outputs
    /// of zero length are aborted writes, not real objects.
    fn is_effectively_missing(&self, action_type: ActionType, item: &FileRef) -> bool {
        let info = item.info();
        if !info.exists {
            return true;
        }
        info.length == 0
            && action_type == ActionType::Compile
            && (item.has_extension("obj") || item.has_extension("o"))
    }

    fn newer_than(&self, item: &FileRef, last_execution_time: Option<SystemTime>) -> bool {
        let Some(mtime) = item.last_write_time() else {
            return false;
        };
        match last_execution_time {
            Some(reference) => mtime > reference + TIMESTAMP_SLACK,
            // no surviving output; everything is newer
            None => true,
        }
    }

    /// The per-item form of the import-library exception: a `.lib`
    /// prerequisite produced by an import-library-producing action.
    fn import_library_item_exception(&self, graph: &ActionGraph, item: &FileRef) -> bool {
        if !self.ignore_outdated_import_libraries || !item.has_extension("lib") {
            return false;
        }
        graph
            .producer(item.path())
            .map_or(false, |p| graph.actions[p].action.produces_import_library)
    }

    /// The per-action form used in phase two: the rebuilt prerequisite
    /// action produces an import library and none of its non-`.lib` outputs
    /// are actually consumed by the dependent.
    fn import_library_action_exception(
        &self,
        graph: &ActionGraph,
        dependent: usize,
        prerequisite: usize,
    ) -> bool {
        if !self.ignore_outdated_import_libraries {
            return false;
        }
        let producer = &graph.actions[prerequisite].action;
        if !producer.produces_import_library {
            return false;
        }
        let consumed = &graph.actions[dependent].action.prerequisite_items;
        producer.produced_items.iter().all(|item| {
            item.has_extension("lib") || !consumed.iter().any(|c| c.path() == item.path())
        })
    }
}

/// Deletes the stale outputs of the outdated subset and creates the
/// directories their replacements will land in.
pub fn prepare_for_execution(graph: &ActionGraph, outdated: &[usize]) -> Result<()> {
    for &index in outdated {
        let action = &graph.actions[index].action;
        for item in action.produced_items.iter().chain(&action.delete_items) {
            match std::fs::remove_file(item.path()) {
                Ok(()) => {
                    trace!("deleted stale output \"{}\"", item.path().display());
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(crate::error::BuildError::io(err, item.path())),
            }
            item.reset_cached_info();
        }
    }
    for &index in outdated {
        for item in &graph.actions[index].action.produced_items {
            utils::create_parent_dir_all(item.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        action::Action,
        actiongraph::{check_for_conflicts, link},
        fileitem::FileItemCache,
    };
    use std::{
        fs,
        path::{Path, PathBuf},
        sync::Arc,
    };

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        files: FileItemCache,
        dependencies: DependencyCache,
        history: ActionHistory,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            let dependencies = DependencyCache::new();
            dependencies.add_partition(&root, root.join("DependencyCache.json"));
            let history = ActionHistory::new();
            history.add_partition(&root, root.join("ActionHistory.json"));
            Self { _dir: dir, root, files: FileItemCache::new(), dependencies, history }
        }

        fn engine(&self) -> Outdatedness<'_> {
            Outdatedness {
                files: &self.files,
                dependencies: &self.dependencies,
                history: &self.history,
                ignore_outdated_import_libraries: true,
            }
        }

        fn write(&self, name: &str, contents: &str) -> PathBuf {
            let path = self.root.join(name);
            fs::write(&path, contents).unwrap();
            self.files.get(&path).reset_cached_info();
            path
        }

        fn set_mtime(&self, path: &Path, when: SystemTime) {
            let f = fs::File::options().write(true).open(path).unwrap();
            f.set_times(fs::FileTimes::new().set_modified(when)).unwrap();
            self.files.get(path).reset_cached_info();
        }

        fn action(
            &self,
            action_type: ActionType,
            produced: &[&str],
            prereqs: &[&str],
            args: &str,
        ) -> Arc<Action> {
            Arc::new(Action {
                action_type,
                working_directory: self.root.clone(),
                command_path: PathBuf::from("/usr/bin/tool"),
                command_arguments: args.to_string(),
                command_version: "1".to_string(),
                prerequisite_items: prereqs.iter().map(|p| self.files.get(self.root.join(p))).collect(),
                produced_items: produced.iter().map(|p| self.files.get(self.root.join(p))).collect(),
                delete_items: Vec::new(),
                dependency_list_file: None,
                produces_import_library: false,
                use_action_history: true,
                status_description: args.to_string(),
            })
        }

        fn graph(&self, actions: Vec<Arc<Action>>) -> ActionGraph {
            let grouped =
                check_for_conflicts(vec![("test".to_string(), actions)]).unwrap();
            link(grouped).unwrap()
        }
    }

    #[test]
    fn missing_output_marks_outdated() {
        let fx = Fixture::new();
        fx.write("in.src", "source");
        let graph = fx.graph(vec![fx.action(ActionType::Compile, &["out.bin"], &["in.src"], "-o out.bin")]);
        assert_eq!(fx.engine().compute(&graph).unwrap(), vec![0]);
    }

    #[test]
    fn up_to_date_after_history_settles() {
        let fx = Fixture::new();
        fx.write("in.src", "source");
        fx.write("out.bin", "built");
        let graph = fx.graph(vec![fx.action(ActionType::Compile, &["out.bin"], &["in.src"], "-o out.bin")]);

        // first probe seeds the history and reports outdated
        assert_eq!(fx.engine().compute(&graph).unwrap(), vec![0]);
        // second probe sees matching attributes and fresh outputs
        assert!(fx.engine().compute(&graph).unwrap().is_empty());
    }

    #[test]
    fn changed_arguments_invalidate_via_history() {
        let fx = Fixture::new();
        fx.write("in.src", "source");
        fx.write("out.bin", "built");
        let graph = fx.graph(vec![fx.action(ActionType::Compile, &["out.bin"], &["in.src"], "-o out.bin")]);
        assert_eq!(fx.engine().compute(&graph).unwrap(), vec![0]);
        assert!(fx.engine().compute(&graph).unwrap().is_empty());

        let changed =
            fx.graph(vec![fx.action(ActionType::Compile, &["out.bin"], &["in.src"], "-O3 -o out.bin")]);
        assert_eq!(fx.engine().compute(&changed).unwrap(), vec![0]);
    }

    #[test]
    fn prerequisite_newer_than_slack_marks_outdated() {
        let fx = Fixture::new();
        let input = fx.write("in.src", "source");
        let output = fx.write("out.bin", "built");
        let graph = fx.graph(vec![fx.action(ActionType::Compile, &["out.bin"], &["in.src"], "-o out.bin")]);
        fx.engine().compute(&graph).unwrap();

        let out_time = utils::modified_time(&output).unwrap();
        // half a second of skew is inside the tolerance
        fx.set_mtime(&input, out_time + Duration::from_millis(500));
        assert!(fx.engine().compute(&graph).unwrap().is_empty());
        // two seconds is not
        fx.set_mtime(&input, out_time + Duration::from_secs(2));
        assert_eq!(fx.engine().compute(&graph).unwrap(), vec![0]);
    }

    #[test]
    fn zero_length_compile_object_counts_as_missing() {
        let fx = Fixture::new();
        fx.write("in.src", "source");
        fx.write("out.o", "");
        let graph = fx.graph(vec![fx.action(ActionType::Compile, &["out.o"], &["in.src"], "-c")]);
        fx.engine().compute(&graph).unwrap();
        // still outdated on the second pass; the empty object never counts
        assert_eq!(fx.engine().compute(&graph).unwrap(), vec![0]);
    }

    #[test]
    fn dependency_list_drives_outdatedness() {
        let fx = Fixture::new();
        fx.write("in.src", "source");
        let output = fx.write("out.bin", "built");
        let header = fx.write("hdr.h", "header");
        fx.write("unit.d", "out.bin: hdr.h\n");

        let mut action =
            (*fx.action(ActionType::Compile, &["out.bin"], &["in.src"], "-o out.bin")).to_record();
        action.dependency_list_file = Some(fx.root.join("unit.d"));
        let action = Arc::new(action.into_action(&fx.files));
        // rebind relative dependency path: the .d file lists hdr.h relative
        // to the partition root, rewrite it absolute for the lookup
        fx.write("unit.d", &format!("out.bin: {}\n", header.display()));

        let graph = fx.graph(vec![action]);
        fx.engine().compute(&graph).unwrap();
        let out_time = utils::modified_time(&output).unwrap();
        fx.set_mtime(&header, out_time - Duration::from_secs(5));
        assert!(fx.engine().compute(&graph).unwrap().is_empty());

        fx.set_mtime(&header, out_time + Duration::from_secs(2));
        // the cached dependency info is keyed by the .d mtime, not the header
        assert_eq!(fx.engine().compute(&graph).unwrap(), vec![0]);
    }

    #[test]
    fn phase_two_propagates_to_dependents() {
        let fx = Fixture::new();
        fx.write("a.src", "a");
        fx.write("a.o", "object");
        fx.write("app", "binary");
        let graph = fx.graph(vec![
            fx.action(ActionType::Compile, &["a.o"], &["a.src"], "compile a"),
            fx.action(ActionType::Link, &["app"], &["a.o"], "link app"),
        ]);
        fx.engine().compute(&graph).unwrap();
        assert!(fx.engine().compute(&graph).unwrap().is_empty());

        // make the compile stale; the link follows via phase two
        let a_src = fx.root.join("a.src");
        let newer = utils::modified_time(&fx.root.join("a.o")).unwrap() + Duration::from_secs(3);
        fx.set_mtime(&a_src, newer);
        let outdated = fx.engine().compute(&graph).unwrap();
        assert_eq!(outdated, vec![0, 1]);
    }

    #[test]
    fn import_library_rebuild_does_not_relink_dependents() {
        let fx = Fixture::new();
        fx.write("dll.src", "dll source");
        fx.write("thing.dll", "dll");
        fx.write("thing.lib", "import lib");
        fx.write("app", "binary");

        let mut producer =
            (*fx.action(ActionType::Link, &["thing.dll", "thing.lib"], &["dll.src"], "link dll"))
                .to_record();
        producer.produces_import_library = true;
        let producer = Arc::new(producer.into_action(&fx.files));
        let consumer = fx.action(ActionType::Link, &["app"], &["thing.lib"], "link app");

        let graph = fx.graph(vec![producer, consumer]);
        fx.engine().compute(&graph).unwrap();
        assert!(fx.engine().compute(&graph).unwrap().is_empty());

        // stale dll source outdates the producer only
        let newer =
            utils::modified_time(&fx.root.join("thing.dll")).unwrap() + Duration::from_secs(3);
        fx.set_mtime(&fx.root.join("dll.src"), newer);
        let outdated = fx.engine().compute(&graph).unwrap();
        assert_eq!(outdated, vec![0]);
    }

    #[test]
    fn prepare_deletes_outputs_and_creates_directories() {
        let fx = Fixture::new();
        fx.write("in.src", "source");
        let stale = fx.write("out.bin", "stale");
        let graph = fx.graph(vec![fx.action(
            ActionType::Compile,
            &["nested/dir/out2.bin", "out.bin"],
            &["in.src"],
            "-o out.bin",
        )]);
        prepare_for_execution(&graph, &[0]).unwrap();
        assert!(!stale.exists());
        assert!(fx.root.join("nested/dir").is_dir());
    }
}
