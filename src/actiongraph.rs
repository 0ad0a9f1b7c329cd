//! Wires merged action sets into a DAG: producer lookup, cycle detection,
//! duplicate-producer conflict checks and the execution ordering.

use crate::{
    action::{Action, LinkedAction},
    config::BuildConfiguration,
    error::{BuildError, Result},
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

/// Absolute paths at or beyond this length break Windows tooling.
pub const MAX_PATH_LENGTH: usize = 260;

/// Which fields differed between two actions producing the same item.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConflictFields {
    pub action_type: bool,
    pub prerequisite_items: bool,
    pub delete_items: bool,
    pub dependency_list_file: bool,
    pub working_directory: bool,
    pub command_path: bool,
    pub command_arguments: bool,
}

impl ConflictFields {
    /// Compares the identity fields of two actions; a default (all-false)
    /// result means the actions are equivalent.
    pub fn between(first: &Action, second: &Action) -> Self {
        let paths = |items: &[crate::fileitem::FileRef]| -> Vec<PathBuf> {
            items.iter().map(|f| f.path().to_path_buf()).collect()
        };
        Self {
            action_type: first.action_type != second.action_type,
            prerequisite_items: paths(&first.prerequisite_items)
                != paths(&second.prerequisite_items),
            delete_items: paths(&first.delete_items) != paths(&second.delete_items),
            dependency_list_file: first.dependency_list_file.as_ref().map(|f| f.path())
                != second.dependency_list_file.as_ref().map(|f| f.path()),
            working_directory: first.working_directory != second.working_directory,
            command_path: first.command_path != second.command_path,
            command_arguments: first.command_arguments != second.command_arguments,
        }
    }

    pub fn any(&self) -> bool {
        self.action_type
            || self.prerequisite_items
            || self.delete_items
            || self.dependency_list_file
            || self.working_directory
            || self.command_path
            || self.command_arguments
    }
}

impl std::fmt::Display for ConflictFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.action_type {
            names.push("action type");
        }
        if self.prerequisite_items {
            names.push("prerequisites");
        }
        if self.delete_items {
            names.push("delete items");
        }
        if self.dependency_list_file {
            names.push("dependency list");
        }
        if self.working_directory {
            names.push("working directory");
        }
        if self.command_path {
            names.push("command path");
        }
        if self.command_arguments {
            names.push("command arguments");
        }
        f.write_str(&names.join(", "))
    }
}

/// An action set merged from one or more targets, each action labelled with
/// the groups that contributed it.
pub type GroupedActions = Vec<(Arc<Action>, BTreeSet<String>)>;

/// Merges per-target action lists, deduplicating equivalent actions and
/// attaching every contributing group's label. Two actions colliding on a
/// produced item with any diverging identity field are a fatal conflict;
/// both definitions are dumped to the diagnostic as JSON.
pub fn check_for_conflicts(
    contributions: Vec<(String, Vec<Arc<Action>>)>,
) -> Result<GroupedActions> {
    let mut merged: GroupedActions = Vec::new();
    let mut producer_of: HashMap<PathBuf, usize> = HashMap::new();

    for (group, actions) in contributions {
        for action in actions {
            // find an existing producer of any of this action's outputs
            let existing = action
                .produced_items
                .iter()
                .find_map(|item| producer_of.get(item.path()).copied());

            match existing {
                Some(index) => {
                    let (prior, groups) = &mut merged[index];
                    let fields = ConflictFields::between(prior, &action);
                    if fields.any() {
                        let item = action
                            .produced_items
                            .iter()
                            .find(|i| prior.produces(i.path()))
                            .map(|i| i.path().to_path_buf())
                            .unwrap_or_default();
                        return Err(BuildError::Conflict {
                            item,
                            fields,
                            first: action_json(prior),
                            second: action_json(&action),
                        });
                    }
                    groups.insert(group.clone());
                    // equivalence does not compare produced items; register
                    // any outputs only this contribution declared
                    for item in &action.produced_items {
                        producer_of.entry(item.path().to_path_buf()).or_insert(index);
                    }
                }
                None => {
                    let index = merged.len();
                    for item in &action.produced_items {
                        producer_of.insert(item.path().to_path_buf(), index);
                    }
                    merged.push((action, BTreeSet::from([group.clone()])));
                }
            }
        }
    }
    Ok(merged)
}

fn action_json(action: &Action) -> String {
    serde_json::to_string_pretty(&action.to_record()).unwrap_or_else(|_| action.describe())
}

/// The merged, linked DAG of actions for one build.
#[derive(Debug)]
pub struct ActionGraph {
    pub actions: Vec<LinkedAction>,
    /// produced path -> producing action index
    producers: HashMap<PathBuf, usize>,
    /// Dependencies-first order established during cycle detection.
    topo_order: Vec<usize>,
}

/// Builds the producer map, records each action's prerequisite actions,
/// rejects cycles and computes transitive-dependent counts.
pub fn link(grouped: GroupedActions) -> Result<ActionGraph> {
    let mut producers: HashMap<PathBuf, usize> = HashMap::new();
    for (index, (action, _)) in grouped.iter().enumerate() {
        for item in &action.produced_items {
            producers.entry(item.path().to_path_buf()).or_insert(index);
        }
    }

    let prerequisite_actions: Vec<Vec<usize>> = grouped
        .iter()
        .enumerate()
        .map(|(index, (action, _))| {
            let mut prereqs: Vec<usize> = action
                .prerequisite_items
                .iter()
                .filter_map(|item| producers.get(item.path()).copied())
                .filter(|&p| p != index)
                .collect();
            prereqs.sort_unstable();
            prereqs.dedup();
            prereqs
        })
        .collect();

    let topo_order = detect_cycles(&grouped, &prerequisite_actions)?;
    let total_dependents = count_total_dependents(&prerequisite_actions);

    let actions = grouped
        .into_iter()
        .zip(prerequisite_actions)
        .zip(total_dependents)
        .map(|(((action, group_names), prerequisite_actions), total_dependents)| LinkedAction {
            action,
            prerequisite_actions,
            total_dependents,
            group_names,
        })
        .collect();

    Ok(ActionGraph { actions, producers, topo_order })
}

/// Iterative fixpoint: grow the set of actions whose producing prerequisites
/// are all already in the set. Anything left when the set stops growing is
/// part of a cycle; the diagnostic names each such action and its cyclic
/// producers.
fn detect_cycles(
    grouped: &GroupedActions,
    prerequisite_actions: &[Vec<usize>],
) -> Result<Vec<usize>> {
    let count = grouped.len();
    let mut linked = vec![false; count];
    let mut order = Vec::with_capacity(count);

    loop {
        let mut grew = false;
        for index in 0..count {
            if linked[index] {
                continue;
            }
            if prerequisite_actions[index].iter().all(|&p| linked[p]) {
                linked[index] = true;
                order.push(index);
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    if order.len() == count {
        return Ok(order);
    }

    let diagnostics = (0..count)
        .filter(|&index| !linked[index])
        .map(|index| {
            let cyclic: Vec<String> = prerequisite_actions[index]
                .iter()
                .filter(|&&p| !linked[p])
                .map(|&p| format!("#{p} ({})", grouped[p].0.describe()))
                .collect();
            format!(
                "  action #{index} ({}) depends on cyclic producer(s): {}",
                grouped[index].0.describe(),
                cyclic.join(", ")
            )
        })
        .collect();
    Err(BuildError::Cycle { diagnostics })
}

/// Number of actions transitively depending on each action. Drives the
/// execution sort so the most-depended-on work starts first.
fn count_total_dependents(prerequisite_actions: &[Vec<usize>]) -> Vec<usize> {
    let count = prerequisite_actions.len();
    let mut dependents_of: Vec<Vec<usize>> = vec![Vec::new(); count];
    for (index, prereqs) in prerequisite_actions.iter().enumerate() {
        for &p in prereqs {
            dependents_of[p].push(index);
        }
    }

    (0..count)
        .map(|start| {
            let mut seen = vec![false; count];
            let mut stack: Vec<usize> = dependents_of[start].clone();
            let mut total = 0;
            while let Some(index) = stack.pop() {
                if seen[index] {
                    continue;
                }
                seen[index] = true;
                total += 1;
                stack.extend(dependents_of[index].iter().copied());
            }
            total
        })
        .collect()
}

impl ActionGraph {
    /// The action producing the given item, if it is produced in this build.
    pub fn producer(&self, item: &Path) -> Option<usize> {
        self.producers.get(item).copied()
    }

    /// Indices in dependencies-first order.
    pub fn topological_order(&self) -> &[usize] {
        &self.topo_order
    }

    /// Indices sorted by descending transitive-dependent count; ties keep
    /// their original order.
    pub fn execution_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.actions.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(self.actions[i].total_dependents));
        order
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Fails on any absolute path long enough to break Windows tooling and
    /// warns on produced items nested deeply under the engine root.
    pub fn check_path_lengths(&self, config: &BuildConfiguration) -> Result<()> {
        for linked in &self.actions {
            for item in
                linked.action.prerequisite_items.iter().chain(&linked.action.produced_items)
            {
                let length = item.path().as_os_str().len();
                if length >= MAX_PATH_LENGTH {
                    return Err(BuildError::PathTooLong {
                        path: item.path().to_path_buf(),
                        length,
                        limit: MAX_PATH_LENGTH,
                    });
                }
            }
            for item in &linked.action.produced_items {
                if let Ok(nested) = item.path().strip_prefix(&config.engine_root) {
                    let length = nested.as_os_str().len();
                    if length > config.max_nested_path_length {
                        warn!(
                            "produced item \"{}\" is nested {} characters under the engine root (limit {})",
                            item.path().display(),
                            length,
                            config.max_nested_path_length
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Serializes the graph in the export format consumed by external
    /// schedulers.
    pub fn export(&self, environment: &BTreeMap<String, String>) -> serde_json::Value {
        self.export_subset(environment, &(0..self.actions.len()).collect::<Vec<_>>())
    }

    /// Exports only the given action indices.
    pub fn export_subset(
        &self,
        environment: &BTreeMap<String, String>,
        indices: &[usize],
    ) -> serde_json::Value {
        #[derive(Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct ExportedAction<'a> {
            id: usize,
            action_type: String,
            command_path: &'a Path,
            command_arguments: &'a str,
            working_directory: &'a Path,
            prerequisite_items: Vec<&'a Path>,
            produced_items: Vec<&'a Path>,
            #[serde(skip_serializing_if = "Option::is_none")]
            dependency_list_file: Option<&'a Path>,
            #[serde(skip_serializing_if = "std::ops::Not::not")]
            produces_import_library: bool,
            group_names: Vec<&'a str>,
        }

        let actions: Vec<ExportedAction<'_>> = indices
            .iter()
            .map(|&id| {
                let linked = &self.actions[id];
                let action = &linked.action;
                ExportedAction {
                    id,
                    action_type: action.action_type.to_string(),
                    command_path: &action.command_path,
                    command_arguments: &action.command_arguments,
                    working_directory: &action.working_directory,
                    prerequisite_items: action
                        .prerequisite_items
                        .iter()
                        .map(|f| f.path())
                        .collect(),
                    produced_items: action.produced_items.iter().map(|f| f.path()).collect(),
                    dependency_list_file: action.dependency_list_file.as_ref().map(|f| f.path()),
                    produces_import_library: action.produces_import_library,
                    group_names: linked.group_names.iter().map(String::as_str).collect(),
                }
            })
            .collect();

        serde_json::json!({ "Environment": environment, "Actions": actions })
    }

    /// Produced items of the given actions that fall under the engine root.
    pub fn engine_changes(&self, config: &BuildConfiguration, indices: &[usize]) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = indices
            .iter()
            .flat_map(|&i| self.actions[i].action.produced_items.iter())
            .filter(|item| item.path().starts_with(&config.engine_root))
            .map(|item| item.path().to_path_buf())
            .collect();
        files.sort();
        files.dedup();
        files
    }
}

/// Sanity pass over a merged set: every produced item has exactly one
/// producing action once conflicts are merged.
pub fn assert_unique_producers(grouped: &GroupedActions) -> Result<()> {
    let mut seen: HashSet<&Path> = HashSet::new();
    for (action, _) in grouped {
        for item in &action.produced_items {
            if !seen.insert(item.path()) {
                return Err(BuildError::msg(format!(
                    "item \"{}\" is produced by more than one action after merging",
                    item.path().display()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        action::ActionType,
        fileitem::{FileItemCache, FileRef},
    };
    use pretty_assertions::assert_eq;

    fn action(
        files: &FileItemCache,
        produced: &[&str],
        prereqs: &[&str],
        args: &str,
    ) -> Arc<Action> {
        let refs = |paths: &[&str]| -> Vec<FileRef> { paths.iter().map(|p| files.get(p)).collect() };
        Arc::new(Action {
            action_type: ActionType::Compile,
            working_directory: PathBuf::from("/work"),
            command_path: PathBuf::from("/usr/bin/tool"),
            command_arguments: args.to_string(),
            command_version: "1".to_string(),
            prerequisite_items: refs(prereqs),
            produced_items: refs(produced),
            delete_items: Vec::new(),
            dependency_list_file: None,
            produces_import_library: false,
            use_action_history: true,
            status_description: args.to_string(),
        })
    }

    fn grouped(actions: Vec<Arc<Action>>) -> GroupedActions {
        actions.into_iter().map(|a| (a, BTreeSet::from(["test".to_string()]))).collect()
    }

    #[test]
    fn link_orders_dependencies_first() {
        let files = FileItemCache::new();
        let set = grouped(vec![
            action(&files, &["/out/app"], &["/out/a.o", "/out/b.o"], "link"),
            action(&files, &["/out/a.o"], &["/src/a.c"], "a"),
            action(&files, &["/out/b.o"], &["/src/b.c"], "b"),
        ]);
        let graph = link(set).unwrap();

        let order = graph.topological_order();
        let pos = |i: usize| order.iter().position(|&x| x == i).unwrap();
        for (index, linked) in graph.actions.iter().enumerate() {
            for &p in &linked.prerequisite_actions {
                assert!(pos(p) < pos(index), "producer {p} must precede {index}");
            }
        }
        // the link action has two transitive providers; each compile has one
        // dependent
        assert_eq!(graph.actions[0].total_dependents, 0);
        assert_eq!(graph.actions[1].total_dependents, 1);
        assert_eq!(graph.actions[2].total_dependents, 1);
        assert_eq!(graph.execution_order()[2], 0);
    }

    #[test]
    fn cycle_diagnostic_names_every_participant() {
        let files = FileItemCache::new();
        let set = grouped(vec![
            action(&files, &["/out/a.o"], &["/out/b.o"], "a"),
            action(&files, &["/out/b.o"], &["/out/a.o"], "b"),
            action(&files, &["/out/c.o"], &["/src/c.c"], "c"),
        ]);
        let err = link(set).unwrap_err();
        let BuildError::Cycle { diagnostics } = err else { panic!("expected cycle") };
        assert_eq!(diagnostics.len(), 2);
        assert!(diagnostics.iter().any(|d| d.contains("action #0")));
        assert!(diagnostics.iter().any(|d| d.contains("action #1")));
    }

    #[test]
    fn equivalent_duplicates_merge_groups() {
        let files = FileItemCache::new();
        let a1 = action(&files, &["/out/shared.o"], &["/src/shared.c"], "shared");
        let a2 = action(&files, &["/out/shared.o"], &["/src/shared.c"], "shared");
        let merged = check_for_conflicts(vec![
            ("Game".to_string(), vec![a1]),
            ("Editor".to_string(), vec![a2]),
        ])
        .unwrap();
        assert_eq!(merged.len(), 1);
        let groups: Vec<&str> = merged[0].1.iter().map(String::as_str).collect();
        assert_eq!(groups, vec!["Editor", "Game"]);
        assert_unique_producers(&merged).unwrap();
    }

    #[test]
    fn diverging_duplicates_report_the_field() {
        let files = FileItemCache::new();
        let a1 = action(&files, &["/out/shared.o"], &["/src/shared.c"], "shared");
        let a2 = action(&files, &["/out/shared.o"], &["/src/shared.c"], "shared -O3");
        let err = check_for_conflicts(vec![
            ("Game".to_string(), vec![a1]),
            ("Editor".to_string(), vec![a2]),
        ])
        .unwrap_err();
        let BuildError::Conflict { fields, .. } = err else { panic!("expected conflict") };
        assert!(fields.command_arguments);
        assert!(!fields.command_path);
        assert!(!fields.prerequisite_items);
    }

    #[test]
    fn path_length_guard() {
        let files = FileItemCache::new();
        let long = format!("/out/{}", "x".repeat(300));
        let set = grouped(vec![action(&files, &[long.as_str()], &["/src/a.c"], "a")]);
        let graph = link(set).unwrap();
        let err = graph.check_path_lengths(&BuildConfiguration::default()).unwrap_err();
        assert!(matches!(err, BuildError::PathTooLong { .. }));
    }

    #[test]
    fn export_format() {
        let files = FileItemCache::new();
        let set = grouped(vec![action(&files, &["/out/a.o"], &["/src/a.c"], "-c a.c")]);
        let graph = link(set).unwrap();
        let env = BTreeMap::from([("PATH".to_string(), "/usr/bin".to_string())]);
        let value = graph.export(&env);
        assert_eq!(value["Environment"]["PATH"], "/usr/bin");
        let actions = value["Actions"].as_array().unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0]["Id"], 0);
        assert_eq!(actions[0]["ActionType"], "Compile");
        assert_eq!(actions[0]["GroupNames"][0], "test");
    }
}
