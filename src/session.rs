//! Drives a build from target descriptors to executed actions.
//!
//! The session owns the caches every component shares (file items,
//! dependency manifests, action history) and walks the build through its
//! states: obtain a makefile per target, merge the action sets into one
//! linked graph, compute the outdated subset, and hand it to the selected
//! executor. Cache persistence is flushed at the end whether or not
//! execution succeeded.

use crate::{
    actiongraph::{self, ActionGraph, GroupedActions},
    action::ActionType,
    config::{BuildConfiguration, TargetDescriptor},
    depcache::DependencyCache,
    error::{BuildError, Result},
    executor::{select_executor, ExecutionSet, Executor},
    fileitem::FileItemCache,
    history::ActionHistory,
    makefile::{Makefile, WorkingSet},
    outdated::{self, Outdatedness},
    toolchain::ToolchainAdapter,
    utils,
};
use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
};

/// Shared state for one build invocation.
pub struct BuildSession {
    pub files: FileItemCache,
    pub dependencies: DependencyCache,
    pub history: ActionHistory,
    pub config: BuildConfiguration,
}

impl BuildSession {
    /// Creates a session and registers the engine-root cache partitions.
    /// Project-rooted partitions can be added per target.
    pub fn new(config: BuildConfiguration) -> Self {
        let dependencies = DependencyCache::new();
        let history = ActionHistory::new();
        let intermediate = config.engine_root.join("Intermediate");
        dependencies.add_partition(&config.engine_root, intermediate.join("DependencyCache.json"));
        history.add_partition(&config.engine_root, intermediate.join("ActionHistory.json"));
        Self { files: FileItemCache::new(), dependencies, history, config }
    }

    /// Where the cached makefile for a target lives.
    pub fn makefile_location(&self, target: &TargetDescriptor) -> PathBuf {
        self.config.engine_root.join("Intermediate").join("Build").join(format!(
            "{}-{}-{}.Makefile.json",
            target.name, target.platform, target.configuration
        ))
    }

    /// Writes every modified cache back to disk.
    pub fn flush_caches(&self) -> Result<()> {
        self.history.flush()?;
        self.dependencies.flush()
    }
}

/// Summary of one build.
#[derive(Debug, Default)]
pub struct BuildResult {
    pub total_actions: usize,
    pub outdated_actions: usize,
    pub executed: bool,
    /// Targets the makefiles require to be built first.
    pub prebuild_targets: Vec<TargetDescriptor>,
    /// Scripts the makefiles require to run first.
    pub prebuild_scripts: Vec<PathBuf>,
}

/// Builds the given targets: plan (or load) each makefile, merge, link,
/// reconcile outdatedness and execute the stale subset.
pub fn build(
    session: &BuildSession,
    adapter: &dyn ToolchainAdapter,
    working_set: &dyn WorkingSet,
    targets: &[TargetDescriptor],
    additional_arguments: &[String],
    executor_override: Option<&dyn Executor>,
) -> Result<BuildResult> {
    let mut result = BuildResult::default();
    let mut contributions: Vec<(String, Vec<Arc<crate::action::Action>>)> = Vec::new();
    let mut environment: BTreeMap<String, String> = BTreeMap::new();

    for target in targets {
        let makefile = obtain_makefile(session, adapter, working_set, target, additional_arguments)?;
        for line in &makefile.diagnostics {
            info!("{target}: {line}");
        }
        if !session.config.skip_prebuild_targets {
            result.prebuild_targets.extend(makefile.prebuild_targets.iter().cloned());
            result.prebuild_scripts.extend(makefile.prebuild_scripts.iter().cloned());
        }
        environment.extend(makefile.environment.clone());
        let actions = makefile
            .actions
            .iter()
            .map(|record| Arc::new(record.clone().into_action(&session.files)))
            .collect();
        contributions.push((target.name.clone(), actions));
    }

    let merged = actiongraph::check_for_conflicts(contributions)?;
    actiongraph::assert_unique_producers(&merged)?;
    let graph = actiongraph::link(merged)?;
    graph.check_path_lengths(&session.config)?;
    result.total_actions = graph.len();

    if let Some(path) = &session.config.export_actions {
        utils::write_json_file(&graph.export(&environment), path)?;
        info!("exported {} action(s) to \"{}\"", graph.len(), path.display());
    }

    let outcome = plan_and_execute(session, &graph, &environment, executor_override, &mut result);
    // caches persist at the end of the build, success or not
    session.flush_caches()?;
    outcome?;
    Ok(result)
}

fn plan_and_execute(
    session: &BuildSession,
    graph: &ActionGraph,
    environment: &BTreeMap<String, String>,
    executor_override: Option<&dyn Executor>,
    result: &mut BuildResult,
) -> Result<()> {
    let outdatedness = Outdatedness {
        files: &session.files,
        dependencies: &session.dependencies,
        history: &session.history,
        ignore_outdated_import_libraries: session.config.ignore_outdated_import_libraries,
    };
    let outdated = outdatedness.compute(graph)?;
    result.outdated_actions = outdated.len();
    info!("{} of {} action(s) are outdated", outdated.len(), graph.len());

    if session.config.no_engine_changes {
        let files = graph.engine_changes(&session.config, &outdated);
        if !files.is_empty() {
            return Err(BuildError::EngineChanges { files });
        }
    }

    if let Some(path) = &session.config.write_outdated_actions {
        utils::write_json_file(&graph.export_subset(environment, &outdated), path)?;
    }

    if session.config.skip_build || outdated.is_empty() {
        return Ok(());
    }

    outdated::prepare_for_execution(graph, &outdated)?;

    // re-link just the outdated subset so the executor sees a graph sorted
    // for its own size
    let subset: GroupedActions = outdated
        .iter()
        .map(|&i| (graph.actions[i].action.clone(), graph.actions[i].group_names.clone()))
        .collect();
    let subgraph = actiongraph::link(subset)?;
    let set = ExecutionSet::from_graph(&subgraph);

    let selected;
    let executor = match executor_override {
        Some(executor) => executor,
        None => {
            selected = select_executor(&session.config);
            info!("executing with the {} executor", selected.name());
            &*selected
        }
    };
    let execution = executor.execute(&set)?;
    result.executed = true;

    // downstream consumers must observe the new outputs, not planning-time
    // stat results
    for item in set.items() {
        for produced in &item.action.produced_items {
            produced.reset_cached_info();
        }
    }

    if !execution.success() {
        return Err(BuildError::ExecutionFailed {
            failed: execution.failed.max(1),
            total: execution.total,
        });
    }

    // a linker that exits zero without writing its outputs is still a
    // failure
    for item in set.items() {
        if item.action.action_type != ActionType::Link {
            continue;
        }
        let missing: Vec<PathBuf> = item
            .action
            .produced_items
            .iter()
            .filter(|produced| !produced.exists())
            .map(|produced| produced.path().to_path_buf())
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::MissingOutputs {
                action: item.action.status_description.clone(),
                items: missing,
            });
        }
    }

    Ok(())
}

fn obtain_makefile(
    session: &BuildSession,
    adapter: &dyn ToolchainAdapter,
    working_set: &dyn WorkingSet,
    target: &TargetDescriptor,
    additional_arguments: &[String],
) -> Result<Makefile> {
    let location = session.makefile_location(target);

    let (loaded, reason) = Makefile::load(&location, additional_arguments);
    if let Some(makefile) = loaded {
        let current_sources = adapter.current_source_files(target)?;
        match makefile.is_valid_for_source_files(&current_sources, working_set) {
            Ok(()) => {
                debug!("reusing makefile for {target}");
                return Ok(makefile);
            }
            Err(reason) => info!("invalidating makefile for {target}: {reason}"),
        }
    } else if let Some(reason) = reason {
        info!("planning {target}: {reason}");
    }

    let makefile = adapter.create_makefile(session, target)?;
    makefile.save(&location)?;
    Ok(makefile)
}
