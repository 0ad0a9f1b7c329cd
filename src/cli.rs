//! Command-line front end: the `build` verb drives the incremental action
//! graph engine, the `graph` verb drives the pipeline runtime.

use crate::{
    config::{BuildConfiguration, TargetDescriptor},
    error::{BuildError, Result},
    makefile::{EmptyWorkingSet, Makefile},
    pipeline::{
        JobDriver, JobOptions, LiteralConditions, ScriptContext, TempStorage, TokenStore,
    },
    session::{self, BuildSession},
    toolchain::ToolchainAdapter,
    utils,
};
use clap::{Args, Parser, Subcommand};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

#[derive(Parser)]
#[command(name = "graphmill", version, about = "Incremental action-graph build engine and pipeline runtime")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Build one or more targets with the incremental action graph engine.
    Build(BuildArgs),
    /// Execute a parsed build graph script.
    Graph(GraphArgs),
}

#[derive(Args)]
pub struct BuildArgs {
    /// Target descriptors as NAME+PLATFORM+CONFIGURATION triples.
    #[arg(long = "target", value_name = "NAME+PLATFORM+CONFIG", required = true)]
    pub targets: Vec<String>,

    /// Root of the engine checkout. Defaults to the current directory.
    #[arg(long)]
    pub engine_root: Option<PathBuf>,

    /// Directory of externally planned makefiles, one
    /// `<Name>-<Platform>-<Config>.plan.json` per target.
    #[arg(long)]
    pub plans: PathBuf,

    /// Plan only; do not execute any actions.
    #[arg(long)]
    pub skip_build: bool,

    /// Fail (with a distinct exit code) if the build would modify engine
    /// files.
    #[arg(long)]
    pub no_engine_changes: bool,

    /// Do not run the pre-build targets implied by the makefiles.
    #[arg(long)]
    pub skip_pre_build_targets: bool,

    /// Export the merged action graph as JSON.
    #[arg(long)]
    pub export_actions: Option<PathBuf>,

    /// Write the outdated subset as JSON.
    #[arg(long)]
    pub write_outdated_actions: Option<PathBuf>,

    /// Maximum number of concurrently executing actions.
    #[arg(long)]
    pub max_parallel_actions: Option<usize>,

    /// Relink dependents when a static import library is rebuilt.
    #[arg(long)]
    pub no_ignore_outdated_import_libraries: bool,

    /// Extra arguments recorded into (and validated against) the makefiles.
    #[arg(long = "argument")]
    pub arguments: Vec<String>,
}

#[derive(Args)]
pub struct GraphArgs {
    /// The parsed graph document (JSON) produced by the schema reader.
    #[arg(long)]
    pub script: PathBuf,

    /// Node or agent names to build.
    #[arg(long = "target")]
    pub targets: Vec<String>,

    /// Set a script property, as PROP=VALUE.
    #[arg(long = "set", value_name = "PROP=VALUE")]
    pub set: Vec<String>,

    /// Append to a script property, as PROP=VALUE.
    #[arg(long = "append", value_name = "PROP=VALUE")]
    pub append: Vec<String>,

    /// Fire a trigger by name.
    #[arg(long = "trigger")]
    pub triggers: Vec<String>,

    /// Treat every trigger as fired.
    #[arg(long)]
    pub skip_triggers: bool,

    /// Treat these triggers as fired (N1+N2 syntax accepted).
    #[arg(long = "skip-trigger")]
    pub skip_trigger: Vec<String>,

    /// Run exactly this node, without its prerequisites.
    #[arg(long)]
    pub single_node: Option<String>,

    /// Print the culled node set instead of executing.
    #[arg(long)]
    pub list_only: bool,

    /// With --list-only, include each node's dependencies.
    #[arg(long)]
    pub show_deps: bool,

    /// Wipe local temp storage first.
    #[arg(long)]
    pub clean: bool,

    /// Re-clean these nodes first (N1+N2 syntax accepted).
    #[arg(long = "clean-node")]
    pub clean_nodes: Vec<String>,

    /// Skip nodes already marked complete and still intact.
    #[arg(long)]
    pub resume: bool,

    /// Write the culled graph as JSON instead of executing.
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// Shared storage directory for cross-machine artifact handoff.
    #[arg(long)]
    pub shared_storage_dir: Option<PathBuf>,

    /// Mirror produced blocks into shared storage.
    #[arg(long)]
    pub write_to_shared_storage: bool,

    /// Owner signature written into acquired tokens.
    #[arg(long, default_value = "Unknown")]
    pub token_signature: String,

    /// Drop nodes whose tokens are held elsewhere instead of failing.
    #[arg(long)]
    pub skip_targets_without_tokens: bool,

    /// Workspace root. Defaults to the current directory.
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Local temp storage directory. Defaults to
    /// `<root>/Intermediate/TempStorage`.
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,
}

/// A toolchain collaborator that replays externally planned makefiles from
/// a directory of `.plan.json` documents.
struct PlanDirectoryToolchain {
    plans: PathBuf,
}

impl PlanDirectoryToolchain {
    fn plan_path(&self, target: &TargetDescriptor) -> PathBuf {
        self.plans.join(format!(
            "{}-{}-{}.plan.json",
            target.name, target.platform, target.configuration
        ))
    }
}

impl ToolchainAdapter for PlanDirectoryToolchain {
    fn name(&self) -> &str {
        "plan-directory"
    }

    fn create_makefile(
        &self,
        _session: &BuildSession,
        target: &TargetDescriptor,
    ) -> Result<Makefile> {
        let path = self.plan_path(target);
        debug!("reading planned makefile \"{}\"", path.display());
        utils::read_json_file(&path)
    }

    fn current_source_files(
        &self,
        target: &TargetDescriptor,
    ) -> Result<BTreeMap<String, BTreeSet<PathBuf>>> {
        // externally planned makefiles own their source layout; report the
        // plan's own snapshot so drift detection falls to the planner
        let makefile: Makefile = utils::read_json_file(self.plan_path(target))?;
        Ok(makefile.source_files)
    }
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Build(args) => run_build(args),
        Command::Graph(args) => run_graph(args),
    }
}

fn run_build(args: BuildArgs) -> Result<()> {
    let engine_root = match args.engine_root {
        Some(root) => utils::absolutize(root),
        None => std::env::current_dir()
            .map_err(|err| BuildError::io(err, "."))
            .map(utils::absolutize)?,
    };

    let targets = args
        .targets
        .iter()
        .map(|spec| {
            let parts: Vec<&str> = spec.split('+').collect();
            match parts.as_slice() {
                [name, platform, configuration] => {
                    Ok(TargetDescriptor::new(*name, *platform, *configuration))
                }
                _ => Err(BuildError::msg(format!(
                    "target \"{spec}\" is not a NAME+PLATFORM+CONFIG triple"
                ))),
            }
        })
        .collect::<Result<Vec<_>>>()?;

    let mut config = BuildConfiguration::new(engine_root);
    config.skip_build = args.skip_build;
    config.no_engine_changes = args.no_engine_changes;
    config.skip_prebuild_targets = args.skip_pre_build_targets;
    config.export_actions = args.export_actions;
    config.write_outdated_actions = args.write_outdated_actions;
    config.ignore_outdated_import_libraries = !args.no_ignore_outdated_import_libraries;
    if let Some(max) = args.max_parallel_actions {
        config.max_parallel_actions = max;
    }

    let session = BuildSession::new(config);
    let adapter = PlanDirectoryToolchain { plans: args.plans };
    let result = session::build(
        &session,
        &adapter,
        &EmptyWorkingSet,
        &targets,
        &args.arguments,
        None,
    )?;

    for script in &result.prebuild_scripts {
        info!("pre-build script (not run by this engine): {}", script.display());
    }
    info!(
        "{} action(s), {} outdated{}",
        result.total_actions,
        result.outdated_actions,
        if result.executed { ", executed" } else { "" }
    );
    Ok(())
}

fn run_graph(args: GraphArgs) -> Result<()> {
    let root = match args.root {
        Some(root) => utils::absolutize(root),
        None => std::env::current_dir()
            .map_err(|err| BuildError::io(err, "."))
            .map(utils::absolutize)?,
    };

    let graph: crate::pipeline::Graph = utils::read_json_file(&args.script)?;

    let mut context = ScriptContext::new(&root);
    for assignment in &args.set {
        let (name, value) = split_assignment(assignment)?;
        context.set(name, value);
    }
    for assignment in &args.append {
        let (name, value) = split_assignment(assignment)?;
        context.append(name, value);
    }

    if args.targets.is_empty() && args.single_node.is_none() && args.export.is_none() {
        return Err(BuildError::msg("no targets specified; pass --target or --single-node"));
    }

    let storage_dir = args
        .storage_dir
        .unwrap_or_else(|| root.join("Intermediate").join("TempStorage"));
    let storage =
        TempStorage::new(&root, storage_dir, args.shared_storage_dir, args.write_to_shared_storage);

    let options = JobOptions {
        targets: args.targets,
        single_node: args.single_node,
        skip_targets_without_tokens: args.skip_targets_without_tokens,
        resume: args.resume,
        clean: args.clean,
        clean_nodes: split_plus_lists(&args.clean_nodes),
        list_only: args.list_only,
        show_deps: args.show_deps,
        active_triggers: args.triggers.into_iter().collect(),
        skip_all_triggers: args.skip_triggers,
        skipped_triggers: split_plus_lists(&args.skip_trigger).into_iter().collect(),
        export: args.export,
    };

    let registry = crate::pipeline::standard_registry();
    let driver = JobDriver {
        graph: &graph,
        context: &context,
        conditions: &LiteralConditions,
        registry: &registry,
        storage,
        tokens: TokenStore::new(args.token_signature),
        options,
    };
    let outcome = driver.run()?;
    if !outcome.planned_only {
        info!("{} node(s) executed", outcome.executed().count());
    }
    Ok(())
}

fn split_assignment(assignment: &str) -> Result<(&str, &str)> {
    assignment
        .split_once('=')
        .ok_or_else(|| BuildError::msg(format!("\"{assignment}\" is not PROP=VALUE")))
}

fn split_plus_lists(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| v.split('+'))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}
