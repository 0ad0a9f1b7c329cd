//! Drives one pipeline job: resolve targets, cull the graph, claim tokens,
//! execute each node in order and route tagged file sets through temp
//! storage.

use crate::{
    error::{BuildError, Result},
    pipeline::{
        context::{ConditionEvaluator, ScriptContext},
        graph::{Graph, Node},
        storage::{
            hash_file, is_duplicable_build_product, TempStorage, TempStorageBlock,
        },
        task::{Task, TaskBinder, TaskContext, TaskRegistry},
        token::{TokenState, TokenStore},
    },
    utils,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::PathBuf,
};

/// How the driver treats a job.
#[derive(Debug, Default)]
pub struct JobOptions {
    pub targets: Vec<String>,
    /// Run exactly this node, without pulling in its prerequisites.
    pub single_node: Option<String>,
    /// Drop nodes whose tokens are held elsewhere instead of failing.
    pub skip_targets_without_tokens: bool,
    /// Skip nodes already marked complete (and still intact).
    pub resume: bool,
    /// Wipe local temp storage before running.
    pub clean: bool,
    /// Re-clean just these nodes before running.
    pub clean_nodes: Vec<String>,
    /// Print the culled node set instead of executing.
    pub list_only: bool,
    /// With `list_only`, also print each node's dependencies.
    pub show_deps: bool,
    /// Triggers explicitly fired for this run.
    pub active_triggers: BTreeSet<String>,
    /// Treat every trigger as fired.
    pub skip_all_triggers: bool,
    /// Treat just these triggers as fired.
    pub skipped_triggers: BTreeSet<String>,
    /// Write the culled graph as JSON here instead of executing.
    pub export: Option<PathBuf>,
}

/// What happened to each node of the culled set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeDisposition {
    Executed,
    /// Already complete and intact; skipped by a resume run.
    AlreadyComplete,
    /// Behind a trigger that was not fired.
    BehindTrigger(String),
    /// A required token is held by another job.
    MissingToken(PathBuf),
}

/// Summary of one driver run.
#[derive(Debug, Default)]
pub struct JobOutcome {
    pub dispositions: BTreeMap<String, NodeDisposition>,
    /// `true` when the run only listed or exported the graph.
    pub planned_only: bool,
}

impl JobOutcome {
    pub fn executed(&self) -> impl Iterator<Item = &str> {
        self.dispositions
            .iter()
            .filter(|(_, d)| matches!(d, NodeDisposition::Executed))
            .map(|(name, _)| name.as_str())
    }
}

/// Executes a parsed graph.
pub struct JobDriver<'a> {
    pub graph: &'a Graph,
    pub context: &'a ScriptContext,
    pub conditions: &'a dyn ConditionEvaluator,
    pub registry: &'a TaskRegistry,
    pub storage: TempStorage,
    pub tokens: TokenStore,
    pub options: JobOptions,
}

impl JobDriver<'_> {
    pub fn run(&self) -> Result<JobOutcome> {
        let mut outcome = JobOutcome::default();

        // target resolution and culling
        let mut set = match &self.options.single_node {
            Some(name) => {
                self.graph
                    .node(name)
                    .ok_or_else(|| BuildError::UnknownTarget(name.clone()))?;
                BTreeSet::from([name.clone()])
            }
            None => {
                let selected = self.graph.resolve_targets(&self.options.targets)?;
                self.graph.cull(&selected)?
            }
        };

        // drop nodes behind unfired triggers
        for node in self.graph.nodes() {
            if !set.contains(&node.name) {
                continue;
            }
            if let Some(trigger) = &node.controlling_trigger {
                let fired = self.options.skip_all_triggers
                    || self.options.active_triggers.contains(trigger)
                    || self.options.skipped_triggers.contains(trigger);
                if !fired {
                    info!("node \"{}\" is behind trigger \"{trigger}\"; not running", node.name);
                    outcome
                        .dispositions
                        .insert(node.name.clone(), NodeDisposition::BehindTrigger(trigger.clone()));
                }
            }
        }
        set.retain(|name| !outcome.dispositions.contains_key(name));

        if let Some(path) = &self.options.export {
            utils::write_json_file(&self.graph.export(&set)?, path)?;
            info!("exported {} node(s) to \"{}\"", set.len(), path.display());
            outcome.planned_only = true;
            return Ok(outcome);
        }

        if self.options.list_only {
            for node in self.graph.execution_order(&set)? {
                if self.options.show_deps {
                    let deps: Vec<String> = self
                        .graph
                        .dependencies_of(node)?
                        .into_iter()
                        .filter(|d| set.contains(d))
                        .collect();
                    info!("{} (depends on: {})", node.name, deps.join(", "));
                } else {
                    info!("{}", node.name);
                }
            }
            outcome.planned_only = true;
            return Ok(outcome);
        }

        if self.options.clean {
            self.storage.clean_local()?;
        }
        for node in &self.options.clean_nodes {
            self.storage.clean_local_node(node)?;
        }

        self.acquire_tokens(&mut set, &mut outcome)?;

        // run the surviving nodes in declared order; track which block owns
        // every staged workspace path so two blocks colliding on one path
        // are caught (only the published duplicable products may collide)
        let mut staged_owner: HashMap<String, TempStorageBlock> = HashMap::new();
        for node in self.graph.execution_order(&set)? {
            if self.options.resume && self.storage.is_complete(&node.name) {
                let tags = node.all_output_tags();
                if self.storage.check_local_integrity(&node.name, &tags)? {
                    info!("node \"{}\" is already complete", node.name);
                    outcome
                        .dispositions
                        .insert(node.name.clone(), NodeDisposition::AlreadyComplete);
                    continue;
                }
            }
            self.execute_node(node, &mut staged_owner)?;
            outcome.dispositions.insert(node.name.clone(), NodeDisposition::Executed);
        }

        self.summarize_reports(&outcome);
        Ok(outcome)
    }

    /// Claims the union of required tokens. On contention, either the whole
    /// job aborts (rolling back tokens it created) or the blocked nodes and
    /// their dependents are dropped, depending on policy. Tokens created
    /// before a skip are deliberately kept.
    fn acquire_tokens(
        &self,
        set: &mut BTreeSet<String>,
        outcome: &mut JobOutcome,
    ) -> Result<()> {
        let mut blocked: Vec<(PathBuf, String)> = Vec::new();
        let mut tried: BTreeSet<PathBuf> = BTreeSet::new();
        for node in self.graph.nodes() {
            if !set.contains(&node.name) {
                continue;
            }
            for token in &node.required_tokens {
                if !tried.insert(token.clone()) {
                    continue;
                }
                match self.tokens.try_acquire(token)? {
                    TokenState::Acquired | TokenState::AlreadyOurs => {}
                    TokenState::HeldBy(owner) => {
                        warn!("token \"{}\" is held by \"{owner}\"", token.display());
                        blocked.push((token.clone(), owner));
                    }
                }
            }
        }
        if blocked.is_empty() {
            return Ok(());
        }

        if !self.options.skip_targets_without_tokens {
            let (token, owner) = blocked.into_iter().next().unwrap();
            self.tokens.release_acquired()?;
            return Err(BuildError::TokenContention { token, owner });
        }

        // drop every node needing a blocked token, then everything
        // depending on a dropped node
        let blocked_tokens: BTreeSet<&PathBuf> = blocked.iter().map(|(t, _)| t).collect();
        let mut dropped: BTreeSet<String> = self
            .graph
            .nodes()
            .filter(|n| set.contains(&n.name))
            .filter(|n| n.required_tokens.iter().any(|t| blocked_tokens.contains(t)))
            .map(|n| n.name.clone())
            .collect();
        loop {
            let mut grew = false;
            for node in self.graph.nodes() {
                if !set.contains(&node.name) || dropped.contains(&node.name) {
                    continue;
                }
                if self.graph.dependencies_of(node)?.iter().any(|d| dropped.contains(d)) {
                    dropped.insert(node.name.clone());
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }
        for name in &dropped {
            let token = self
                .graph
                .node(name)
                .and_then(|n| n.required_tokens.first().cloned())
                .unwrap_or_default();
            info!("dropping node \"{name}\": required token is unavailable");
            outcome.dispositions.insert(name.clone(), NodeDisposition::MissingToken(token));
        }
        set.retain(|name| !dropped.contains(name));
        Ok(())
    }

    fn execute_node(
        &self,
        node: &Node,
        staged_owner: &mut HashMap<String, TempStorageBlock>,
    ) -> Result<()> {
        info!("running node \"{}\"", node.name);
        let producers = self.graph.tag_producers()?;

        // stage inputs and remember where every input file came from, with
        // the hash it arrived with
        let mut tag_sets: BTreeMap<String, BTreeSet<PathBuf>> = BTreeMap::new();
        let mut input_sources: BTreeMap<PathBuf, (TempStorageBlock, String)> = BTreeMap::new();
        for tag in &node.inputs {
            let producer = producers.get(tag).ok_or_else(|| BuildError::UnresolvedTag {
                tag: tag.clone(),
                location: format!("node \"{}\"", node.name),
            })?;
            let list = self.storage.read_file_list(producer, tag)?;
            let listed: BTreeSet<&str> = list.files.iter().map(String::as_str).collect();
            for block in &list.blocks {
                let manifest = self.storage.retrieve(block)?;
                self.storage.stage(block, &manifest)?;
                for entry in &manifest.files {
                    match staged_owner.get(&entry.relative_path) {
                        Some(owner) if owner != block => {
                            if !is_duplicable_build_product(std::path::Path::new(
                                &entry.relative_path,
                            )) {
                                return Err(BuildError::msg(format!(
                                    "\"{}\" is provided by both {}/{} and {}/{} but is not a duplicable build product",
                                    entry.relative_path,
                                    owner.node,
                                    owner.output,
                                    block.node,
                                    block.output
                                )));
                            }
                        }
                        _ => {
                            staged_owner
                                .insert(entry.relative_path.clone(), block.clone());
                        }
                    }
                    if listed.contains(entry.relative_path.as_str()) {
                        input_sources.insert(
                            self.storage.root().join(&entry.relative_path),
                            (block.clone(), entry.hash.clone()),
                        );
                    }
                }
            }
            let files: BTreeSet<PathBuf> =
                list.files.iter().map(|f| self.storage.root().join(f)).collect();
            tag_sets.insert(tag.clone(), files);
        }
        for tag in node.all_output_tags() {
            tag_sets.entry(tag).or_default();
        }

        // bind all tasks up front so parameter errors surface before any
        // work runs
        let binder = TaskBinder {
            registry: self.registry,
            context: self.context,
            conditions: self.conditions,
        };
        let tasks: Vec<Box<dyn Task>> =
            node.tasks.iter().map(|info| binder.bind(info)).collect::<Result<_>>()?;
        validate_tag_flow(node, &tasks, &producers)?;

        let mut build_products: BTreeSet<PathBuf> = BTreeSet::new();
        let mut ctx = TaskContext {
            root: self.storage.root(),
            tag_sets: &mut tag_sets,
            build_products: &mut build_products,
        };

        // run the task list, greedily merging adjacent batchable tasks
        let mut index = 0;
        while index < tasks.len() {
            match tasks[index].begin_batch() {
                Some(mut batch) => {
                    let mut end = index + 1;
                    while end < tasks.len() && batch.absorb(&*tasks[end]) {
                        end += 1;
                    }
                    if end > index + 1 {
                        debug!("batched {} task(s) into one invocation", end - index);
                    }
                    batch.execute(&mut ctx)?;
                    index = end;
                }
                None => {
                    tasks[index].execute(&mut ctx)?;
                    index += 1;
                }
            }
        }

        // inputs handed to this node must come back byte-identical
        let mut damaged: Vec<PathBuf> = Vec::new();
        for (file, (block, hash)) in &input_sources {
            let intact = file.exists() && hash_file(file)? == *hash;
            if !intact {
                error!(
                    "input \"{}\" from block {}/{} was modified by node \"{}\"",
                    file.display(),
                    block.node,
                    block.output,
                    node.name
                );
                damaged.push(file.clone());
            }
        }
        if !damaged.is_empty() {
            return Err(BuildError::Clobbered { node: node.name.clone(), files: damaged });
        }

        self.publish_outputs(node, &tag_sets, &build_products, &input_sources)
    }

    /// Partitions new files into output tags, archives one block per
    /// distinct output name and writes a file list per declared output tag.
    fn publish_outputs(
        &self,
        node: &Node,
        tag_sets: &BTreeMap<String, BTreeSet<PathBuf>>,
        build_products: &BTreeSet<PathBuf>,
        input_sources: &BTreeMap<PathBuf, (TempStorageBlock, String)>,
    ) -> Result<()> {
        let default_tag = node.default_output_tag();
        let input_files: BTreeSet<&PathBuf> = input_sources.keys().collect();

        // new files per named tag; anything untagged lands in the default
        let is_new =
            |file: &PathBuf| !input_files.contains(file);
        let mut partitioned: BTreeMap<&str, BTreeSet<PathBuf>> = BTreeMap::new();
        let mut explicitly_tagged: BTreeSet<PathBuf> = BTreeSet::new();
        for tag in &node.outputs {
            let new_files: BTreeSet<PathBuf> = tag_sets
                .get(tag)
                .map(|files| files.iter().filter(|f| is_new(f)).cloned().collect())
                .unwrap_or_default();
            explicitly_tagged.extend(new_files.iter().cloned());
            partitioned.insert(tag.as_str(), new_files);
        }
        let untagged: BTreeSet<PathBuf> = build_products
            .iter()
            .chain(tag_sets.get(&default_tag).into_iter().flatten())
            .filter(|f| is_new(f) && !explicitly_tagged.contains(*f))
            .cloned()
            .collect();
        partitioned.insert(default_tag.as_str(), untagged);

        // archive one block per output name; a file tagged into several
        // outputs is archived once and referenced from the others
        let mut archived_in: HashMap<PathBuf, TempStorageBlock> = HashMap::new();
        for (tag, files) in &partitioned {
            let to_archive: Vec<PathBuf> =
                files.iter().filter(|f| !archived_in.contains_key(*f)).cloned().collect();
            if to_archive.is_empty() {
                continue;
            }
            let output_name = tag.trim_start_matches('#');
            let (block, _manifest) = self.storage.archive(&node.name, output_name, &to_archive)?;
            for file in &to_archive {
                archived_in.insert(file.clone(), block.clone());
            }
        }

        // file list per output tag: the full tag set, referencing the
        // blocks its files live in (own block plus pass-through inputs)
        for tag in node.all_output_tags() {
            let files: BTreeSet<PathBuf> = match partitioned.get(tag.as_str()) {
                Some(new_files) => {
                    let mut files = new_files.clone();
                    if let Some(declared) = tag_sets.get(&tag) {
                        files.extend(declared.iter().cloned());
                    }
                    files
                }
                None => tag_sets.get(&tag).cloned().unwrap_or_default(),
            };
            let mut blocks: BTreeSet<TempStorageBlock> = BTreeSet::new();
            for file in &files {
                if let Some(block) = archived_in.get(file) {
                    blocks.insert(block.clone());
                } else if let Some((block, _)) = input_sources.get(file) {
                    blocks.insert(block.clone());
                }
            }
            self.storage.write_file_list(&node.name, &tag, &files, &blocks)?;
        }

        self.storage.mark_complete(&node.name)?;
        Ok(())
    }

    fn summarize_reports(&self, outcome: &JobOutcome) {
        for report in &self.graph.reports {
            let executed: Vec<&str> = report
                .nodes
                .iter()
                .filter(|n| {
                    matches!(outcome.dispositions.get(*n), Some(NodeDisposition::Executed))
                })
                .map(String::as_str)
                .collect();
            info!(
                "report \"{}\": {} of {} node(s) ran",
                report.name,
                executed.len(),
                report.nodes.len()
            );
        }
    }
}

/// Validates tag flow through a node's task list: consumed tags must be
/// node inputs or produced earlier in the node; produced tags must not be
/// owned by another node.
fn validate_tag_flow(
    node: &Node,
    tasks: &[Box<dyn Task>],
    producers: &HashMap<String, String>,
) -> Result<()> {
    let mut local: BTreeSet<String> = node.all_output_tags().into_iter().collect();
    for task in tasks {
        for tag in task.consumed_tags() {
            if !local.contains(&tag) && !node.inputs.contains(&tag) {
                return Err(BuildError::UnresolvedTag {
                    tag,
                    location: task.location().to_string(),
                });
            }
        }
        for tag in task.produced_tags() {
            if let Some(owner) = producers.get(&tag) {
                if owner != &node.name {
                    return Err(BuildError::msg(format!(
                        "{}: tag \"{tag}\" belongs to node \"{owner}\"",
                        task.location()
                    )));
                }
            }
            local.insert(tag);
        }
    }
    Ok(())
}
