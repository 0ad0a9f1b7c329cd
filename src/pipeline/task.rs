//! Tasks and the binding machinery that turns parsed task records into
//! typed task instances.
//!
//! Every task class declares its parameters as an explicit descriptor
//! table: name, value type, validation class, whether required, whether a
//! collection. The binder walks the table, parses argument strings into
//! typed values (booleans through the condition evaluator, paths against
//! the canonical root, collections split on `;`) and hands the typed record
//! to the class constructor. Tasks may opt into batch execution; the
//! runtime greedily merges adjacent consenting tasks into one invocation.

use crate::{
    error::{BuildError, Result},
    executor::split_command_arguments,
    pipeline::context::{ConditionEvaluator, ScriptContext},
    utils,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    collections::{BTreeMap, BTreeSet, HashMap},
    path::{Path, PathBuf},
    process::Command,
};

/// Position of an element in the source script, carried through binding so
/// user errors point at the line that caused them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

impl SourceLocation {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self { file: file.into(), line }
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.file, self.line)
    }
}

/// A parsed-but-unbound task record from the script.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskInfo {
    pub name: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
    #[serde(default)]
    pub location: SourceLocation,
}

/// Value type of a task parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterType {
    Text,
    Boolean,
    Integer,
    FileReference,
    DirectoryReference,
    /// One of a fixed set of names, matched case-insensitively and stored
    /// in its canonical spelling.
    Enumeration(&'static [&'static str]),
}

/// Validation class applied to the raw string before parsing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Validation {
    None,
    /// A single `#tag` name.
    TagName,
    /// Elements that are each a `#tag` or a file path.
    TagList,
    /// Quotes and parentheses must balance.
    BalancedString,
}

/// Descriptor for one named task argument.
#[derive(Clone, Copy, Debug)]
pub struct TaskParameter {
    pub name: &'static str,
    pub parameter_type: ParameterType,
    pub validation: Validation,
    pub optional: bool,
    pub collection: bool,
}

impl TaskParameter {
    pub const fn required(name: &'static str, parameter_type: ParameterType) -> Self {
        Self { name, parameter_type, validation: Validation::None, optional: false, collection: false }
    }

    pub const fn optional(name: &'static str, parameter_type: ParameterType) -> Self {
        Self { name, parameter_type, validation: Validation::None, optional: true, collection: false }
    }

    pub const fn validated(mut self, validation: Validation) -> Self {
        self.validation = validation;
        self
    }

    pub const fn collection(mut self) -> Self {
        self.collection = true;
        self
    }
}

/// A parsed argument value.
#[derive(Clone, Debug)]
pub enum TaskValue {
    Text(String),
    Boolean(bool),
    Integer(i64),
    Path(PathBuf),
    List(Vec<TaskValue>),
}

/// The typed argument record handed to a task constructor.
#[derive(Debug)]
pub struct BoundArguments {
    pub task: &'static str,
    pub location: SourceLocation,
    values: BTreeMap<&'static str, TaskValue>,
}

impl BoundArguments {
    pub fn text(&self, name: &str) -> String {
        match self.values.get(name) {
            Some(TaskValue::Text(value)) => value.clone(),
            _ => String::new(),
        }
    }

    pub fn opt_text(&self, name: &str) -> Option<String> {
        match self.values.get(name) {
            Some(TaskValue::Text(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn boolean(&self, name: &str, default: bool) -> bool {
        match self.values.get(name) {
            Some(TaskValue::Boolean(value)) => *value,
            _ => default,
        }
    }

    pub fn integer(&self, name: &str, default: i64) -> i64 {
        match self.values.get(name) {
            Some(TaskValue::Integer(value)) => *value,
            _ => default,
        }
    }

    pub fn path(&self, name: &str) -> Option<PathBuf> {
        match self.values.get(name) {
            Some(TaskValue::Path(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn text_list(&self, name: &str) -> Vec<String> {
        match self.values.get(name) {
            Some(TaskValue::List(values)) => values
                .iter()
                .filter_map(|v| match v {
                    TaskValue::Text(text) => Some(text.clone()),
                    TaskValue::Path(path) => Some(path.display().to_string()),
                    _ => None,
                })
                .collect(),
            Some(TaskValue::Text(value)) => vec![value.clone()],
            _ => Vec::new(),
        }
    }

    fn required_path(&self, name: &str) -> Result<PathBuf> {
        self.path(name).ok_or_else(|| BuildError::MissingParameter {
            task: self.task.to_string(),
            parameter: name.to_string(),
            location: self.location.to_string(),
        })
    }
}

/// Mutable state a task executes against: the canonical root, the node's
/// tag sets and the accumulated build products.
pub struct TaskContext<'a> {
    pub root: &'a Path,
    pub tag_sets: &'a mut BTreeMap<String, BTreeSet<PathBuf>>,
    pub build_products: &'a mut BTreeSet<PathBuf>,
}

impl TaskContext<'_> {
    /// Resolves file specs: `#tag` elements name tag sets, anything else is
    /// a path relative to the root. A path naming a directory contributes
    /// its files recursively.
    pub fn resolve_files(
        &self,
        specs: &[String],
        location: &SourceLocation,
    ) -> Result<BTreeSet<PathBuf>> {
        let mut files = BTreeSet::new();
        for spec in specs {
            if let Some(tag) = spec.strip_prefix('#') {
                let tag = format!("#{tag}");
                match self.tag_sets.get(&tag) {
                    Some(set) => files.extend(set.iter().cloned()),
                    None => {
                        return Err(BuildError::UnresolvedTag {
                            tag,
                            location: location.to_string(),
                        })
                    }
                }
                continue;
            }
            let path = resolve_path(self.root, spec);
            if path.is_dir() {
                files.extend(
                    walkdir::WalkDir::new(&path)
                        .into_iter()
                        .filter_map(|e| e.ok())
                        .filter(|e| e.file_type().is_file())
                        .map(|e| e.into_path()),
                );
            } else {
                files.insert(path);
            }
        }
        Ok(files)
    }

    /// Adds files to a tag set, creating the set if the node has not
    /// touched it yet.
    pub fn add_to_tag(&mut self, tag: &str, files: impl IntoIterator<Item = PathBuf>) {
        self.tag_sets.entry(tag.to_string()).or_default().extend(files);
    }
}

fn resolve_path(root: &Path, spec: &str) -> PathBuf {
    let path = Path::new(spec);
    if path.is_absolute() {
        utils::absolutize(path)
    } else {
        utils::absolutize(root.join(path))
    }
}

impl std::fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("name", &self.name()).field("location", self.location()).finish()
    }
}

/// A bound, executable task.
pub trait Task: Send + Sync {
    fn name(&self) -> &'static str;
    fn location(&self) -> &SourceLocation;

    /// Tags this task reads; each must be local or a declared node input.
    fn consumed_tags(&self) -> Vec<String> {
        Vec::new()
    }

    /// Tags this task writes; each must be local or a declared node output.
    fn produced_tags(&self) -> Vec<String> {
        Vec::new()
    }

    fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<()>;

    /// Batch capability: an executor seeded with this task. The runtime
    /// offers subsequent tasks to the executor and merges every one it
    /// absorbs into a single invocation.
    fn begin_batch(&self) -> Option<Box<dyn BatchExecutor>> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Merges adjacent compatible tasks into one invocation.
pub trait BatchExecutor: Send {
    /// Offers the next task; `true` consents to absorb it.
    fn absorb(&mut self, task: &dyn Task) -> bool;
    fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<()>;
}

/// One entry of the task registry: the descriptor table plus the typed
/// constructor.
pub struct TaskBinding {
    pub name: &'static str,
    pub parameters: &'static [TaskParameter],
    pub construct: fn(&BoundArguments) -> Result<Box<dyn Task>>,
}

pub type TaskRegistry = HashMap<&'static str, TaskBinding>;

/// The built-in task classes.
pub fn standard_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    for binding in [
        TaskBinding { name: "Copy", parameters: COPY_PARAMETERS, construct: construct_copy },
        TaskBinding { name: "Delete", parameters: DELETE_PARAMETERS, construct: construct_delete },
        TaskBinding { name: "Spawn", parameters: SPAWN_PARAMETERS, construct: construct_spawn },
        TaskBinding { name: "Tag", parameters: TAG_PARAMETERS, construct: construct_tag },
        TaskBinding { name: "Log", parameters: LOG_PARAMETERS, construct: construct_log },
    ] {
        registry.insert(binding.name, binding);
    }
    registry
}

/// Binds [`TaskInfo`] records against a registry.
pub struct TaskBinder<'a> {
    pub registry: &'a TaskRegistry,
    pub context: &'a ScriptContext,
    pub conditions: &'a dyn ConditionEvaluator,
}

static TAG_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^#[^;#]+$").unwrap());

impl TaskBinder<'_> {
    pub fn bind(&self, info: &TaskInfo) -> Result<Box<dyn Task>> {
        let binding = self.registry.get(info.name.as_str()).ok_or_else(|| {
            BuildError::UnknownTask { name: info.name.clone(), location: info.location.to_string() }
        })?;

        for parameter in binding.parameters {
            if !parameter.optional && !info.arguments.contains_key(parameter.name) {
                return Err(BuildError::MissingParameter {
                    task: info.name.clone(),
                    parameter: parameter.name.to_string(),
                    location: info.location.to_string(),
                });
            }
        }
        for name in info.arguments.keys() {
            if !binding.parameters.iter().any(|p| p.name == name) {
                warn!("{}: task \"{}\" ignores argument \"{name}\"", info.location, info.name);
            }
        }

        let mut values = BTreeMap::new();
        for parameter in binding.parameters {
            let Some(raw) = info.arguments.get(parameter.name) else {
                continue;
            };
            let expanded = self.context.expand(raw);
            let value = if parameter.collection {
                let elements = expanded
                    .split(';')
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .map(|e| self.parse_element(parameter, e, &info.location))
                    .collect::<Result<Vec<_>>>()?;
                TaskValue::List(elements)
            } else {
                self.parse_element(parameter, expanded.trim(), &info.location)?
            };
            values.insert(parameter.name, value);
        }

        let bound =
            BoundArguments { task: binding.name, location: info.location.clone(), values };
        (binding.construct)(&bound)
    }

    fn parse_element(
        &self,
        parameter: &TaskParameter,
        element: &str,
        location: &SourceLocation,
    ) -> Result<TaskValue> {
        let invalid = |message: String| BuildError::InvalidParameter {
            parameter: parameter.name.to_string(),
            value: element.to_string(),
            message,
            location: location.to_string(),
        };

        match parameter.validation {
            Validation::None => {}
            Validation::TagName => {
                if !TAG_NAME.is_match(element) {
                    return Err(invalid("expected a single #tag name".to_string()));
                }
            }
            Validation::TagList => {
                if element.starts_with('#') && !TAG_NAME.is_match(element) {
                    return Err(invalid("malformed #tag reference".to_string()));
                }
            }
            Validation::BalancedString => {
                if !is_balanced(element) {
                    return Err(invalid("unbalanced quotes or parentheses".to_string()));
                }
            }
        }

        match parameter.parameter_type {
            ParameterType::Text => Ok(TaskValue::Text(element.to_string())),
            ParameterType::Boolean => {
                let value = self.conditions.evaluate(element, self.context).map_err(|err| {
                    invalid(err.to_string())
                })?;
                Ok(TaskValue::Boolean(value))
            }
            ParameterType::Integer => element
                .parse::<i64>()
                .map(TaskValue::Integer)
                .map_err(|err| invalid(err.to_string())),
            ParameterType::FileReference | ParameterType::DirectoryReference => {
                Ok(TaskValue::Path(resolve_path(&self.context.root, element)))
            }
            ParameterType::Enumeration(allowed) => allowed
                .iter()
                .find(|v| v.eq_ignore_ascii_case(element))
                .map(|v| TaskValue::Text(v.to_string()))
                .ok_or_else(|| invalid(format!("expected one of {}", allowed.join(", ")))),
        }
    }
}

fn is_balanced(text: &str) -> bool {
    let mut depth = 0i32;
    let mut in_quotes = false;
    for c in text.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            '(' if !in_quotes => depth += 1,
            ')' if !in_quotes => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0 && !in_quotes
}

fn tags_in(specs: &[String]) -> Vec<String> {
    specs.iter().filter(|s| s.starts_with('#')).cloned().collect()
}

// ---------------------------------------------------------------------------
// Copy

const COPY_PARAMETERS: &[TaskParameter] = &[
    TaskParameter::required("Files", ParameterType::Text)
        .validated(Validation::TagList)
        .collection(),
    TaskParameter::required("To", ParameterType::DirectoryReference),
    TaskParameter::optional("Tag", ParameterType::Text).validated(Validation::TagName),
];

/// Copies files into a directory, optionally tagging the copies.
#[derive(Clone, Debug)]
pub struct CopyTask {
    files: Vec<String>,
    to_dir: PathBuf,
    tag: Option<String>,
    location: SourceLocation,
}

fn construct_copy(args: &BoundArguments) -> Result<Box<dyn Task>> {
    Ok(Box::new(CopyTask {
        files: args.text_list("Files"),
        to_dir: args.required_path("To")?,
        tag: args.opt_text("Tag"),
        location: args.location.clone(),
    }))
}

impl CopyTask {
    fn copy_files(&self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let sources = ctx.resolve_files(&self.files, &self.location)?;
        std::fs::create_dir_all(&self.to_dir)
            .map_err(|err| BuildError::io(err, &self.to_dir))?;
        let mut copied = Vec::with_capacity(sources.len());
        for source in &sources {
            let file_name = source
                .file_name()
                .ok_or_else(|| BuildError::msg(format!("cannot copy \"{}\"", source.display())))?;
            let dest = self.to_dir.join(file_name);
            std::fs::copy(source, &dest).map_err(|err| BuildError::io(err, source))?;
            copied.push(dest);
        }
        debug!("{}: copied {} file(s) to \"{}\"", self.location, copied.len(), self.to_dir.display());
        ctx.build_products.extend(copied.iter().cloned());
        if let Some(tag) = &self.tag {
            ctx.add_to_tag(tag, copied);
        }
        Ok(())
    }
}

impl Task for CopyTask {
    fn name(&self) -> &'static str {
        "Copy"
    }

    fn location(&self) -> &SourceLocation {
        &self.location
    }

    fn consumed_tags(&self) -> Vec<String> {
        tags_in(&self.files)
    }

    fn produced_tags(&self) -> Vec<String> {
        self.tag.iter().cloned().collect()
    }

    fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<()> {
        self.copy_files(ctx)
    }

    fn begin_batch(&self) -> Option<Box<dyn BatchExecutor>> {
        Some(Box::new(CopyBatch { copies: vec![self.clone()] }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Adjacent copies merged into one invocation.
struct CopyBatch {
    copies: Vec<CopyTask>,
}

impl BatchExecutor for CopyBatch {
    fn absorb(&mut self, task: &dyn Task) -> bool {
        match task.as_any().downcast_ref::<CopyTask>() {
            Some(copy) => {
                self.copies.push(copy.clone());
                true
            }
            None => false,
        }
    }

    fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<()> {
        if self.copies.len() > 1 {
            debug!("executing {} copy task(s) as one batch", self.copies.len());
        }
        for copy in &self.copies {
            copy.copy_files(ctx)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Delete

const DELETE_PARAMETERS: &[TaskParameter] = &[TaskParameter::required("Files", ParameterType::Text)
    .validated(Validation::TagList)
    .collection()];

/// Deletes files.
struct DeleteTask {
    files: Vec<String>,
    location: SourceLocation,
}

fn construct_delete(args: &BoundArguments) -> Result<Box<dyn Task>> {
    Ok(Box::new(DeleteTask { files: args.text_list("Files"), location: args.location.clone() }))
}

impl Task for DeleteTask {
    fn name(&self) -> &'static str {
        "Delete"
    }

    fn location(&self) -> &SourceLocation {
        &self.location
    }

    fn consumed_tags(&self) -> Vec<String> {
        tags_in(&self.files)
    }

    fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let files = ctx.resolve_files(&self.files, &self.location)?;
        for file in &files {
            match std::fs::remove_file(file) {
                Ok(()) => {
                    ctx.build_products.remove(file);
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(BuildError::io(err, file)),
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Spawn

const SPAWN_PARAMETERS: &[TaskParameter] = &[
    TaskParameter::required("Exe", ParameterType::FileReference),
    TaskParameter::optional("Arguments", ParameterType::Text)
        .validated(Validation::BalancedString),
    TaskParameter::optional("WorkingDir", ParameterType::DirectoryReference),
];

/// Runs an external command and fails on a nonzero exit.
struct SpawnTask {
    exe: PathBuf,
    arguments: String,
    working_dir: Option<PathBuf>,
    location: SourceLocation,
}

fn construct_spawn(args: &BoundArguments) -> Result<Box<dyn Task>> {
    Ok(Box::new(SpawnTask {
        exe: args.required_path("Exe")?,
        arguments: args.text("Arguments"),
        working_dir: args.path("WorkingDir"),
        location: args.location.clone(),
    }))
}

impl Task for SpawnTask {
    fn name(&self) -> &'static str {
        "Spawn"
    }

    fn location(&self) -> &SourceLocation {
        &self.location
    }

    fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let working_dir = self.working_dir.clone().unwrap_or_else(|| ctx.root.to_path_buf());
        info!("{}: running \"{}\" {}", self.location, self.exe.display(), self.arguments);
        let status = Command::new(&self.exe)
            .args(split_command_arguments(&self.arguments))
            .current_dir(&working_dir)
            .status()
            .map_err(|err| BuildError::io(err, &self.exe))?;
        if !status.success() {
            return Err(BuildError::msg(format!(
                "{}: \"{}\" exited with {status}",
                self.location,
                self.exe.display()
            )));
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Tag

const TAG_PARAMETERS: &[TaskParameter] = &[
    TaskParameter::required("Files", ParameterType::Text)
        .validated(Validation::TagList)
        .collection(),
    TaskParameter::required("With", ParameterType::Text).validated(Validation::TagName),
];

/// Adds files to a tag set.
struct TagTask {
    files: Vec<String>,
    with: String,
    location: SourceLocation,
}

fn construct_tag(args: &BoundArguments) -> Result<Box<dyn Task>> {
    Ok(Box::new(TagTask {
        files: args.text_list("Files"),
        with: args.text("With"),
        location: args.location.clone(),
    }))
}

impl Task for TagTask {
    fn name(&self) -> &'static str {
        "Tag"
    }

    fn location(&self) -> &SourceLocation {
        &self.location
    }

    fn consumed_tags(&self) -> Vec<String> {
        tags_in(&self.files)
    }

    fn produced_tags(&self) -> Vec<String> {
        vec![self.with.clone()]
    }

    fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let files = ctx.resolve_files(&self.files, &self.location)?;
        ctx.add_to_tag(&self.with, files);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Log

const LOG_PARAMETERS: &[TaskParameter] = &[
    TaskParameter::required("Message", ParameterType::Text),
    TaskParameter::optional("Level", ParameterType::Enumeration(&["Info", "Warning", "Error"])),
];

/// Writes a message to the job log.
struct LogTask {
    message: String,
    level: String,
    location: SourceLocation,
}

fn construct_log(args: &BoundArguments) -> Result<Box<dyn Task>> {
    Ok(Box::new(LogTask {
        message: args.text("Message"),
        level: args.opt_text("Level").unwrap_or_else(|| "Info".to_string()),
        location: args.location.clone(),
    }))
}

impl Task for LogTask {
    fn name(&self) -> &'static str {
        "Log"
    }

    fn location(&self) -> &SourceLocation {
        &self.location
    }

    fn execute(&self, _ctx: &mut TaskContext<'_>) -> Result<()> {
        match self.level.as_str() {
            "Error" => error!("{}", self.message),
            "Warning" => warn!("{}", self.message),
            _ => info!("{}", self.message),
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
