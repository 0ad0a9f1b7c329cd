//! Schedules outdated action sets.
//!
//! Executors are pluggable: the engine hands the sorted action set to
//! whichever implementation is selected and only requires that every
//! action's prerequisite-producing actions finish before it starts.
//! Selection walks the candidates in a fixed order, probing each with
//! [`Executor::is_available`]; the local executor is last in the chain and
//! always available, so selection always succeeds. Distributed backends plug
//! in by prepending themselves to the chain.

use crate::{actiongraph::ActionGraph, action::Action, config::BuildConfiguration, error::Result};
use std::sync::Arc;

pub mod local;
pub use local::LocalExecutor;

/// One schedulable entry of an [`ExecutionSet`].
#[derive(Debug)]
pub struct ExecutionItem {
    pub action: Arc<Action>,
    /// Positions (within the set) of the actions producing this item's
    /// prerequisites.
    pub prerequisites: Vec<usize>,
    pub total_dependents: usize,
}

/// The outdated actions in scheduling order: descending
/// transitive-dependent count, ties keeping graph order, so the
/// most-depended-on work starts first.
#[derive(Debug)]
pub struct ExecutionSet {
    items: Vec<ExecutionItem>,
}

impl ExecutionSet {
    /// Builds the set from a (re-linked) graph of just the actions to run.
    pub fn from_graph(graph: &ActionGraph) -> Self {
        let order = graph.execution_order();
        // map graph index -> set position for prerequisite rewiring
        let mut position = vec![0usize; graph.len()];
        for (pos, &index) in order.iter().enumerate() {
            position[index] = pos;
        }
        let items = order
            .iter()
            .map(|&index| {
                let linked = &graph.actions[index];
                ExecutionItem {
                    action: linked.action.clone(),
                    prerequisites: linked
                        .prerequisite_actions
                        .iter()
                        .map(|&p| position[p])
                        .collect(),
                    total_dependents: linked.total_dependents,
                }
            })
            .collect();
        Self { items }
    }

    pub fn items(&self) -> &[ExecutionItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Tally of one executor run. Individual failures are reported through the
/// log as they happen; the tally lets the engine report all of them rather
/// than just the first.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecutionResult {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

impl ExecutionResult {
    /// `true` when every action ran and none failed.
    pub fn success(&self) -> bool {
        self.failed == 0 && self.completed == self.total
    }
}

/// A strategy for running an [`ExecutionSet`].
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this executor can run in the current environment.
    fn is_available(&self) -> bool {
        true
    }

    /// Runs every action, honoring prerequisite ordering.
    fn execute(&self, set: &ExecutionSet) -> Result<ExecutionResult>;
}

/// Picks the executor for this build. The chain currently holds only the
/// local executor; configurations asking for a remote backend fall through
/// to it when none is registered.
pub fn select_executor(config: &BuildConfiguration) -> Box<dyn Executor> {
    if config.allow_remote_executor {
        debug!("no remote executor registered, falling back to local execution");
    }
    Box::new(LocalExecutor::new(config.max_parallel_actions))
}

/// Splits a command-line argument string the way a shell would: whitespace
/// separates, double quotes group, a backslash escapes the next character
/// inside quotes.
pub fn split_command_arguments(arguments: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = arguments.chars().peekable();
    let mut pending = false;
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                pending = true;
            }
            '\\' if in_quotes => {
                if let Some(&next) = chars.peek() {
                    if next == '"' || next == '\\' {
                        chars.next();
                        current.push(next);
                        continue;
                    }
                }
                current.push('\\');
            }
            c if c.is_whitespace() && !in_quotes => {
                if pending || !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            c => current.push(c),
        }
    }
    if pending || !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_plain_arguments() {
        assert_eq!(split_command_arguments("-c  a.c -o a.o"), vec!["-c", "a.c", "-o", "a.o"]);
    }

    #[test]
    fn splits_quoted_arguments() {
        assert_eq!(
            split_command_arguments(r#"-I "My Includes" -D "A=\"quoted\"" last"#),
            vec!["-I", "My Includes", "-D", r#"A="quoted""#, "last"]
        );
    }

    #[test]
    fn empty_quoted_argument_survives() {
        assert_eq!(split_command_arguments(r#"-m """#), vec!["-m", ""]);
    }
}
