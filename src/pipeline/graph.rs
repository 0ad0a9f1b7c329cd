//! The parsed job graph: agents owning nodes, nodes owning tasks, triggers
//! gating execution and tags naming the file sets that flow between nodes.
//!
//! The schema reader hands the runtime a fully parsed [`Graph`] value; this
//! module owns resolution (target names to nodes), transitive culling and
//! the export consumed by external orchestrators.

use crate::{
    error::{BuildError, Result},
    pipeline::task::TaskInfo,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
};

/// An ordered sequence of tasks with declared inputs and outputs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Node {
    pub name: String,
    /// Tags consumed from other nodes, e.g. `#Compiled Binaries`.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Named tags this node publishes, in addition to its default output.
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<TaskInfo>,
    /// Ordering-only dependencies on other nodes.
    #[serde(default)]
    pub after: Vec<String>,
    /// Token files that must be exclusively held before this node runs.
    #[serde(default)]
    pub required_tokens: Vec<PathBuf>,
    /// Trigger gating this node, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controlling_trigger: Option<String>,
}

impl Node {
    /// Every node publishes a default output tag carrying its otherwise
    /// untagged build products.
    pub fn default_output_tag(&self) -> String {
        format!("#{}", self.name)
    }

    /// Declared outputs plus the default output.
    pub fn all_output_tags(&self) -> Vec<String> {
        let mut tags = vec![self.default_output_tag()];
        tags.extend(self.outputs.iter().cloned());
        tags
    }
}

/// A group of nodes intended to run together on one machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Agent {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

/// A guarded grouping that executes only when selected by the driver.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Trigger {
    pub name: String,
}

/// A passive aggregation of node outcomes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Report {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// A parsed script: agents in declared order, plus triggers and reports.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Graph {
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub reports: Vec<Report>,
}

impl Graph {
    /// All nodes in declared order (agents in order, nodes within each
    /// agent in order).
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.agents.iter().flat_map(|agent| agent.nodes.iter())
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes().find(|node| node.name == name)
    }

    /// The agent owning the given node.
    pub fn agent_of(&self, node_name: &str) -> Option<&Agent> {
        self.agents.iter().find(|agent| agent.nodes.iter().any(|n| n.name == node_name))
    }

    /// Maps every tag name to the node producing it. Two nodes publishing
    /// the same tag is a script error.
    pub fn tag_producers(&self) -> Result<HashMap<String, String>> {
        let mut producers = HashMap::new();
        for node in self.nodes() {
            for tag in node.all_output_tags() {
                if let Some(previous) = producers.insert(tag.clone(), node.name.clone()) {
                    return Err(BuildError::msg(format!(
                        "tag \"{tag}\" is produced by both \"{previous}\" and \"{}\"",
                        node.name
                    )));
                }
            }
        }
        Ok(producers)
    }

    /// Resolves target names to node names. A target may name a node or an
    /// agent (all of its nodes); anything else is fatal.
    pub fn resolve_targets(&self, targets: &[String]) -> Result<Vec<String>> {
        let mut resolved = Vec::new();
        for target in targets {
            if let Some(node) = self.node(target) {
                resolved.push(node.name.clone());
                continue;
            }
            if let Some(agent) = self.agents.iter().find(|a| &a.name == target) {
                resolved.extend(agent.nodes.iter().map(|n| n.name.clone()));
                continue;
            }
            return Err(BuildError::UnknownTarget(target.clone()));
        }
        resolved.dedup();
        Ok(resolved)
    }

    /// Expands the selection to its transitive prerequisites: the producers
    /// of every consumed tag, plus ordering-only dependencies.
    pub fn cull(&self, selected: &[String]) -> Result<BTreeSet<String>> {
        let producers = self.tag_producers()?;
        let mut set: BTreeSet<String> = BTreeSet::new();
        let mut stack: Vec<String> = selected.to_vec();
        while let Some(name) = stack.pop() {
            if !set.insert(name.clone()) {
                continue;
            }
            let node = self
                .node(&name)
                .ok_or_else(|| BuildError::UnknownTarget(name.clone()))?;
            for tag in &node.inputs {
                match producers.get(tag) {
                    Some(producer) => stack.push(producer.clone()),
                    None => {
                        return Err(BuildError::UnresolvedTag {
                            tag: tag.clone(),
                            location: format!("node \"{}\"", node.name),
                        })
                    }
                }
            }
            stack.extend(node.after.iter().cloned());
        }
        Ok(set)
    }

    /// The per-node dependencies (producing nodes of inputs plus `after`
    /// edges) for the given set.
    pub fn dependencies_of(&self, node: &Node) -> Result<BTreeSet<String>> {
        let producers = self.tag_producers()?;
        let mut deps: BTreeSet<String> = node
            .inputs
            .iter()
            .filter_map(|tag| producers.get(tag).cloned())
            .collect();
        deps.extend(node.after.iter().cloned());
        deps.remove(&node.name);
        Ok(deps)
    }

    /// Serializes the culled graph for external orchestrators: nodes with
    /// their dependencies, tags and gating triggers.
    pub fn export(&self, set: &BTreeSet<String>) -> Result<serde_json::Value> {
        #[derive(Serialize)]
        #[serde(rename_all = "PascalCase")]
        struct ExportedNode<'a> {
            name: &'a str,
            agent: &'a str,
            depends_on: Vec<String>,
            inputs: &'a [String],
            outputs: Vec<String>,
            #[serde(skip_serializing_if = "Option::is_none")]
            trigger: Option<&'a String>,
        }

        let mut nodes = Vec::new();
        for node in self.nodes() {
            if !set.contains(&node.name) {
                continue;
            }
            let mut depends_on: Vec<String> =
                self.dependencies_of(node)?.into_iter().filter(|d| set.contains(d)).collect();
            depends_on.sort();
            nodes.push(ExportedNode {
                name: &node.name,
                agent: self.agent_of(&node.name).map(|a| a.name.as_str()).unwrap_or(""),
                depends_on,
                inputs: &node.inputs,
                outputs: node.all_output_tags(),
                trigger: node.controlling_trigger.as_ref(),
            });
        }
        let triggers: Vec<&str> = self.triggers.iter().map(|t| t.name.as_str()).collect();
        Ok(serde_json::json!({ "Nodes": nodes, "Triggers": triggers }))
    }

    /// Execution order for a culled set: declared order, which by
    /// construction of `cull` places producers before consumers only if the
    /// script declares them earlier. A consumed tag produced by a later
    /// node is a script error.
    pub fn execution_order<'a>(&'a self, set: &BTreeSet<String>) -> Result<Vec<&'a Node>> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut order = Vec::new();
        for node in self.nodes() {
            if !set.contains(&node.name) {
                continue;
            }
            for dep in self.dependencies_of(node)? {
                if set.contains(&dep) && !seen.contains(dep.as_str()) {
                    return Err(BuildError::msg(format!(
                        "node \"{}\" consumes output of \"{dep}\", which is declared later",
                        node.name
                    )));
                }
            }
            seen.insert(&node.name);
            order.push(node);
        }
        Ok(order)
    }

    /// Distinct triggers gating any node of the set, in declared order.
    pub fn triggers_in(&self, set: &BTreeSet<String>) -> Vec<&str> {
        let gating: BTreeSet<&str> = self
            .nodes()
            .filter(|n| set.contains(&n.name))
            .filter_map(|n| n.controlling_trigger.as_deref())
            .collect();
        self.triggers.iter().map(|t| t.name.as_str()).filter(|t| gating.contains(t)).collect()
    }
}

/// Convenience for building graphs in code and tests.
#[derive(Default)]
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(mut self, name: impl Into<String>) -> Self {
        self.graph.agents.push(Agent { name: name.into(), nodes: Vec::new() });
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.graph
            .agents
            .last_mut()
            .expect("add an agent before adding nodes")
            .nodes
            .push(node);
        self
    }

    pub fn trigger(mut self, name: impl Into<String>) -> Self {
        self.graph.triggers.push(Trigger { name: name.into() });
        self
    }

    pub fn build(self) -> Graph {
        self.graph
    }
}
