use crate::types::Payload;
use maestro_core::{MaestroError, MaestroResult, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

/// The closed set of node kinds a workflow may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Delegates to an agent through the task distribution engine.
    Agent,
    /// Evaluates a predicate over the execution context.
    Condition,
    /// Logs or writes a context variable.
    Action,
    /// Structural marker; fan-out already expresses parallelism.
    Parallel,
    /// Structural marker; a chain of connections already expresses ordering.
    Sequential,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeKind::Agent => "agent",
            NodeKind::Condition => "condition",
            NodeKind::Action => "action",
            NodeKind::Parallel => "parallel",
            NodeKind::Sequential => "sequential",
        };
        write!(f, "{s}")
    }
}

/// A step in a workflow graph. Run state lives on the execution, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: Payload,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            config: Payload::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConnection {
    pub from: String,
    pub to: String,
    /// Informational only; edges are never pruned by it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl WorkflowConnection {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
            label: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// A DAG of nodes and connections plus default context variables.
///
/// Nodes are unique by id and connections always reference existing nodes;
/// both are enforced on insertion. Acyclicity and entry points are checked
/// by [`validate`](Self::validate), which the engine runs at registration.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: String,
    nodes: BTreeMap<String, WorkflowNode>,
    connections: Vec<WorkflowConnection>,
    /// Seeded into every execution's context before its input data.
    pub variables: Payload,
}

#[derive(Deserialize)]
struct WorkflowFile {
    workflow: WorkflowHeader,
    #[serde(default)]
    nodes: Vec<WorkflowNode>,
    #[serde(default)]
    connections: Vec<WorkflowConnection>,
    #[serde(default)]
    variables: Payload,
}

#[derive(Deserialize)]
struct WorkflowHeader {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_version")]
    version: String,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: default_version(),
            nodes: BTreeMap::new(),
            connections: Vec::new(),
            variables: Payload::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    /// Parse a workflow file. Nodes and connections go through
    /// [`add_node`](Self::add_node) and [`add_connection`](Self::add_connection),
    /// so their checks apply; graph validation is left to registration.
    pub fn from_toml_str(s: &str) -> MaestroResult<Self> {
        let file: WorkflowFile =
            toml::from_str(s).map_err(|e| MaestroError::Config(format!("Invalid workflow: {e}")))?;

        let mut def = Self::new(file.workflow.id, file.workflow.name)
            .with_description(file.workflow.description)
            .with_version(file.workflow.version);
        def.variables = file.variables;
        for node in file.nodes {
            def.add_node(node)?;
        }
        for conn in file.connections {
            def.add_connection(conn)?;
        }
        Ok(def)
    }

    pub fn load(path: &Path) -> MaestroResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn add_node(&mut self, node: WorkflowNode) -> Result<(), ValidationError> {
        if self.nodes.contains_key(&node.id) {
            return Err(ValidationError::DuplicateNode(node.id));
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Remove a node together with every connection touching it.
    pub fn remove_node(&mut self, id: &str) -> Option<WorkflowNode> {
        let node = self.nodes.remove(id)?;
        self.connections.retain(|c| c.from != id && c.to != id);
        Some(node)
    }

    pub fn add_connection(&mut self, conn: WorkflowConnection) -> Result<(), ValidationError> {
        for endpoint in [&conn.from, &conn.to] {
            if !self.nodes.contains_key(endpoint) {
                return Err(ValidationError::DanglingConnection {
                    from: conn.from.clone(),
                    to: conn.to.clone(),
                    missing: endpoint.clone(),
                });
            }
        }
        self.connections.push(conn);
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(id)
    }

    /// Nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &WorkflowNode> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn connections(&self) -> &[WorkflowConnection] {
        &self.connections
    }

    pub fn next_nodes(&self, id: &str) -> Vec<&str> {
        self.connections
            .iter()
            .filter(|c| c.from == id)
            .map(|c| c.to.as_str())
            .collect()
    }

    pub fn previous_nodes(&self, id: &str) -> Vec<&str> {
        self.connections
            .iter()
            .filter(|c| c.to == id)
            .map(|c| c.from.as_str())
            .collect()
    }

    /// Nodes with no incoming connection, in id order.
    pub fn entry_nodes(&self) -> Vec<&str> {
        let targets: HashSet<&str> = self.connections.iter().map(|c| c.to.as_str()).collect();
        self.nodes
            .keys()
            .map(String::as_str)
            .filter(|id| !targets.contains(id))
            .collect()
    }

    /// Every structural problem found; empty means the graph is runnable.
    pub fn validate(&self) -> Vec<ValidationError> {
        if self.nodes.is_empty() {
            return vec![ValidationError::EmptyWorkflow];
        }

        let mut errors = Vec::new();
        for conn in &self.connections {
            for endpoint in [&conn.from, &conn.to] {
                if !self.nodes.contains_key(endpoint) {
                    errors.push(ValidationError::DanglingConnection {
                        from: conn.from.clone(),
                        to: conn.to.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
        }

        if let Some(path) = self.find_cycle() {
            errors.push(ValidationError::Cycle { path });
        }

        // a single unattached node is tolerated as an extra entry point
        let attached: BTreeSet<&str> = self
            .connections
            .iter()
            .flat_map(|c| [c.from.as_str(), c.to.as_str()])
            .collect();
        let orphans: Vec<String> = self
            .nodes
            .keys()
            .filter(|id| !attached.contains(id.as_str()))
            .cloned()
            .collect();
        if orphans.len() > 1 {
            errors.push(ValidationError::DisconnectedNodes(orphans));
        }

        if self.entry_nodes().is_empty() {
            errors.push(ValidationError::NoEntryNodes);
        }
        errors
    }

    /// Iterative DFS keeping an explicit `(node, next child)` stack. Returns
    /// the first cycle found, with its first node repeated at the end.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for conn in &self.connections {
            adjacency
                .entry(conn.from.as_str())
                .or_default()
                .push(conn.to.as_str());
        }

        let mut done: HashSet<&str> = HashSet::new();
        for start in self.nodes.keys().map(String::as_str) {
            if done.contains(start) {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
            let mut on_stack: HashSet<&str> = HashSet::from([start]);

            while let Some((node, next)) = stack.last_mut() {
                let node = *node;
                let children = adjacency.get(node).map(Vec::as_slice).unwrap_or(&[]);
                let Some(&child) = children.get(*next) else {
                    on_stack.remove(node);
                    done.insert(node);
                    stack.pop();
                    continue;
                };
                *next += 1;

                if on_stack.contains(child) {
                    let from = stack.iter().position(|(n, _)| *n == child).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[from..].iter().map(|(n, _)| n.to_string()).collect();
                    path.push(child.to_string());
                    return Some(path);
                }
                if !done.contains(child) {
                    on_stack.insert(child);
                    stack.push((child, 0));
                }
            }
        }
        None
    }
}
