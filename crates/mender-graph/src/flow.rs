use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use mender_core::error::{MenderError, Result};
use mender_core::types::NodeStatus;

use crate::edge::{Edge, EdgeCondition};
use crate::join::JoinNode;
use crate::task::TaskNode;
use crate::trigger::TriggerNode;

/// Serialized flow, as saved by the flow editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Trigger {
        #[serde(default)]
        prompt: String,
    },
    Task {
        #[serde(default)]
        instruction: Option<String>,
    },
    Join,
}

impl NodeSpec {
    pub fn trigger(id: &str, label: &str, prompt: &str) -> Self {
        Self {
            id: id.into(),
            label: Some(label.into()),
            kind: NodeKind::Trigger {
                prompt: prompt.into(),
            },
        }
    }

    pub fn task(id: &str, label: &str, instruction: Option<&str>) -> Self {
        Self {
            id: id.into(),
            label: Some(label.into()),
            kind: NodeKind::Task {
                instruction: instruction.map(str::to_string),
            },
        }
    }

    pub fn join(id: &str, label: &str) -> Self {
        Self {
            id: id.into(),
            label: Some(label.into()),
            kind: NodeKind::Join,
        }
    }
}

impl FlowDefinition {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Built-in failure triage flow: three parallel investigations joined
    /// into a single fix proposal.
    pub fn triage() -> Self {
        Self {
            id: "triage".into(),
            name: "Failure triage".into(),
            description: "Investigate a failing test from three angles and propose a fix".into(),
            nodes: vec![
                NodeSpec::trigger("start", "Describe the failure", ""),
                NodeSpec::task(
                    "stack",
                    "Analyze stack trace",
                    Some("Find the root cause in this failure: {{input}}"),
                ),
                NodeSpec::task(
                    "dom",
                    "Inspect selectors",
                    Some("Check which selectors changed for: {{input}}"),
                ),
                NodeSpec::task(
                    "history",
                    "Check recent changes",
                    Some("List commits that could explain: {{input}}"),
                ),
                NodeSpec::join("merge", "Merge findings"),
                NodeSpec::task(
                    "fix",
                    "Propose fix",
                    Some("Propose a fix based on:\n{{merge}}"),
                ),
            ],
            edges: vec![
                Edge::always("start", "stack"),
                Edge::always("start", "dom"),
                Edge::always("start", "history"),
                Edge::on_success("stack", "merge"),
                Edge::on_success("dom", "merge"),
                Edge::on_success("history", "merge"),
                Edge::on_success("merge", "fix"),
            ],
        }
    }
}

/// A node of a validated flow graph.
#[derive(Debug, Clone)]
pub enum GraphNode {
    Trigger(TriggerNode),
    Task(TaskNode),
    Join(JoinNode),
}

impl GraphNode {
    pub fn id(&self) -> &str {
        match self {
            Self::Trigger(n) => &n.id,
            Self::Task(n) => &n.id,
            Self::Join(n) => &n.id,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Trigger(n) => &n.label,
            Self::Task(n) => &n.label,
            Self::Join(n) => &n.label,
        }
    }

    pub fn status(&self) -> NodeStatus {
        match self {
            Self::Trigger(n) => n.status(),
            Self::Task(n) => n.status(),
            Self::Join(n) => n.status(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Trigger(_) => "trigger",
            Self::Task(_) => "task",
            Self::Join(_) => "join",
        }
    }
}

/// A validated flow: node state plus immutable topology.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    pub id: String,
    pub name: String,
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    order: Vec<String>,
    trigger_id: String,
}

impl FlowGraph {
    /// Validate a definition and build its node state.
    pub fn build(def: FlowDefinition) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, spec) in def.nodes.iter().enumerate() {
            if index.insert(spec.id.clone(), i).is_some() {
                return Err(MenderError::DuplicateNode(spec.id.clone()));
            }
        }

        let triggers: Vec<&NodeSpec> = def
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Trigger { .. }))
            .collect();
        if triggers.len() != 1 {
            return Err(MenderError::MissingTrigger(triggers.len()));
        }
        let trigger_id = triggers[0].id.clone();

        let mut seen_pairs = HashSet::new();
        for edge in &def.edges {
            let invalid = |reason: &str| MenderError::InvalidEdge {
                from: edge.from.clone(),
                to: edge.to.clone(),
                reason: reason.to_string(),
            };
            if !index.contains_key(&edge.from) {
                return Err(invalid("unknown source node"));
            }
            if !index.contains_key(&edge.to) {
                return Err(invalid("unknown target node"));
            }
            if edge.from == edge.to {
                return Err(invalid("self loop"));
            }
            if edge.to == trigger_id {
                return Err(invalid("the trigger node cannot have inputs"));
            }
            if !seen_pairs.insert((edge.from.as_str(), edge.to.as_str())) {
                return Err(invalid("duplicate edge"));
            }
            if edge.condition == EdgeCondition::OnFailure
                && matches!(def.nodes[index[&edge.to]].kind, NodeKind::Join)
            {
                return Err(invalid("failure edges cannot feed a join"));
            }
        }

        let nodes = def
            .nodes
            .iter()
            .map(|spec| {
                let label = spec.label.clone().unwrap_or_else(|| spec.id.clone());
                match &spec.kind {
                    NodeKind::Trigger { prompt } => {
                        Ok(GraphNode::Trigger(TriggerNode::new(&spec.id, label, prompt.clone())))
                    }
                    NodeKind::Task { instruction } => {
                        let mut task = TaskNode::new(&spec.id, label);
                        task.instruction = instruction.clone();
                        Ok(GraphNode::Task(task))
                    }
                    NodeKind::Join => {
                        // Port ordinals follow edge declaration order
                        let sources: Vec<&str> = def
                            .edges
                            .iter()
                            .filter(|e| e.to == spec.id)
                            .map(|e| e.from.as_str())
                            .collect();
                        Ok(GraphNode::Join(JoinNode::new(&spec.id, label, sources)?))
                    }
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let order = execution_order(&def, &trigger_id)?;
        debug!(flow = %def.id, nodes = nodes.len(), edges = def.edges.len(), "Flow validated");

        Ok(Self {
            id: def.id,
            name: def.name,
            nodes,
            index,
            edges: def.edges,
            order,
            trigger_id,
        })
    }

    pub fn trigger_id(&self) -> &str {
        &self.trigger_id
    }

    /// Topological order, trigger first.
    pub fn execution_order(&self) -> &[String] {
        &self.order
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.from == id)
    }

    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.to == id)
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn node_mut(&mut self, id: &str) -> Result<&mut GraphNode> {
        match self.index.get(id) {
            Some(&i) => Ok(&mut self.nodes[i]),
            None => Err(MenderError::UnknownNode(id.to_string())),
        }
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut GraphNode> {
        self.nodes.iter_mut()
    }

    pub fn trigger(&self) -> &TriggerNode {
        match self.node(&self.trigger_id) {
            Some(GraphNode::Trigger(t)) => t,
            _ => unreachable!("validated flow always holds its trigger"),
        }
    }

    pub fn trigger_mut(&mut self) -> &mut TriggerNode {
        let i = self.index[&self.trigger_id];
        match &mut self.nodes[i] {
            GraphNode::Trigger(t) => t,
            _ => unreachable!("validated flow always holds its trigger"),
        }
    }

    pub fn joins(&self) -> impl Iterator<Item = &JoinNode> {
        self.nodes.iter().filter_map(|n| match n {
            GraphNode::Join(j) => Some(j),
            _ => None,
        })
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.iter().filter_map(|n| match n {
            GraphNode::Task(t) => Some(t),
            _ => None,
        })
    }
}

/// Kahn's algorithm seeded with the trigger, then any other source nodes.
fn execution_order(def: &FlowDefinition, trigger_id: &str) -> Result<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> =
        def.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &def.edges {
        adjacency.entry(&edge.from).or_default().push(&edge.to);
        *in_degree.entry(&edge.to).or_default() += 1;
    }

    let mut queue: VecDeque<&str> = VecDeque::new();
    queue.push_back(trigger_id);
    for node in &def.nodes {
        if node.id != trigger_id && in_degree[node.id.as_str()] == 0 {
            queue.push_back(&node.id);
        }
    }

    let mut order = Vec::with_capacity(def.nodes.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        for &next in adjacency.get(id).map(Vec::as_slice).unwrap_or_default() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if order.len() < def.nodes.len() {
        let stuck = def
            .nodes
            .iter()
            .find(|n| !order.contains(&n.id))
            .map(|n| n.id.clone())
            .unwrap_or_default();
        return Err(MenderError::Cycle(stuck));
    }
    Ok(order)
}
