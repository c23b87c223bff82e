//! Pure projections of controller state for renderers.
//!
//! Snapshots are recomputed from scratch after every transition; nothing in
//! here feeds back into execution.

use serde::Serialize;

use mender_core::types::NodeStatus;

use crate::controller::{GraphController, RunSummary};
use crate::flow::GraphNode;
use crate::join::port_id;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowSnapshot {
    pub flow_id: String,
    pub flow_name: String,
    pub run: Option<RunSummary>,
    /// Nodes in execution order, trigger first.
    pub nodes: Vec<NodeView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeView {
    Trigger(TriggerView),
    Task(TaskView),
    Join(JoinView),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerView {
    pub id: String,
    pub label: String,
    pub draft: String,
    pub status: NodeStatus,
    pub editable: bool,
    pub can_submit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskView {
    pub id: String,
    pub label: String,
    pub status: NodeStatus,
    pub output: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinView {
    pub id: String,
    pub label: String,
    pub status: NodeStatus,
    pub received: usize,
    pub total: usize,
    /// Ports in ordinal order.
    pub ports: Vec<PortView>,
    pub result: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortView {
    pub port_id: String,
    pub ordinal: usize,
    pub source_id: String,
    pub received: bool,
    pub content: Option<String>,
}

impl FlowSnapshot {
    pub fn capture(controller: &GraphController) -> Self {
        let graph = controller.graph();
        let nodes = graph
            .execution_order()
            .iter()
            .filter_map(|id| graph.node(id))
            .map(NodeView::from)
            .collect();

        Self {
            flow_id: graph.id.clone(),
            flow_name: graph.name.clone(),
            run: controller.run_summary(),
            nodes,
        }
    }

    pub fn trigger(&self) -> Option<&TriggerView> {
        self.nodes.iter().find_map(|n| match n {
            NodeView::Trigger(t) => Some(t),
            _ => None,
        })
    }

    pub fn task(&self, id: &str) -> Option<&TaskView> {
        self.nodes.iter().find_map(|n| match n {
            NodeView::Task(t) if t.id == id => Some(t),
            _ => None,
        })
    }

    pub fn join(&self, id: &str) -> Option<&JoinView> {
        self.nodes.iter().find_map(|n| match n {
            NodeView::Join(j) if j.id == id => Some(j),
            _ => None,
        })
    }

    /// Whether the current run has resolved (or no run was ever started).
    pub fn is_settled(&self) -> bool {
        self.run.as_ref().map_or(true, |r| r.outcome.is_some())
    }
}

impl NodeView {
    pub fn id(&self) -> &str {
        match self {
            Self::Trigger(v) => &v.id,
            Self::Task(v) => &v.id,
            Self::Join(v) => &v.id,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Trigger(v) => &v.label,
            Self::Task(v) => &v.label,
            Self::Join(v) => &v.label,
        }
    }

    pub fn status(&self) -> NodeStatus {
        match self {
            Self::Trigger(v) => v.status,
            Self::Task(v) => v.status,
            Self::Join(v) => v.status,
        }
    }
}

impl From<&GraphNode> for NodeView {
    fn from(node: &GraphNode) -> Self {
        match node {
            GraphNode::Trigger(t) => Self::Trigger(TriggerView {
                id: t.id.clone(),
                label: t.label.clone(),
                draft: t.draft().to_string(),
                status: t.status(),
                editable: t.is_editable(),
                can_submit: t.can_submit(),
            }),
            GraphNode::Task(t) => Self::Task(TaskView {
                id: t.id.clone(),
                label: t.label.clone(),
                status: t.status(),
                output: t.output().map(str::to_string),
                error: t.error().map(str::to_string),
            }),
            GraphNode::Join(j) => Self::Join(JoinView {
                id: j.id.clone(),
                label: j.label.clone(),
                status: j.status(),
                received: j.received_count(),
                total: j.total(),
                ports: j
                    .slots()
                    .iter()
                    .map(|s| PortView {
                        port_id: port_id(s.ordinal),
                        ordinal: s.ordinal,
                        source_id: s.source_id.clone(),
                        received: s.received,
                        content: s.content.clone(),
                    })
                    .collect(),
                result: j.result().map(str::to_string),
            }),
        }
    }
}

/// First line of `text`, cut to `max_chars` characters.
pub fn preview(text: &str, max_chars: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    let mut chars = line.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() || text.lines().nth(1).is_some() {
        format!("{}…", head)
    } else {
        head
    }
}
