//! Flow graph execution: node state machines and the run controller.
//!
//! A flow is a directed acyclic graph with exactly one `TriggerNode`, any
//! number of `TaskNode`s, and `JoinNode`s that hold a fixed, ordered set of
//! input ports and only aggregate once every port has received a result.
//!
//! The `GraphController` is the single writer of node state. Nodes emit
//! intents (`Intent::Submit`) as values; the controller applies them, tags
//! every run with a `RunId`, and propagates results along edges whose
//! condition matches. The `FlowRunner` drives a controller on one event
//! loop, running tasks and combinations through pluggable traits.

pub mod context;
pub mod controller;
pub mod edge;
pub mod flow;
pub mod join;
pub mod runner;
pub mod task;
pub mod trigger;
pub mod view;

pub use context::RunContext;
pub use controller::{CombineRequest, Dispatch, GraphController, RunSummary, StartedRun, TaskRequest};
pub use edge::{Edge, EdgeCondition};
pub use flow::{FlowDefinition, FlowGraph, GraphNode, NodeKind, NodeSpec};
pub use join::{Delivery, InputSlot, JoinNode};
pub use runner::{Combiner, ConcatCombiner, EchoExecutor, FlowRunner, RunnerHandle, TaskExecutor};
pub use task::TaskNode;
pub use trigger::TriggerNode;
pub use view::{FlowSnapshot, JoinView, NodeView, PortView, TaskView, TriggerView};
