use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use mender_core::config::{GraphConfig, JoinStallPolicy};
use mender_core::error::{MenderError, Result};
use mender_core::event::EventBus;
use mender_core::types::{FlowEvent, Intent, NodeStatus, RunId};

use crate::context::RunContext;
use crate::flow::{FlowGraph, GraphNode};
use crate::join::{Delivery, InputSlot};

/// Work the controller asks its driver to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    RunTask(TaskRequest),
    Combine(CombineRequest),
}

/// Execute one task node.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub run_id: RunId,
    pub node_id: String,
    pub label: String,
    /// Instruction template with placeholders already filled in.
    pub instruction: Option<String>,
    /// Outputs of the predecessors whose edges fired, in edge order.
    pub input: String,
}

/// Combine the inputs of a join whose barrier has opened.
#[derive(Debug, Clone, PartialEq)]
pub struct CombineRequest {
    pub run_id: RunId,
    pub join_id: String,
    pub inputs: Vec<InputSlot>,
}

/// Returned when a submission starts a new run.
///
/// Submissions are refused while a run is unresolved, so a new run never
/// replaces one in flight. Only [`GraphController::reset`] retires
/// unresolved work.
#[derive(Debug, Clone)]
pub struct StartedRun {
    pub run_id: RunId,
    pub dispatch: Vec<Dispatch>,
}

/// Read-only summary of the current run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub prompt: String,
    /// `Some(succeeded)` once the run has resolved.
    pub outcome: Option<bool>,
    pub elapsed_ms: u64,
}

struct ActiveRun {
    id: RunId,
    prompt: String,
    started: Instant,
    finished: Option<Instant>,
    context: RunContext,
    /// Edges resolved during this run, `true` when the result travelled.
    edges: HashMap<(String, String), bool>,
    /// Nodes dispatched and not yet reported back.
    in_flight: HashSet<String>,
    outcome: Option<bool>,
}

enum Resolution {
    Finished {
        node_id: String,
        succeeded: bool,
        output: String,
    },
    Skipped {
        node_id: String,
    },
}

/// Owns the flow topology and every node's execution state.
///
/// Nodes never change their own status: the controller applies intents,
/// executor results, and combination results, then propagates them along
/// matching edges.
pub struct GraphController {
    graph: FlowGraph,
    config: GraphConfig,
    bus: Arc<EventBus>,
    run: Option<ActiveRun>,
}

impl GraphController {
    pub fn new(graph: FlowGraph, config: GraphConfig, bus: Arc<EventBus>) -> Self {
        Self {
            graph,
            config,
            bus,
            run: None,
        }
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn current_run(&self) -> Option<RunId> {
        self.run.as_ref().map(|r| r.id)
    }

    pub fn context(&self) -> Option<&RunContext> {
        self.run.as_ref().map(|r| &r.context)
    }

    pub fn run_summary(&self) -> Option<RunSummary> {
        self.run.as_ref().map(|r| RunSummary {
            run_id: r.id,
            prompt: r.prompt.clone(),
            outcome: r.outcome,
            elapsed_ms: r
                .finished
                .unwrap_or_else(Instant::now)
                .saturating_duration_since(r.started)
                .as_millis() as u64,
        })
    }

    /// Edit the trigger draft; ignored while a run is in flight.
    pub fn edit_draft(&mut self, text: impl Into<String>) -> bool {
        self.graph.trigger_mut().edit(text)
    }

    /// Ask the trigger for a submit intent.
    pub fn submit(&self) -> Option<Intent> {
        self.graph.trigger().submit()
    }

    /// Apply a node intent. Returns the started run, if one was started.
    pub fn apply(&mut self, intent: Intent, now: Instant) -> Result<Option<StartedRun>> {
        match intent {
            Intent::Submit { node_id, text } => {
                if node_id != self.graph.trigger_id() {
                    return Err(MenderError::UnknownNode(node_id));
                }
                let text = text.trim();
                if text.is_empty() || self.graph.trigger().status() == NodeStatus::Running {
                    debug!(node_id = %node_id, "Submission ignored by trigger guard");
                    return Ok(None);
                }
                self.start_run(text.to_string(), now).map(Some)
            }
        }
    }

    fn start_run(&mut self, prompt: String, now: Instant) -> Result<StartedRun> {
        for node in self.graph.nodes_mut() {
            match node {
                GraphNode::Trigger(t) => t.reset(),
                GraphNode::Task(t) => t.reset(),
                GraphNode::Join(j) => {
                    j.reset();
                    j.begin_run(now);
                }
            }
        }
        self.graph.trigger_mut().set_status(NodeStatus::Running)?;

        let run_id = RunId::new();
        self.run = Some(ActiveRun {
            id: run_id,
            prompt: prompt.clone(),
            started: now,
            finished: None,
            context: RunContext::new(prompt.clone()),
            edges: HashMap::new(),
            in_flight: HashSet::new(),
            outcome: None,
        });

        info!(run_id = %run_id, flow = %self.graph.id, "Run started");
        self.bus.publish(FlowEvent::RunStarted {
            run_id,
            prompt: prompt.clone(),
        });
        for node in self.graph.nodes() {
            self.bus.publish(FlowEvent::NodeStatusChanged {
                run_id: Some(run_id),
                node_id: node.id().to_string(),
                status: node.status(),
            });
        }

        let trigger_id = self.graph.trigger_id().to_string();
        let dispatch = self.settle(Resolution::Finished {
            node_id: trigger_id,
            succeeded: true,
            output: prompt,
        })?;
        self.finish_if_settled()?;

        Ok(StartedRun { run_id, dispatch })
    }

    /// Report the outcome of a dispatched task.
    pub fn task_finished(
        &mut self,
        run_id: RunId,
        node_id: &str,
        outcome: std::result::Result<String, String>,
    ) -> Result<Vec<Dispatch>> {
        if !self.accept_result(run_id, node_id) {
            return Ok(vec![]);
        }

        let succeeded = outcome.is_ok();
        let output = match self.graph.node_mut(node_id)? {
            GraphNode::Task(task) => match outcome {
                Ok(text) => {
                    task.succeed(text.clone())?;
                    text
                }
                Err(message) => {
                    warn!(run_id = %run_id, node_id = %node_id, error = %message, "Task failed");
                    task.fail(message.clone())?;
                    message
                }
            },
            other => {
                return Err(MenderError::InvalidStatus {
                    node: node_id.to_string(),
                    kind: other.kind_name().to_string(),
                    status: NodeStatus::Success.to_string(),
                })
            }
        };
        self.publish_status(node_id);

        let dispatch = self.settle(Resolution::Finished {
            node_id: node_id.to_string(),
            succeeded,
            output,
        })?;
        self.finish_if_settled()?;
        Ok(dispatch)
    }

    /// Report the outcome of a join combination.
    pub fn aggregation_finished(
        &mut self,
        run_id: RunId,
        join_id: &str,
        outcome: std::result::Result<String, String>,
    ) -> Result<Vec<Dispatch>> {
        if !self.accept_result(run_id, join_id) {
            return Ok(vec![]);
        }

        let succeeded = outcome.is_ok();
        let output = match self.graph.node_mut(join_id)? {
            GraphNode::Join(join) => match outcome {
                Ok(result) => {
                    join.complete(result.clone())?;
                    result
                }
                Err(message) => {
                    warn!(run_id = %run_id, join_id = %join_id, error = %message, "Combination failed");
                    join.fail()?;
                    message
                }
            },
            other => {
                return Err(MenderError::InvalidStatus {
                    node: join_id.to_string(),
                    kind: other.kind_name().to_string(),
                    status: NodeStatus::Complete.to_string(),
                })
            }
        };
        self.publish_status(join_id);

        let dispatch = self.settle(Resolution::Finished {
            node_id: join_id.to_string(),
            succeeded,
            output,
        })?;
        self.finish_if_settled()?;
        Ok(dispatch)
    }

    /// Apply the join stall policy.
    pub fn check_stalls(&mut self, now: Instant) -> Result<Vec<Dispatch>> {
        let JoinStallPolicy::FailAfterSecs(limit) = self.config.join_stall else {
            return Ok(vec![]);
        };
        let run_id = match self.run.as_ref() {
            Some(run) if run.outcome.is_none() => run.id,
            _ => return Ok(vec![]),
        };

        let stalled: Vec<(String, u64)> = self
            .graph
            .joins()
            .filter_map(|j| {
                j.waited(now)
                    .filter(|waited| waited.as_secs() >= limit)
                    .map(|waited| (j.id.clone(), waited.as_secs()))
            })
            .collect();

        let mut dispatch = Vec::new();
        for (join_id, waited_secs) in stalled {
            if let GraphNode::Join(join) = self.graph.node_mut(&join_id)? {
                join.fail()?;
            }
            warn!(run_id = %run_id, join_id = %join_id, waited_secs, "Join stalled, failing it");
            self.bus.publish(FlowEvent::JoinStalled {
                run_id,
                join_id: join_id.clone(),
                waited_secs,
            });
            self.publish_status(&join_id);
            dispatch.extend(self.settle(Resolution::Finished {
                output: format!("{} stalled after {}s", join_id, waited_secs),
                node_id: join_id,
                succeeded: false,
            })?);
        }
        self.finish_if_settled()?;
        Ok(dispatch)
    }

    /// Drop the current run and return every node to idle.
    pub fn reset(&mut self) {
        self.supersede_unresolved_run();
        for node in self.graph.nodes_mut() {
            match node {
                GraphNode::Trigger(t) => t.reset(),
                GraphNode::Task(t) => t.reset(),
                GraphNode::Join(j) => j.reset(),
            }
        }
        for node in self.graph.nodes() {
            self.bus.publish(FlowEvent::NodeStatusChanged {
                run_id: None,
                node_id: node.id().to_string(),
                status: node.status(),
            });
        }
        info!(flow = %self.graph.id, "Flow reset");
    }

    /// Drop the current run, announcing it as superseded if it had not resolved.
    fn supersede_unresolved_run(&mut self) {
        let Some(old) = self.run.take() else {
            return;
        };
        if old.outcome.is_none() {
            info!(run_id = %old.id, "Run superseded");
            self.bus.publish(FlowEvent::RunSuperseded { run_id: old.id });
        }
    }

    /// Whether a result for `node_id` belongs to the current run and was expected.
    fn accept_result(&mut self, run_id: RunId, node_id: &str) -> bool {
        let run = match self.run.as_mut() {
            Some(run) if run.id == run_id && run.outcome.is_none() => run,
            _ => {
                debug!(run_id = %run_id, node_id = %node_id, "Discarding result from stale run");
                self.bus.publish(FlowEvent::StaleResult {
                    run_id,
                    node_id: node_id.to_string(),
                });
                return false;
            }
        };
        if !run.in_flight.remove(node_id) {
            warn!(run_id = %run_id, node_id = %node_id, "Result for a node that was not dispatched");
            return false;
        }
        true
    }

    /// Propagate a resolution along outgoing edges, collecting new work.
    fn settle(&mut self, first: Resolution) -> Result<Vec<Dispatch>> {
        let Some(run) = self.run.as_mut() else {
            return Ok(vec![]);
        };
        let graph = &mut self.graph;
        let bus = &self.bus;

        let mut dispatch = Vec::new();
        let mut queue = VecDeque::from([first]);

        while let Some(resolution) = queue.pop_front() {
            let (source, succeeded, output) = match resolution {
                Resolution::Finished {
                    node_id,
                    succeeded,
                    output,
                } => {
                    run.context.record_output(&node_id, &output, succeeded);
                    (node_id, Some(succeeded), output)
                }
                Resolution::Skipped { node_id } => {
                    debug!(run_id = %run.id, node_id = %node_id, "Node skipped, no incoming edge fired");
                    (node_id, None, String::new())
                }
            };

            let outgoing: Vec<_> = graph.outgoing(&source).cloned().collect();
            for edge in outgoing {
                let fired = succeeded.is_some_and(|ok| edge.fires(ok, run.context.data()));
                run.edges
                    .insert((edge.from.clone(), edge.to.clone()), fired);

                let is_join = matches!(graph.node(&edge.to), Some(GraphNode::Join(_)));
                if is_join {
                    if !fired {
                        debug!(join_id = %edge.to, source_id = %edge.from, "Edge did not fire, port stays empty");
                        continue;
                    }
                    let GraphNode::Join(join) = graph.node_mut(&edge.to)? else {
                        continue;
                    };
                    match join.deliver(&edge.from, Some(output.clone())) {
                        Ok(Delivery::Pending { received, total }) => {
                            debug!(join_id = %join.id, received, total, "Join input received");
                            bus.publish(FlowEvent::InputDelivered {
                                run_id: run.id,
                                join_id: join.id.clone(),
                                source_id: edge.from.clone(),
                                received,
                                total,
                            });
                        }
                        Ok(Delivery::Ready) => {
                            info!(run_id = %run.id, join_id = %join.id, "Join barrier open, aggregating");
                            bus.publish(FlowEvent::InputDelivered {
                                run_id: run.id,
                                join_id: join.id.clone(),
                                source_id: edge.from.clone(),
                                received: join.total(),
                                total: join.total(),
                            });
                            bus.publish(FlowEvent::JoinReady {
                                run_id: run.id,
                                join_id: join.id.clone(),
                            });
                            bus.publish(FlowEvent::NodeStatusChanged {
                                run_id: Some(run.id),
                                node_id: join.id.clone(),
                                status: join.status(),
                            });
                            run.in_flight.insert(join.id.clone());
                            dispatch.push(Dispatch::Combine(CombineRequest {
                                run_id: run.id,
                                join_id: join.id.clone(),
                                inputs: join.slots().to_vec(),
                            }));
                        }
                        Ok(Delivery::Duplicate) => {
                            warn!(join_id = %join.id, source_id = %edge.from, "Duplicate join input ignored");
                        }
                        Err(e) => {
                            warn!(join_id = %join.id, error = %e, "Late join input ignored");
                        }
                    }
                    continue;
                }

                // Tasks start once every incoming edge has resolved
                let target = edge.to.clone();
                let incoming: Vec<(String, Option<bool>)> = graph
                    .incoming(&target)
                    .map(|e| {
                        let state = run.edges.get(&(e.from.clone(), e.to.clone())).copied();
                        (e.from.clone(), state)
                    })
                    .collect();
                if incoming.iter().any(|(_, state)| state.is_none()) {
                    continue;
                }
                let fired_from: Vec<&String> = incoming
                    .iter()
                    .filter(|(_, state)| *state == Some(true))
                    .map(|(from, _)| from)
                    .collect();
                if fired_from.is_empty() {
                    queue.push_back(Resolution::Skipped { node_id: target });
                    continue;
                }

                let input = fired_from
                    .iter()
                    .filter_map(|from| run.context.output_text(from))
                    .collect::<Vec<_>>()
                    .join("\n\n");

                if let GraphNode::Task(task) = graph.node_mut(&target)? {
                    task.start()?;
                    let instruction = task
                        .instruction
                        .as_deref()
                        .map(|t| run.context.substitute(t));
                    info!(run_id = %run.id, node_id = %task.id, "Dispatching task");
                    bus.publish(FlowEvent::NodeStatusChanged {
                        run_id: Some(run.id),
                        node_id: task.id.clone(),
                        status: task.status(),
                    });
                    run.in_flight.insert(task.id.clone());
                    dispatch.push(Dispatch::RunTask(TaskRequest {
                        run_id: run.id,
                        node_id: task.id.clone(),
                        label: task.label.clone(),
                        instruction,
                        input,
                    }));
                }
            }
        }

        Ok(dispatch)
    }

    /// Resolve the run once nothing is in flight and no barrier is open.
    fn finish_if_settled(&mut self) -> Result<()> {
        let Some(run) = self.run.as_mut() else {
            return Ok(());
        };
        if run.outcome.is_some() || !run.in_flight.is_empty() {
            return Ok(());
        }
        if self.graph.joins().any(|j| j.status().is_active()) {
            debug!(run_id = %run.id, "Run blocked on a join barrier");
            return Ok(());
        }

        let succeeded = !self
            .graph
            .nodes()
            .iter()
            .any(|n| n.status() == NodeStatus::Error);
        let now = Instant::now();
        run.outcome = Some(succeeded);
        run.finished = Some(now);
        let run_id = run.id;
        let elapsed_ms = now.saturating_duration_since(run.started).as_millis() as u64;

        self.graph.trigger_mut().set_status(if succeeded {
            NodeStatus::Success
        } else {
            NodeStatus::Error
        })?;
        let trigger_id = self.graph.trigger_id().to_string();
        self.publish_status(&trigger_id);

        info!(run_id = %run_id, succeeded, elapsed_ms, "Run complete");
        self.bus.publish(FlowEvent::RunComplete {
            run_id,
            succeeded,
            elapsed_ms,
        });
        Ok(())
    }

    fn publish_status(&self, node_id: &str) {
        if let Some(node) = self.graph.node(node_id) {
            self.bus.publish(FlowEvent::NodeStatusChanged {
                run_id: self.current_run(),
                node_id: node_id.to_string(),
                status: node.status(),
            });
        }
    }
}
