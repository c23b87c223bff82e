use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use mender_core::config::InFlightPolicy;
use mender_core::error::{MenderError, Result};
use mender_core::types::{FlowEvent, RunId};

use crate::controller::{CombineRequest, Dispatch, GraphController, TaskRequest};
use crate::view::FlowSnapshot;

const MIN_TICK: Duration = Duration::from_millis(1);

/// Executes task nodes.
pub trait TaskExecutor: Send + Sync + 'static {
    fn execute(&self, request: TaskRequest) -> BoxFuture<'_, Result<String>>;
}

/// Produces a join's combined result from its filled ports.
pub trait Combiner: Send + Sync + 'static {
    fn combine(&self, request: CombineRequest) -> BoxFuture<'_, Result<String>>;
}

/// Answers every task with its filled-in instruction (or its input).
#[derive(Debug, Clone, Default)]
pub struct EchoExecutor {
    delay: Duration,
}

impl EchoExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep before answering, so intermediate states stay visible.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl TaskExecutor for EchoExecutor {
    fn execute(&self, request: TaskRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let body = request.instruction.unwrap_or(request.input);
            Ok(format!("[{}] {}", request.label, body))
        })
    }
}

/// Concatenates received inputs in ordinal order, each under its source id.
#[derive(Debug, Clone, Default)]
pub struct ConcatCombiner;

impl Combiner for ConcatCombiner {
    fn combine(&self, request: CombineRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let mut inputs = request.inputs;
            inputs.sort_by_key(|s| s.ordinal);
            let sections: Vec<String> = inputs
                .into_iter()
                .filter(|s| s.received)
                .map(|s| format!("## {}\n{}", s.source_id, s.content.unwrap_or_default()))
                .collect();
            Ok(sections.join("\n\n"))
        })
    }
}

enum RunnerMessage {
    EditDraft(String),
    Submit {
        text: Option<String>,
        respond: oneshot::Sender<Option<RunId>>,
    },
    Reset,
    TaskDone {
        run_id: RunId,
        node_id: String,
        outcome: std::result::Result<String, String>,
    },
    CombineDone {
        run_id: RunId,
        join_id: String,
        outcome: std::result::Result<String, String>,
    },
    Shutdown,
}

/// Drives a [`GraphController`] on a single event loop.
///
/// Executor and combiner calls run as spawned tasks and report back through
/// the runner's own channel, so the controller only ever sees one message
/// at a time.
pub struct FlowRunner {
    controller: GraphController,
    executor: Arc<dyn TaskExecutor>,
    combiner: Arc<dyn Combiner>,
    tx: mpsc::Sender<RunnerMessage>,
    rx: mpsc::Receiver<RunnerMessage>,
    snapshot_tx: watch::Sender<FlowSnapshot>,
    work: HashMap<RunId, Vec<JoinHandle<()>>>,
    tick: Duration,
}

impl FlowRunner {
    pub fn new(
        controller: GraphController,
        executor: Arc<dyn TaskExecutor>,
        combiner: Arc<dyn Combiner>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let (snapshot_tx, _) = watch::channel(FlowSnapshot::capture(&controller));
        Self {
            controller,
            executor,
            combiner,
            tx,
            rx,
            snapshot_tx,
            work: HashMap::new(),
            tick: Duration::from_millis(100),
        }
    }

    /// Interval between stall checks, at least one millisecond.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(MIN_TICK);
        self
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            tx: self.tx.clone(),
            snapshot: self.snapshot_tx.subscribe(),
            bus: self.controller.bus().clone(),
        }
    }

    /// Spawn the loop onto the current runtime.
    pub fn spawn(self) -> (RunnerHandle, JoinHandle<()>) {
        let handle = self.handle();
        (handle, tokio::spawn(self.run()))
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(flow = %self.controller.graph().id, "Flow runner started");

        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(RunnerMessage::Shutdown) | None => break,
                    Some(msg) => self.handle_message(msg),
                },
                _ = ticker.tick() => {
                    match self.controller.check_stalls(Instant::now()) {
                        Ok(dispatch) => self.dispatch(dispatch),
                        Err(e) => error!(error = %e, "Stall check failed"),
                    }
                    for handles in self.work.values_mut() {
                        handles.retain(|h| !h.is_finished());
                    }
                    self.work.retain(|_, handles| !handles.is_empty());
                }
            }
            self.publish_snapshot();
        }

        for (_, handles) in self.work.drain() {
            for handle in handles {
                handle.abort();
            }
        }
        info!("Flow runner stopped");
    }

    fn handle_message(&mut self, msg: RunnerMessage) {
        match msg {
            RunnerMessage::EditDraft(text) => {
                if !self.controller.edit_draft(text) {
                    debug!("Draft edit ignored while running");
                }
            }
            RunnerMessage::Submit { text, respond } => {
                if let Some(text) = text {
                    self.controller.edit_draft(text);
                }
                let started = match self.controller.submit() {
                    Some(intent) => match self.controller.apply(intent, Instant::now()) {
                        Ok(started) => started,
                        Err(e) => {
                            error!(error = %e, "Submission failed");
                            None
                        }
                    },
                    None => None,
                };
                let run_id = started.map(|started| {
                    self.dispatch(started.dispatch);
                    started.run_id
                });
                // Watchers must see the new run before the caller learns its id
                self.publish_snapshot();
                let _ = respond.send(run_id);
            }
            RunnerMessage::Reset => {
                if let Some(run_id) = self.controller.current_run() {
                    self.retire(run_id);
                }
                self.controller.reset();
            }
            RunnerMessage::TaskDone {
                run_id,
                node_id,
                outcome,
            } => match self.controller.task_finished(run_id, &node_id, outcome) {
                Ok(dispatch) => self.dispatch(dispatch),
                Err(e) => error!(node_id = %node_id, error = %e, "Could not apply task result"),
            },
            RunnerMessage::CombineDone {
                run_id,
                join_id,
                outcome,
            } => match self.controller.aggregation_finished(run_id, &join_id, outcome) {
                Ok(dispatch) => self.dispatch(dispatch),
                Err(e) => error!(join_id = %join_id, error = %e, "Could not apply combined result"),
            },
            RunnerMessage::Shutdown => {}
        }
    }

    fn dispatch(&mut self, items: Vec<Dispatch>) {
        for item in items {
            let tx = self.tx.clone();
            let (run_id, handle) = match item {
                Dispatch::RunTask(request) => {
                    let executor = self.executor.clone();
                    let run_id = request.run_id;
                    let node_id = request.node_id.clone();
                    let handle = tokio::spawn(async move {
                        let outcome = executor.execute(request).await.map_err(|e| e.to_string());
                        let _ = tx
                            .send(RunnerMessage::TaskDone {
                                run_id,
                                node_id,
                                outcome,
                            })
                            .await;
                    });
                    (run_id, handle)
                }
                Dispatch::Combine(request) => {
                    let combiner = self.combiner.clone();
                    let run_id = request.run_id;
                    let join_id = request.join_id.clone();
                    let handle = tokio::spawn(async move {
                        let outcome = combiner.combine(request).await.map_err(|e| e.to_string());
                        let _ = tx
                            .send(RunnerMessage::CombineDone {
                                run_id,
                                join_id,
                                outcome,
                            })
                            .await;
                    });
                    (run_id, handle)
                }
            };
            self.work.entry(run_id).or_default().push(handle);
        }
    }

    /// Apply the in-flight policy to a run's outstanding work.
    fn retire(&mut self, run_id: RunId) {
        let Some(handles) = self.work.remove(&run_id) else {
            return;
        };
        let pending = handles.iter().filter(|h| !h.is_finished()).count();
        if pending == 0 {
            return;
        }
        match self.controller.config().in_flight {
            InFlightPolicy::Abort => {
                for handle in &handles {
                    handle.abort();
                }
                info!(run_id = %run_id, aborted = pending, "Aborted in-flight work");
            }
            InFlightPolicy::Discard => {
                info!(run_id = %run_id, pending, "In-flight work left to finish, results will be discarded");
            }
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = FlowSnapshot::capture(&self.controller);
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

/// Cloneable handle to a running [`FlowRunner`].
#[derive(Clone)]
pub struct RunnerHandle {
    tx: mpsc::Sender<RunnerMessage>,
    snapshot: watch::Receiver<FlowSnapshot>,
    bus: Arc<mender_core::event::EventBus>,
}

impl RunnerHandle {
    /// Replace the draft and submit it. Returns the started run, or `None`
    /// when the trigger guard rejected the submission.
    pub async fn submit_text(&self, text: impl Into<String>) -> Result<Option<RunId>> {
        self.request_submit(Some(text.into())).await
    }

    /// Submit the current draft.
    pub async fn submit(&self) -> Result<Option<RunId>> {
        self.request_submit(None).await
    }

    pub async fn edit_draft(&self, text: impl Into<String>) -> Result<()> {
        self.send(RunnerMessage::EditDraft(text.into())).await
    }

    pub async fn reset(&self) -> Result<()> {
        self.send(RunnerMessage::Reset).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(RunnerMessage::Shutdown).await
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> FlowSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<FlowSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.bus.subscribe()
    }

    /// Submit `text` and wait until that run resolves.
    pub async fn run_to_completion(&self, text: impl Into<String>) -> Result<FlowSnapshot> {
        let run_id = self.submit_text(text).await?.ok_or_else(|| MenderError::Execution {
            node: "trigger".to_string(),
            message: "submission rejected".to_string(),
        })?;

        let mut snapshots = self.snapshot.clone();
        let snapshot = snapshots
            .wait_for(|s| {
                s.run
                    .as_ref()
                    .is_some_and(|r| r.run_id == run_id && r.outcome.is_some())
            })
            .await
            .map_err(|_| MenderError::RunnerStopped)?
            .clone();
        Ok(snapshot)
    }

    async fn request_submit(&self, text: Option<String>) -> Result<Option<RunId>> {
        let (respond, rx) = oneshot::channel();
        self.send(RunnerMessage::Submit { text, respond }).await?;
        rx.await.map_err(|_| MenderError::RunnerStopped)
    }

    async fn send(&self, msg: RunnerMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| MenderError::RunnerStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use mender_core::config::{GraphConfig, JoinStallPolicy};
    use mender_core::event::EventBus;
    use mender_core::types::NodeStatus;

    use crate::flow::{FlowDefinition, FlowGraph};
    use crate::join::InputSlot;

    fn runner_with(config: GraphConfig, executor: Arc<dyn TaskExecutor>) -> FlowRunner {
        let graph = FlowGraph::build(FlowDefinition::triage()).unwrap();
        let controller = GraphController::new(graph, config, Arc::new(EventBus::default()));
        FlowRunner::new(controller, executor, Arc::new(ConcatCombiner)).with_tick(Duration::from_millis(10))
    }

    /// Fails one node, echoes everything else.
    struct FailingExecutor {
        fail_on: &'static str,
        calls: AtomicUsize,
    }

    impl TaskExecutor for FailingExecutor {
        fn execute(&self, request: TaskRequest) -> BoxFuture<'_, Result<String>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if request.node_id == self.fail_on {
                    Err(MenderError::Execution {
                        node: request.node_id,
                        message: "agent offline".into(),
                    })
                } else {
                    Ok(format!("{} ok", request.node_id))
                }
            })
        }
    }

    #[tokio::test]
    async fn test_echo_executor_prefers_instruction() {
        let exec = EchoExecutor::new();
        let out = exec
            .execute(TaskRequest {
                run_id: RunId::new(),
                node_id: "a".into(),
                label: "Analyze".into(),
                instruction: Some("look at x".into()),
                input: "x".into(),
            })
            .await
            .unwrap();
        assert_eq!(out, "[Analyze] look at x");
    }

    #[tokio::test]
    async fn test_concat_combiner_uses_ordinal_order() {
        let mut late = InputSlot::new("history", 2);
        late.received = true;
        late.content = Some("c".into());
        let mut first = InputSlot::new("stack", 0);
        first.received = true;
        first.content = Some("a".into());
        let mut second = InputSlot::new("dom", 1);
        second.received = true;
        second.content = Some("b".into());

        let out = ConcatCombiner
            .combine(CombineRequest {
                run_id: RunId::new(),
                join_id: "merge".into(),
                inputs: vec![late, first, second],
            })
            .await
            .unwrap();
        assert_eq!(out, "## stack\na\n\n## dom\nb\n\n## history\nc");
    }

    #[tokio::test]
    async fn test_run_to_completion_success() {
        let runner = runner_with(GraphConfig::default(), Arc::new(EchoExecutor::new()));
        let (handle, join) = runner.spawn();

        let snap = handle.run_to_completion("login test flaky").await.unwrap();
        assert_eq!(snap.run.as_ref().unwrap().outcome, Some(true));
        assert_eq!(snap.trigger().unwrap().status, NodeStatus::Success);

        let merge = snap.join("merge").unwrap();
        assert_eq!(merge.status, NodeStatus::Complete);
        let result = merge.result.as_deref().unwrap();
        assert!(result.starts_with("## stack\n[Analyze stack trace]"));
        assert!(snap.task("fix").unwrap().output.as_deref().unwrap().contains("## dom"));

        handle.shutdown().await.unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_blank_submission_is_rejected() {
        let runner = runner_with(GraphConfig::default(), Arc::new(EchoExecutor::new()));
        let (handle, _join) = runner.spawn();
        assert_eq!(handle.submit_text("   ").await.unwrap(), None);
        assert!(handle.run_to_completion("").await.is_err());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stall_policy_resolves_failed_branch() {
        let config = GraphConfig {
            join_stall: JoinStallPolicy::FailAfterSecs(0),
            ..GraphConfig::default()
        };
        let executor = Arc::new(FailingExecutor {
            fail_on: "dom",
            calls: AtomicUsize::new(0),
        });
        let runner = runner_with(config, executor.clone());
        let (handle, _join) = runner.spawn();

        let snap = handle.run_to_completion("checkout broken").await.unwrap();
        assert_eq!(snap.run.as_ref().unwrap().outcome, Some(false));
        assert_eq!(snap.task("dom").unwrap().status, NodeStatus::Error);
        assert_eq!(snap.join("merge").unwrap().status, NodeStatus::Error);
        assert_eq!(snap.task("fix").unwrap().status, NodeStatus::Idle);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_returns_to_idle() {
        let runner = runner_with(
            GraphConfig::default(),
            Arc::new(EchoExecutor::with_delay(Duration::from_secs(30))),
        );
        let (handle, _join) = runner.spawn();
        assert!(handle.submit_text("slow").await.unwrap().is_some());
        handle.reset().await.unwrap();
        // Round trip so the reset has been applied and published
        assert_eq!(handle.submit_text(" ").await.unwrap(), None);

        let snap = handle.snapshot();
        assert!(snap.run.is_none());
        assert!(snap.nodes.iter().all(|n| n.status() == NodeStatus::Idle));
        assert!(snap.trigger().unwrap().editable);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submitted_run_is_visible_when_id_returns() {
        let runner = runner_with(
            GraphConfig::default(),
            Arc::new(EchoExecutor::with_delay(Duration::from_secs(30))),
        );
        let (handle, _join) = runner.spawn();
        let run_id = handle.submit_text("slow").await.unwrap().unwrap();

        let snap = handle.snapshot();
        let run = snap.run.as_ref().expect("run published");
        assert_eq!(run.run_id, run_id);
        assert!(run.outcome.is_none());
        assert_eq!(snap.task("stack").unwrap().status, NodeStatus::Running);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_tick_is_clamped() {
        let graph = FlowGraph::build(FlowDefinition::triage()).unwrap();
        let controller =
            GraphController::new(graph, GraphConfig::default(), Arc::new(EventBus::default()));
        let runner = FlowRunner::new(controller, Arc::new(EchoExecutor::new()), Arc::new(ConcatCombiner))
            .with_tick(Duration::ZERO);
        assert_eq!(runner.tick, MIN_TICK);

        let (handle, join) = runner.spawn();
        let snap = handle.run_to_completion("zero tick").await.unwrap();
        assert_eq!(snap.run.as_ref().unwrap().outcome, Some(true));
        handle.shutdown().await.unwrap();
        join.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_handle() {
        let runner = runner_with(GraphConfig::default(), Arc::new(EchoExecutor::new()));
        let (handle, join) = runner.spawn();
        handle.shutdown().await.unwrap();
        join.await.unwrap();
        assert!(matches!(
            handle.edit_draft("late").await,
            Err(MenderError::RunnerStopped)
        ));
    }
}
