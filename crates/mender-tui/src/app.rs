use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use mender_core::config::AppConfig;
use mender_core::event::EventBus;
use mender_core::types::{FailureId, FailureStatus, FlowEvent, OperatorIntent, RunId};
use mender_graph::{FlowSnapshot, NodeView, RunnerHandle};
use mender_monitor::{
    ActivityEvent, ActivityKind, FailureInput, FailureService, MonitorStore, MonitoringLayout,
};

use crate::event::{EventLoop, TuiEvent};
use crate::input::{InputAction, InputHandler};
use crate::ui;

/// Application state.
pub struct App {
    pub flow: FlowSnapshot,
    pub store: MonitorStore,
    pub layout: MonitoringLayout,
    pub input: InputHandler,
    /// Highlighted row in the failure list.
    pub cursor: usize,
    pub tick_count: usize,
    pub notice: Option<String>,
    service: FailureService,
    intents: mpsc::UnboundedReceiver<OperatorIntent>,
    /// Pending failures waiting for the flow.
    queue: VecDeque<FailureId>,
    /// Failure being repaired by the current run.
    active: Option<ActiveRepair>,
}

struct ActiveRepair {
    failure_id: FailureId,
    run_id: RunId,
    /// Set once a snapshot has shown this run.
    seen: bool,
}

impl App {
    pub fn new(config: &AppConfig, bus: Arc<EventBus>, flow: FlowSnapshot) -> Self {
        let (tx, intents) = mpsc::unbounded_channel();
        let retry_tx = tx.clone();
        let layout = MonitoringLayout::new(&config.monitor)
            .with_retry_handler(move |id| {
                let _ = retry_tx.send(OperatorIntent::Retry(id.clone()));
            })
            .with_escalate_handler(move |id| {
                let _ = tx.send(OperatorIntent::Escalate(id.clone()));
            });

        let mut input = InputHandler::new();
        if let Some(trigger) = flow.trigger() {
            input.prompt.set(&trigger.draft);
        }

        Self {
            flow,
            store: MonitorStore::new(config.monitor.max_activity),
            layout,
            input,
            cursor: 0,
            tick_count: 0,
            notice: None,
            service: FailureService::new(bus, &config.monitor),
            intents,
            queue: VecDeque::new(),
            active: None,
        }
    }

    pub fn service(&self) -> &FailureService {
        &self.service
    }

    pub fn active_failure(&self) -> Option<&FailureId> {
        self.active.as_ref().map(|a| &a.failure_id)
    }

    pub fn prompt_locked(&self) -> bool {
        self.flow.trigger().is_some_and(|t| !t.editable)
    }

    /// Failure ids in list order.
    pub fn failure_ids(&self) -> Vec<FailureId> {
        self.service
            .list(&self.store, None, None)
            .into_iter()
            .map(|f| f.id.clone())
            .collect()
    }

    pub fn highlighted(&self) -> Option<FailureId> {
        self.failure_ids().into_iter().nth(self.cursor)
    }

    /// Move the highlight; an open detail panel follows it.
    pub fn move_cursor(&mut self, delta: isize) {
        let len = self.failure_ids().len();
        if len == 0 {
            self.cursor = 0;
            return;
        }
        self.cursor = (self.cursor as isize + delta).clamp(0, len as isize - 1) as usize;
        if self.store.selected_failure().is_some() {
            self.open_highlighted();
        }
    }

    pub fn open_highlighted(&mut self) {
        if let Some(id) = self.highlighted() {
            self.layout.select(&mut self.store, id);
        }
    }

    pub fn close_detail(&mut self) {
        self.layout.close_detail(&mut self.store);
    }

    /// Target of retry/escalate: the open detail, else the highlighted row.
    fn intent_target(&self) -> Option<FailureId> {
        self.store
            .selected_failure()
            .map(|f| f.id.clone())
            .or_else(|| self.highlighted())
    }

    pub fn retry_target(&mut self) {
        if let Some(id) = self.intent_target() {
            self.layout.retry(&id);
        }
    }

    pub fn escalate_target(&mut self) {
        if let Some(id) = self.intent_target() {
            self.layout.escalate(&id);
        }
    }

    /// Act on intents forwarded by the layout.
    pub fn apply_intents(&mut self) {
        while let Ok(intent) = self.intents.try_recv() {
            match self.service.apply(&mut self.store, intent) {
                Ok(failure) if failure.status == FailureStatus::Pending => {
                    self.notice = Some(format!("{} requeued", failure.id));
                    self.queue.push_back(failure.id);
                }
                Ok(failure) => {
                    self.notice = Some(format!("{} {}", failure.id, failure.status));
                }
                Err(e) => {
                    warn!(error = %e, "Operator intent rejected");
                    self.notice = Some(e.to_string());
                }
            }
        }
    }

    /// Report a failure from the submit form (`file::name | error`).
    pub fn submit_failure_form(&mut self, text: &str) -> Option<FailureId> {
        let Some(input) = parse_failure_form(text) else {
            self.notice = Some("expected: file::test name | error message".to_string());
            return None;
        };
        let failure = self.service.create(&mut self.store, input);
        self.queue.push_back(failure.id.clone());
        self.notice = Some(format!("{} queued", failure.id));
        Some(failure.id)
    }

    pub fn on_flow_event(&mut self, event: FlowEvent) {
        let active_run = self.active.as_ref().map(|a| a.run_id);
        match event {
            FlowEvent::NodeStatusChanged {
                run_id: Some(run_id),
                node_id,
                status,
            } => {
                if let Some(failure_id) = self
                    .active
                    .as_ref()
                    .filter(|_| active_run == Some(run_id))
                    .map(|a| a.failure_id.clone())
                {
                    if let Err(e) = self.service.record_node(&mut self.store, &failure_id, &node_id, status, None) {
                        warn!(failure_id = %failure_id, error = %e, "Could not record node status");
                    }
                } else if status.is_terminal() {
                    self.store.push_activity(
                        ActivityEvent::new(ActivityKind::NodeUpdate, format!("{} {}", node_id, status))
                            .for_node(node_id),
                    );
                }
            }
            FlowEvent::RunStarted { run_id, prompt } if active_run != Some(run_id) => {
                self.store.push_activity(ActivityEvent::new(
                    ActivityKind::WorkflowStarted,
                    format!("Run {} started: {}", run_id.short(), prompt),
                ));
            }
            FlowEvent::RunComplete {
                run_id,
                succeeded,
                elapsed_ms,
            } if active_run != Some(run_id) => {
                let outcome = if succeeded { "succeeded" } else { "failed" };
                self.store.push_activity(ActivityEvent::new(
                    ActivityKind::WorkflowFinished,
                    format!("Run {} {} in {}ms", run_id.short(), outcome, elapsed_ms),
                ));
            }
            FlowEvent::JoinStalled {
                join_id,
                waited_secs,
                ..
            } => {
                self.store.push_activity(
                    ActivityEvent::new(
                        ActivityKind::NodeUpdate,
                        format!("{} stalled after {}s", join_id, waited_secs),
                    )
                    .for_node(join_id),
                );
            }
            FlowEvent::RunSuperseded { run_id } => {
                if let Some(active) = self.active.as_mut().filter(|a| a.run_id == run_id) {
                    active.seen = true;
                }
                self.store.push_activity(ActivityEvent::new(
                    ActivityKind::WorkflowFinished,
                    format!("Run {} superseded", run_id.short()),
                ));
            }
            _ => {}
        }
    }

    /// Take a new flow snapshot; settles the active failure once its run resolves.
    pub fn refresh(&mut self, snapshot: FlowSnapshot) {
        self.flow = snapshot;
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let run_id = active.run_id;
        let failure_id = active.failure_id.clone();

        let outcome = match self.flow.run.as_ref() {
            Some(run) if run.run_id == run_id => {
                active.seen = true;
                match run.outcome {
                    Some(succeeded) => succeeded,
                    None => return,
                }
            }
            // Older than the submission
            _ if !active.seen => return,
            // Reset or replaced after the run was seen
            _ => false,
        };

        if self.flow.run.as_ref().is_some_and(|r| r.run_id == run_id) {
            for node in &self.flow.nodes {
                let output = match node {
                    NodeView::Task(t) => t.output.as_deref().or(t.error.as_deref()),
                    NodeView::Join(j) => j.result.as_deref(),
                    NodeView::Trigger(_) => continue,
                };
                if let Err(e) =
                    self.service
                        .record_node(&mut self.store, &failure_id, node.id(), node.status(), output)
                {
                    debug!(error = %e, "Skipping node result");
                }
            }
        }

        match self.service.finish_workflow(&mut self.store, &failure_id, outcome) {
            Ok(failure) => self.notice = Some(format!("{} {}", failure.id, failure.status)),
            Err(e) => warn!(failure_id = %failure_id, error = %e, "Could not finish workflow"),
        }
        self.active = None;
    }

    /// Apply forwarded intents and start the next queued failure when the
    /// flow is idle.
    pub async fn pump(&mut self, runner: &RunnerHandle) -> anyhow::Result<()> {
        self.apply_intents();
        if self.active.is_some() || !self.flow.is_settled() {
            return Ok(());
        }

        while let Some(failure_id) = self.queue.pop_front() {
            let Some(failure) = self.store.failure(&failure_id).cloned() else {
                continue;
            };
            if failure.status != FailureStatus::Pending {
                continue;
            }
            match runner.submit_text(failure.prompt()).await? {
                Some(run_id) => {
                    self.service
                        .start_workflow(&mut self.store, &failure_id, &self.flow.flow_id)?;
                    info!(failure_id = %failure_id, run_id = %run_id, "Repair run started");
                    self.active = Some(ActiveRepair {
                        failure_id,
                        run_id,
                        seen: false,
                    });
                }
                None => {
                    self.queue.push_front(failure_id);
                }
            }
            break;
        }
        Ok(())
    }
}

/// Parse `file::test name | error message`.
pub fn parse_failure_form(text: &str) -> Option<FailureInput> {
    let (title, error) = match text.split_once('|') {
        Some((title, error)) => (title.trim(), error.trim()),
        None => (text.trim(), text.trim()),
    };
    let (test_file, test_name) = match title.split_once("::") {
        Some((file, name)) => (file.trim(), name.trim()),
        None => ("", title),
    };
    if test_name.is_empty() || error.is_empty() {
        return None;
    }
    Some(FailureInput {
        test_file: test_file.to_string(),
        test_name: test_name.to_string(),
        error_message: error.to_string(),
        ..Default::default()
    })
}

/// Main app loop.
pub async fn run_app(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    config: &AppConfig,
    runner: RunnerHandle,
    event_bus: Arc<EventBus>,
) -> anyhow::Result<()> {
    let mut app = App::new(config, event_bus.clone(), runner.snapshot());
    let mut events = EventLoop::new(
        event_bus.subscribe(),
        Duration::from_millis(config.tui.tick_ms),
    );

    loop {
        app.refresh(runner.snapshot());
        app.pump(&runner).await?;
        terminal.draw(|f| ui::draw(f, &app))?;

        let Some(event) = events.next().await else {
            break;
        };
        match event {
            TuiEvent::Key(key) => {
                let locked = app.prompt_locked();
                let form_open = app.layout.is_submit_form_open();
                match app.input.handle_key(key, locked, form_open) {
                    InputAction::Quit => break,
                    InputAction::Edited(text) => runner.edit_draft(text).await?,
                    InputAction::Submit(text) => {
                        if let Some(run_id) = runner.submit_text(text).await? {
                            debug!(run_id = %run_id, "Prompt submitted");
                        }
                    }
                    InputAction::SubmitFailure(text) => {
                        app.submit_failure_form(&text);
                    }
                    InputAction::Reset => runner.reset().await?,
                    InputAction::ToggleForm => {
                        app.layout.toggle_submit_form();
                    }
                    InputAction::SelectPrev => app.move_cursor(-1),
                    InputAction::SelectNext => app.move_cursor(1),
                    InputAction::Open => app.open_highlighted(),
                    InputAction::CloseDetail => app.close_detail(),
                    InputAction::Retry => app.retry_target(),
                    InputAction::Escalate => app.escalate_target(),
                    InputAction::None => {}
                }
            }
            TuiEvent::Flow(event) => app.on_flow_event(event),
            TuiEvent::Tick => {
                app.tick_count += 1;
            }
        }
    }

    runner.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use mender_core::config::GraphConfig;
    use mender_graph::{
        ConcatCombiner, EchoExecutor, FlowDefinition, FlowGraph, FlowRunner, GraphController,
    };
    use mender_monitor::CenterView;

    fn controller(bus: Arc<EventBus>) -> GraphController {
        let graph = FlowGraph::build(FlowDefinition::triage()).unwrap();
        GraphController::new(graph, GraphConfig::default(), bus)
    }

    fn app() -> App {
        let bus = Arc::new(EventBus::default());
        let snapshot = FlowSnapshot::capture(&controller(bus.clone()));
        App::new(&AppConfig::default(), bus, snapshot)
    }

    #[test]
    fn test_parse_failure_form() {
        let input = parse_failure_form("tests/cart.spec.ts::adds item | locator not found").unwrap();
        assert_eq!(input.test_file, "tests/cart.spec.ts");
        assert_eq!(input.test_name, "adds item");
        assert_eq!(input.error_message, "locator not found");

        let bare = parse_failure_form("timeout in checkout").unwrap();
        assert_eq!(bare.test_file, "");
        assert_eq!(bare.error_message, "timeout in checkout");

        assert!(parse_failure_form("a.ts:: | boom").is_none());
        assert!(parse_failure_form("   ").is_none());
    }

    #[test]
    fn test_form_creates_and_queues_failure() {
        let mut app = app();
        let id = app.submit_failure_form("a.ts::b | c").unwrap();
        assert_eq!(app.store.failure(&id).unwrap().status, FailureStatus::Pending);
        assert_eq!(app.queue.front(), Some(&id));
        assert!(app.submit_failure_form("").is_none());
        assert!(app.notice.is_some());
    }

    #[test]
    fn test_cursor_and_detail() {
        let mut app = app();
        let first = app.submit_failure_form("a.ts::one | x").unwrap();
        let second = app.submit_failure_form("a.ts::two | y").unwrap();
        let ids = app.failure_ids();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first) && ids.contains(&second));

        app.open_highlighted();
        let shown = match app.layout.view(&app.store).center {
            CenterView::Detail { failure, .. } => failure.id.clone(),
            other => panic!("expected detail, got {:?}", other),
        };
        assert_eq!(shown, ids[0]);

        // Detail follows the cursor
        app.move_cursor(1);
        assert_eq!(app.store.selected_failure_id(), Some(&ids[1]));
        app.move_cursor(5);
        assert_eq!(app.cursor, 1);

        app.close_detail();
        assert!(matches!(
            app.layout.view(&app.store).center,
            CenterView::FullList { .. }
        ));
    }

    #[test]
    fn test_retry_goes_through_layout_handler() {
        let mut app = app();
        let id = app.submit_failure_form("a.ts::b | c").unwrap();
        app.queue.clear();

        // Pending failures cannot be retried
        app.retry_target();
        app.apply_intents();
        assert!(app.queue.is_empty());
        assert!(app.notice.as_deref().unwrap().contains("pending"));

        app.escalate_target();
        app.apply_intents();
        assert_eq!(app.store.failure(&id).unwrap().status, FailureStatus::Escalated);

        app.retry_target();
        app.apply_intents();
        let failure = app.store.failure(&id).unwrap();
        assert_eq!(failure.status, FailureStatus::Pending);
        assert_eq!(failure.retry_count, 1);
        assert_eq!(app.queue.front(), Some(&id));
    }

    #[tokio::test]
    async fn test_queued_failure_runs_through_flow() {
        let bus = Arc::new(EventBus::default());
        let runner = FlowRunner::new(
            controller(bus.clone()),
            Arc::new(EchoExecutor::new()),
            Arc::new(ConcatCombiner),
        );
        let (handle, _join) = runner.spawn();
        let mut app = App::new(&AppConfig::default(), bus, handle.snapshot());

        let id = app.submit_failure_form("tests/login.spec.ts::logs in | timeout").unwrap();
        app.pump(&handle).await.unwrap();
        let active = app.active.as_ref().unwrap();
        assert_eq!(active.failure_id, id);
        let run_id = active.run_id;
        assert_eq!(app.store.failure(&id).unwrap().status, FailureStatus::Running);

        let mut snapshots = handle.watch();
        let done = snapshots
            .wait_for(|s| s.run.as_ref().is_some_and(|r| r.run_id == run_id && r.outcome.is_some()))
            .await
            .unwrap()
            .clone();
        app.refresh(done);

        let failure = app.store.failure(&id).unwrap();
        assert_eq!(failure.status, FailureStatus::Completed);
        assert!(app.active.is_none());
        assert_eq!(failure.node_results["merge"]["status"], "complete");
        assert!(failure.node_results["fix"]["output"]
            .as_str()
            .unwrap()
            .contains("Propose fix"));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_older_than_submission_keeps_failure_running() {
        let bus = Arc::new(EventBus::default());
        let runner = FlowRunner::new(
            controller(bus.clone()),
            Arc::new(EchoExecutor::with_delay(Duration::from_secs(30))),
            Arc::new(ConcatCombiner),
        );
        let (handle, _join) = runner.spawn();
        let idle = handle.snapshot();
        let mut app = App::new(&AppConfig::default(), bus, idle.clone());

        let id = app.submit_failure_form("tests/cart.spec.ts::adds | detached").unwrap();
        app.pump(&handle).await.unwrap();

        // A snapshot taken before the run existed is not a reset
        app.refresh(idle.clone());
        assert_eq!(app.store.failure(&id).unwrap().status, FailureStatus::Running);
        assert_eq!(app.active_failure(), Some(&id));

        app.refresh(handle.snapshot());
        assert!(app.active.as_ref().unwrap().seen);

        // Once seen, losing the run settles the failure as failed
        handle.reset().await.unwrap();
        let mut snapshots = handle.watch();
        let cleared = snapshots.wait_for(|s| s.run.is_none()).await.unwrap().clone();
        app.refresh(cleared);
        assert_eq!(app.store.failure(&id).unwrap().status, FailureStatus::Failed);
        assert!(app.active.is_none());
        handle.shutdown().await.unwrap();
    }
}
