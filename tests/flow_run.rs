use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use mender_core::config::{GraphConfig, JoinStallPolicy};
use mender_core::error::{MenderError, Result};
use mender_core::event::EventBus;
use mender_core::types::{FlowEvent, NodeStatus};
use mender_graph::{
    ConcatCombiner, EchoExecutor, FlowDefinition, FlowGraph, FlowRunner, GraphController,
    RunnerHandle, TaskExecutor, TaskRequest,
};

const REVIEW_FLOW: &str = r#"{
  "id": "review",
  "name": "Review",
  "nodes": [
    { "id": "start", "kind": "trigger", "label": "Describe" },
    { "id": "logs", "kind": "task", "label": "Read logs", "instruction": "logs for {{input}}" },
    { "id": "diff", "kind": "task", "label": "Read diff", "instruction": "diff for {{input}}" },
    { "id": "gather", "kind": "join", "label": "Gather" },
    { "id": "report", "kind": "task", "label": "Report", "instruction": "report:\n{{gather}}" }
  ],
  "edges": [
    { "from": "start", "to": "logs" },
    { "from": "start", "to": "diff" },
    { "from": "diff", "to": "gather", "condition": { "type": "on_success" } },
    { "from": "logs", "to": "gather", "condition": { "type": "on_success" } },
    { "from": "gather", "to": "report" }
  ]
}"#;

/// Fails every task whose id is listed.
struct FailingExecutor {
    fail: Vec<&'static str>,
}

impl TaskExecutor for FailingExecutor {
    fn execute(&self, request: TaskRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            if self.fail.contains(&request.node_id.as_str()) {
                return Err(MenderError::Execution {
                    node: request.node_id,
                    message: "agent crashed".into(),
                });
            }
            Ok(format!("ok from {}", request.node_id))
        })
    }
}

fn spawn(
    def: FlowDefinition,
    config: GraphConfig,
    executor: Arc<dyn TaskExecutor>,
) -> (RunnerHandle, Arc<EventBus>) {
    let bus = Arc::new(EventBus::default());
    let graph = FlowGraph::build(def).expect("valid flow");
    let controller = GraphController::new(graph, config, bus.clone());
    let runner = FlowRunner::new(controller, executor, Arc::new(ConcatCombiner))
        .with_tick(Duration::from_millis(10));
    let (handle, _join) = runner.spawn();
    (handle, bus)
}

fn load_review_flow() -> FlowDefinition {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(REVIEW_FLOW.as_bytes()).expect("write flow");
    FlowDefinition::load(tmp.path()).expect("load flow")
}

#[tokio::test]
async fn test_flow_file_runs_to_completion() {
    let (handle, _bus) = spawn(
        load_review_flow(),
        GraphConfig::default(),
        Arc::new(EchoExecutor::new()),
    );

    let snap = tokio::time::timeout(Duration::from_secs(5), handle.run_to_completion("checkout"))
        .await
        .expect("run settles")
        .expect("run completes");

    assert_eq!(snap.flow_id, "review");
    assert_eq!(snap.run.as_ref().unwrap().outcome, Some(true));

    // Port order follows edge order, not node order
    let gather = snap.join("gather").unwrap();
    assert_eq!(gather.status, NodeStatus::Complete);
    let sources: Vec<_> = gather.ports.iter().map(|p| p.source_id.as_str()).collect();
    assert_eq!(sources, vec!["diff", "logs"]);
    let result = gather.result.as_deref().unwrap();
    assert_eq!(
        result,
        "## diff\n[Read diff] diff for checkout\n\n## logs\n[Read logs] logs for checkout"
    );

    let report = snap.task("report").unwrap();
    assert_eq!(report.status, NodeStatus::Success);
    assert!(report.output.as_deref().unwrap().starts_with("[Report] report:\n## diff"));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_events_follow_barrier_order() {
    let (handle, bus) = spawn(
        load_review_flow(),
        GraphConfig::default(),
        Arc::new(EchoExecutor::new()),
    );
    let mut rx = bus.subscribe();
    handle.submit_text("flaky search").await.unwrap().unwrap();

    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event arrives")
            .expect("bus open");
        let done = matches!(event, FlowEvent::RunComplete { .. });
        events.push(event);
        if done {
            break;
        }
    }

    let position = |pred: &dyn Fn(&FlowEvent) -> bool| events.iter().position(|e| pred(e)).unwrap();
    let started = position(&|e| matches!(e, FlowEvent::RunStarted { .. }));
    let first_delivery = position(&|e| matches!(e, FlowEvent::InputDelivered { .. }));
    let ready = position(&|e| matches!(e, FlowEvent::JoinReady { .. }));
    assert!(started < first_delivery);
    assert!(first_delivery < ready);

    let received: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            FlowEvent::InputDelivered { received, total, .. } => {
                assert_eq!(*total, 2);
                Some(*received)
            }
            _ => None,
        })
        .collect();
    assert_eq!(received, vec![1, 2]);

    assert!(matches!(
        events.last(),
        Some(FlowEvent::RunComplete { succeeded: true, .. })
    ));
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_branch_with_stall_timeout() {
    let config = GraphConfig {
        join_stall: JoinStallPolicy::FailAfterSecs(1),
        ..Default::default()
    };
    let (handle, _bus) = spawn(
        load_review_flow(),
        config,
        Arc::new(FailingExecutor { fail: vec!["logs"] }),
    );

    let snap = tokio::time::timeout(Duration::from_secs(5), handle.run_to_completion("x"))
        .await
        .expect("run settles")
        .expect("run completes");

    assert_eq!(snap.run.as_ref().unwrap().outcome, Some(false));
    let logs = snap.task("logs").unwrap();
    assert_eq!(logs.status, NodeStatus::Error);
    assert!(logs.error.as_deref().unwrap().contains("agent crashed"));

    // The join keeps what it got, but never combines
    let gather = snap.join("gather").unwrap();
    assert_eq!(gather.status, NodeStatus::Error);
    assert_eq!(gather.received, 1);
    assert!(gather.result.is_none());
    assert_eq!(snap.task("report").unwrap().status, NodeStatus::Idle);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reset_then_submit_starts_fresh_run() {
    let (handle, _bus) = spawn(
        load_review_flow(),
        GraphConfig::default(),
        Arc::new(EchoExecutor::with_delay(Duration::from_millis(200))),
    );

    let first = handle.submit_text("first").await.unwrap().unwrap();
    handle.reset().await.unwrap();
    let snap = handle.run_to_completion("second").await.unwrap();

    let run = snap.run.as_ref().unwrap();
    assert_ne!(run.run_id, first);
    assert_eq!(run.prompt, "second");
    assert!(snap
        .task("logs")
        .unwrap()
        .output
        .as_deref()
        .unwrap()
        .ends_with("second"));

    handle.shutdown().await.unwrap();
}

#[test]
fn test_invalid_flow_files_are_rejected() {
    let cyclic = r#"{
      "id": "loop", "name": "Loop",
      "nodes": [
        { "id": "start", "kind": "trigger" },
        { "id": "a", "kind": "task" },
        { "id": "b", "kind": "task" }
      ],
      "edges": [
        { "from": "start", "to": "a" },
        { "from": "a", "to": "b" },
        { "from": "b", "to": "a" }
      ]
    }"#;
    let def = FlowDefinition::from_json(cyclic).unwrap();
    assert!(matches!(FlowGraph::build(def), Err(MenderError::Cycle(_))));

    let headless = r#"{ "id": "x", "name": "X", "nodes": [ { "id": "a", "kind": "task" } ] }"#;
    let def = FlowDefinition::from_json(headless).unwrap();
    assert!(matches!(
        FlowGraph::build(def),
        Err(MenderError::MissingTrigger(0))
    ));

    assert!(matches!(
        FlowDefinition::from_json("{ not json"),
        Err(MenderError::Json(_))
    ));
}
