use std::sync::{mpsc, Arc};

use mender_core::config::MonitorConfig;
use mender_core::event::EventBus;
use mender_core::types::{FailureId, FailureStatus, FlowEvent, NodeStatus, OperatorIntent};
use mender_monitor::{
    ActivityKind, CenterView, FailureInput, FailureService, MonitorStore, MonitoringLayout,
};

fn report(service: &FailureService, store: &mut MonitorStore, name: &str) -> FailureId {
    service
        .create(
            store,
            FailureInput {
                test_file: "tests/checkout.spec.ts".into(),
                test_name: name.into(),
                error_message: format!("{} timed out", name),
                ..Default::default()
            },
        )
        .id
}

/// Layout wired to a channel, the way the terminal UI wires it.
fn wired_layout(config: &MonitorConfig) -> (MonitoringLayout, mpsc::Receiver<OperatorIntent>) {
    let (tx, rx) = mpsc::channel();
    let escalate_tx = tx.clone();
    let layout = MonitoringLayout::new(config)
        .with_retry_handler(move |id| {
            let _ = tx.send(OperatorIntent::Retry(id.clone()));
        })
        .with_escalate_handler(move |id| {
            let _ = escalate_tx.send(OperatorIntent::Escalate(id.clone()));
        });
    (layout, rx)
}

#[test]
fn test_select_detail_and_back_to_list() {
    let config = MonitorConfig {
        collapsed_rows: 2,
        ..Default::default()
    };
    let service = FailureService::new(Arc::new(EventBus::default()), &config);
    let mut store = MonitorStore::new(config.max_activity);
    let (layout, _rx) = wired_layout(&config);

    let ids: Vec<FailureId> = ["pays", "ships", "refunds"]
        .iter()
        .map(|name| report(&service, &mut store, name))
        .collect();

    match layout.view(&store).center {
        CenterView::FullList { failures } => assert_eq!(failures.len(), 3),
        other => panic!("expected full list, got {:?}", other),
    }

    layout.select(&mut store, ids[1].clone());
    match layout.view(&store).center {
        CenterView::Detail { collapsed, failure } => {
            assert_eq!(failure.id, ids[1]);
            assert_eq!(failure.title(), "tests/checkout.spec.ts::ships");
            assert_eq!(collapsed.len(), 2);
            assert!(collapsed.iter().any(|f| f.id == ids[1]));
        }
        other => panic!("expected detail, got {:?}", other),
    }

    layout.close_detail(&mut store);
    assert!(matches!(
        layout.view(&store).center,
        CenterView::FullList { .. }
    ));
}

#[test]
fn test_operator_intents_round_trip_through_service() {
    let config = MonitorConfig::default();
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe();
    let service = FailureService::new(bus, &config);
    let mut store = MonitorStore::new(config.max_activity);
    let (layout, intents) = wired_layout(&config);

    let id = report(&service, &mut store, "pays");
    service.start_workflow(&mut store, &id, "triage").unwrap();
    service
        .record_node(&mut store, &id, "stack", NodeStatus::Error, Some("crash"))
        .unwrap();
    service.finish_workflow(&mut store, &id, false).unwrap();

    // The layout only forwards; state is untouched until the service acts
    assert!(layout.retry(&id));
    assert_eq!(store.failure(&id).unwrap().status, FailureStatus::Failed);

    let intent = intents.try_recv().expect("retry forwarded");
    assert_eq!(intent, OperatorIntent::Retry(id.clone()));
    let retried = service.apply(&mut store, intent).unwrap();
    assert_eq!(retried.status, FailureStatus::Pending);
    assert_eq!(retried.retry_count, 1);

    assert!(layout.escalate(&id));
    let escalated = service
        .apply(&mut store, intents.try_recv().expect("escalate forwarded"))
        .unwrap();
    assert_eq!(escalated.status, FailureStatus::Escalated);

    let kinds: Vec<ActivityKind> = store.activity().map(|a| a.kind).collect();
    assert_eq!(kinds.first(), Some(&ActivityKind::Escalated));
    assert!(kinds.contains(&ActivityKind::Retried));
    assert!(kinds.contains(&ActivityKind::NodeUpdate));

    let mut updates = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let FlowEvent::FailureUpdated { status, .. } = event {
            updates.push(status);
        }
    }
    assert_eq!(
        updates,
        vec![
            FailureStatus::Running,
            FailureStatus::Failed,
            FailureStatus::Pending,
            FailureStatus::Escalated,
        ]
    );
}

#[test]
fn test_activity_log_is_bounded() {
    let config = MonitorConfig {
        max_activity: 3,
        ..Default::default()
    };
    let service = FailureService::new(Arc::new(EventBus::default()), &config);
    let mut store = MonitorStore::new(config.max_activity);

    for name in ["a", "b", "c", "d", "e"] {
        report(&service, &mut store, name);
    }
    let messages: Vec<&str> = store.activity().map(|a| a.message.as_str()).collect();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0], "New failure: tests/checkout.spec.ts::e");
}
