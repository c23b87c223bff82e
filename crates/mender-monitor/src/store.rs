use std::cmp::Reverse;
use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mender_core::types::{FailureId, FailureStatus};

use crate::failure::Failure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    FailureCreated,
    Retried,
    Escalated,
    WorkflowStarted,
    NodeUpdate,
    WorkflowFinished,
}

/// One entry in the activity feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: ActivityKind,
    pub failure_id: Option<FailureId>,
    pub node_id: Option<String>,
    pub message: String,
}

impl ActivityEvent {
    pub fn new(kind: ActivityKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            failure_id: None,
            node_id: None,
            message: message.into(),
        }
    }

    pub fn for_failure(mut self, id: &FailureId) -> Self {
        self.failure_id = Some(id.clone());
        self
    }

    pub fn for_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }
}

/// Shared monitoring state: failures, the current selection, and the
/// activity feed.
///
/// Each field has exactly one mutator so every write can be traced to a
/// single call site.
#[derive(Debug, Clone)]
pub struct MonitorStore {
    failures: Vec<Failure>,
    selected_failure_id: Option<FailureId>,
    activity: VecDeque<ActivityEvent>,
    max_activity: usize,
}

impl Default for MonitorStore {
    fn default() -> Self {
        Self::new(100)
    }
}

impl MonitorStore {
    pub fn new(max_activity: usize) -> Self {
        Self {
            failures: Vec::new(),
            selected_failure_id: None,
            activity: VecDeque::new(),
            max_activity,
        }
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    pub fn failure(&self, id: &FailureId) -> Option<&Failure> {
        self.failures.iter().find(|f| &f.id == id)
    }

    /// Insert a failure, or replace the record with the same id.
    pub fn upsert_failure(&mut self, failure: Failure) {
        match self.failures.iter_mut().find(|f| f.id == failure.id) {
            Some(existing) => *existing = failure,
            None => self.failures.push(failure),
        }
    }

    pub fn selected_failure_id(&self) -> Option<&FailureId> {
        self.selected_failure_id.as_ref()
    }

    pub fn set_selected_failure_id(&mut self, id: Option<FailureId>) {
        self.selected_failure_id = id;
    }

    /// The selected failure, if the selection resolves to one.
    pub fn selected_failure(&self) -> Option<&Failure> {
        self.selected_failure_id
            .as_ref()
            .and_then(|id| self.failure(id))
    }

    /// Failures newest first, optionally filtered by status.
    pub fn list(&self, status: Option<FailureStatus>, limit: usize) -> Vec<&Failure> {
        let mut list: Vec<&Failure> = self
            .failures
            .iter()
            .rev()
            .filter(|f| status.map_or(true, |s| f.status == s))
            .collect();
        list.sort_by_key(|f| Reverse(f.created_at));
        list.truncate(limit);
        list
    }

    /// Activity entries, newest first.
    pub fn activity(&self) -> impl Iterator<Item = &ActivityEvent> {
        self.activity.iter()
    }

    pub fn push_activity(&mut self, event: ActivityEvent) {
        self.activity.push_front(event);
        self.activity.truncate(self.max_activity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::failure::FailureInput;

    fn failure(id: &str, minutes_ago: i64) -> Failure {
        Failure::from_input(
            FailureId::from(id),
            FailureInput {
                test_name: id.into(),
                ..Default::default()
            },
            Utc::now() - Duration::minutes(minutes_ago),
        )
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let mut store = MonitorStore::default();
        store.upsert_failure(failure("fail-a", 0));
        let mut updated = failure("fail-a", 0);
        updated.status = FailureStatus::Escalated;
        store.upsert_failure(updated);
        assert_eq!(store.failures().len(), 1);
        assert_eq!(
            store.failure(&"fail-a".into()).unwrap().status,
            FailureStatus::Escalated
        );
    }

    #[test]
    fn test_list_newest_first_with_filter_and_limit() {
        let mut store = MonitorStore::default();
        store.upsert_failure(failure("fail-old", 30));
        store.upsert_failure(failure("fail-new", 1));
        let mut mid = failure("fail-mid", 10);
        mid.status = FailureStatus::Failed;
        store.upsert_failure(mid);

        let ids: Vec<_> = store.list(None, 50).iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["fail-new", "fail-mid", "fail-old"]);

        let failed = store.list(Some(FailureStatus::Failed), 50);
        assert_eq!(failed.len(), 1);
        assert_eq!(store.list(None, 2).len(), 2);
    }

    #[test]
    fn test_selection_of_missing_failure_does_not_resolve() {
        let mut store = MonitorStore::default();
        store.upsert_failure(failure("fail-a", 0));
        store.set_selected_failure_id(Some("fail-zz".into()));
        assert!(store.selected_failure_id().is_some());
        assert!(store.selected_failure().is_none());

        store.set_selected_failure_id(Some("fail-a".into()));
        assert_eq!(store.selected_failure().unwrap().id.as_str(), "fail-a");
    }

    #[test]
    fn test_activity_is_bounded_newest_first() {
        let mut store = MonitorStore::new(3);
        for i in 0..5 {
            store.push_activity(ActivityEvent::new(ActivityKind::NodeUpdate, format!("event {}", i)));
        }
        let messages: Vec<_> = store.activity().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["event 4", "event 3", "event 2"]);
    }
}
