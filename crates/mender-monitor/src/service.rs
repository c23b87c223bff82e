use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use mender_core::config::MonitorConfig;
use mender_core::error::{MenderError, Result};
use mender_core::event::EventBus;
use mender_core::types::{FailureId, FailureStatus, FlowEvent, NodeStatus, OperatorIntent};

use crate::failure::{Failure, FailureInput, FailureStats};
use crate::store::{ActivityEvent, ActivityKind, MonitorStore};

/// Handles operator intents and workflow progress for failures.
///
/// Every change goes through [`MonitorStore::upsert_failure`] and is
/// announced on the event bus.
pub struct FailureService {
    bus: Arc<EventBus>,
    list_limit: usize,
}

impl FailureService {
    pub fn new(bus: Arc<EventBus>, config: &MonitorConfig) -> Self {
        Self {
            bus,
            list_limit: config.list_limit,
        }
    }

    /// Record a newly reported failure as `pending`.
    pub fn create(&self, store: &mut MonitorStore, input: FailureInput) -> Failure {
        let failure = Failure::new(input);
        info!(failure_id = %failure.id, test = %failure.title(), "Failure reported");
        store.push_activity(
            ActivityEvent::new(
                ActivityKind::FailureCreated,
                format!("New failure: {}", failure.title()),
            )
            .for_failure(&failure.id),
        );
        store.upsert_failure(failure.clone());
        self.bus.publish(FlowEvent::FailureCreated {
            failure_id: failure.id.clone(),
        });
        failure
    }

    /// Requeue a failed or escalated failure.
    pub fn retry(&self, store: &mut MonitorStore, id: &FailureId) -> Result<Failure> {
        let mut failure = lookup(store, id)?;
        if !failure.status.is_retryable() {
            return Err(MenderError::InvalidTransition {
                node: id.to_string(),
                from: failure.status.to_string(),
                to: FailureStatus::Pending.to_string(),
            });
        }

        failure.status = FailureStatus::Pending;
        failure.retry_count += 1;
        failure.node_results.clear();
        failure.current_node_id = None;
        failure.completed_at = None;
        failure.updated_at = Utc::now();
        info!(failure_id = %id, retry_count = failure.retry_count, "Failure requeued");

        store.push_activity(
            ActivityEvent::new(
                ActivityKind::Retried,
                format!("Retry #{} queued", failure.retry_count),
            )
            .for_failure(id),
        );
        Ok(self.save(store, failure))
    }

    /// Hand a failure over for manual review.
    pub fn escalate(&self, store: &mut MonitorStore, id: &FailureId) -> Result<Failure> {
        let mut failure = lookup(store, id)?;
        failure.status = FailureStatus::Escalated;
        failure.updated_at = Utc::now();
        warn!(failure_id = %id, "Failure escalated for manual review");

        store.push_activity(
            ActivityEvent::new(ActivityKind::Escalated, "Escalated for manual review").for_failure(id),
        );
        Ok(self.save(store, failure))
    }

    pub fn apply(&self, store: &mut MonitorStore, intent: OperatorIntent) -> Result<Failure> {
        match intent {
            OperatorIntent::Retry(id) => self.retry(store, &id),
            OperatorIntent::Escalate(id) => self.escalate(store, &id),
        }
    }

    /// A repair workflow picked up a pending failure.
    pub fn start_workflow(
        &self,
        store: &mut MonitorStore,
        id: &FailureId,
        workflow_id: &str,
    ) -> Result<Failure> {
        let mut failure = lookup(store, id)?;
        if failure.status != FailureStatus::Pending {
            return Err(MenderError::InvalidTransition {
                node: id.to_string(),
                from: failure.status.to_string(),
                to: FailureStatus::Running.to_string(),
            });
        }

        failure.status = FailureStatus::Running;
        failure.workflow_id = Some(workflow_id.to_string());
        failure.updated_at = Utc::now();
        info!(failure_id = %id, workflow_id, "Repair workflow started");

        store.push_activity(
            ActivityEvent::new(
                ActivityKind::WorkflowStarted,
                format!("Workflow {} started", workflow_id),
            )
            .for_failure(id),
        );
        Ok(self.save(store, failure))
    }

    /// Track a node of the running workflow.
    pub fn record_node(
        &self,
        store: &mut MonitorStore,
        id: &FailureId,
        node_id: &str,
        status: NodeStatus,
        output: Option<&str>,
    ) -> Result<()> {
        let mut failure = lookup(store, id)?;
        if failure.status != FailureStatus::Running {
            debug!(failure_id = %id, node_id, "Node update for a failure that is not running");
            return Ok(());
        }

        if status.is_active() {
            failure.current_node_id = Some(node_id.to_string());
        }
        failure.node_results.insert(
            node_id.to_string(),
            serde_json::json!({
                "status": status.as_str(),
                "output": output,
            }),
        );
        failure.updated_at = Utc::now();

        if status.is_terminal() {
            store.push_activity(
                ActivityEvent::new(ActivityKind::NodeUpdate, format!("{} {}", node_id, status))
                    .for_failure(id)
                    .for_node(node_id),
            );
        }
        store.upsert_failure(failure);
        Ok(())
    }

    /// The repair workflow resolved.
    pub fn finish_workflow(
        &self,
        store: &mut MonitorStore,
        id: &FailureId,
        succeeded: bool,
    ) -> Result<Failure> {
        let mut failure = lookup(store, id)?;
        let now = Utc::now();
        failure.status = if succeeded {
            FailureStatus::Completed
        } else {
            FailureStatus::Failed
        };
        failure.current_node_id = None;
        failure.completed_at = Some(now);
        failure.updated_at = now;
        info!(failure_id = %id, status = %failure.status, "Repair workflow finished");

        store.push_activity(
            ActivityEvent::new(
                ActivityKind::WorkflowFinished,
                format!("Workflow finished: {}", failure.status),
            )
            .for_failure(id),
        );
        Ok(self.save(store, failure))
    }

    pub fn stats(&self, store: &MonitorStore) -> FailureStats {
        FailureStats::from_failures(store.failures())
    }

    /// Newest first, capped at `limit` (or the configured list limit).
    pub fn list<'a>(
        &self,
        store: &'a MonitorStore,
        status: Option<FailureStatus>,
        limit: Option<usize>,
    ) -> Vec<&'a Failure> {
        store.list(status, limit.unwrap_or(self.list_limit))
    }

    fn save(&self, store: &mut MonitorStore, failure: Failure) -> Failure {
        store.upsert_failure(failure.clone());
        self.bus.publish(FlowEvent::FailureUpdated {
            failure_id: failure.id.clone(),
            status: failure.status,
        });
        failure
    }
}

fn lookup(store: &MonitorStore, id: &FailureId) -> Result<Failure> {
    store
        .failure(id)
        .cloned()
        .ok_or_else(|| MenderError::FailureNotFound(id.to_string()))
}
