use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mender_core::types::{FailureId, FailureStatus};

type JsonMap = serde_json::Map<String, serde_json::Value>;

/// A failing test reported to the fleet, and its repair progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub id: FailureId,
    pub test_file: String,
    pub test_name: String,
    pub error_message: String,
    #[serde(default)]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default)]
    pub actual: Option<String>,
    #[serde(default)]
    pub context: JsonMap,
    #[serde(default)]
    pub status: FailureStatus,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub current_node_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    /// Per-node results of the last workflow run, keyed by node id.
    #[serde(default)]
    pub node_results: JsonMap,
}

/// Fields supplied when reporting a new failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FailureInput {
    pub test_file: String,
    pub test_name: String,
    pub error_message: String,
    #[serde(default)]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default)]
    pub actual: Option<String>,
    #[serde(default)]
    pub context: JsonMap,
    #[serde(default)]
    pub workflow_id: Option<String>,
}

impl Failure {
    pub fn new(input: FailureInput) -> Self {
        Self::from_input(FailureId::generate(), input, Utc::now())
    }

    pub fn from_input(id: FailureId, input: FailureInput, now: DateTime<Utc>) -> Self {
        Self {
            id,
            test_file: input.test_file,
            test_name: input.test_name,
            error_message: input.error_message,
            stack_trace: input.stack_trace,
            expected: input.expected,
            actual: input.actual,
            context: input.context,
            status: FailureStatus::Pending,
            workflow_id: input.workflow_id,
            current_node_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            retry_count: 0,
            node_results: JsonMap::new(),
        }
    }

    /// `file::name`, as shown in lists.
    pub fn title(&self) -> String {
        if self.test_file.is_empty() {
            self.test_name.clone()
        } else {
            format!("{}::{}", self.test_file, self.test_name)
        }
    }

    /// Prompt handed to the repair workflow.
    pub fn prompt(&self) -> String {
        let mut prompt = format!("{} failed: {}", self.title(), self.error_message);
        if let (Some(expected), Some(actual)) = (&self.expected, &self.actual) {
            prompt.push_str(&format!("\nexpected: {}\nactual: {}", expected, actual));
        }
        if let Some(trace) = &self.stack_trace {
            prompt.push('\n');
            prompt.push_str(trace);
        }
        prompt
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, FailureStatus::Completed | FailureStatus::Failed)
    }
}

/// Aggregate counts over the failure store.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FailureStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub escalated: usize,
    /// `completed / (completed + failed)` as a percentage, one decimal.
    pub success_rate: f64,
}

impl FailureStats {
    pub fn from_failures<'a>(failures: impl IntoIterator<Item = &'a Failure>) -> Self {
        let mut stats = Self::default();
        for failure in failures {
            stats.total += 1;
            match failure.status {
                FailureStatus::Pending => stats.pending += 1,
                FailureStatus::Running => stats.running += 1,
                FailureStatus::Completed => stats.completed += 1,
                FailureStatus::Failed => stats.failed += 1,
                FailureStatus::Escalated => stats.escalated += 1,
            }
        }
        let finished = stats.completed + stats.failed;
        if finished > 0 {
            let rate = stats.completed as f64 / finished as f64 * 100.0;
            stats.success_rate = (rate * 10.0).round() / 10.0;
        }
        stats
    }

    pub fn count(&self, status: FailureStatus) -> usize {
        match status {
            FailureStatus::Pending => self.pending,
            FailureStatus::Running => self.running,
            FailureStatus::Completed => self.completed,
            FailureStatus::Failed => self.failed,
            FailureStatus::Escalated => self.escalated,
        }
    }
}
