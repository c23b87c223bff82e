use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one end-to-end execution of a flow.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First eight characters, for status bars and log lines.
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a failure record (`fail-` followed by 8 hex characters).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureId(pub String);

impl FailureId {
    pub fn generate() -> Self {
        Self(format!("fail-{}", &Uuid::new_v4().simple().to_string()[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FailureId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for FailureId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for FailureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle states shared by every graph node kind.
///
/// Trigger and task nodes use `Idle`, `Running`, `Success`, `Error`.
/// Join nodes use `Idle`, `Waiting`, `Aggregating`, `Complete`, `Error`.
#[derive(Debug, Clone, Copy, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Idle,
    Waiting,
    Running,
    Aggregating,
    Success,
    Complete,
    Error,
}

/// Coarse shape every node status maps onto.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Phase {
    Idle,
    Active,
    Terminal,
}

impl NodeStatus {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Idle => Phase::Idle,
            Self::Waiting | Self::Running | Self::Aggregating => Phase::Active,
            Self::Success | Self::Complete | Self::Error => Phase::Terminal,
        }
    }

    pub fn is_active(&self) -> bool {
        self.phase() == Phase::Active
    }

    pub fn is_terminal(&self) -> bool {
        self.phase() == Phase::Terminal
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Aggregating => "aggregating",
            Self::Success => "success",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing state of a failure record in the healing pipeline.
#[derive(Debug, Clone, Copy, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Escalated,
}

impl FailureStatus {
    pub const ALL: [FailureStatus; 5] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Escalated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Escalated => "escalated",
        }
    }

    /// Only failed or escalated failures may be requeued.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Failed | Self::Escalated)
    }
}

impl fmt::Display for FailureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown failure status: {}", s))
    }
}

/// A request emitted by a graph node for its controller to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Start a new run with the given (already trimmed) prompt.
    Submit { node_id: String, text: String },
}

/// A request emitted by the monitoring layout for the composition root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorIntent {
    Retry(FailureId),
    Escalate(FailureId),
}

/// Event broadcast to all subscribers of the flow `EventBus`.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// A trigger submission was accepted and a new run began.
    RunStarted { run_id: RunId, prompt: String },
    /// The run was reset before it resolved.
    RunSuperseded { run_id: RunId },
    /// A node moved to a new status.
    NodeStatusChanged {
        run_id: Option<RunId>,
        node_id: String,
        status: NodeStatus,
    },
    /// An upstream result landed in a join port.
    InputDelivered {
        run_id: RunId,
        join_id: String,
        source_id: String,
        received: usize,
        total: usize,
    },
    /// Every port of a join has been satisfied.
    JoinReady { run_id: RunId, join_id: String },
    /// A join exceeded the configured stall timeout.
    JoinStalled {
        run_id: RunId,
        join_id: String,
        waited_secs: u64,
    },
    /// A result arrived for a run that is no longer current.
    StaleResult { run_id: RunId, node_id: String },
    /// The run resolved.
    RunComplete {
        run_id: RunId,
        succeeded: bool,
        elapsed_ms: u64,
    },
    /// A failure record was created.
    FailureCreated { failure_id: FailureId },
    /// A failure record changed status.
    FailureUpdated {
        failure_id: FailureId,
        status: FailureStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_status_phases() {
        assert_eq!(NodeStatus::Idle.phase(), Phase::Idle);
        assert!(NodeStatus::Waiting.is_active());
        assert!(NodeStatus::Aggregating.is_active());
        assert!(NodeStatus::Running.is_active());
        assert!(NodeStatus::Complete.is_terminal());
        assert!(NodeStatus::Success.is_terminal());
        assert!(NodeStatus::Error.is_terminal());
    }

    #[test]
    fn test_node_status_serializes_lowercase() {
        let json = serde_json::to_string(&NodeStatus::Aggregating).unwrap();
        assert_eq!(json, "\"aggregating\"");
        let parsed: NodeStatus = serde_json::from_str("\"waiting\"").unwrap();
        assert_eq!(parsed, NodeStatus::Waiting);
    }

    #[test]
    fn test_failure_id_format() {
        let id = FailureId::generate();
        assert!(id.as_str().starts_with("fail-"));
        assert_eq!(id.as_str().len(), 13);
    }

    #[test]
    fn test_failure_status_parse() {
        assert_eq!("failed".parse::<FailureStatus>(), Ok(FailureStatus::Failed));
        assert!("bogus".parse::<FailureStatus>().is_err());
        assert!(FailureStatus::Escalated.is_retryable());
        assert!(!FailureStatus::Running.is_retryable());
    }

    #[test]
    fn test_run_id_short() {
        let id = RunId::new();
        assert_eq!(id.short().len(), 8);
    }
}
