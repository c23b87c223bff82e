use mender_core::error::{MenderError, Result};
use mender_core::types::{Intent, NodeStatus};

/// Start-of-workflow node: holds an editable draft prompt and fires a single
/// `Submit` intent. It never moves its own status; the controller does.
#[derive(Debug, Clone)]
pub struct TriggerNode {
    pub id: String,
    pub label: String,
    draft: String,
    status: NodeStatus,
}

impl TriggerNode {
    pub fn new(id: impl Into<String>, label: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            draft: prompt.into(),
            status: NodeStatus::Idle,
        }
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    /// The draft is locked while the triggered run is in flight.
    pub fn is_editable(&self) -> bool {
        self.status != NodeStatus::Running
    }

    pub fn can_submit(&self) -> bool {
        self.is_editable() && !self.draft.trim().is_empty()
    }

    /// Replace the draft. Returns `false` (and changes nothing) while running.
    pub fn edit(&mut self, text: impl Into<String>) -> bool {
        if !self.is_editable() {
            return false;
        }
        self.draft = text.into();
        true
    }

    /// Produce a submit intent carrying the trimmed draft, if allowed.
    pub fn submit(&self) -> Option<Intent> {
        if !self.can_submit() {
            return None;
        }
        Some(Intent::Submit {
            node_id: self.id.clone(),
            text: self.draft.trim().to_string(),
        })
    }

    pub(crate) fn set_status(&mut self, status: NodeStatus) -> Result<()> {
        match status {
            NodeStatus::Idle | NodeStatus::Running | NodeStatus::Success | NodeStatus::Error => {
                self.status = status;
                Ok(())
            }
            other => Err(MenderError::InvalidStatus {
                node: self.id.clone(),
                kind: "trigger".to_string(),
                status: other.to_string(),
            }),
        }
    }

    pub(crate) fn reset(&mut self) {
        self.status = NodeStatus::Idle;
    }
}
