use mender_core::error::{MenderError, Result};
use mender_core::types::NodeStatus;

/// Intermediate processing node: `idle -> running -> success | error`.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub id: String,
    pub label: String,
    /// Optional instruction template; `{{key}}` placeholders are filled from
    /// the run context before dispatch.
    pub instruction: Option<String>,
    status: NodeStatus,
    output: Option<String>,
    error: Option<String>,
}

impl TaskNode {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            instruction: None,
            status: NodeStatus::Idle,
            output: None,
            error: None,
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub(crate) fn start(&mut self) -> Result<()> {
        self.expect(NodeStatus::Idle, NodeStatus::Running)?;
        self.status = NodeStatus::Running;
        Ok(())
    }

    pub(crate) fn succeed(&mut self, output: impl Into<String>) -> Result<()> {
        self.expect(NodeStatus::Running, NodeStatus::Success)?;
        self.status = NodeStatus::Success;
        self.output = Some(output.into());
        Ok(())
    }

    pub(crate) fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.expect(NodeStatus::Running, NodeStatus::Error)?;
        self.status = NodeStatus::Error;
        self.error = Some(error.into());
        Ok(())
    }

    pub(crate) fn reset(&mut self) {
        self.status = NodeStatus::Idle;
        self.output = None;
        self.error = None;
    }

    fn expect(&self, from: NodeStatus, to: NodeStatus) -> Result<()> {
        if self.status == from {
            Ok(())
        } else {
            Err(MenderError::InvalidTransition {
                node: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            })
        }
    }
}
