use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use mender_core::error::{MenderError, Result};
use mender_core::types::NodeStatus;

/// Stable port identity for the input at `ordinal`.
pub fn port_id(ordinal: usize) -> String {
    format!("input-{}", ordinal)
}

/// A labeled input position on a join, bound to exactly one upstream producer.
///
/// The ordinal comes from the flow topology (edge order), never from the
/// order in which results arrive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSlot {
    pub source_id: String,
    pub ordinal: usize,
    pub received: bool,
    pub content: Option<String>,
}

impl InputSlot {
    pub fn new(source_id: impl Into<String>, ordinal: usize) -> Self {
        Self {
            source_id: source_id.into(),
            ordinal,
            received: false,
            content: None,
        }
    }

    pub fn port_id(&self) -> String {
        port_id(self.ordinal)
    }

    fn clear(&mut self) {
        self.received = false;
        self.content = None;
    }
}

/// Outcome of delivering an upstream result into a join port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Some ports are still empty.
    Pending { received: usize, total: usize },
    /// The last port was filled; the join is now aggregating.
    Ready,
    /// The port had already received a result during this run.
    Duplicate,
}

/// Aggregation barrier over a fixed, ordered set of input ports.
///
/// `idle -> waiting -> aggregating -> complete`, with `error` reachable from
/// the two active states. The combined result is present exactly when the
/// node is `complete`.
#[derive(Debug, Clone)]
pub struct JoinNode {
    pub id: String,
    pub label: String,
    slots: Vec<InputSlot>,
    status: NodeStatus,
    result: Option<String>,
    waiting_since: Option<Instant>,
}

impl JoinNode {
    /// Create a join with one port per source, ordinals in iteration order.
    ///
    /// A join needs at least one source.
    pub fn new<S: Into<String>>(
        id: impl Into<String>,
        label: impl Into<String>,
        sources: impl IntoIterator<Item = S>,
    ) -> Result<Self> {
        let id = id.into();
        let slots: Vec<InputSlot> = sources
            .into_iter()
            .enumerate()
            .map(|(ordinal, source)| InputSlot::new(source, ordinal))
            .collect();
        if slots.is_empty() {
            return Err(MenderError::InvalidEdge {
                from: String::new(),
                to: id,
                reason: "join has no inputs".into(),
            });
        }
        Ok(Self {
            id,
            label: label.into(),
            slots,
            status: NodeStatus::Idle,
            result: None,
            waiting_since: None,
        })
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn slots(&self) -> &[InputSlot] {
        &self.slots
    }

    pub fn total(&self) -> usize {
        self.slots.len()
    }

    pub fn received_count(&self) -> usize {
        self.slots.iter().filter(|s| s.received).count()
    }

    pub fn all_received(&self) -> bool {
        self.slots.iter().all(|s| s.received)
    }

    pub fn slot_for(&self, source_id: &str) -> Option<&InputSlot> {
        self.slots.iter().find(|s| s.source_id == source_id)
    }

    /// Discard everything from the previous run and start waiting.
    pub fn begin_run(&mut self, now: Instant) {
        self.clear();
        self.status = NodeStatus::Waiting;
        self.waiting_since = Some(now);
    }

    /// Record the result of upstream `source_id`.
    pub fn deliver(&mut self, source_id: &str, content: Option<String>) -> Result<Delivery> {
        let idx = self
            .slots
            .iter()
            .position(|s| s.source_id == source_id)
            .ok_or_else(|| MenderError::UnknownPort {
                join: self.id.clone(),
                source_id: source_id.to_string(),
            })?;

        if self.slots[idx].received {
            return Ok(Delivery::Duplicate);
        }
        if self.status != NodeStatus::Waiting {
            return Err(self.transition_error(NodeStatus::Waiting));
        }

        let slot = &mut self.slots[idx];
        slot.received = true;
        slot.content = content;

        if self.all_received() {
            self.status = NodeStatus::Aggregating;
            self.waiting_since = None;
            Ok(Delivery::Ready)
        } else {
            Ok(Delivery::Pending {
                received: self.received_count(),
                total: self.total(),
            })
        }
    }

    /// Store the combined result. Only valid while aggregating.
    pub fn complete(&mut self, result: impl Into<String>) -> Result<()> {
        if self.status != NodeStatus::Aggregating {
            return Err(self.transition_error(NodeStatus::Complete));
        }
        self.status = NodeStatus::Complete;
        self.result = Some(result.into());
        Ok(())
    }

    /// Mark the join failed (stall timeout or failed combination).
    pub fn fail(&mut self) -> Result<()> {
        if !matches!(self.status, NodeStatus::Waiting | NodeStatus::Aggregating) {
            return Err(self.transition_error(NodeStatus::Error));
        }
        self.status = NodeStatus::Error;
        self.waiting_since = None;
        Ok(())
    }

    /// Return to idle, clearing all ports.
    pub fn reset(&mut self) {
        self.clear();
        self.status = NodeStatus::Idle;
    }

    /// How long the join has been waiting, if it is waiting.
    pub fn waited(&self, now: Instant) -> Option<Duration> {
        match (self.status, self.waiting_since) {
            (NodeStatus::Waiting, Some(since)) => Some(now.saturating_duration_since(since)),
            _ => None,
        }
    }

    /// Check the structural invariants of the barrier.
    pub fn invariants_hold(&self) -> bool {
        let result_matches = self.result.is_some() == (self.status == NodeStatus::Complete);
        let gate_respected = match self.status {
            NodeStatus::Aggregating | NodeStatus::Complete => self.all_received(),
            NodeStatus::Waiting => !self.all_received(),
            _ => true,
        };
        result_matches && gate_respected && self.received_count() <= self.total()
    }

    fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.clear();
        }
        self.result = None;
        self.waiting_since = None;
    }

    fn transition_error(&self, to: NodeStatus) -> MenderError {
        MenderError::InvalidTransition {
            node: self.id.clone(),
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }
}
