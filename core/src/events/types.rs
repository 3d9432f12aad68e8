//! Progress event types.
//!
//! Events are append-only: once published they are never mutated. `seq` is
//! assigned by the bus, strictly increasing per migration starting at 1,
//! so one subscriber always observes a totally ordered stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::types::{MigrationId, WorkerKind};

/// All event kinds the core emits. The last three are terminal: a
/// subscription stream ends after delivering exactly one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStart,
    PhaseEnter,
    /// A reasoner call is in flight.
    WorkerThinking,
    /// A repo gateway or container runtime call.
    ToolUse,
    /// One validation stage finished.
    StageResult,
    WorkerDone,
    RetryScheduled,
    Succeeded,
    Failed,
    Escalated,
}

impl EventKind {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Escalated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowStart => "workflow_start",
            Self::PhaseEnter => "phase_enter",
            Self::WorkerThinking => "worker_thinking",
            Self::ToolUse => "tool_use",
            Self::StageResult => "stage_result",
            Self::WorkerDone => "worker_done",
            Self::RetryScheduled => "retry_scheduled",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Escalated => "escalated",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress event as observed by subscribers and persisted to the
/// event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub migration_id: MigrationId,
    /// Monotonic per migration, starting at 1.
    pub seq: u64,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_worker: Option<WorkerKind>,
    /// Opaque to the bus; consumers decode by `kind`.
    #[serde(default)]
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
}

/// An event before the bus has assigned its identity (seq, timestamp).
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub kind: EventKind,
    pub source_worker: Option<WorkerKind>,
    pub payload: serde_json::Value,
}

impl EventDraft {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            source_worker: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn from_worker(kind: EventKind, worker: WorkerKind) -> Self {
        Self {
            kind,
            source_worker: Some(worker),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Seal the draft into a published event.
    pub fn into_event(self, migration_id: MigrationId, seq: u64) -> Event {
        Event {
            migration_id,
            seq,
            kind: self.kind,
            source_worker: self.source_worker,
            payload: self.payload,
            ts: Utc::now(),
        }
    }
}
