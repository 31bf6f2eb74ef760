pub mod runner;
pub mod stream;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// No further events will be appended once an execution reaches one of
    /// these.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// A run of a whole flow (composite) or of a single block (direct).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    /// Child executions, one per node, in start order.
    #[serde(default)]
    pub node_executions: Vec<NodeExecutionState>,
}

impl Execution {
    pub fn for_flow(id: impl Into<String>, flow_id: impl Into<String>, input: Value) -> Self {
        Self::pending(id.into(), Some(flow_id.into()), None, input)
    }

    pub fn for_block(id: impl Into<String>, block_id: impl Into<String>, input: Value) -> Self {
        Self::pending(id.into(), None, Some(block_id.into()), input)
    }

    fn pending(
        id: String,
        flow_id: Option<String>,
        block_id: Option<String>,
        input: Value,
    ) -> Self {
        Self {
            id,
            flow_id,
            block_id,
            status: ExecutionStatus::Pending,
            input,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            created_at: Utc::now(),
            node_executions: Vec::new(),
        }
    }

    /// Flow executions aggregate the event logs of their node executions.
    pub fn is_composite(&self) -> bool {
        self.flow_id.is_some()
    }

    /// Apply a status transition, stamping start and completion times.
    pub fn transition(&mut self, status: ExecutionStatus, error: Option<String>) {
        let now = Utc::now();
        if status == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_terminal() {
            self.completed_at = Some(now);
            self.duration_ms = self
                .started_at
                .map(|started| (now - started).num_milliseconds());
        }
        self.status = status;
        if error.is_some() {
            self.error = error;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionState {
    /// Id of the child execution whose event log belongs to this node.
    pub execution_id: String,
    pub node_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

impl NodeExecutionState {
    pub fn started(execution_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            node_id: node_id.into(),
            status: ExecutionStatus::Running,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_ms: None,
        }
    }
}

/// One entry of an execution's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub execution_id: String,
    /// Assigned by the store on append; strictly increasing from 0.
    pub index: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

/// Which part of an event log to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRange {
    /// Events with `index >= n`.
    From(u64),
    /// Events with `index > n`.
    After(u64),
}

impl EventRange {
    pub fn contains(self, index: u64) -> bool {
        match self {
            EventRange::From(n) => index >= n,
            EventRange::After(n) => index > n,
        }
    }
}
