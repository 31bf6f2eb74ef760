use async_trait::async_trait;
use serde_json::Value;

use super::FlowDefinition;
use crate::executions::{
    EventRange, Execution, ExecutionEvent, ExecutionStatus, NodeExecutionState,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode or decode record: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    pub fn flow_not_found(id: &str) -> Self {
        StoreError::NotFound {
            kind: "flow",
            id: id.to_string(),
        }
    }

    pub fn execution_not_found(id: &str) -> Self {
        StoreError::NotFound {
            kind: "execution",
            id: id.to_string(),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait Store: Send + Sync {
    // Flows
    async fn list_flows(&self) -> Vec<FlowDefinition>;
    async fn get_flow(&self, id: &str) -> Option<FlowDefinition>;
    async fn save_flow(&self, flow: FlowDefinition) -> StoreResult<()>;
    async fn delete_flow(&self, id: &str) -> StoreResult<bool>;

    // Executions
    async fn create_execution(&self, execution: Execution) -> StoreResult<()>;
    async fn get_execution(&self, id: &str) -> StoreResult<Option<Execution>>;
    async fn set_execution_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> StoreResult<()>;
    async fn push_node_execution(
        &self,
        execution_id: &str,
        node: NodeExecutionState,
    ) -> StoreResult<()>;
    async fn complete_node_execution(
        &self,
        execution_id: &str,
        node_id: &str,
        status: ExecutionStatus,
    ) -> StoreResult<()>;

    // Event logs
    /// Append to an execution's log, returning the assigned index.
    async fn append_event(
        &self,
        execution_id: &str,
        event_type: &str,
        data: Value,
    ) -> StoreResult<u64>;
    /// Events of one execution within `range`, ordered by index.
    async fn list_events(
        &self,
        execution_id: &str,
        range: EventRange,
    ) -> StoreResult<Vec<ExecutionEvent>>;

    // Lifecycle
    async fn load_all(&self) -> anyhow::Result<()>;
}
