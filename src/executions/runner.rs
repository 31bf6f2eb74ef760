use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;

use super::{Execution, ExecutionStatus, NodeExecutionState};
use crate::compiler::units::{CompiledUnit, FlowExecutor, UnitResult, UnitRunner};
use crate::flows::store::{Store, StoreResult};

/// Runs compiled flows as composite executions.
///
/// Each unit gets a child execution named `{execution}-{node}` whose log
/// carries `node_started` then `node_completed` or `node_failed`. Units
/// skipped after an upstream failure get a cancelled child with a single
/// `node_skipped` event.
#[derive(Clone)]
pub struct FlowRunner {
    store: Arc<dyn Store>,
    runner: Arc<dyn UnitRunner>,
}

impl FlowRunner {
    pub fn new(store: Arc<dyn Store>, runner: Arc<dyn UnitRunner>) -> Self {
        Self { store, runner }
    }

    /// Register a pending execution of `flow_id` and run it in the
    /// background. Returns the new execution id.
    pub async fn start(
        &self,
        flow_id: &str,
        executor: FlowExecutor,
        input: Value,
    ) -> StoreResult<String> {
        let execution_id = Uuid::new_v4().to_string();
        self.store
            .create_execution(Execution::for_flow(&execution_id, flow_id, input.clone()))
            .await?;

        let this = self.clone();
        let id = execution_id.clone();
        let flow_id = flow_id.to_string();
        tokio::spawn(async move {
            match this.execute(&id, &executor, input).await {
                Ok(status) => {
                    tracing::info!(
                        flow_id = %flow_id,
                        execution_id = %id,
                        ?status,
                        "Flow execution finished"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        flow_id = %flow_id,
                        execution_id = %id,
                        error = %e,
                        "Flow execution failed"
                    );
                    let _ = this
                        .store
                        .set_execution_status(&id, ExecutionStatus::Failed, Some(e.to_string()))
                        .await;
                }
            }
        });

        Ok(execution_id)
    }

    /// Drive an already registered execution to a terminal status.
    pub async fn execute(
        &self,
        execution_id: &str,
        executor: &FlowExecutor,
        input: Value,
    ) -> StoreResult<ExecutionStatus> {
        self.store
            .set_execution_status(execution_id, ExecutionStatus::Running, None)
            .await?;

        let recorder = RecordingRunner {
            store: self.store.as_ref(),
            inner: self.runner.as_ref(),
            parent: execution_id,
        };
        let outcomes = executor.run(&recorder, input).await;

        let mut failed = Vec::new();
        for outcome in &outcomes {
            match &outcome.result {
                UnitResult::Failed { .. } => failed.push(outcome.node_id.as_str()),
                UnitResult::Skipped => recorder.record_skipped(&outcome.node_id).await?,
                UnitResult::Completed { .. } => {}
            }
        }

        let (status, error) = if failed.is_empty() {
            (ExecutionStatus::Completed, None)
        } else {
            (
                ExecutionStatus::Failed,
                Some(format!("units failed: {}", failed.join(", "))),
            )
        };
        self.store
            .set_execution_status(execution_id, status, error)
            .await?;
        Ok(status)
    }
}

/// Wraps the real runner and mirrors every unit into the store.
struct RecordingRunner<'a> {
    store: &'a dyn Store,
    inner: &'a dyn UnitRunner,
    parent: &'a str,
}

impl<'a> RecordingRunner<'a> {
    fn child_id(&self, node_id: &str) -> String {
        format!("{}-{}", self.parent, node_id)
    }

    /// Create the child execution, then attach it to the parent. The child
    /// must exist before the parent lists it.
    async fn open_child(&self, node_id: &str, input: Value) -> StoreResult<String> {
        let child_id = self.child_id(node_id);
        self.store
            .create_execution(Execution::for_block(&child_id, node_id, input))
            .await?;
        self.store
            .push_node_execution(self.parent, NodeExecutionState::started(&child_id, node_id))
            .await?;
        Ok(child_id)
    }

    async fn close_child(
        &self,
        child_id: &str,
        node_id: &str,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> StoreResult<()> {
        self.store
            .set_execution_status(child_id, status, error)
            .await?;
        self.store
            .complete_node_execution(self.parent, node_id, status)
            .await
    }

    async fn record_skipped(&self, node_id: &str) -> StoreResult<()> {
        let child_id = self.open_child(node_id, Value::Null).await?;
        self.store
            .append_event(&child_id, "node_skipped", json!({ "nodeId": node_id }))
            .await?;
        self.close_child(&child_id, node_id, ExecutionStatus::Cancelled, None)
            .await
    }
}

#[async_trait]
impl<'a> UnitRunner for RecordingRunner<'a> {
    async fn run_unit(&self, unit: &CompiledUnit, input: Value) -> anyhow::Result<Value> {
        let node_id = unit.node_id.as_str();
        let child_id = self.open_child(node_id, input.clone()).await?;
        self.store
            .set_execution_status(&child_id, ExecutionStatus::Running, None)
            .await?;
        self.store
            .append_event(
                &child_id,
                "node_started",
                json!({ "nodeId": node_id, "label": unit.label }),
            )
            .await?;

        match self.inner.run_unit(unit, input).await {
            Ok(output) => {
                self.store
                    .append_event(
                        &child_id,
                        "node_completed",
                        json!({ "nodeId": node_id, "output": output }),
                    )
                    .await?;
                self.close_child(&child_id, node_id, ExecutionStatus::Completed, None)
                    .await?;
                Ok(output)
            }
            Err(e) => {
                let error = format!("{e:#}");
                self.store
                    .append_event(
                        &child_id,
                        "node_failed",
                        json!({ "nodeId": node_id, "error": error }),
                    )
                    .await?;
                self.close_child(&child_id, node_id, ExecutionStatus::Failed, Some(error))
                    .await?;
                Err(e)
            }
        }
    }
}
