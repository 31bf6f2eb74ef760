//! Resumable live view of an execution's event log.
//!
//! A connection replays everything at or after `from_index`, then polls the
//! store with a growing interval until the execution reaches a terminal
//! status, drains once more and closes with [`StreamRecord::Done`].
//!
//! Block executions stream their own log. Flow executions stream the merged
//! logs of their node executions under a connection-scoped index.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use super::{EventRange, Execution, ExecutionEvent, ExecutionStatus};
use crate::flows::store::{Store, StoreError, StoreResult};

const CHANNEL_CAPACITY: usize = 64;

/// Interval between polls. Grows by half on every empty poll up to a cap and
/// drops back to the initial value whenever a poll returns events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl PollSchedule {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn direct() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_millis(1000))
    }

    pub fn composite() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_millis(2000))
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn on_empty(&mut self) -> Duration {
        self.current = (self.current * 3 / 2).min(self.max);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    /// Log index for block executions, connection-scoped index for flow
    /// executions. Clients resume by passing the last seen value plus one.
    pub index: u64,
    pub execution_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamRecord {
    Event(StreamEvent),
    /// The stream failed and is about to end.
    Error { message: String },
    /// The execution finished and every event has been delivered.
    Done,
}

enum Cursor {
    Direct {
        next_index: u64,
    },
    Composite {
        /// Highest index seen per child execution id.
        seen: HashMap<String, u64>,
        next_synthetic: u64,
    },
}

/// Per-connection state, owned by the streaming task.
struct Session {
    store: Arc<dyn Store>,
    execution_id: String,
    cursor: Cursor,
    schedule: PollSchedule,
}

/// A child event tagged with everything the merge order needs.
struct ChildEvent {
    child_order: usize,
    node_id: String,
    event: ExecutionEvent,
}

impl Session {
    async fn open(store: Arc<dyn Store>, execution_id: String) -> StoreResult<Self> {
        let execution = store
            .get_execution(&execution_id)
            .await?
            .ok_or_else(|| StoreError::execution_not_found(&execution_id))?;

        let (cursor, schedule) = if execution.is_composite() {
            (
                Cursor::Composite {
                    seen: HashMap::new(),
                    next_synthetic: 0,
                },
                PollSchedule::composite(),
            )
        } else {
            (Cursor::Direct { next_index: 0 }, PollSchedule::direct())
        };

        Ok(Self {
            store,
            execution_id,
            cursor,
            schedule,
        })
    }

    async fn execution(&self) -> StoreResult<Execution> {
        self.store
            .get_execution(&self.execution_id)
            .await?
            .ok_or_else(|| StoreError::execution_not_found(&self.execution_id))
    }

    async fn status(&self) -> StoreResult<ExecutionStatus> {
        Ok(self.execution().await?.status)
    }

    /// Everything already logged with index at or after `from_index`.
    async fn catch_up(&mut self, from_index: u64) -> StoreResult<Vec<StreamEvent>> {
        if let Cursor::Direct { next_index } = &mut self.cursor {
            *next_index = from_index;
            return self.poll().await;
        }
        // Synthetic indices only exist once the whole history is merged.
        let mut events = self.poll().await?;
        events.retain(|e| e.index >= from_index);
        Ok(events)
    }

    /// Events appended since the last catch-up or poll.
    async fn poll(&mut self) -> StoreResult<Vec<StreamEvent>> {
        if let Cursor::Direct { next_index } = self.cursor {
            let events = self
                .store
                .list_events(&self.execution_id, EventRange::From(next_index))
                .await?;
            if let Some(last) = events.last() {
                self.cursor = Cursor::Direct {
                    next_index: last.index + 1,
                };
            }
            return Ok(events.into_iter().map(direct_event).collect());
        }

        // Children are re-read every time so late starters are picked up.
        let children = self.execution().await?.node_executions;
        let Cursor::Composite {
            seen,
            next_synthetic,
        } = &mut self.cursor
        else {
            return Ok(Vec::new());
        };

        let mut batch = Vec::new();
        for (child_order, child) in children.iter().enumerate() {
            let range = match seen.get(&child.execution_id) {
                Some(last) => EventRange::After(*last),
                None => EventRange::From(0),
            };
            let events = self.store.list_events(&child.execution_id, range).await?;
            batch.extend(events.into_iter().map(|event| ChildEvent {
                child_order,
                node_id: child.node_id.clone(),
                event,
            }));
        }
        merge_order(&mut batch);

        let mut out = Vec::with_capacity(batch.len());
        for child in batch {
            seen.insert(child.event.execution_id.clone(), child.event.index);
            out.push(StreamEvent {
                index: *next_synthetic,
                execution_id: child.event.execution_id,
                node_id: Some(child.node_id),
                event_type: child.event.event_type,
                data: child.event.data,
                timestamp: child.event.created_at,
            });
            *next_synthetic += 1;
        }
        Ok(out)
    }

    /// Wait out the current interval, then poll. An empty poll lengthens the
    /// interval and any events reset it.
    async fn tick(&mut self) -> StoreResult<Vec<StreamEvent>> {
        // Armed only after the previous poll finished, so queries never overlap.
        tokio::time::sleep(self.schedule.current()).await;

        let batch = self.poll().await?;
        if batch.is_empty() {
            self.schedule.on_empty();
        } else {
            self.schedule.reset();
        }
        Ok(batch)
    }
}

fn direct_event(event: ExecutionEvent) -> StreamEvent {
    let node_id = event
        .data
        .get("nodeId")
        .and_then(Value::as_str)
        .map(str::to_string);
    StreamEvent {
        index: event.index,
        execution_id: event.execution_id,
        node_id,
        event_type: event.event_type,
        data: event.data,
        timestamp: event.created_at,
    }
}

/// Creation time, then child order, then the child's own index.
fn merge_order(batch: &mut [ChildEvent]) {
    batch.sort_by(|a, b| {
        a.event
            .created_at
            .cmp(&b.event.created_at)
            .then(a.child_order.cmp(&b.child_order))
            .then(a.event.index.cmp(&b.event.index))
    });
}

/// Live stream of one execution. Dropping it stops the polling task.
pub struct ExecutionStream {
    records: ReceiverStream<StreamRecord>,
    task: JoinHandle<()>,
    aborted: bool,
}

impl ExecutionStream {
    pub fn open(store: Arc<dyn Store>, execution_id: impl Into<String>, from_index: u64) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(run(store, execution_id.into(), from_index, tx));
        Self {
            records: ReceiverStream::new(rx),
            task,
            aborted: false,
        }
    }

    /// Stop polling. Records not yet received are discarded.
    pub fn abort(&mut self) {
        self.aborted = true;
        self.task.abort();
        self.records.close();
    }
}

impl Stream for ExecutionStream {
    type Item = StreamRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.aborted {
            return Poll::Ready(None);
        }
        Pin::new(&mut self.records).poll_next(cx)
    }
}

impl Drop for ExecutionStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    store: Arc<dyn Store>,
    execution_id: String,
    from_index: u64,
    tx: mpsc::Sender<StreamRecord>,
) {
    tracing::debug!(execution_id = %execution_id, from_index, "Execution stream opened");
    let result = stream_events(store, &execution_id, from_index, &tx).await;

    let last = match result {
        Ok(true) => StreamRecord::Done,
        // Receiver gone.
        Ok(false) => return,
        Err(e) => {
            tracing::warn!(execution_id = %execution_id, error = %e, "Execution stream failed");
            StreamRecord::Error {
                message: e.to_string(),
            }
        }
    };
    let _ = tx.send(last).await;
    tracing::debug!(execution_id = %execution_id, "Execution stream closed");
}

/// Returns `Ok(false)` when the receiver went away before completion.
async fn stream_events(
    store: Arc<dyn Store>,
    execution_id: &str,
    from_index: u64,
    tx: &mpsc::Sender<StreamRecord>,
) -> StoreResult<bool> {
    let mut session = Session::open(store, execution_id.to_string()).await?;

    let replay = session.catch_up(from_index).await?;
    if !forward(tx, replay).await {
        return Ok(false);
    }

    loop {
        if session.status().await?.is_terminal() {
            let drained = session.poll().await?;
            return Ok(forward(tx, drained).await);
        }

        let batch = session.tick().await?;
        if !forward(tx, batch).await {
            return Ok(false);
        }
    }
}

async fn forward(tx: &mpsc::Sender<StreamRecord>, events: Vec<StreamEvent>) -> bool {
    for event in events {
        if tx.send(StreamRecord::Event(event)).await.is_err() {
            return false;
        }
    }
    true
}
