use std::convert::Infallible;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};

use super::AppState;
use crate::executions::stream::{ExecutionStream, StreamRecord};

pub(crate) async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let execution = state
        .store
        .get_execution(&id)
        .await
        .map_err(|e| {
            tracing::error!(execution_id = %id, error = %e, "Failed to load execution");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        })?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "execution not found" })),
            )
        })?;

    Ok(Json(serde_json::to_value(&execution).unwrap_or_default()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StreamQuery {
    #[serde(default)]
    from_index: u64,
}

/// `data: {event}` per record, `event: error` on failure and `data: [DONE]`
/// once the execution has finished. Closing the connection stops polling.
pub(crate) async fn stream_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::info!(
        execution_id = %id,
        from_index = query.from_index,
        "Client subscribed to execution"
    );

    let mut records = ExecutionStream::open(state.store.clone(), id, query.from_index);
    let stream = async_stream::stream! {
        while let Some(record) = records.next().await {
            yield Ok(sse_event(record));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

fn sse_event(record: StreamRecord) -> Event {
    let (name, data) = sse_payload(record);
    match name {
        Some(name) => Event::default().event(name).data(data),
        None => Event::default().data(data),
    }
}

/// Event name and data line for one record.
fn sse_payload(record: StreamRecord) -> (Option<&'static str>, String) {
    match record {
        StreamRecord::Event(event) => (None, serde_json::to_string(&event).unwrap_or_default()),
        StreamRecord::Error { message } => {
            (Some("error"), json!({ "error": message }).to_string())
        }
        StreamRecord::Done => (None, "[DONE]".to_string()),
    }
}
