use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::Utc;
use hyper::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::AppState;
use crate::compiler::{self, CompilationResult, CompileOptions};
use crate::executions::runner::FlowRunner;
use crate::flows::store::StoreError;
use crate::flows::{FlowDefinition, FlowEdge, FlowNode, NodeType};

type ApiError = (StatusCode, Json<Value>);

fn not_found() -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "flow not found" })),
    )
}

fn save_failed(e: StoreError) -> ApiError {
    let status = match e {
        StoreError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({ "error": format!("failed to save flow: {e}") })),
    )
}

/// Enabled flows must pass validation.
fn reject_invalid_enabled(
    flow: &FlowDefinition,
    validation: &CompilationResult,
) -> Result<(), ApiError> {
    if flow.enabled && !validation.success {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "flow failed validation and cannot be enabled",
                "validation": validation.report(),
            })),
        ));
    }
    Ok(())
}

pub(crate) async fn list_flows(State(state): State<AppState>) -> Json<Value> {
    let flows = state.store.list_flows().await;

    let summaries: Vec<Value> = flows
        .iter()
        .map(|f| {
            json!({
                "id": f.id,
                "name": f.name,
                "description": f.description,
                "enabled": f.enabled,
                "version": f.version,
                "nodeCount": f.nodes.len(),
                "edgeCount": f.edges.len(),
                "createdAt": f.created_at,
                "updatedAt": f.updated_at,
            })
        })
        .collect();

    Json(json!({ "flows": summaries }))
}

pub(crate) async fn get_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let flow = state.store.get_flow(&id).await.ok_or_else(not_found)?;
    Ok(Json(serde_json::to_value(&flow).unwrap_or_default()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateFlowRequest {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    nodes: Vec<FlowNode>,
    #[serde(default)]
    edges: Vec<FlowEdge>,
    #[serde(default)]
    triggers: Vec<Value>,
}

pub(crate) async fn create_flow(
    State(state): State<AppState>,
    Json(body): Json<CreateFlowRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let now = Utc::now();
    let flow = FlowDefinition {
        id: Uuid::new_v4().to_string(),
        name: body.name,
        description: body.description,
        enabled: body.enabled,
        nodes: body.nodes,
        edges: body.edges,
        triggers: body.triggers,
        version: 1,
        created_at: now,
        updated_at: now,
    };

    let validation = compiler::compile(&flow, CompileOptions { validate_only: true });
    reject_invalid_enabled(&flow, &validation)?;

    state.store.save_flow(flow.clone()).await.map_err(save_failed)?;
    tracing::info!(flow_id = %flow.id, name = %flow.name, "Created flow");

    Ok((
        StatusCode::CREATED,
        Json(json!({ "flow": flow, "validation": validation.report() })),
    ))
}

/// Full replacement of a flow's graph. Partial graph edits are not accepted.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReplaceFlowRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
    nodes: Vec<FlowNode>,
    edges: Vec<FlowEdge>,
    #[serde(default)]
    triggers: Vec<Value>,
}

pub(crate) async fn update_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ReplaceFlowRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut flow = state.store.get_flow(&id).await.ok_or_else(not_found)?;

    if let Some(name) = body.name {
        flow.name = name;
    }
    if let Some(description) = body.description {
        flow.description = description;
    }
    if let Some(enabled) = body.enabled {
        flow.enabled = enabled;
    }
    flow.replace_graph(body.nodes, body.edges, body.triggers);

    let validation = compiler::compile(&flow, CompileOptions { validate_only: true });
    reject_invalid_enabled(&flow, &validation)?;

    state.store.save_flow(flow.clone()).await.map_err(save_failed)?;
    tracing::info!(
        flow_id = %flow.id,
        version = flow.version,
        valid = validation.success,
        "Replaced flow graph"
    );

    Ok(Json(json!({ "flow": flow, "validation": validation.report() })))
}

pub(crate) async fn delete_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let existed = state.store.delete_flow(&id).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("failed to delete flow: {e}") })),
        )
    })?;

    if !existed {
        return Err(not_found());
    }
    Ok(Json(json!({ "deleted": true })))
}

pub(crate) async fn compile_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(options): Query<CompileOptions>,
) -> Result<Json<Value>, ApiError> {
    let flow = state.store.get_flow(&id).await.ok_or_else(not_found)?;
    let result = compiler::compile(&flow, options);
    Ok(Json(result.report()))
}

#[derive(Deserialize, Default)]
pub(crate) struct ExecuteFlowRequest {
    #[serde(default)]
    input: Value,
}

/// Compile the stored flow and start it as a composite execution. The run
/// continues in the background; clients follow it through the stream.
pub(crate) async fn execute_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: String,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let flow = state.store.get_flow(&id).await.ok_or_else(not_found)?;

    let request: ExecuteFlowRequest = if body.trim().is_empty() {
        ExecuteFlowRequest::default()
    } else {
        serde_json::from_str(&body).map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid execute request: {e}") })),
            )
        })?
    };

    let result = compiler::compile(&flow, CompileOptions::default());
    let Some(executor) = result.executor.clone() else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "flow failed validation and cannot be executed",
                "validation": result.report(),
            })),
        ));
    };

    let runner = FlowRunner::new(state.store.clone(), state.runner.clone());
    let execution_id = runner
        .start(&flow.id, executor, request.input)
        .await
        .map_err(|e| {
            tracing::error!(flow_id = %flow.id, error = %e, "Failed to start execution");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("failed to start execution: {e}") })),
            )
        })?;
    tracing::info!(
        flow_id = %flow.id,
        execution_id = %execution_id,
        "Flow execution started"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "executionId": execution_id, "flowId": flow.id })),
    ))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CompileRequest {
    flow: FlowDefinition,
    #[serde(default)]
    validate_only: bool,
}

/// Compile a definition that is not stored, e.g. from an editor.
pub(crate) async fn compile_document(Json(body): Json<CompileRequest>) -> Json<Value> {
    let result = compiler::compile(
        &body.flow,
        CompileOptions {
            validate_only: body.validate_only,
        },
    );
    Json(result.report())
}

pub(crate) async fn get_node_types() -> Json<Value> {
    let node_types: Vec<Value> = NodeType::ALL
        .iter()
        .map(|t| json!({ "type": t, "label": node_label(t), "fields": node_fields(t) }))
        .collect();
    Json(json!({ "nodeTypes": node_types }))
}

fn node_label(node_type: &NodeType) -> &'static str {
    match node_type {
        NodeType::AiBlock => "AI Block",
        NodeType::FunctionBlock => "Function Block",
        NodeType::Router => "Router",
        NodeType::Parallel => "Parallel",
        NodeType::Loop => "Loop",
        NodeType::Filter => "Filter",
        NodeType::Gate => "Gate",
        NodeType::Source => "Source",
        NodeType::Sink => "Sink",
        NodeType::Unknown(_) => "Unknown",
    }
}

fn node_fields(node_type: &NodeType) -> Value {
    match node_type {
        NodeType::AiBlock => json!({
            "blockId": { "type": "string" },
            "model": { "type": "string" },
            "prompt": { "type": "string" }
        }),
        NodeType::FunctionBlock => json!({
            "blockId": { "type": "string" },
            "language": { "type": "string" },
            "code": { "type": "string" }
        }),
        NodeType::Router => json!({
            "routes": { "type": "object", "description": "Route name to target node id", "default": {} },
            "routeField": { "type": "string", "required": true },
            "defaultRoute": { "type": "string" }
        }),
        NodeType::Parallel => json!({
            "processors": { "type": "array", "description": "Node ids run side by side", "default": [] }
        }),
        NodeType::Loop => json!({
            "bodyNodeId": { "type": "string", "required": true },
            "condition": { "type": "string" },
            "maxIterations": { "type": "number", "default": crate::flows::DEFAULT_MAX_ITERATIONS }
        }),
        NodeType::Filter => json!({
            "condition": { "type": "string", "default": "" }
        }),
        NodeType::Gate => json!({
            "condition": { "type": "string" },
            "requireApproval": { "type": "boolean", "default": false }
        }),
        NodeType::Source => json!({
            "trigger": { "type": "string", "enum": ["manual", "webhook", "schedule"], "default": "manual" },
            "config": { "type": "object" }
        }),
        NodeType::Sink => json!({
            "sinkKind": { "type": "string" },
            "config": { "type": "object" }
        }),
        NodeType::Unknown(_) => json!({}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::file_store::FileStore;
    use crate::flows::store::Store;
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    async fn state() -> (TempDir, AppState) {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.load_all().await.unwrap();
        (dir, AppState::new(Arc::new(store)))
    }

    fn valid_graph() -> (Vec<FlowNode>, Vec<FlowEdge>) {
        let nodes = serde_json::from_value(json!([
            {"id": "s", "type": "source"},
            {"id": "a", "type": "ai-block", "data": {"prompt": "Summarise"}},
            {"id": "k", "type": "sink"}
        ]))
        .unwrap();
        let edges = serde_json::from_value(json!([
            {"id": "e1", "source": "s", "target": "a"},
            {"id": "e2", "source": "a", "target": "k"}
        ]))
        .unwrap();
        (nodes, edges)
    }

    async fn create(state: &AppState, body: Value) -> Result<Value, ApiError> {
        let body: CreateFlowRequest = serde_json::from_value(body).unwrap();
        create_flow(State(state.clone()), Json(body))
            .await
            .map(|(_, Json(v))| v)
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let (_dir, state) = state().await;
        let created = create(&state, json!({"name": "Draft"})).await.unwrap();

        assert_eq!(created["flow"]["version"], 1);
        assert_eq!(created["validation"]["success"], false);

        let Json(list) = list_flows(State(state.clone())).await;
        assert_eq!(list["flows"][0]["name"], "Draft");
        assert_eq!(list["flows"][0]["nodeCount"], 0);
    }

    #[tokio::test]
    async fn test_create_enabled_invalid_flow_is_rejected() {
        let (_dir, state) = state().await;
        let (status, Json(body)) = create(&state, json!({"name": "Broken", "enabled": true}))
            .await
            .unwrap_err();

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["validation"]["errors"][0]["code"], "NO_SOURCE");
        assert!(state.store.list_flows().await.is_empty());
    }

    #[tokio::test]
    async fn test_replace_bumps_version_and_revalidates() {
        let (_dir, state) = state().await;
        let created = create(&state, json!({"name": "Draft"})).await.unwrap();
        let id = created["flow"]["id"].as_str().unwrap().to_string();

        let (nodes, edges) = valid_graph();
        let Json(updated) = update_flow(
            State(state.clone()),
            Path(id.clone()),
            Json(ReplaceFlowRequest {
                name: None,
                description: None,
                enabled: Some(true),
                nodes,
                edges,
                triggers: vec![],
            }),
        )
        .await
        .unwrap();

        assert_eq!(updated["flow"]["version"], 2);
        assert_eq!(updated["flow"]["enabled"], true);
        assert_eq!(updated["validation"]["success"], true);
        assert_eq!(state.store.get_flow(&id).await.unwrap().nodes.len(), 3);

        // Enabling with a broken graph is refused and leaves the stored copy alone.
        let err = update_flow(
            State(state.clone()),
            Path(id.clone()),
            Json(ReplaceFlowRequest {
                name: None,
                description: None,
                enabled: None,
                nodes: vec![],
                edges: vec![],
                triggers: vec![],
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert_eq!(state.store.get_flow(&id).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_compile_stored_flow_returns_units() {
        let (_dir, state) = state().await;
        let (nodes, edges) = valid_graph();
        let created = create(
            &state,
            json!({"name": "Digest", "enabled": true, "nodes": nodes, "edges": edges}),
        )
        .await
        .unwrap();
        let id = created["flow"]["id"].as_str().unwrap().to_string();

        let Json(result) = compile_flow(
            State(state.clone()),
            Path(id.clone()),
            Query(CompileOptions::default()),
        )
        .await
        .unwrap();
        assert_eq!(result["success"], true);
        let units: Vec<_> = result["units"]
            .as_array()
            .unwrap()
            .iter()
            .map(|u| u["nodeId"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(units, vec!["s", "a", "k"]);

        let Json(result) = compile_flow(
            State(state.clone()),
            Path(id),
            Query(CompileOptions {
                validate_only: true,
            }),
        )
        .await
        .unwrap();
        assert!(result.get("units").is_none());
    }

    #[tokio::test]
    async fn test_execute_rejects_invalid_flow_and_bad_body() {
        let (_dir, state) = state().await;
        let created = create(&state, json!({"name": "Draft"})).await.unwrap();
        let id = created["flow"]["id"].as_str().unwrap().to_string();

        let (status, Json(body)) =
            execute_flow(State(state.clone()), Path(id.clone()), String::new())
                .await
                .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["validation"]["errors"][0]["code"], "NO_SOURCE");

        let err = execute_flow(State(state.clone()), Path(id), "{ nope".into())
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);

        let err = execute_flow(State(state), Path("nope".into()), String::new())
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_stale_save_maps_to_conflict() {
        let (status, Json(body)) = save_failed(StoreError::Conflict(
            "flow f1 is already at version 3".into(),
        ));
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(
            body["error"],
            "failed to save flow: conflict: flow f1 is already at version 3"
        );

        let (status, _) = save_failed(StoreError::flow_not_found("f1"));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_missing_flow_is_not_found() {
        let (_dir, state) = state().await;
        let err = get_flow(State(state.clone()), Path("nope".into()))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);

        let err = delete_flow(State(state), Path("nope".into()))
            .await
            .unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_compile_document_reports_cycle() {
        let body: CompileRequest = serde_json::from_value(json!({
            "flow": {
                "id": "doc", "name": "doc",
                "nodes": [
                    {"id": "s", "type": "source"},
                    {"id": "a", "type": "filter", "label": "A"},
                    {"id": "b", "type": "filter", "label": "B"}
                ],
                "edges": [
                    {"id": "e1", "source": "s", "target": "a"},
                    {"id": "e2", "source": "a", "target": "b"},
                    {"id": "e3", "source": "b", "target": "a"}
                ]
            },
            "validateOnly": true
        }))
        .unwrap();

        let Json(result) = compile_document(Json(body)).await;
        assert_eq!(result["success"], false);
        assert_eq!(result["errors"][0]["code"], "CYCLE_DETECTED");
        assert_eq!(result["errors"][0]["message"], "Cycle detected: A → B → A");
    }

    #[tokio::test]
    async fn test_node_types_lists_all_nine() {
        let Json(body) = get_node_types().await;
        let types = body["nodeTypes"].as_array().unwrap();
        assert_eq!(types.len(), 9);
        assert_eq!(types[0]["type"], "ai-block");
        assert_eq!(types[4]["fields"]["maxIterations"]["default"], 100);
    }
}
