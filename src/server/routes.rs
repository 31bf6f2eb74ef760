use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::StatusCode;
use hyper::header;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use super::AppState;
use super::{execution_routes, flow_routes, middleware};

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(vec![header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_router())
        .fallback(not_found)
        .with_state(state)
        .layer(cors)
        .layer(axum::middleware::from_fn(middleware::strip_trailing_slash))
        .layer(axum::middleware::from_fn(
            middleware::enrich_current_span_middleware,
        ))
}

fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        // Flow CRUD
        .route(
            "/flows",
            get(flow_routes::list_flows).post(flow_routes::create_flow),
        )
        .route(
            "/flows/{id}",
            get(flow_routes::get_flow)
                .put(flow_routes::update_flow)
                .delete(flow_routes::delete_flow),
        )
        .route("/flows/{id}/execute", post(flow_routes::execute_flow))
        // Compilation
        .route("/flows/{id}/compile", post(flow_routes::compile_flow))
        .route("/compile", post(flow_routes::compile_document))
        .route("/node-types", get(flow_routes::get_node_types))
        // Executions
        .route("/executions/{id}", get(execution_routes::get_execution))
        .route(
            "/executions/{id}/stream",
            get(execution_routes::stream_execution),
        )
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn not_found(req: axum::extract::Request) -> impl IntoResponse {
    tracing::warn!("unhandled path: {}", req.uri());
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
}
