pub mod execution_routes;
pub mod flow_routes;
pub mod middleware;
pub mod routes;

use std::sync::Arc;

use axum::Router;

use crate::compiler::units::{PassthroughRunner, UnitRunner};
use crate::flows::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    /// Engine handed every unit of a flow started through the API.
    pub runner: Arc<dyn UnitRunner>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            runner: Arc::new(PassthroughRunner),
        }
    }

    pub fn with_runner(mut self, runner: Arc<dyn UnitRunner>) -> Self {
        self.runner = runner;
        self
    }
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}
