//! Observation server (§4.8): a lightweight HTTP+SSE surface colocated with the
//! orchestrator so a viewer can watch a run without participating in it.

pub mod routes;
pub mod snapshot;
pub mod sse;

use crate::config::Config;
use crate::orchestrator::Supervisor;
use std::sync::Arc;

/// Shared application state handed to every axum handler.
pub struct AppState {
    pub config: Config,
    pub supervisor: Supervisor,
}

pub type SharedState = Arc<AppState>;

pub fn build_router(state: SharedState) -> axum::Router {
    routes::router(state)
}
