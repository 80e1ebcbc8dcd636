//! Ops HTTP surface
//!
//! A small axum server for operators and the query-rewriter collaborator:
//! health, candidate/job listings, the materialized-column lookup, manual
//! cycle trigger, and backfill abort.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;

use crate::backfill::AbortRegistry;
use crate::config::PipelineConfig;
use crate::database::DatabaseOps;
use crate::state::StateStore;

pub mod handlers;
mod models;

use handlers::{
    abort_job, health_check, list_candidates, list_jobs, list_materialized, lookup_materialized,
    trigger_cycle,
};

#[derive(Clone)]
pub struct AppState {
    pub ops: Arc<dyn DatabaseOps>,
    pub store: Arc<Mutex<StateStore>>,
    pub aborts: Arc<AbortRegistry>,
    pub config: PipelineConfig,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/candidates", get(list_candidates))
        .route("/jobs", get(list_jobs))
        .route("/jobs/abort", post(abort_job))
        .route("/materialized", get(list_materialized))
        .route("/materialized/{table}/{property}", get(lookup_materialized))
        .route("/cycle", post(trigger_cycle))
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state)
}

/// Serve the ops surface until the process exits.
pub async fn serve(state: AppState, host: &str, port: u16) -> std::io::Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr).await?;
    log::info!("Ops server listening on {}", addr);

    let router = build_router(state);
    axum::serve(listener, router).await
}
