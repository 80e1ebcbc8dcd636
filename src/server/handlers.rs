use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::cycle;
use crate::ranker::StaticSavingsModel;
use crate::rewriter::MaterializedLookup;
use crate::state::{BackfillJob, JobState, MaterializationCandidate};

use super::models::{
    AbortRequest, AbortResponse, HealthResponse, LookupResponse, TriggerResponse,
};
use super::AppState;

pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// All candidates with their lifecycle state, for operator review.
pub async fn list_candidates(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.lock().await;
    let candidates: Vec<MaterializationCandidate> =
        store.document().candidates.values().cloned().collect();
    Json(candidates)
}

/// All backfill jobs with cursors, for operator review.
pub async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.lock().await;
    let jobs: Vec<BackfillJob> = store.document().jobs.values().cloned().collect();
    Json(jobs)
}

/// The full rewriter view: every fully materialized (table, property, column).
pub async fn list_materialized(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.lock().await;
    Json(MaterializedLookup::from_store(&store).entries())
}

/// Point lookup for the query-rewriter collaborator:
/// `GET /materialized/{table}/{property}`.
pub async fn lookup_materialized(
    State(state): State<AppState>,
    Path((table, property)): Path<(String, String)>,
) -> impl IntoResponse {
    let store = state.store.lock().await;
    let lookup = MaterializedLookup::from_store(&store);
    let column = lookup.lookup(&table, &property).map(|c| c.to_string());
    let status = if column.is_some() {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    };
    (
        status,
        Json(LookupResponse {
            table,
            property,
            column,
        }),
    )
}

/// Kick off a cycle in the background. Single-flight is enforced by the lease,
/// so a concurrent trigger degrades to a clean no-op.
pub async fn trigger_cycle(State(state): State<AppState>) -> impl IntoResponse {
    tokio::spawn(async move {
        let model = StaticSavingsModel {
            factor: state.config.savings_factor,
        };
        match cycle::run_cycle(
            state.ops.clone(),
            state.store.clone(),
            state.aborts.clone(),
            &state.config,
            &model,
        )
        .await
        {
            Ok(report) => log::info!("Triggered cycle finished: {:?}", report),
            Err(e) => log::error!("Triggered cycle failed: {}", e),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            started: true,
            message: "Cycle started; progress is logged and visible under /jobs".to_string(),
        }),
    )
}

/// Request abort of a running backfill job. The coordinator parks the job as
/// Paused before the next chunk; no chunk is interrupted mid-write.
pub async fn abort_job(
    State(state): State<AppState>,
    Json(request): Json<AbortRequest>,
) -> impl IntoResponse {
    let key = crate::state::state_key(&request.table, &request.property);
    let store = state.store.lock().await;
    match store.job(&request.table, &request.property) {
        Some(job) if job.state == JobState::Running => {
            state.aborts.request(&key);
            (
                StatusCode::ACCEPTED,
                Json(AbortResponse {
                    requested: true,
                    message: format!("Abort requested for {}", key),
                }),
            )
        }
        Some(job) => (
            StatusCode::CONFLICT,
            Json(AbortResponse {
                requested: false,
                message: format!("Job {} is {:?}, not Running", key, job.state),
            }),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(AbortResponse {
                requested: false,
                message: format!("No backfill job for {}", key),
            }),
        ),
    }
}
