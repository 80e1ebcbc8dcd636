//! Cycle orchestration
//!
//! One scheduled run of the full pipeline: lease -> resume pass -> query log
//! read -> extraction/aggregation -> ranking -> schema mutation -> backfill.
//! There is no feedback loop within a run; de-duplication against previous
//! runs happens through the persisted candidate set.
//!
//! Failures are isolated per (table, property) unit: a schema conflict or a
//! failed backfill on one candidate never aborts its siblings in the batch.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::backfill::{AbortRegistry, BackfillCoordinator, JobOutcome};
use crate::config::PipelineConfig;
use crate::database::{DatabaseError, DatabaseOps};
use crate::lease::{CycleLease, LeaseError};
use crate::query_log;
use crate::ranker::{self, BenefitModel};
use crate::schema_mutator::{self, SchemaMutationError};
use crate::state::{BackfillJob, CandidateState, StateStore, StateStoreError};

#[derive(Error, Debug)]
pub enum CycleError {
    #[error(transparent)]
    Lease(LeaseError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    State(#[from] StateStoreError),
}

/// How the invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CycleOutcome {
    Completed,
    /// Another cycle held the lease; this invocation was a clean no-op
    SkippedContended,
}

/// Operator-facing summary of one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub records_scanned: usize,
    pub parse_skips: usize,
    pub candidates_selected: usize,
    pub schema_conflicts: usize,
    pub jobs_resumed: usize,
    pub jobs_completed: usize,
    pub jobs_aborted: usize,
    pub jobs_failed: usize,
}

impl CycleReport {
    fn skipped() -> Self {
        Self {
            outcome: CycleOutcome::SkippedContended,
            records_scanned: 0,
            parse_skips: 0,
            candidates_selected: 0,
            schema_conflicts: 0,
            jobs_resumed: 0,
            jobs_completed: 0,
            jobs_aborted: 0,
            jobs_failed: 0,
        }
    }
}

/// Run one full cycle under the single-flight lease.
pub async fn run_cycle(
    ops: Arc<dyn DatabaseOps>,
    store: Arc<Mutex<StateStore>>,
    aborts: Arc<AbortRegistry>,
    config: &PipelineConfig,
    model: &dyn BenefitModel,
) -> Result<CycleReport, CycleError> {
    let lease = match CycleLease::acquire(&config.lease_path, config.lease_ttl_secs) {
        Ok(lease) => lease,
        Err(LeaseError::Contended { holder, expires_at }) => {
            log::info!(
                "Cycle lease held by {} until {}; nothing to do",
                holder,
                expires_at
            );
            return Ok(CycleReport::skipped());
        }
        Err(e) => return Err(CycleError::Lease(e)),
    };

    let coordinator = BackfillCoordinator::new(
        ops.clone(),
        store.clone(),
        aborts,
        config.chunk_size,
        config.max_retries,
    );

    let mut report = CycleReport {
        outcome: CycleOutcome::Completed,
        records_scanned: 0,
        parse_skips: 0,
        candidates_selected: 0,
        schema_conflicts: 0,
        jobs_resumed: 0,
        jobs_completed: 0,
        jobs_aborted: 0,
        jobs_failed: 0,
    };

    // Resume pass: jobs a crash or abort left behind come first, so a wedged
    // backlog drains before new schema mutations pile on.
    let resumable = {
        let store = store.lock().await;
        store.resumable_jobs()
    };
    report.jobs_resumed = resumable.len();
    if !resumable.is_empty() {
        log::info!("Resuming {} interrupted backfill jobs", resumable.len());
        tally(&mut report, coordinator.run_all(resumable).await);
    }

    // Mine the trailing window
    let records = query_log::read_window(ops.as_ref(), config).await?;
    let aggregate = ranker::aggregate(&records, config);
    report.records_scanned = aggregate.records_scanned;
    report.parse_skips = aggregate.parse_skips;

    let candidates = {
        let store = store.lock().await;
        ranker::select_candidates(&aggregate, &store, config, model)
    };
    report.candidates_selected = candidates.len();
    log::info!(
        "Cycle selected {} candidates from {} records ({} parse skips)",
        candidates.len(),
        report.records_scanned,
        report.parse_skips
    );

    // Mutate schemas and enqueue backfill, one isolated unit at a time
    let mut new_jobs = Vec::new();
    for candidate in candidates {
        let Some(watched) = config.watched_table(&candidate.table) else {
            continue;
        };
        let json_column = watched.json_column.clone();

        {
            let mut store = store.lock().await;
            store.upsert_candidate(candidate.clone());
            store.save()?;
        }

        match schema_mutator::apply_candidate(ops.as_ref(), &candidate, &json_column).await {
            Ok(()) => {
                let (database, table) = schema_mutator::split_qualified(&candidate.table);
                let partitions = match ops.list_partitions(database, table).await {
                    Ok(partitions) => partitions,
                    Err(e) => {
                        log::error!(
                            "Could not snapshot partitions for {}: {}; candidate left NotMaterialized",
                            candidate.table,
                            e
                        );
                        continue;
                    }
                };

                let job = BackfillJob::new(
                    &candidate.table,
                    &candidate.property,
                    &candidate.column,
                    partitions,
                );
                let mut store = store.lock().await;
                store.set_candidate_state(
                    &candidate.table,
                    &candidate.property,
                    CandidateState::Pending,
                );
                if store.enqueue_job(job.clone()) {
                    new_jobs.push(job);
                }
                store.save()?;
            }
            Err(SchemaMutationError::SchemaConflict { .. }) => {
                report.schema_conflicts += 1;
                log::error!(
                    "Schema conflict for {} property `{}` (column {}); marked Failed for manual review",
                    candidate.table,
                    candidate.property,
                    candidate.column
                );
                let mut store = store.lock().await;
                store.set_candidate_state(
                    &candidate.table,
                    &candidate.property,
                    CandidateState::Failed,
                );
                store.save()?;
            }
            Err(SchemaMutationError::Database(e)) => {
                // Transient; the candidate stays NotMaterialized and the next
                // cycle re-selects it
                log::warn!(
                    "Schema mutation for {} property `{}` failed: {}",
                    candidate.table,
                    candidate.property,
                    e
                );
            }
        }
    }

    tally(&mut report, coordinator.run_all(new_jobs).await);

    if let Err(e) = lease.release() {
        log::warn!("Cycle finished but lease release failed: {}", e);
    }

    log::info!(
        "Cycle complete: {} selected, {} conflicts, {} backfills completed, {} failed, {} aborted",
        report.candidates_selected,
        report.schema_conflicts,
        report.jobs_completed,
        report.jobs_failed,
        report.jobs_aborted
    );
    Ok(report)
}

fn tally(
    report: &mut CycleReport,
    results: Vec<(String, Result<JobOutcome, crate::backfill::BackfillError>)>,
) {
    for (key, result) in results {
        match result {
            Ok(JobOutcome::Completed) => report.jobs_completed += 1,
            Ok(JobOutcome::Aborted) => report.jobs_aborted += 1,
            Err(e) => {
                report.jobs_failed += 1;
                log::error!("Backfill job {} failed: {}", key, e);
            }
        }
    }
}
