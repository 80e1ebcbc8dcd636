//! Backfill coordinator
//!
//! Rewrites historical partitions so a newly added materialized column is
//! physically populated, without ever blocking live ingestion. Work is chunked
//! (`chunk_size` partitions per step) and the progress cursor is persisted
//! after every chunk, so a crash or operator abort resumes at the last
//! completed chunk instead of reprocessing the table. Chunk application is
//! idempotent: the defining expression is pure over the raw data, so
//! re-materializing a partition recomputes identical values.
//!
//! Jobs for distinct (table, property) pairs run concurrently; chunks within
//! one job are strictly sequential to keep the cursor meaningful.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::database::DatabaseOps;
use crate::state::{BackfillJob, CandidateState, JobState, StateStore};

pub mod errors;
pub use errors::BackfillError;

/// Terminal outcome of driving one job within a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Operator abort: the job is Paused with a valid resumable cursor
    Aborted,
}

/// Operator abort requests, shared between the ops server and the coordinator.
/// The coordinator checks before issuing each chunk; an abort never interrupts
/// a chunk mid-write.
#[derive(Debug, Default)]
pub struct AbortRegistry {
    requested: StdMutex<HashSet<String>>,
}

impl AbortRegistry {
    /// Request abort for a `db.table::property` job key.
    pub fn request(&self, key: &str) {
        self.requested
            .lock()
            .expect("abort registry lock")
            .insert(key.to_string());
    }

    pub fn is_requested(&self, key: &str) -> bool {
        self.requested
            .lock()
            .expect("abort registry lock")
            .contains(key)
    }

    /// Consume an abort request once the job has been parked.
    pub fn clear(&self, key: &str) {
        self.requested.lock().expect("abort registry lock").remove(key);
    }
}

#[derive(Clone)]
pub struct BackfillCoordinator {
    ops: Arc<dyn DatabaseOps>,
    store: Arc<Mutex<StateStore>>,
    aborts: Arc<AbortRegistry>,
    chunk_size: usize,
    max_retries: u32,
    backoff_base: Duration,
}

const BACKOFF_CAP: Duration = Duration::from_secs(60);

impl BackfillCoordinator {
    pub fn new(
        ops: Arc<dyn DatabaseOps>,
        store: Arc<Mutex<StateStore>>,
        aborts: Arc<AbortRegistry>,
        chunk_size: usize,
        max_retries: u32,
    ) -> Self {
        Self {
            ops,
            store,
            aborts,
            chunk_size,
            max_retries,
            backoff_base: Duration::from_secs(1),
        }
    }

    /// Shrink retry backoff; test hook.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Drive all given jobs to a terminal state for this cycle, concurrently.
    /// Failures are isolated per job: one exhausted job never aborts siblings.
    pub async fn run_all(
        &self,
        jobs: Vec<BackfillJob>,
    ) -> Vec<(String, Result<JobOutcome, BackfillError>)> {
        let mut set = JoinSet::new();
        for job in jobs {
            let coordinator = self.clone();
            let key = job.key();
            set.spawn(async move {
                let result = coordinator.run_job(job).await;
                (key, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(e) => log::error!("Backfill task panicked: {}", e),
            }
        }
        results
    }

    /// Run one job to a terminal state: Completed, Paused (abort) or Failed.
    pub async fn run_job(&self, mut job: BackfillJob) -> Result<JobOutcome, BackfillError> {
        let (database, table) = {
            let (db, t) = crate::schema_mutator::split_qualified(&job.table);
            (db.to_string(), t.to_string())
        };

        job.state = JobState::Running;
        self.persist(&job).await?;
        log::info!(
            "Backfill {} ({}/{} partitions done) for {}.{}",
            job.id,
            job.cursor,
            job.partitions.len(),
            job.table,
            job.column
        );

        while !job.is_done() {
            if self.aborts.is_requested(&job.key()) {
                self.aborts.clear(&job.key());
                job.state = JobState::Paused;
                self.persist(&job).await?;
                log::warn!(
                    "Backfill {} aborted by operator at partition index {}",
                    job.id,
                    job.cursor
                );
                return Ok(JobOutcome::Aborted);
            }

            let chunk_end = (job.cursor + self.chunk_size).min(job.partitions.len());
            match self.apply_chunk(&database, &table, &job, chunk_end).await {
                Ok(()) => {
                    // Cursor only advances after the whole chunk is applied, so
                    // a kill mid-chunk re-runs it from the chunk start.
                    job.cursor = chunk_end;
                    job.attempts = 0;
                    self.persist(&job).await?;
                }
                Err((partition, e)) if !e.is_retryable() => {
                    job.state = JobState::Failed;
                    self.persist(&job).await?;
                    return Err(BackfillError::NonRetryable {
                        table: job.table,
                        column: job.column,
                        partition,
                        source: e,
                    });
                }
                Err((partition, e)) => {
                    job.attempts += 1;
                    if job.attempts >= self.max_retries {
                        job.state = JobState::Failed;
                        self.persist(&job).await?;
                        return Err(BackfillError::RetriesExhausted {
                            table: job.table,
                            column: job.column,
                            partition,
                            attempts: job.attempts,
                            source: e,
                        });
                    }

                    job.state = JobState::Paused;
                    self.persist(&job).await?;
                    let backoff = self.backoff(job.attempts);
                    log::warn!(
                        "Backfill {} chunk failed (attempt {}/{}), retrying in {:?}: {}",
                        job.id,
                        job.attempts,
                        self.max_retries,
                        backoff,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    job.state = JobState::Running;
                    self.persist(&job).await?;
                }
            }
        }

        job.state = JobState::Completed;
        {
            let mut store = self.store.lock().await;
            store.update_job(job.clone());
            // Candidate becomes Materialized only via a Completed job
            store.set_candidate_state(&job.table, &job.property, CandidateState::Materialized);
            store.save()?;
        }
        log::info!(
            "Backfill {} completed: {}.{} over {} partitions",
            job.id,
            job.table,
            job.column,
            job.partitions.len()
        );
        Ok(JobOutcome::Completed)
    }

    /// Apply one chunk: sequentially materialize each partition in
    /// `[job.cursor, chunk_end)`. The per-partition ALTER is the atomic unit
    /// the database guarantees; the chunk is our persistence unit. Errors name
    /// the partition that actually failed.
    async fn apply_chunk(
        &self,
        database: &str,
        table: &str,
        job: &BackfillJob,
        chunk_end: usize,
    ) -> Result<(), (String, crate::database::DatabaseError)> {
        for partition in &job.partitions[job.cursor..chunk_end] {
            self.ops
                .materialize_partition(database, table, &job.column, partition)
                .await
                .map_err(|e| (partition.clone(), e))?;
        }
        Ok(())
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let exp = self.backoff_base.saturating_mul(1u32 << attempts.min(16));
        exp.min(BACKOFF_CAP)
    }

    async fn persist(&self, job: &BackfillJob) -> Result<(), BackfillError> {
        let mut store = self.store.lock().await;
        store.update_job(job.clone());
        store.save()?;
        Ok(())
    }
}
