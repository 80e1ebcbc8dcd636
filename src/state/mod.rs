//! Durable pipeline state
//!
//! Candidates and backfill jobs must survive process restarts: a killed
//! backfill resumes from its last persisted cursor, and ranking in the next
//! cycle de-duplicates against previously selected properties. The store is a
//! single JSON document keyed by `db.table::property`, written atomically
//! (temp file + rename) after every meaningful transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub mod errors;
pub use errors::StateStoreError;

/// Composite key for everything owned by one (table, property) unit.
pub fn state_key(table: &str, property: &str) -> String {
    format!("{}::{}", table, property)
}

/// Lifecycle of a materialization candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateState {
    NotMaterialized,
    /// ADD COLUMN issued; backfill not yet complete
    Pending,
    /// Backfill completed; the rewriter may substitute the column
    Materialized,
    /// Unrecoverable error; eligible for re-selection next cycle
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializationCandidate {
    /// Qualified `db.table`
    pub table: String,
    /// Property path inside the raw JSON column (arbitrary characters)
    pub property: String,
    /// Derived physical column name
    pub column: String,
    /// Benefit score at selection time
    pub score: f64,
    /// Usage count over the window that selected it
    pub usage_count: u64,
    pub state: CandidateState,
    pub selected_at: DateTime<Utc>,
}

impl MaterializationCandidate {
    pub fn key(&self) -> String {
        state_key(&self.table, &self.property)
    }
}

/// Backfill job state machine: Running -> {Completed | Paused | Failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Running,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillJob {
    pub id: Uuid,
    /// Qualified `db.table`
    pub table: String,
    pub property: String,
    pub column: String,
    /// Partition snapshot taken at job creation, oldest first. Parts created
    /// later are filled by the column definition itself and need no rewrite.
    pub partitions: Vec<String>,
    /// Index of the next unprocessed partition
    pub cursor: usize,
    /// Consecutive failures on the current chunk; reset on success
    pub attempts: u32,
    pub state: JobState,
}

impl BackfillJob {
    pub fn new(table: &str, property: &str, column: &str, partitions: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            table: table.to_string(),
            property: property.to_string(),
            column: column.to_string(),
            partitions,
            cursor: 0,
            attempts: 0,
            state: JobState::Running,
        }
    }

    pub fn key(&self) -> String {
        state_key(&self.table, &self.property)
    }

    /// Jobs that still hold (or may resume) work
    pub fn is_active(&self) -> bool {
        matches!(self.state, JobState::Running | JobState::Paused)
    }

    pub fn is_done(&self) -> bool {
        self.cursor >= self.partitions.len()
    }
}

/// The persisted document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDocument {
    pub candidates: BTreeMap<String, MaterializationCandidate>,
    pub jobs: BTreeMap<String, BackfillJob>,
}

/// File-backed store for candidates and jobs.
pub struct StateStore {
    path: PathBuf,
    doc: StateDocument,
}

impl StateStore {
    /// Load the store from `path`, or start empty if the file doesn't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let path = path.as_ref().to_path_buf();
        let doc = match std::fs::read_to_string(&path) {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| StateStoreError::Parse {
                    path: path.display().to_string(),
                    source: e,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateDocument::default(),
            Err(e) => {
                return Err(StateStoreError::Read {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };
        Ok(Self { path, doc })
    }

    /// Persist atomically: write a sibling temp file, then rename over the
    /// target so a crash never leaves a half-written document.
    pub fn save(&self) -> Result<(), StateStoreError> {
        let serialized =
            serde_json::to_string_pretty(&self.doc).expect("state document serializes");
        let tmp_path = self.path.with_extension("json.tmp");
        let write_err = |source| StateStoreError::Write {
            path: self.path.display().to_string(),
            source,
        };
        std::fs::write(&tmp_path, serialized).map_err(write_err)?;
        std::fs::rename(&tmp_path, &self.path).map_err(write_err)?;
        Ok(())
    }

    pub fn document(&self) -> &StateDocument {
        &self.doc
    }

    pub fn candidate(&self, table: &str, property: &str) -> Option<&MaterializationCandidate> {
        self.doc.candidates.get(&state_key(table, property))
    }

    pub fn upsert_candidate(&mut self, candidate: MaterializationCandidate) {
        self.doc.candidates.insert(candidate.key(), candidate);
    }

    pub fn set_candidate_state(&mut self, table: &str, property: &str, state: CandidateState) {
        if let Some(candidate) = self.doc.candidates.get_mut(&state_key(table, property)) {
            candidate.state = state;
        }
    }

    pub fn job(&self, table: &str, property: &str) -> Option<&BackfillJob> {
        self.doc.jobs.get(&state_key(table, property))
    }

    /// Insert a job unless an active one already owns this (table, property).
    /// Keying by the composite key enforces the single-active-job invariant.
    pub fn enqueue_job(&mut self, job: BackfillJob) -> bool {
        let key = job.key();
        if let Some(existing) = self.doc.jobs.get(&key) {
            if existing.is_active() {
                log::warn!("Job already active for {}, not enqueuing another", key);
                return false;
            }
        }
        self.doc.jobs.insert(key, job);
        true
    }

    pub fn update_job(&mut self, job: BackfillJob) {
        self.doc.jobs.insert(job.key(), job);
    }

    /// Jobs that should be picked up at the start of a cycle: Running ones a
    /// crash left behind, and Paused ones waiting for a retry.
    pub fn resumable_jobs(&self) -> Vec<BackfillJob> {
        self.doc
            .jobs
            .values()
            .filter(|j| j.is_active())
            .cloned()
            .collect()
    }

    /// Properties the ranker must not re-select for a table: Materialized or
    /// Pending. Failed candidates stay eligible and are retried next cycle.
    pub fn excluded_properties(&self, table: &str) -> HashSet<String> {
        self.doc
            .candidates
            .values()
            .filter(|c| {
                c.table == table
                    && matches!(
                        c.state,
                        CandidateState::Pending | CandidateState::Materialized
                    )
            })
            .map(|c| c.property.clone())
            .collect()
    }

    /// The read-only view the query-rewriter collaborator consumes.
    pub fn materialized_columns(&self) -> Vec<&MaterializationCandidate> {
        self.doc
            .candidates
            .values()
            .filter(|c| c.state == CandidateState::Materialized)
            .collect()
    }
}
