//! Full-cycle pipeline tests: log mining -> ranking -> mutation -> backfill

use std::sync::Arc;

use tempfile::{tempdir, TempDir};
use tokio::sync::Mutex;

use hotcolumn::backfill::AbortRegistry;
use hotcolumn::config::{PipelineConfig, WatchedTable};
use hotcolumn::cycle::{run_cycle, CycleOutcome};
use hotcolumn::database::{ColumnDefinition, DatabaseOps};
use hotcolumn::lease::CycleLease;
use hotcolumn::ranker::StaticSavingsModel;
use hotcolumn::rewriter::MaterializedLookup;
use hotcolumn::schema_mutator::derive_column_name;
use hotcolumn::state::{CandidateState, JobState, StateStore};

use super::fake_db::FakeDatabase;

fn test_config(dir: &TempDir) -> PipelineConfig {
    PipelineConfig {
        min_usage_threshold: 10,
        top_n: 10,
        chunk_size: 1,
        max_retries: 3,
        state_path: dir.path().join("state.json").display().to_string(),
        lease_path: dir.path().join("cycle.lease").display().to_string(),
        watched_tables: vec![WatchedTable {
            database: "analytics".to_string(),
            table: "events".to_string(),
            json_column: "properties".to_string(),
        }],
        ..Default::default()
    }
}

fn open_store(config: &PipelineConfig) -> Arc<Mutex<StateStore>> {
    Arc::new(Mutex::new(StateStore::open(&config.state_path).unwrap()))
}

#[tokio::test]
async fn test_full_cycle_materializes_hot_property() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);

    let mut fake = FakeDatabase::new().with_table("analytics", "events", &["202601", "202602"]);
    fake.add_rows(
        "analytics",
        "events",
        "202601",
        &[serde_json::json!({"$current_url": "https://a.example"})],
    );
    fake.add_rows(
        "analytics",
        "events",
        "202602",
        &[serde_json::json!({"$current_url": "https://b.example"})],
    );
    fake.add_log_records("analytics.events", "$current_url", 150, 3000);

    let fake = Arc::new(fake);
    let ops: Arc<dyn DatabaseOps> = fake.clone();
    let store = open_store(&config);
    let model = StaticSavingsModel { factor: 0.5 };

    let report = run_cycle(
        ops,
        store.clone(),
        Arc::new(AbortRegistry::default()),
        &config,
        &model,
    )
    .await
    .unwrap();

    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.records_scanned, 150);
    assert_eq!(report.candidates_selected, 1);
    assert_eq!(report.jobs_completed, 1);
    assert_eq!(report.jobs_failed, 0);

    let column = derive_column_name("$current_url");
    let store = store.lock().await;
    let candidate = store.candidate("analytics.events", "$current_url").unwrap();
    assert_eq!(candidate.state, CandidateState::Materialized);
    assert_eq!(candidate.column, column);

    let job = store.job("analytics.events", "$current_url").unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.cursor, 2);

    // Both historical partitions were physically rewritten with real values
    let fake_state = fake.state.lock().unwrap();
    assert_eq!(
        fake_state.materialized_values[&("202601".to_string(), column.clone())],
        vec!["https://a.example".to_string()]
    );
    assert_eq!(
        fake_state.materialized_values[&("202602".to_string(), column.clone())],
        vec!["https://b.example".to_string()]
    );

    // The rewriter collaborator can now resolve the column
    let lookup = MaterializedLookup::from_store(&store);
    assert_eq!(
        lookup.lookup("analytics.events", "$current_url"),
        Some(column.as_str())
    );
}

#[tokio::test]
async fn test_schema_conflict_does_not_block_batch() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);

    let mut fake = FakeDatabase::new().with_table("analytics", "events", &["202601"]);
    for property in ["alpha", "beta", "gamma", "delta", "bad"] {
        fake.add_log_records("analytics.events", property, 20, 500);
    }
    // `mat_bad` pre-exists with an incompatible definition
    fake.seed_column(
        "analytics",
        "events",
        ColumnDefinition {
            name: derive_column_name("bad"),
            data_type: "UInt64".to_string(),
            default_kind: "DEFAULT".to_string(),
            default_expression: "0".to_string(),
        },
    );

    let fake = Arc::new(fake);
    let ops: Arc<dyn DatabaseOps> = fake.clone();
    let store = open_store(&config);
    let model = StaticSavingsModel { factor: 0.5 };

    let report = run_cycle(
        ops,
        store.clone(),
        Arc::new(AbortRegistry::default()),
        &config,
        &model,
    )
    .await
    .unwrap();

    assert_eq!(report.candidates_selected, 5);
    assert_eq!(report.schema_conflicts, 1);
    assert_eq!(report.jobs_completed, 4);

    let store = store.lock().await;
    assert_eq!(
        store.candidate("analytics.events", "bad").unwrap().state,
        CandidateState::Failed
    );
    for property in ["alpha", "beta", "gamma", "delta"] {
        assert_eq!(
            store.candidate("analytics.events", property).unwrap().state,
            CandidateState::Materialized,
            "property {property} should have been materialized"
        );
    }
}

#[tokio::test]
async fn test_lease_contention_is_clean_noop() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);

    let mut fake = FakeDatabase::new().with_table("analytics", "events", &["202601"]);
    fake.add_log_records("analytics.events", "$current_url", 50, 1000);
    let fake = Arc::new(fake);
    let ops: Arc<dyn DatabaseOps> = fake.clone();
    let store = open_store(&config);
    let model = StaticSavingsModel { factor: 0.5 };

    // Another "process" holds the lease
    let held = CycleLease::acquire(&config.lease_path, 3600).unwrap();

    let report = run_cycle(
        ops,
        store.clone(),
        Arc::new(AbortRegistry::default()),
        &config,
        &model,
    )
    .await
    .unwrap();

    assert_eq!(report.outcome, CycleOutcome::SkippedContended);
    assert_eq!(report.candidates_selected, 0);
    assert!(fake.state.lock().unwrap().materialize_calls.is_empty());
    assert!(store.lock().await.document().candidates.is_empty());

    held.release().unwrap();
}

#[tokio::test]
async fn test_second_cycle_deduplicates_materialized_property() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);

    let mut fake = FakeDatabase::new().with_table("analytics", "events", &["202601"]);
    fake.add_log_records("analytics.events", "$current_url", 50, 1000);
    let fake = Arc::new(fake);
    let ops: Arc<dyn DatabaseOps> = fake.clone();
    let store = open_store(&config);
    let model = StaticSavingsModel { factor: 0.5 };

    let first = run_cycle(
        ops.clone(),
        store.clone(),
        Arc::new(AbortRegistry::default()),
        &config,
        &model,
    )
    .await
    .unwrap();
    assert_eq!(first.candidates_selected, 1);

    // Same log window again: the property is Materialized and must not reappear
    let second = run_cycle(
        ops,
        store.clone(),
        Arc::new(AbortRegistry::default()),
        &config,
        &model,
    )
    .await
    .unwrap();
    assert_eq!(second.candidates_selected, 0);
    assert_eq!(second.jobs_resumed, 0);
}
