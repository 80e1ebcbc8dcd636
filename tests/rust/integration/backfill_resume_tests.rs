//! Backfill durability: crash resume, retry exhaustion, chunk idempotence

use std::sync::Arc;

use chrono::Utc;
use tempfile::{tempdir, TempDir};
use tokio::sync::Mutex;

use hotcolumn::backfill::AbortRegistry;
use hotcolumn::config::{PipelineConfig, WatchedTable};
use hotcolumn::cycle::run_cycle;
use hotcolumn::database::DatabaseOps;
use hotcolumn::ranker::StaticSavingsModel;
use hotcolumn::schema_mutator::{derive_column_name, materialization_expr};
use hotcolumn::state::{
    BackfillJob, CandidateState, JobState, MaterializationCandidate, StateStore,
};

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

#[tokio::test]
async fn test_killed_job_resumes_from_persisted_cursor() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);
    let column = derive_column_name("$current_url");

    let fake = FakeDatabase::new().with_table("analytics", "events", &["202601", "202602", "202603"]);
    let fake = Arc::new(fake);
    let ops: Arc<dyn DatabaseOps> = fake.clone();

    // Simulate the state a mid-chunk kill leaves behind: Pending candidate,
    // Running job, cursor past the first partition. Add the column the way
    // the mutator would have, so the fake knows its expression.
    ops.add_materialized_column(
        "analytics",
        "events",
        &column,
        "String",
        &materialization_expr("properties", "$current_url"),
    )
    .await
    .unwrap();
    {
        let mut store = StateStore::open(&config.state_path).unwrap();
        store.upsert_candidate(MaterializationCandidate {
            table: "analytics.events".to_string(),
            property: "$current_url".to_string(),
            column: column.clone(),
            score: 100.0,
            usage_count: 500,
            state: CandidateState::Pending,
            selected_at: Utc::now(),
        });
        let mut job = BackfillJob::new(
            "analytics.events",
            "$current_url",
            &column,
            vec![
                "202601".to_string(),
                "202602".to_string(),
                "202603".to_string(),
            ],
        );
        job.cursor = 1;
        job.state = JobState::Running;
        assert!(store.enqueue_job(job));
        store.save().unwrap();
    }

    // Fresh "process": reload the store from disk and run a cycle (empty log)
    let store = Arc::new(Mutex::new(StateStore::open(&config.state_path).unwrap()));
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

    assert_eq!(report.jobs_resumed, 1);
    assert_eq!(report.jobs_completed, 1);

    // Only the unprocessed partitions were touched - not the start of the table
    let touched: Vec<String> = fake
        .state
        .lock()
        .unwrap()
        .materialize_calls
        .iter()
        .map(|(partition, _)| partition.clone())
        .collect();
    assert_eq!(touched, vec!["202602".to_string(), "202603".to_string()]);

    let store = store.lock().await;
    assert_eq!(
        store
            .candidate("analytics.events", "$current_url")
            .unwrap()
            .state,
        CandidateState::Materialized
    );
}

#[tokio::test(start_paused = true)]
async fn test_transient_chunk_failure_recovers_with_backoff() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);

    let mut fake = FakeDatabase::new().with_table("analytics", "events", &["202601", "202602"]);
    fake.add_log_records("analytics.events", "plan", 50, 800);
    fake.state
        .lock()
        .unwrap()
        .fail_once_partitions
        .insert("202602".to_string());

    let fake = Arc::new(fake);
    let ops: Arc<dyn DatabaseOps> = fake.clone();
    let store = Arc::new(Mutex::new(StateStore::open(&config.state_path).unwrap()));
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

    assert_eq!(report.jobs_completed, 1);
    assert_eq!(report.jobs_failed, 0);

    // The failing partition was attempted twice: fail, backoff, succeed
    let calls = fake.state.lock().unwrap().materialize_calls.clone();
    let attempts_on_flaky = calls.iter().filter(|(p, _)| p == "202602").count();
    assert_eq!(attempts_on_flaky, 2);

    let store = store.lock().await;
    assert_eq!(
        store.job("analytics.events", "plan").unwrap().state,
        JobState::Completed
    );
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_leave_candidate_pending() {
    let dir = tempdir().unwrap();
    let config = test_config(&dir);

    let mut fake = FakeDatabase::new().with_table("analytics", "events", &["202601"]);
    fake.add_log_records("analytics.events", "plan", 50, 800);
    fake.state
        .lock()
        .unwrap()
        .fail_partitions
        .insert("202601".to_string());

    let fake = Arc::new(fake);
    let ops: Arc<dyn DatabaseOps> = fake.clone();
    let store = Arc::new(Mutex::new(StateStore::open(&config.state_path).unwrap()));
    let model = StaticSavingsModel { factor: 0.5 };

    let report = run_cycle(
        ops.clone(),
        store.clone(),
        Arc::new(AbortRegistry::default()),
        &config,
        &model,
    )
    .await
    .unwrap();

    assert_eq!(report.jobs_failed, 1);
    {
        let store = store.lock().await;
        // Never auto-rolled-back: the candidate stays Pending for manual review
        assert_eq!(
            store.candidate("analytics.events", "plan").unwrap().state,
            CandidateState::Pending
        );
        assert_eq!(
            store.job("analytics.events", "plan").unwrap().state,
            JobState::Failed
        );
    }

    // Next cycle: Pending is excluded from ranking, Failed jobs are not resumed
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

#[tokio::test]
async fn test_replaying_a_chunk_is_idempotent() -> anyhow::Result<()> {
    let fake = FakeDatabase::new().with_table("analytics", "events", &["202601"]);
    fake.add_rows(
        "analytics",
        "events",
        "202601",
        &[
            serde_json::json!({"plan": "pro", "seats": 4}),
            serde_json::json!({"seats": 1}),
        ],
    );
    let fake = Arc::new(fake);
    let ops: Arc<dyn DatabaseOps> = fake.clone();

    ops.add_materialized_column(
        "analytics",
        "events",
        "mat_plan",
        "String",
        &materialization_expr("properties", "plan"),
    )
    .await?;

    ops.materialize_partition("analytics", "events", "mat_plan", "202601")
        .await?;
    let first = fake.state.lock().unwrap().materialized_values
        [&("202601".to_string(), "mat_plan".to_string())]
        .clone();

    // Crash-resume replays the same chunk; values must come out identical
    ops.materialize_partition("analytics", "events", "mat_plan", "202601")
        .await?;
    let second = fake.state.lock().unwrap().materialized_values
        [&("202601".to_string(), "mat_plan".to_string())]
        .clone();

    assert_eq!(first, second);
    assert_eq!(first, vec!["pro".to_string(), String::new()]);
    Ok(())
}
