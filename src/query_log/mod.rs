//! Query log reader
//!
//! Thin glue over [`DatabaseOps::fetch_query_log`]: computes the trailing
//! window and pulls records for every watched table.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::database::{DatabaseError, DatabaseOps};

/// One finished query as observed in `system.query_log`.
/// Immutable; produced by the reader, consumed once by the extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub query: String,
    pub duration_ms: u64,
    pub read_bytes: u64,
    pub event_time: DateTime<Utc>,
    /// Qualified `db.table` the record was attributed to
    pub table: String,
}

/// Fetch the trailing-window query log for every watched table.
pub async fn read_window(
    ops: &dyn DatabaseOps,
    config: &PipelineConfig,
) -> Result<Vec<QueryRecord>, DatabaseError> {
    let since = Utc::now() - Duration::days(config.trailing_window_days as i64);
    let mut records = Vec::new();

    for watched in &config.watched_tables {
        let qualified = watched.qualified_name();
        let mut batch = ops.fetch_query_log(&qualified, since).await?;
        log::info!(
            "Query log: {} records for {} since {}",
            batch.len(),
            qualified,
            since
        );
        records.append(&mut batch);
    }

    Ok(records)
}
