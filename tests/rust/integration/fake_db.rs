//! In-memory [`DatabaseOps`] fake
//!
//! Models just enough ClickHouse to drive the pipeline end to end: a query
//! log, per-table column definitions, partitioned rows of raw JSON documents,
//! and a `MATERIALIZE COLUMN` that actually computes values from the raw data
//! (so idempotence tests can compare real outputs). Failure injection is per
//! partition, either transient (fails once) or persistent.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use hotcolumn::database::{ColumnDefinition, DatabaseError, DatabaseOps};
use hotcolumn::query_log::QueryRecord;

#[derive(Default)]
pub struct FakeState {
    /// (db, table) -> column definitions
    pub columns: HashMap<(String, String), Vec<ColumnDefinition>>,
    /// (db, table) -> ordered partition ids
    pub partitions: HashMap<(String, String), Vec<String>>,
    /// (db, table, partition) -> raw JSON documents
    pub rows: HashMap<(String, String, String), Vec<serde_json::Value>>,
    /// column name -> the property its expression extracts
    pub column_properties: HashMap<String, String>,
    /// (partition, column) -> computed values, the "physical" column content
    pub materialized_values: HashMap<(String, String), Vec<String>>,
    /// every materialize call, in order: (partition, column)
    pub materialize_calls: Vec<(String, String)>,
    /// partitions that always fail with a timeout
    pub fail_partitions: HashSet<String>,
    /// partitions that fail exactly once, then recover
    pub fail_once_partitions: HashSet<String>,
}

pub struct FakeDatabase {
    pub query_log: Vec<QueryRecord>,
    pub state: Mutex<FakeState>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self {
            query_log: Vec::new(),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn with_table(self, database: &str, table: &str, partitions: &[&str]) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.partitions.insert(
                (database.to_string(), table.to_string()),
                partitions.iter().map(|p| p.to_string()).collect(),
            );
        }
        self
    }

    pub fn add_rows(&self, database: &str, table: &str, partition: &str, docs: &[serde_json::Value]) {
        let mut state = self.state.lock().unwrap();
        state
            .rows
            .entry((database.to_string(), table.to_string(), partition.to_string()))
            .or_default()
            .extend(docs.iter().cloned());
    }

    pub fn add_log_records(&mut self, table: &str, property: &str, count: usize, duration_ms: u64) {
        for _ in 0..count {
            self.query_log.push(QueryRecord {
                query: format!(
                    "SELECT count() FROM {} WHERE JSONExtractString(properties, '{}') != ''",
                    table, property
                ),
                duration_ms,
                read_bytes: 1 << 16,
                event_time: Utc::now(),
                table: table.to_string(),
            });
        }
    }

    /// Pre-create a column so the mutator's compatibility check sees it.
    pub fn seed_column(&self, database: &str, table: &str, definition: ColumnDefinition) {
        let mut state = self.state.lock().unwrap();
        state
            .columns
            .entry((database.to_string(), table.to_string()))
            .or_default()
            .push(definition);
    }

    fn timeout(operation: &str) -> DatabaseError {
        DatabaseError::Timeout {
            operation: operation.to_string(),
            timeout_secs: 1,
        }
    }
}

#[async_trait]
impl DatabaseOps for FakeDatabase {
    async fn fetch_query_log(
        &self,
        qualified_table: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<QueryRecord>, DatabaseError> {
        Ok(self
            .query_log
            .iter()
            .filter(|r| r.table == qualified_table && r.event_time >= since)
            .cloned()
            .collect())
    }

    async fn get_column(
        &self,
        database: &str,
        table: &str,
        column: &str,
    ) -> Result<Option<ColumnDefinition>, DatabaseError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .columns
            .get(&(database.to_string(), table.to_string()))
            .and_then(|columns| columns.iter().find(|c| c.name == column))
            .cloned())
    }

    async fn add_materialized_column(
        &self,
        database: &str,
        table: &str,
        column: &str,
        data_type: &str,
        expression: &str,
    ) -> Result<(), DatabaseError> {
        let mut state = self.state.lock().unwrap();
        let key = (database.to_string(), table.to_string());
        let columns = state.columns.entry(key).or_default();
        // IF NOT EXISTS semantics
        if columns.iter().any(|c| c.name == column) {
            return Ok(());
        }
        columns.push(ColumnDefinition {
            name: column.to_string(),
            data_type: data_type.to_string(),
            default_kind: "MATERIALIZED".to_string(),
            default_expression: expression.to_string(),
        });

        // Remember which property the expression extracts, for materialization.
        // The property path is the last quoted literal in the expression.
        if let Some(property) = expression.split('\'').rev().nth(1) {
            state
                .column_properties
                .insert(column.to_string(), property.replace("\\'", "'"));
        }
        Ok(())
    }

    async fn list_partitions(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .partitions
            .get(&(database.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn materialize_partition(
        &self,
        database: &str,
        table: &str,
        column: &str,
        partition_id: &str,
    ) -> Result<(), DatabaseError> {
        let mut state = self.state.lock().unwrap();
        state
            .materialize_calls
            .push((partition_id.to_string(), column.to_string()));

        if state.fail_partitions.contains(partition_id) {
            return Err(Self::timeout("materialize_partition"));
        }
        if state.fail_once_partitions.remove(partition_id) {
            return Err(Self::timeout("materialize_partition"));
        }

        let property = state
            .column_properties
            .get(column)
            .cloned()
            .unwrap_or_default();
        let docs = state
            .rows
            .get(&(
                database.to_string(),
                table.to_string(),
                partition_id.to_string(),
            ))
            .cloned()
            .unwrap_or_default();

        // trim(BOTH '"' FROM JSONExtractRaw(...)) semantics: strings unwrap,
        // missing keys become ''
        let values: Vec<String> = docs
            .iter()
            .map(|doc| match doc.get(&property) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            })
            .collect();

        state
            .materialized_values
            .insert((partition_id.to_string(), column.to_string()), values);
        Ok(())
    }
}
