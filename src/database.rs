//! Database access layer
//!
//! All ClickHouse-facing operations go through the [`DatabaseOps`] trait so the
//! pipeline can be driven against fakes in tests. The production implementation
//! wraps the `clickhouse` crate client and applies a per-call timeout; a timeout
//! surfaces as a retryable [`DatabaseError::Timeout`], never a crash.

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::query_log::QueryRecord;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("ClickHouse error: {0}")]
    Client(#[from] clickhouse::error::Error),

    #[error("Operation `{operation}` timed out after {timeout_secs}s")]
    Timeout {
        operation: String,
        timeout_secs: u64,
    },
}

impl DatabaseError {
    /// Transient errors are worth retrying with backoff; schema-shaped errors
    /// are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            DatabaseError::Timeout { .. } => true,
            DatabaseError::Client(e) => matches!(
                e,
                clickhouse::error::Error::Network(_) | clickhouse::error::Error::TimedOut
            ),
        }
    }
}

/// An existing column's definition, as reported by `system.columns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: String,
    /// `default_kind` in ClickHouse terms: "", "DEFAULT", "MATERIALIZED", ...
    pub default_kind: String,
    /// The defining expression for MATERIALIZED/DEFAULT columns
    pub default_expression: String,
}

/// The database operations the pipeline needs, behind a seam for testing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatabaseOps: Send + Sync {
    /// Fetch finished queries from the query log that touched `qualified_table`
    /// within the trailing window.
    async fn fetch_query_log(
        &self,
        qualified_table: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<QueryRecord>, DatabaseError>;

    /// Look up an existing column's definition, if the column exists.
    async fn get_column(
        &self,
        database: &str,
        table: &str,
        column: &str,
    ) -> Result<Option<ColumnDefinition>, DatabaseError>;

    /// Issue `ALTER TABLE ... ADD COLUMN IF NOT EXISTS ... MATERIALIZED ...`.
    async fn add_materialized_column(
        &self,
        database: &str,
        table: &str,
        column: &str,
        data_type: &str,
        expression: &str,
    ) -> Result<(), DatabaseError>;

    /// List the table's active partition IDs, oldest first.
    async fn list_partitions(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Vec<String>, DatabaseError>;

    /// Rewrite one partition so the materialized column is physically stored
    /// for pre-existing rows. Idempotent: the defining expression is pure, so
    /// re-running a partition recomputes identical values.
    async fn materialize_partition(
        &self,
        database: &str,
        table: &str,
        column: &str,
        partition_id: &str,
    ) -> Result<(), DatabaseError>;
}

fn read_env_var(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Build a ClickHouse client from environment variables, or None if unset.
pub fn try_get_client() -> Option<Client> {
    let url = read_env_var("CLICKHOUSE_URL")?;
    let user = read_env_var("CLICKHOUSE_USER")?;
    let password = read_env_var("CLICKHOUSE_PASSWORD")?;
    let database = read_env_var("CLICKHOUSE_DATABASE")?;

    log::info!("Connecting to ClickHouse at {}", url);
    Some(
        Client::default()
            .with_url(url)
            .with_user(user)
            .with_password(password)
            .with_database(database)
            .with_option("allow_experimental_json_type", "1")
            .with_option("mutations_sync", "0"), // Backfill mutations run async; we poll parts
    )
}

pub fn get_client() -> Client {
    try_get_client().expect("ClickHouse environment variables should be set")
}

/// Production [`DatabaseOps`] over a ClickHouse client.
pub struct ClickHouseOps {
    client: Client,
    op_timeout: Duration,
}

impl ClickHouseOps {
    pub fn new(client: Client, op_timeout: Duration) -> Self {
        Self { client, op_timeout }
    }

    async fn with_timeout<T, F>(&self, operation: &str, fut: F) -> Result<T, DatabaseError>
    where
        F: std::future::Future<Output = Result<T, clickhouse::error::Error>> + Send,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DatabaseError::Timeout {
                operation: operation.to_string(),
                timeout_secs: self.op_timeout.as_secs(),
            }),
        }
    }
}

/// Escape a string literal for interpolation into a ClickHouse statement.
pub fn escape_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Quote an identifier with backticks, escaping embedded backticks.
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "\\`"))
}

#[async_trait]
impl DatabaseOps for ClickHouseOps {
    async fn fetch_query_log(
        &self,
        qualified_table: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<QueryRecord>, DatabaseError> {
        #[derive(Debug, clickhouse::Row, Deserialize)]
        struct LogRow {
            query: String,
            query_duration_ms: u64,
            read_bytes: u64,
            event_time: u32,
        }

        // Only finished SELECTs count: failed or in-flight queries carry no
        // trustworthy duration, and our own mutations must not feed the miner.
        let sql = format!(
            "SELECT query, query_duration_ms, read_bytes, toUnixTimestamp(event_time) AS event_time \
             FROM system.query_log \
             WHERE type = 'QueryFinish' \
               AND is_initial_query \
               AND query_kind = 'Select' \
               AND has(tables, '{}') \
               AND event_time >= toDateTime({})",
            escape_literal(qualified_table),
            since.timestamp()
        );

        log::debug!("Query log scan: {}", sql);
        let rows: Vec<LogRow> = self
            .with_timeout("fetch_query_log", self.client.query(&sql).fetch_all())
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| QueryRecord {
                query: r.query,
                duration_ms: r.query_duration_ms,
                read_bytes: r.read_bytes,
                event_time: DateTime::<Utc>::from_timestamp(r.event_time as i64, 0)
                    .unwrap_or_else(Utc::now),
                table: qualified_table.to_string(),
            })
            .collect())
    }

    async fn get_column(
        &self,
        database: &str,
        table: &str,
        column: &str,
    ) -> Result<Option<ColumnDefinition>, DatabaseError> {
        #[derive(Debug, clickhouse::Row, Deserialize)]
        struct ColumnRow {
            name: String,
            #[serde(rename = "type")]
            data_type: String,
            default_kind: String,
            default_expression: String,
        }

        let sql = format!(
            "SELECT name, type, default_kind, default_expression \
             FROM system.columns \
             WHERE database = '{}' AND table = '{}' AND name = '{}'",
            escape_literal(database),
            escape_literal(table),
            escape_literal(column)
        );

        let rows: Vec<ColumnRow> = self
            .with_timeout("get_column", self.client.query(&sql).fetch_all())
            .await?;

        Ok(rows.into_iter().next().map(|c| ColumnDefinition {
            name: c.name,
            data_type: c.data_type,
            default_kind: c.default_kind,
            default_expression: c.default_expression,
        }))
    }

    async fn add_materialized_column(
        &self,
        database: &str,
        table: &str,
        column: &str,
        data_type: &str,
        expression: &str,
    ) -> Result<(), DatabaseError> {
        let sql = format!(
            "ALTER TABLE {}.{} ADD COLUMN IF NOT EXISTS {} {} MATERIALIZED {}",
            quote_identifier(database),
            quote_identifier(table),
            quote_identifier(column),
            data_type,
            expression
        );

        log::info!("Schema mutation: {}", sql);
        self.with_timeout(
            "add_materialized_column",
            self.client.query(&sql).execute(),
        )
        .await
    }

    async fn list_partitions(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Vec<String>, DatabaseError> {
        #[derive(Debug, clickhouse::Row, Deserialize)]
        struct PartitionRow {
            partition_id: String,
        }

        let sql = format!(
            "SELECT DISTINCT partition_id \
             FROM system.parts \
             WHERE database = '{}' AND table = '{}' AND active \
             ORDER BY partition_id",
            escape_literal(database),
            escape_literal(table)
        );

        let rows: Vec<PartitionRow> = self
            .with_timeout("list_partitions", self.client.query(&sql).fetch_all())
            .await?;

        Ok(rows.into_iter().map(|p| p.partition_id).collect())
    }

    async fn materialize_partition(
        &self,
        database: &str,
        table: &str,
        column: &str,
        partition_id: &str,
    ) -> Result<(), DatabaseError> {
        let sql = format!(
            "ALTER TABLE {}.{} MATERIALIZE COLUMN {} IN PARTITION ID '{}'",
            quote_identifier(database),
            quote_identifier(table),
            quote_identifier(column),
            escape_literal(partition_id)
        );

        log::debug!("Backfill chunk: {}", sql);
        self.with_timeout("materialize_partition", self.client.query(&sql).execute())
            .await
    }
}
