//! HotColumn - Automatic materialized-column selection for ClickHouse
//!
//! This crate mines the ClickHouse query log for hot JSON property accesses
//! and promotes them to physical columns through:
//! - Query log mining and property extraction
//! - Cost/benefit candidate ranking
//! - Idempotent schema mutation (ADD COLUMN ... MATERIALIZED)
//! - Resumable, partition-chunked backfill that never blocks ingestion

pub mod backfill;
pub mod config;
pub mod cycle;
pub mod database;
pub mod extractor;
pub mod lease;
pub mod query_log;
pub mod ranker;
pub mod rewriter;
pub mod schema_mutator;
pub mod server;
pub mod state;
