use serde::{Deserialize, Serialize};
use std::env;
use thiserror::Error;
use validator::Validate;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable error: {0}")]
    EnvVar(#[from] std::env::VarError),

    #[error("Parse error for {field}: {value} - {source}")]
    Parse {
        field: String,
        value: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// A table whose queries are mined for JSON property extraction calls.
#[derive(Clone, Debug, Validate, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchedTable {
    /// ClickHouse database the table lives in
    #[validate(length(min = 1, message = "Database name cannot be empty"))]
    pub database: String,

    /// Table name
    #[validate(length(min = 1, message = "Table name cannot be empty"))]
    pub table: String,

    /// The raw serialized-JSON column that extraction calls read from
    #[serde(default = "default_json_column")]
    pub json_column: String,
}

fn default_json_column() -> String {
    "properties".to_string()
}

impl WatchedTable {
    /// Fully-qualified `db.table` form used in SQL statements and state keys
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

/// Pipeline configuration with validation
#[derive(Clone, Debug, Validate, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Size of the query-log window scanned, in days
    #[validate(range(
        min = 1,
        max = 90,
        message = "Trailing window must be between 1 and 90 days"
    ))]
    pub trailing_window_days: u32,

    /// Maximum number of new candidates selected per cycle
    #[validate(range(min = 1, max = 1000, message = "top_n must be between 1 and 1000"))]
    pub top_n: usize,

    /// Partitions rewritten per backfill step
    #[validate(range(min = 1, max = 100, message = "chunk_size must be between 1 and 100"))]
    pub chunk_size: usize,

    /// Attempt cap for a failing backfill chunk before the job goes Failed
    #[validate(range(min = 1, max = 20, message = "max_retries must be between 1 and 20"))]
    pub max_retries: u32,

    /// Floor usage count below which a property is never considered
    pub min_usage_threshold: u64,

    /// Fraction of observed query cost assumed saved by materialization.
    /// Replaceable heuristic; see `ranker::BenefitModel`.
    #[validate(range(
        min = 0.0,
        max = 1.0,
        message = "savings_factor must be between 0.0 and 1.0"
    ))]
    pub savings_factor: f64,

    /// Per-call timeout for database-facing operations, in seconds
    #[validate(range(
        min = 1,
        max = 3600,
        message = "Operation timeout must be between 1 and 3600 seconds"
    ))]
    pub op_timeout_secs: u64,

    /// Path of the durable candidate/job state file
    #[validate(length(min = 1, message = "State path cannot be empty"))]
    pub state_path: String,

    /// Path of the single-flight cycle lease file
    #[validate(length(min = 1, message = "Lease path cannot be empty"))]
    pub lease_path: String,

    /// Lease TTL in seconds; a crashed holder stops wedging cycles after this
    #[validate(range(
        min = 60,
        max = 86400,
        message = "Lease TTL must be between 60 and 86400 seconds"
    ))]
    pub lease_ttl_secs: u64,

    /// Tables whose query traffic is mined
    #[validate(
        length(min = 1, message = "At least one watched table is required"),
        nested
    )]
    pub watched_tables: Vec<WatchedTable>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            trailing_window_days: 7,
            top_n: 10,
            chunk_size: 1,
            max_retries: 3,
            min_usage_threshold: 100,
            savings_factor: 0.5,
            op_timeout_secs: 600,
            state_path: "hotcolumn_state.json".to_string(),
            lease_path: "hotcolumn.lease".to_string(),
            lease_ttl_secs: 6 * 3600,
            watched_tables: vec![WatchedTable {
                database: "default".to_string(),
                table: "events".to_string(),
                json_column: default_json_column(),
            }],
        }
    }
}

impl PipelineConfig {
    /// Create configuration from environment variables with validation.
    /// The watched-table list only comes from YAML; env configuration keeps
    /// the default single `default.events` entry unless merged with a file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            trailing_window_days: parse_env_var("HOTCOLUMN_WINDOW_DAYS", "7")?,
            top_n: parse_env_var("HOTCOLUMN_TOP_N", "10")?,
            chunk_size: parse_env_var("HOTCOLUMN_CHUNK_SIZE", "1")?,
            max_retries: parse_env_var("HOTCOLUMN_MAX_RETRIES", "3")?,
            min_usage_threshold: parse_env_var("HOTCOLUMN_MIN_USAGE", "100")?,
            savings_factor: parse_env_var("HOTCOLUMN_SAVINGS_FACTOR", "0.5")?,
            op_timeout_secs: parse_env_var("HOTCOLUMN_OP_TIMEOUT_SECS", "600")?,
            state_path: env::var("HOTCOLUMN_STATE_PATH")
                .unwrap_or_else(|_| "hotcolumn_state.json".to_string()),
            lease_path: env::var("HOTCOLUMN_LEASE_PATH")
                .unwrap_or_else(|_| "hotcolumn.lease".to_string()),
            lease_ttl_secs: parse_env_var("HOTCOLUMN_LEASE_TTL_SECS", "21600")?,
            watched_tables: PipelineConfig::default().watched_tables,
        };

        config.validate()?;
        Ok(config)
    }

    /// Create configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::Parse {
            field: "yaml_file".to_string(),
            value: path.as_ref().display().to_string(),
            source: Box::new(e),
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
            field: "yaml_content".to_string(),
            value: content,
            source: Box::new(e),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Find the watched-table entry for a qualified `db.table` name
    pub fn watched_table(&self, qualified: &str) -> Option<&WatchedTable> {
        self.watched_tables
            .iter()
            .find(|t| t.qualified_name() == qualified)
    }
}

/// Parse an environment variable with a default value
fn parse_env_var<T: std::str::FromStr>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = env::var(key).unwrap_or_else(|_| default.to_string());
    value.parse().map_err(|e| ConfigError::Parse {
        field: key.to_string(),
        value,
        source: Box::new(e),
    })
}
