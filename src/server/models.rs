use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub started: bool,
    pub message: String,
}

/// Identifies one (table, property) unit for abort requests.
#[derive(Debug, Deserialize)]
pub struct AbortRequest {
    /// Qualified `db.table`
    pub table: String,
    pub property: String,
}

#[derive(Debug, Serialize)]
pub struct AbortResponse {
    pub requested: bool,
    pub message: String,
}

/// Answer for the rewriter's point lookup.
#[derive(Debug, Serialize)]
pub struct LookupResponse {
    pub table: String,
    pub property: String,
    /// None while the property is not yet fully materialized
    pub column: Option<String>,
}
