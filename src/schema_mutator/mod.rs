//! Schema mutator
//!
//! Turns a selected candidate into a physical `MATERIALIZED` column. The
//! operation is idempotent: `ADD COLUMN IF NOT EXISTS` plus an up-front
//! compatibility check against `system.columns`, so re-running a cycle over a
//! half-applied batch converges instead of erroring.
//!
//! Property paths may contain arbitrary characters (`$current_url`,
//! `utm source`, unicode), so the physical column name is a sanitized form of
//! the path plus a short content hash whenever sanitization was lossy. The
//! derivation is deterministic and collision-resistant: two distinct paths that
//! sanitize identically still get distinct columns.

use sha2::{Digest, Sha256};

use crate::database::{escape_literal, DatabaseOps};
use crate::state::MaterializationCandidate;

pub mod errors;
pub use errors::SchemaMutationError;

/// All auto-materialized columns share this prefix so operators can spot them.
pub const COLUMN_PREFIX: &str = "mat_";

/// Materialized columns hold the string form of the property; missing keys
/// become empty strings, which keeps the column non-Nullable and cheap.
pub const COLUMN_TYPE: &str = "String";

/// Derive the physical column name for a property path.
///
/// `$current_url` -> `mat_current_url_<8-hex>`; a path that is already a clean
/// identifier keeps its name verbatim (`browser` -> `mat_browser`).
pub fn derive_column_name(property: &str) -> String {
    let mut sanitized = String::with_capacity(property.len());
    let mut last_was_underscore = false;
    for ch in property.chars() {
        if ch.is_ascii_alphanumeric() {
            sanitized.push(ch.to_ascii_lowercase());
            last_was_underscore = false;
        } else if !last_was_underscore && !sanitized.is_empty() {
            sanitized.push('_');
            last_was_underscore = true;
        }
    }
    let sanitized = sanitized.trim_end_matches('_').to_string();

    if sanitized == property {
        format!("{}{}", COLUMN_PREFIX, sanitized)
    } else {
        // Lossy sanitization: disambiguate with a content hash of the raw path
        let digest = Sha256::digest(property.as_bytes());
        let suffix = hex::encode(&digest[..4]);
        if sanitized.is_empty() {
            format!("{}{}", COLUMN_PREFIX, suffix)
        } else {
            format!("{}{}_{}", COLUMN_PREFIX, sanitized, suffix)
        }
    }
}

/// The defining expression for a materialized property column. Unwraps quoted
/// JSON strings and yields '' for missing keys, so the expression is total
/// over any raw document.
pub fn materialization_expr(json_column: &str, property: &str) -> String {
    format!(
        "trim(BOTH '\"' FROM JSONExtractRaw({}, '{}'))",
        json_column,
        escape_literal(property)
    )
}

// ClickHouse normalizes stored expressions (spacing, keyword case), so the
// compatibility check compares a whitespace-and-case-insensitive form.
fn normalized(expr: &str) -> String {
    expr.chars()
        .filter(|c| !c.is_whitespace() && *c != '\\')
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Issue the add-column operation for one candidate.
///
/// Returns `Ok(())` when the column was added or already exists compatibly.
/// A pre-existing column with a different definition is a
/// [`SchemaMutationError::SchemaConflict`].
pub async fn apply_candidate(
    ops: &dyn DatabaseOps,
    candidate: &MaterializationCandidate,
    json_column: &str,
) -> Result<(), SchemaMutationError> {
    let (database, table) = split_qualified(&candidate.table);
    let expression = materialization_expr(json_column, &candidate.property);

    if let Some(existing) = ops.get_column(database, table, &candidate.column).await? {
        let compatible = existing.default_kind == "MATERIALIZED"
            && existing.data_type == COLUMN_TYPE
            && normalized(&existing.default_expression) == normalized(&expression);
        if compatible {
            log::info!(
                "Column {} on {} already materialized, skipping ADD COLUMN",
                candidate.column,
                candidate.table
            );
            return Ok(());
        }
        return Err(SchemaMutationError::SchemaConflict {
            table: candidate.table.clone(),
            column: candidate.column.clone(),
            existing_type: existing.data_type,
            existing_kind: existing.default_kind,
            existing_expression: existing.default_expression,
        });
    }

    ops.add_materialized_column(database, table, &candidate.column, COLUMN_TYPE, &expression)
        .await?;
    Ok(())
}

/// Split `db.table` into its parts. A bare table name maps to the `default`
/// database, matching ClickHouse resolution.
pub fn split_qualified(qualified: &str) -> (&str, &str) {
    match qualified.split_once('.') {
        Some((db, table)) => (db, table),
        None => ("default", qualified),
    }
}
