use thiserror::Error;

use crate::database::DatabaseError;

#[derive(Error, Debug)]
pub enum SchemaMutationError {
    /// A column with the derived name already exists with an incompatible
    /// definition. Never silently overwritten; the candidate is marked Failed
    /// and left for manual review.
    #[error(
        "Column `{column}` on {table} already exists with incompatible definition \
         ({existing_kind} {existing_type} {existing_expression})"
    )]
    SchemaConflict {
        table: String,
        column: String,
        existing_type: String,
        existing_kind: String,
        existing_expression: String,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}
