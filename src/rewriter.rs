//! Query-rewriter collaborator interface
//!
//! The rewriter itself is out of core scope; what it needs from us is a
//! read-only `lookup(table, property) -> column name` view over the properties
//! whose backfill has completed. Pending columns are deliberately invisible:
//! until backfill finishes, old rows would read as empty.

use std::collections::HashMap;

use serde::Serialize;

use crate::state::StateStore;

/// One entry of the rewriter view, also served over the ops HTTP surface.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MaterializedColumn {
    pub table: String,
    pub property: String,
    pub column: String,
}

/// Immutable lookup snapshot built from the state store.
#[derive(Debug, Clone, Default)]
pub struct MaterializedLookup {
    columns: HashMap<(String, String), String>,
}

impl MaterializedLookup {
    pub fn from_store(store: &StateStore) -> Self {
        let columns = store
            .materialized_columns()
            .into_iter()
            .map(|c| {
                (
                    (c.table.clone(), c.property.clone()),
                    c.column.clone(),
                )
            })
            .collect();
        Self { columns }
    }

    /// The materialized column name for (table, property), or None when the
    /// rewriter must keep extracting from the raw JSON column.
    pub fn lookup(&self, table: &str, property: &str) -> Option<&str> {
        self.columns
            .get(&(table.to_string(), property.to_string()))
            .map(|s| s.as_str())
    }

    pub fn entries(&self) -> Vec<MaterializedColumn> {
        let mut entries: Vec<_> = self
            .columns
            .iter()
            .map(|((table, property), column)| MaterializedColumn {
                table: table.clone(),
                property: property.clone(),
                column: column.clone(),
            })
            .collect();
        entries.sort_by(|a, b| (&a.table, &a.property).cmp(&(&b.table, &b.property)));
        entries
    }
}
