use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

use tracing::info;

use crate::error::PipelineError;
use crate::warehouse::{WarehouseClient, WarehouseError};

/// Permissive wide type for auto-added columns. Typing them tightly is the
/// warehouse consumer's job; the pipeline only promises not to drop fields.
pub const WIDE_COLUMN_TYPE: &str = "TEXT";

const MAX_IDENTIFIER_LEN: usize = 120;

/// Turn an observed field name into a valid column identifier: lowercase,
/// disallowed characters replaced with underscores, runs collapsed, leading
/// digits prefixed.
pub fn sanitize_identifier(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut last_was_underscore = false;
    for c in field.chars() {
        let c = c.to_ascii_lowercase();
        let mapped = if c.is_ascii_alphanumeric() { c } else { '_' };
        if mapped == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        out.push(mapped);
    }

    if out.is_empty() {
        out.push('_');
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out.truncate(MAX_IDENTIFIER_LEN);
    out
}

/// Additively migrates warehouse tables toward the observed field set.
/// Schema evolves forward-only: columns are added with a permissive type,
/// never removed or retyped. Column sets are cached per (target, table) and
/// compared case-insensitively.
#[derive(Default)]
pub struct SchemaSynchronizer {
    cache: Mutex<HashMap<String, HashSet<String>>>,
}

impl SchemaSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add any missing columns for `observed_fields`, returning how many this
    /// call actually added. Another loader winning the race to add a column
    /// counts as success, not failure.
    pub async fn sync(
        &self,
        target_name: &str,
        client: &dyn WarehouseClient,
        table: &str,
        observed_fields: &BTreeSet<String>,
    ) -> Result<usize, PipelineError> {
        let cache_key = format!("{target_name}.{table}");

        let cached = self
            .lock()
            .get(&cache_key)
            .cloned();
        let mut known = match cached {
            Some(columns) => columns,
            None => {
                let columns =
                    client
                        .list_columns(table)
                        .await
                        .map_err(|error| PipelineError::Schema {
                            table: table.to_owned(),
                            error,
                        })?;
                columns.into_iter().map(|c| c.to_lowercase()).collect()
            }
        };

        let mut added = 0;
        for field in observed_fields {
            let column = sanitize_identifier(field);
            if known.contains(&column) {
                continue;
            }
            match client.add_column(table, &column, WIDE_COLUMN_TYPE).await {
                Ok(()) => {
                    info!("added column {column} to {target_name}.{table}");
                    added += 1;
                }
                Err(WarehouseError::ColumnExists(_)) => {}
                Err(error) => {
                    return Err(PipelineError::Schema {
                        table: table.to_owned(),
                        error,
                    })
                }
            }
            known.insert(column);
        }

        self.lock().insert(cache_key, known);
        Ok(added)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashSet<String>>> {
        self.cache.lock().expect("SchemaSynchronizer lock poisoned")
    }
}
