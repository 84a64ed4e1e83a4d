//! In-memory table store.

use super::{ReadOptions, TableStore};
use crate::batch::Batch;
use crate::error::StoreError;
use async_trait::async_trait;
use snafu::OptionExt;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct TableState {
    data: Batch,
    partition_by: Vec<String>,
    properties: HashMap<String, String>,
}

/// A [`TableStore`] keeping every table as a batch behind a
/// [`tokio::sync::RwLock`]. Writes take the lock exclusively, so each append
/// and overwrite is a single commit.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    tables: RwLock<HashMap<String, TableState>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn exists(&self, table: &str) -> Result<bool, StoreError> {
        Ok(self.tables.read().await.contains_key(table))
    }

    async fn create_from_batch(
        &self,
        table: &str,
        batch: &Batch,
        partition_by: &[String],
        properties: HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.contains_key(table) {
            return crate::error::TableExistsSnafu { table }.fail();
        }
        tables.insert(
            table.to_string(),
            TableState {
                data: batch.clone(),
                partition_by: partition_by.to_vec(),
                properties,
            },
        );
        Ok(())
    }

    async fn append(&self, table: &str, batch: &Batch) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let state = tables
            .get_mut(table)
            .context(crate::error::TableNotFoundSnafu { table })?;
        let current = std::mem::take(&mut state.data);
        state.data = Batch::concat(vec![current, batch.clone()]);
        Ok(())
    }

    async fn read(&self, table: &str, options: ReadOptions) -> Result<Batch, StoreError> {
        let tables = self.tables.read().await;
        let state = tables
            .get(table)
            .context(crate::error::TableNotFoundSnafu { table })?;
        let mut result = match &options.filter {
            Some(filter) => state.data.filter(|row| filter.matches(&state.data, row)),
            None => state.data.clone(),
        };
        if let Some(limit) = options.limit {
            if result.num_rows() > limit {
                let indices: Vec<usize> = (0..limit).collect();
                result = result.take_rows(&indices);
            }
        }
        if let Some(columns) = &options.columns {
            for name in columns {
                if !result.has_column(name) {
                    return crate::error::ColumnNotFoundSnafu {
                        table,
                        column: name,
                    }
                    .fail();
                }
            }
            let names: Vec<&str> = columns.iter().map(String::as_str).collect();
            result = result.select(&names);
        }
        Ok(result)
    }

    async fn overwrite(&self, table: &str, batch: &Batch) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let state = tables
            .get_mut(table)
            .context(crate::error::TableNotFoundSnafu { table })?;
        state.data = batch.clone();
        Ok(())
    }

    async fn table_properties(
        &self,
        table: &str,
    ) -> Result<HashMap<String, String>, StoreError> {
        let tables = self.tables.read().await;
        let state = tables
            .get(table)
            .context(crate::error::TableNotFoundSnafu { table })?;
        Ok(state.properties.clone())
    }

    async fn list_tables(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.tables.read().await.keys().cloned().collect())
    }
}

// Partitioning metadata is recorded but not used for physical layout.
impl MemoryTableStore {
    /// Partition columns recorded at creation, for inspection in tests.
    pub async fn partition_columns(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let tables = self.tables.read().await;
        let state = tables
            .get(table)
            .context(crate::error::TableNotFoundSnafu { table })?;
        Ok(state.partition_by.clone())
    }
}
