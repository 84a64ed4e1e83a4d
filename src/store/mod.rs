//! Table storage abstraction.
//!
//! The medallion layers read and write named tables through [`TableStore`],
//! keeping the engine independent of the physical catalog. The in-memory
//! implementation in [`memory`] backs tests and single-process runs.

mod memory;

pub use memory::MemoryTableStore;

use crate::batch::{Batch, Value};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;

/// A predicate pushed down to the store on read.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Column equals the given value.
    Eq(String, Value),
    /// Column is strictly greater than the given value.
    Gt(String, Value),
    /// Column is greater than or equal to the given value.
    Gte(String, Value),
    /// Column is strictly less than the given value.
    Lt(String, Value),
    /// Column is less than or equal to the given value.
    Lte(String, Value),
    /// Boolean column is true.
    IsTrue(String),
    /// Column is null or absent.
    IsNull(String),
    /// All of the inner filters hold.
    And(Vec<Filter>),
}

impl Filter {
    /// Evaluate the filter against one row of a batch. Absent columns read
    /// as null; incomparable values never match.
    pub fn matches(&self, batch: &Batch, row: usize) -> bool {
        match self {
            Filter::Eq(column, value) => batch.get(column, row) == Some(value),
            Filter::Gt(column, value) => Self::compare(batch, row, column, value)
                .is_some_and(|o| o == std::cmp::Ordering::Greater),
            Filter::Gte(column, value) => Self::compare(batch, row, column, value)
                .is_some_and(|o| o != std::cmp::Ordering::Less),
            Filter::Lt(column, value) => Self::compare(batch, row, column, value)
                .is_some_and(|o| o == std::cmp::Ordering::Less),
            Filter::Lte(column, value) => Self::compare(batch, row, column, value)
                .is_some_and(|o| o != std::cmp::Ordering::Greater),
            Filter::IsTrue(column) => batch.get(column, row) == Some(&Value::Bool(true)),
            Filter::IsNull(column) => {
                batch.get(column, row).map_or(true, Value::is_null)
            }
            Filter::And(filters) => filters.iter().all(|f| f.matches(batch, row)),
        }
    }

    fn compare(
        batch: &Batch,
        row: usize,
        column: &str,
        value: &Value,
    ) -> Option<std::cmp::Ordering> {
        let cell = batch.get(column, row)?;
        if cell.is_null() {
            return None;
        }
        cell.partial_cmp(value)
    }
}

/// Options for [`TableStore::read`].
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Project onto these columns; `None` reads all.
    pub columns: Option<Vec<String>>,
    /// Row predicate; `None` reads all rows.
    pub filter: Option<Filter>,
    /// Stop after this many matching rows.
    pub limit: Option<usize>,
}

impl ReadOptions {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filtered(filter: Filter) -> Self {
        Self {
            filter: Some(filter),
            ..Self::default()
        }
    }
}

/// Async access to named tables.
///
/// `append` and `overwrite` are each atomic with respect to concurrent
/// reads: a reader sees the table either before or after the call, never a
/// partial write.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Whether the table exists.
    async fn exists(&self, table: &str) -> Result<bool, StoreError>;

    /// Create a table from an initial batch. The batch may be empty, in
    /// which case only the schema is recorded. Fails if the table exists.
    async fn create_from_batch(
        &self,
        table: &str,
        batch: &Batch,
        partition_by: &[String],
        properties: HashMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Append rows to an existing table. Columns new to the table widen the
    /// schema; existing rows read as null for them.
    async fn append(&self, table: &str, batch: &Batch) -> Result<(), StoreError>;

    /// Read rows, applying filter, projection, and limit in that order.
    async fn read(&self, table: &str, options: ReadOptions) -> Result<Batch, StoreError>;

    /// Replace the table contents with the batch in one commit.
    async fn overwrite(&self, table: &str, batch: &Batch) -> Result<(), StoreError>;

    /// Properties recorded at table creation.
    async fn table_properties(&self, table: &str) -> Result<HashMap<String, String>, StoreError>;

    /// All table names, unordered.
    async fn list_tables(&self) -> Result<Vec<String>, StoreError>;
}
