//! In-memory columnar batches.
//!
//! A [`Batch`] is the unit of data handed between connectors, the medallion
//! layers, and the table store: an ordered set of named columns of equal
//! length. Batches are cheap to clone column-by-column and are treated as
//! immutable once handed to the engine; the mutating helpers here are for
//! constructing the next batch, not patching rows in place.

mod value;

pub use value::Value;

use indexmap::IndexMap;
use snafu::prelude::*;
use std::cmp::Ordering;

/// Errors from batch construction and column operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BatchError {
    /// Column length does not match the batch row count.
    #[snafu(display("Column '{column}' has {actual} values, expected {expected}"))]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },

    /// Column name appears more than once.
    #[snafu(display("Duplicate column '{column}'"))]
    DuplicateColumn { column: String },

    /// A record was not a JSON object.
    #[snafu(display("Record {index} is not a JSON object"))]
    NotAnObject { index: usize },
}

/// An ordered collection of equally sized named columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    columns: IndexMap<String, Vec<Value>>,
    rows: usize,
}

impl Batch {
    /// An empty batch with no columns and no rows.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a batch from `(name, values)` pairs. All columns must have the
    /// same length.
    pub fn from_columns<N, I>(columns: I) -> Result<Self, BatchError>
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, Vec<Value>)>,
    {
        let mut batch = Batch::new();
        let mut first = true;
        for (name, values) in columns {
            let name = name.into();
            if first {
                batch.rows = values.len();
                first = false;
            }
            ensure!(
                values.len() == batch.rows,
                LengthMismatchSnafu {
                    column: name.clone(),
                    expected: batch.rows,
                    actual: values.len(),
                }
            );
            ensure!(
                !batch.columns.contains_key(&name),
                DuplicateColumnSnafu { column: name }
            );
            batch.columns.insert(name, values);
        }
        Ok(batch)
    }

    /// Build a batch from JSON object records.
    ///
    /// The column set is the union of all keys in first-seen order; records
    /// missing a key get nulls. Nested objects and arrays are preserved as
    /// [`Value::Json`].
    pub fn from_json_records(records: Vec<serde_json::Value>) -> Result<Self, BatchError> {
        let mut columns: IndexMap<String, Vec<Value>> = IndexMap::new();
        for (index, record) in records.into_iter().enumerate() {
            let object = match record {
                serde_json::Value::Object(map) => map,
                _ => return NotAnObjectSnafu { index }.fail(),
            };
            // Backfill nulls for columns this record introduces.
            for (key, json) in object {
                let column = columns.entry(key).or_insert_with(|| vec![Value::Null; index]);
                column.push(Value::from_json(json));
            }
            for column in columns.values_mut() {
                if column.len() == index {
                    column.push(Value::Null);
                }
            }
        }
        let rows = columns.values().next().map_or(0, Vec::len);
        Ok(Batch { columns, rows })
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Cell access; `None` if the column does not exist or the row is out of
    /// range.
    pub fn get(&self, name: &str, row: usize) -> Option<&Value> {
        self.columns.get(name).and_then(|c| c.get(row))
    }

    /// Add or replace a column. Length must match the row count, except on a
    /// batch with no columns yet, where it defines the row count.
    pub fn push_column(
        &mut self,
        name: impl Into<String>,
        values: Vec<Value>,
    ) -> Result<(), BatchError> {
        let name = name.into();
        if self.columns.is_empty() {
            self.rows = values.len();
        }
        ensure!(
            values.len() == self.rows,
            LengthMismatchSnafu {
                column: name.clone(),
                expected: self.rows,
                actual: values.len(),
            }
        );
        self.columns.insert(name, values);
        Ok(())
    }

    /// Add or replace a column by broadcasting one value to every row.
    pub fn set_literal(&mut self, name: impl Into<String>, value: Value) {
        let values = vec![value; self.rows];
        self.columns.insert(name.into(), values);
    }

    /// Rename a column. Missing source names are ignored.
    pub fn rename_column(&mut self, from: &str, to: &str) {
        if let Some(index) = self.columns.get_index_of(from) {
            if let Some((_, values)) = self.columns.shift_remove_index(index) {
                self.columns.shift_insert(index, to.to_string(), values);
            }
        }
    }

    /// Replace each cell of a column through `f`. Missing columns are
    /// ignored.
    pub fn map_column(&mut self, name: &str, mut f: impl FnMut(&Value) -> Value) {
        if let Some(values) = self.columns.get_mut(name) {
            for value in values.iter_mut() {
                *value = f(value);
            }
        }
    }

    pub fn drop_column(&mut self, name: &str) {
        self.columns.shift_remove(name);
    }

    /// Project onto the named columns, skipping names that do not exist.
    pub fn select(&self, names: &[&str]) -> Batch {
        let mut columns = IndexMap::new();
        for &name in names {
            if let Some(values) = self.columns.get(name) {
                columns.insert(name.to_string(), values.clone());
            }
        }
        let rows = if columns.is_empty() { 0 } else { self.rows };
        Batch { columns, rows }
    }

    /// Keep rows whose index satisfies the predicate.
    pub fn filter(&self, keep: impl Fn(usize) -> bool) -> Batch {
        let indices: Vec<usize> = (0..self.rows).filter(|&i| keep(i)).collect();
        self.take_rows(&indices)
    }

    /// Materialize the given row indices, in order.
    pub fn take_rows(&self, indices: &[usize]) -> Batch {
        let columns = self
            .columns
            .iter()
            .map(|(name, values)| {
                let taken = indices.iter().map(|&i| values[i].clone()).collect();
                (name.clone(), taken)
            })
            .collect();
        Batch {
            columns,
            rows: indices.len(),
        }
    }

    /// Stable sort by one column. Nulls order first; incomparable values
    /// keep their relative order.
    pub fn sort_by(&self, column: &str, descending: bool) -> Batch {
        let Some(values) = self.columns.get(column) else {
            return self.clone();
        };
        let mut indices: Vec<usize> = (0..self.rows).collect();
        indices.sort_by(|&a, &b| {
            let ordering = match (&values[a], &values[b]) {
                (Value::Null, Value::Null) => Ordering::Equal,
                (Value::Null, _) => Ordering::Less,
                (_, Value::Null) => Ordering::Greater,
                (x, y) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
            };
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
        self.take_rows(&indices)
    }

    /// One row as an ordered name→value map.
    pub fn row_map(&self, row: usize) -> IndexMap<String, Value> {
        self.columns
            .iter()
            .map(|(name, values)| (name.clone(), values[row].clone()))
            .collect()
    }

    /// The values of the named columns at one row, for use as a key tuple.
    /// Missing columns yield nulls.
    pub fn key_at(&self, row: usize, columns: &[String]) -> Vec<Value> {
        columns
            .iter()
            .map(|name| self.get(name, row).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Maximum non-null value of a column under within-type ordering.
    pub fn max_of(&self, column: &str) -> Option<Value> {
        let values = self.columns.get(column)?;
        let mut max: Option<&Value> = None;
        for value in values {
            if value.is_null() {
                continue;
            }
            match max {
                None => max = Some(value),
                Some(current) => {
                    if value.partial_cmp(current) == Some(Ordering::Greater) {
                        max = Some(value);
                    }
                }
            }
        }
        max.cloned()
    }

    /// Vertically concatenate batches. The output schema is the union of all
    /// input schemas in first-seen order; missing cells become null.
    pub fn concat(batches: impl IntoIterator<Item = Batch>) -> Batch {
        let batches: Vec<Batch> = batches.into_iter().filter(|b| b.num_columns() > 0).collect();
        let mut columns: IndexMap<String, Vec<Value>> = IndexMap::new();
        let total: usize = batches.iter().map(Batch::num_rows).sum();
        let mut written = 0usize;
        for batch in &batches {
            for name in batch.columns.keys() {
                columns
                    .entry(name.clone())
                    .or_insert_with(|| vec![Value::Null; written]);
            }
            for (name, out) in columns.iter_mut() {
                match batch.columns.get(name) {
                    Some(values) => out.extend(values.iter().cloned()),
                    None => out.extend(std::iter::repeat(Value::Null).take(batch.rows)),
                }
            }
            written += batch.rows;
        }
        Batch {
            columns,
            rows: total,
        }
    }

    /// An empty batch that keeps this batch's schema (for schema-only
    /// writes).
    pub fn clear(&self) -> Batch {
        let columns = self
            .columns
            .keys()
            .map(|name| (name.clone(), Vec::new()))
            .collect();
        Batch { columns, rows: 0 }
    }
}
