//! Slowly Changing Dimension Type 2 management.
//!
//! SCD Type 2 keeps full history for dimension tables: changes never update
//! a row in place, they close the old version and insert a new one. Each
//! version carries:
//!
//! - `_scd_surrogate_key` — unique id per version row
//! - `_scd_business_key` — the joined business key values
//! - `_scd_effective_from` / `_scd_effective_to` — the half-open validity
//!   interval; `_scd_effective_to` is null while the version is current
//! - `_scd_is_current` — at most one true row per business key
//! - `_scd_version` — 1 for the first version, strictly increasing
//!
//! Change detection compares payload columns directly, skipping the `_scd_*`
//! columns and the bronze/silver provenance columns; a null value and an
//! absent column compare equal. Re-applying an unchanged snapshot writes
//! nothing.
//!
//! Closing and inserting versions happens as a single overwrite of the
//! rebuilt table image, so a reader never observes a key with its old
//! version closed but the new one missing.

use crate::batch::{Batch, Value};
use crate::emit;
use crate::error::{StoreError, TransformationError};
use crate::metrics::events::DimensionMerged;
use crate::store::{Filter, ReadOptions, TableStore};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use snafu::ResultExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// System columns managed by the SCD2 machinery.
pub const SCD_COLUMNS: [&str; 6] = [
    "_scd_surrogate_key",
    "_scd_business_key",
    "_scd_effective_from",
    "_scd_effective_to",
    "_scd_is_current",
    "_scd_version",
];

/// Parameters for one dimension merge.
#[derive(Debug, Clone)]
pub struct Scd2Request {
    /// Target dimension table (unqualified).
    pub table: String,
    /// Columns identifying a business entity.
    pub business_keys: Vec<String>,
    /// Columns compared for change detection. `None` tracks every payload
    /// column of the source.
    pub tracked_columns: Option<Vec<String>>,
    /// Effective timestamp for new and closed versions; defaults to now.
    pub effective_date: Option<DateTime<Utc>>,
    /// Boolean column marking soft-deleted records, honored by
    /// [`Scd2Manager::merge`].
    pub delete_indicator: Option<String>,
}

impl Scd2Request {
    pub fn new(table: impl Into<String>, business_keys: &[&str]) -> Self {
        Self {
            table: table.into(),
            business_keys: business_keys.iter().map(|s| s.to_string()).collect(),
            tracked_columns: None,
            effective_date: None,
            delete_indicator: None,
        }
    }

    pub fn tracked(mut self, columns: &[&str]) -> Self {
        self.tracked_columns = Some(columns.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn effective_at(mut self, when: DateTime<Utc>) -> Self {
        self.effective_date = Some(when);
        self
    }

    pub fn delete_indicator(mut self, column: impl Into<String>) -> Self {
        self.delete_indicator = Some(column.into());
        self
    }
}

/// Row counts from one merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Scd2Report {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
}

/// Maintains SCD Type 2 dimension tables over a [`TableStore`].
pub struct Scd2Manager {
    store: Arc<dyn TableStore>,
    namespace: String,
}

impl Scd2Manager {
    pub fn new(store: Arc<dyn TableStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", self.namespace, table)
    }

    /// Apply a snapshot of records to the dimension.
    ///
    /// New business keys are inserted at version 1. Keys whose tracked
    /// payload changed get their current version closed at the effective
    /// date and a new version opened. Unchanged keys are left untouched.
    /// Duplicate business keys within the snapshot keep the last occurrence.
    pub async fn apply(
        &self,
        source: Batch,
        request: &Scd2Request,
    ) -> Result<Scd2Report, TransformationError> {
        let target = self.qualified(&request.table);
        let effective = request.effective_date.unwrap_or_else(Utc::now);

        if source.is_empty() {
            info!(table = %target, "Empty snapshot, nothing to merge");
            return Ok(Scd2Report::default());
        }
        for key in &request.business_keys {
            if !source.has_column(key) {
                return crate::error::MissingColumnSnafu {
                    stage: "scd2",
                    column: key,
                }
                .fail();
            }
        }
        let tracked = self.tracked_columns(&source, request)?;

        // Last occurrence per business key wins within one snapshot.
        let mut last: IndexMap<Vec<Value>, usize> = IndexMap::new();
        for row in 0..source.num_rows() {
            last.insert(source.key_at(row, &request.business_keys), row);
        }
        let rows: Vec<usize> = {
            let mut rows: Vec<usize> = last.values().copied().collect();
            rows.sort_unstable();
            rows
        };
        let source = source.take_rows(&rows);

        let exists = self
            .store
            .exists(&target)
            .await
            .context(crate::error::ReadSourceSnafu { table: &target })?;
        if !exists {
            return self.initial_load(source, request, &target, effective).await;
        }

        let current = self
            .store
            .read(
                &target,
                ReadOptions::filtered(Filter::IsTrue("_scd_is_current".to_string())),
            )
            .await
            .context(crate::error::ReadSourceSnafu { table: &target })?;

        let mut current_by_key: HashMap<Vec<Value>, usize> = HashMap::new();
        for row in 0..current.num_rows() {
            current_by_key.insert(current.key_at(row, &request.business_keys), row);
        }

        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut unchanged = 0usize;
        for row in 0..source.num_rows() {
            let key = source.key_at(row, &request.business_keys);
            match current_by_key.get(&key) {
                None => inserts.push(row),
                Some(&existing_row) => {
                    if payload_changed(&source, row, &current, existing_row, &tracked) {
                        updates.push(row);
                    } else {
                        unchanged += 1;
                    }
                }
            }
        }

        let report = Scd2Report {
            inserted: inserts.len(),
            updated: updates.len(),
            deleted: 0,
            unchanged,
        };
        if inserts.is_empty() && updates.is_empty() {
            info!(table = %target, unchanged, "No changes detected");
            return Ok(report);
        }

        let mut new_inserts = source.take_rows(&inserts);
        stamp_versions(
            &mut new_inserts,
            &request.business_keys,
            vec![1; inserts.len()],
            effective,
        );

        if updates.is_empty() {
            self.store
                .append(&target, &new_inserts)
                .await
                .context(crate::error::WriteTargetSnafu { table: &target })?;
        } else {
            // Next version per updated key, read from the current rows.
            let versions: Vec<i64> = updates
                .iter()
                .map(|&row| {
                    let key = source.key_at(row, &request.business_keys);
                    let existing_row = current_by_key.get(&key).copied();
                    let old = existing_row
                        .and_then(|r| current.get("_scd_version", r))
                        .and_then(Value::as_int)
                        .unwrap_or(0);
                    old + 1
                })
                .collect();
            let mut new_versions = source.take_rows(&updates);
            stamp_versions(&mut new_versions, &request.business_keys, versions, effective);

            let closed_keys: HashSet<Vec<Value>> = updates
                .iter()
                .map(|&row| source.key_at(row, &request.business_keys))
                .collect();

            // Rebuild the full image: history + closed versions + new rows,
            // committed in one overwrite.
            let all = self
                .store
                .read(&target, ReadOptions::all())
                .await
                .context(crate::error::ReadSourceSnafu { table: &target })?;
            let all = close_current_rows(all, &request.business_keys, &closed_keys, effective);
            let image = Batch::concat(vec![all, new_versions, new_inserts]);
            self.store
                .overwrite(&target, &image)
                .await
                .context(crate::error::WriteTargetSnafu { table: &target })?;
        }

        info!(
            table = %target,
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            "SCD2 changes applied"
        );
        emit!(DimensionMerged {
            inserted: report.inserted as u64,
            updated: report.updated as u64,
            unchanged: report.unchanged as u64,
            table: target,
        });
        Ok(report)
    }

    /// Merge a snapshot that may carry soft deletes.
    ///
    /// Rows where the request's `delete_indicator` column is `true` close
    /// the key's current version without opening a replacement; the rest go
    /// through [`apply`](Self::apply).
    pub async fn merge(
        &self,
        source: Batch,
        request: &Scd2Request,
    ) -> Result<Scd2Report, TransformationError> {
        let effective = request.effective_date.unwrap_or_else(Utc::now);
        let (live, deletes) = match &request.delete_indicator {
            Some(column) if source.has_column(column) => {
                let deletes =
                    source.filter(|row| source.get(column, row) == Some(&Value::Bool(true)));
                let mut live =
                    source.filter(|row| source.get(column, row) != Some(&Value::Bool(true)));
                // The indicator is bookkeeping, not payload.
                live.drop_column(column);
                (live, deletes)
            }
            _ => (source, Batch::new()),
        };

        let mut report = self
            .apply(live, &Scd2Request {
                effective_date: Some(effective),
                ..request.clone()
            })
            .await?;
        if !deletes.is_empty() {
            report.deleted = self.apply_deletes(&deletes, request, effective).await?;
        }
        Ok(report)
    }

    async fn apply_deletes(
        &self,
        deletes: &Batch,
        request: &Scd2Request,
        effective: DateTime<Utc>,
    ) -> Result<usize, TransformationError> {
        let target = self.qualified(&request.table);
        let exists = self
            .store
            .exists(&target)
            .await
            .context(crate::error::ReadSourceSnafu { table: &target })?;
        if !exists {
            return Ok(0);
        }

        let delete_keys: HashSet<Vec<Value>> = (0..deletes.num_rows())
            .map(|row| deletes.key_at(row, &request.business_keys))
            .collect();

        let all = self
            .store
            .read(&target, ReadOptions::all())
            .await
            .context(crate::error::ReadSourceSnafu { table: &target })?;
        let closing = (0..all.num_rows())
            .filter(|&row| {
                all.get("_scd_is_current", row) == Some(&Value::Bool(true))
                    && delete_keys.contains(&all.key_at(row, &request.business_keys))
            })
            .count();
        if closing == 0 {
            return Ok(0);
        }

        let image = close_current_rows(all, &request.business_keys, &delete_keys, effective);
        self.store
            .overwrite(&target, &image)
            .await
            .context(crate::error::WriteTargetSnafu { table: &target })?;
        info!(table = %target, deleted = closing, "Soft-deleted dimension records");
        Ok(closing)
    }

    async fn initial_load(
        &self,
        mut source: Batch,
        request: &Scd2Request,
        target: &str,
        effective: DateTime<Utc>,
    ) -> Result<Scd2Report, TransformationError> {
        let rows = source.num_rows();
        stamp_versions(&mut source, &request.business_keys, vec![1; rows], effective);
        let properties = HashMap::from([("floe.scd_type".to_string(), "2".to_string())]);
        self.store
            .create_from_batch(
                target,
                &source,
                &["_scd_is_current".to_string()],
                properties,
            )
            .await
            .context(crate::error::WriteTargetSnafu { table: target })?;
        info!(table = %target, rows, "SCD2 initial load completed");
        emit!(DimensionMerged {
            inserted: rows as u64,
            updated: 0,
            unchanged: 0,
            table: target.to_string(),
        });
        Ok(Scd2Report {
            inserted: rows,
            ..Scd2Report::default()
        })
    }

    fn tracked_columns(
        &self,
        source: &Batch,
        request: &Scd2Request,
    ) -> Result<Vec<String>, TransformationError> {
        match &request.tracked_columns {
            Some(columns) => {
                for column in columns {
                    if !source.has_column(column) {
                        return crate::error::MissingColumnSnafu {
                            stage: "scd2",
                            column,
                        }
                        .fail();
                    }
                }
                Ok(columns.clone())
            }
            None => Ok(source
                .column_names()
                .filter(|name| {
                    !request.business_keys.iter().any(|k| k == name) && !is_system_column(name)
                })
                .map(str::to_string)
                .collect()),
        }
    }

    /// Only the current version of every business key.
    pub async fn current(
        &self,
        table: &str,
        columns: Option<Vec<String>>,
    ) -> Result<Batch, StoreError> {
        let options = ReadOptions {
            columns,
            filter: Some(Filter::IsTrue("_scd_is_current".to_string())),
            limit: None,
        };
        self.store.read(&self.qualified(table), options).await
    }

    /// The version of one business key that was effective at `as_of`, or
    /// `None` if the key did not exist then.
    pub async fn record_at(
        &self,
        table: &str,
        key: &IndexMap<String, Value>,
        as_of: DateTime<Utc>,
    ) -> Result<Option<Batch>, StoreError> {
        let all = self.read_key(table, key).await?;
        let hit = all.filter(|row| {
            let from_ok = matches!(
                all.get("_scd_effective_from", row),
                Some(Value::Timestamp(from)) if *from <= as_of
            );
            let to_ok = match all.get("_scd_effective_to", row) {
                Some(Value::Timestamp(to)) => *to > as_of,
                _ => true,
            };
            from_ok && to_ok
        });
        Ok(if hit.is_empty() { None } else { Some(hit) })
    }

    /// Every version of one business key, ordered by version.
    pub async fn history(
        &self,
        table: &str,
        key: &IndexMap<String, Value>,
    ) -> Result<Batch, StoreError> {
        let all = self.read_key(table, key).await?;
        Ok(all.sort_by("_scd_version", false))
    }

    async fn read_key(
        &self,
        table: &str,
        key: &IndexMap<String, Value>,
    ) -> Result<Batch, StoreError> {
        let filters: Vec<Filter> = key
            .iter()
            .map(|(column, value)| Filter::Eq(column.clone(), value.clone()))
            .collect();
        self.store
            .read(
                &self.qualified(table),
                ReadOptions::filtered(Filter::And(filters)),
            )
            .await
    }
}

/// Columns excluded from change detection: SCD2 system columns and the
/// provenance stamped by the bronze and silver layers.
fn is_system_column(name: &str) -> bool {
    name.starts_with("_scd_")
        || crate::bronze::METADATA_COLUMNS.contains(&name)
        || crate::silver::METADATA_COLUMNS.contains(&name)
}

fn payload_changed(
    source: &Batch,
    source_row: usize,
    existing: &Batch,
    existing_row: usize,
    tracked: &[String],
) -> bool {
    tracked.iter().any(|column| {
        // A null cell and a missing column are the same absence.
        let new = source.get(column, source_row).unwrap_or(&Value::Null);
        let old = existing.get(column, existing_row).unwrap_or(&Value::Null);
        new != old
    })
}

/// Add the SCD2 columns to a batch of fresh version rows.
fn stamp_versions(
    batch: &mut Batch,
    business_keys: &[String],
    versions: Vec<i64>,
    effective: DateTime<Utc>,
) {
    let rows = batch.num_rows();
    let surrogates: Vec<Value> = (0..rows)
        .map(|_| Value::Str(Uuid::new_v4().to_string()))
        .collect();
    let business: Vec<Value> = (0..rows)
        .map(|row| Value::Str(business_key_string(&batch.key_at(row, business_keys))))
        .collect();
    let versions: Vec<Value> = versions.into_iter().map(Value::Int).collect();
    // Lengths match rows by construction.
    let _ = batch.push_column("_scd_surrogate_key", surrogates);
    let _ = batch.push_column("_scd_business_key", business);
    batch.set_literal("_scd_effective_from", Value::Timestamp(effective));
    batch.set_literal("_scd_effective_to", Value::Null);
    batch.set_literal("_scd_is_current", Value::Bool(true));
    let _ = batch.push_column("_scd_version", versions);
}

/// Close the current version of every key in `keys`: set
/// `_scd_effective_to` and drop the current flag. Other rows pass through
/// untouched.
fn close_current_rows(
    batch: Batch,
    business_keys: &[String],
    keys: &HashSet<Vec<Value>>,
    effective: DateTime<Utc>,
) -> Batch {
    let mut to_column: Vec<Value> = batch
        .column("_scd_effective_to")
        .map(|v| v.to_vec())
        .unwrap_or_else(|| vec![Value::Null; batch.num_rows()]);
    let mut current_column: Vec<Value> = batch
        .column("_scd_is_current")
        .map(|v| v.to_vec())
        .unwrap_or_else(|| vec![Value::Bool(false); batch.num_rows()]);
    for row in 0..batch.num_rows() {
        if current_column[row] == Value::Bool(true)
            && keys.contains(&batch.key_at(row, business_keys))
        {
            to_column[row] = Value::Timestamp(effective);
            current_column[row] = Value::Bool(false);
        }
    }
    let mut batch = batch;
    let _ = batch.push_column("_scd_effective_to", to_column);
    let _ = batch.push_column("_scd_is_current", current_column);
    batch
}

fn business_key_string(key: &[Value]) -> String {
    key.iter()
        .map(|value| match value {
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join("|")
}
