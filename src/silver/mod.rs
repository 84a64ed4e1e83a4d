//! Silver layer: cleaned and validated data.
//!
//! The silver processor pulls rows from a bronze table, runs them through a
//! fixed pipeline, and appends them to a silver table. The pipeline order
//! never varies:
//!
//! 1. schema mapping (column renames)
//! 2. standard cleaning (whitespace trim, null-sentinel strings)
//! 3. user transformations
//! 4. deduplication (keep latest by the watermark column)
//! 5. quality checks
//!
//! A failing stage aborts the whole run with the stage's name; nothing is
//! written on failure. Incremental runs are gated on the target table's own
//! maximum of the watermark column (`_ingestion_time` by default), so
//! re-running after a crash reprocesses exactly the bronze rows that never
//! landed.

pub mod transforms;

use crate::batch::{Batch, Value};
use crate::bronze::BronzeIngestor;
use crate::config::{CleaningConfig, LayerConfig};
use crate::emit;
use crate::error::TransformationError;
use crate::metrics::events::{DuplicatesDropped, RowsProcessed};
use crate::store::{Filter, ReadOptions, TableStore};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use snafu::ResultExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Metadata columns stamped on every silver table.
pub const METADATA_COLUMNS: [&str; 4] = [
    "_processing_time",
    "_bronze_table",
    "_bronze_batch_id",
    "_processing_date",
];

type StageFn =
    Box<dyn Fn(Batch) -> Result<Batch, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// A named transformation step. The name identifies the stage in errors and
/// logs when it fails.
pub struct Stage {
    name: String,
    run: StageFn,
}

impl Stage {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(Batch) -> Result<Batch, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, batch: Batch) -> Result<Batch, TransformationError> {
        (self.run)(batch).map_err(|e| TransformationError::Stage {
            stage: self.name.clone(),
            message: e.to_string(),
        })
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage").field("name", &self.name).finish()
    }
}

/// One bronze-to-silver processing run.
pub struct ProcessRequest {
    pub source_table: String,
    pub target_table: String,
    /// Column renames applied first; missing source columns are ignored.
    pub schema_mapping: IndexMap<String, String>,
    /// User transformations, applied in order after standard cleaning.
    pub transformations: Vec<Stage>,
    /// Deduplication key; empty disables deduplication.
    pub dedup_columns: Vec<String>,
    /// Quality checks, applied last. A check that errors aborts the run; a
    /// check that filters rows shapes what gets written.
    pub quality_checks: Vec<Stage>,
    /// Process only bronze rows newer than the target's watermark.
    pub incremental: bool,
    /// Column the incremental gate and dedup ordering use.
    pub watermark_column: String,
}

impl ProcessRequest {
    pub fn new(source_table: impl Into<String>, target_table: impl Into<String>) -> Self {
        Self {
            source_table: source_table.into(),
            target_table: target_table.into(),
            schema_mapping: IndexMap::new(),
            transformations: Vec::new(),
            dedup_columns: Vec::new(),
            quality_checks: Vec::new(),
            incremental: true,
            watermark_column: "_ingestion_time".to_string(),
        }
    }

    pub fn rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.schema_mapping.insert(from.into(), to.into());
        self
    }

    pub fn transform(mut self, stage: Stage) -> Self {
        self.transformations.push(stage);
        self
    }

    pub fn dedup_by(mut self, columns: &[&str]) -> Self {
        self.dedup_columns = columns.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn quality_check(mut self, stage: Stage) -> Self {
        self.quality_checks.push(stage);
        self
    }

    pub fn full_reload(mut self) -> Self {
        self.incremental = false;
        self
    }

    pub fn watermark_column(mut self, column: impl Into<String>) -> Self {
        self.watermark_column = column.into();
        self
    }
}

/// Runs the bronze-to-silver pipeline.
pub struct SilverProcessor {
    store: Arc<dyn TableStore>,
    bronze: BronzeIngestor,
    namespace: String,
    partition_by: Vec<String>,
    cleaning: CleaningConfig,
}

impl SilverProcessor {
    pub fn new(
        store: Arc<dyn TableStore>,
        silver: &LayerConfig,
        bronze: &LayerConfig,
        cleaning: CleaningConfig,
    ) -> Self {
        Self {
            bronze: BronzeIngestor::new(Arc::clone(&store), bronze),
            store,
            namespace: silver.namespace.clone(),
            partition_by: silver.partition_by.clone(),
            cleaning,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", self.namespace, table)
    }

    /// Run the pipeline and return the number of rows written.
    pub async fn process(&self, request: ProcessRequest) -> Result<usize, TransformationError> {
        let source = &request.source_table;
        let target = self.qualified(&request.target_table);

        let mut batch = self.read_pending(&request, &target).await?;
        if batch.is_empty() {
            info!(source, target = %target, "No new data to process");
            return Ok(0);
        }

        // 1. Schema mapping
        for (from, to) in &request.schema_mapping {
            batch.rename_column(from, to);
        }

        // 2. Standard cleaning
        batch = self.standard_cleaning(batch);

        // 3. User transformations
        for stage in &request.transformations {
            batch = stage.apply(batch)?;
        }

        // 4. Deduplication
        if !request.dedup_columns.is_empty() {
            batch = self.deduplicate(
                batch,
                &request.dedup_columns,
                &request.watermark_column,
                &target,
            )?;
        }

        // 5. Quality checks
        for check in &request.quality_checks {
            batch = check.apply(batch)?;
        }

        let processing_time = Utc::now();
        self.add_metadata(&mut batch, source, processing_time);

        let rows = batch.num_rows();
        self.write(&target, &batch, processing_time)
            .await
            .context(crate::error::WriteTargetSnafu { table: &target })?;

        info!(table = %target, rows, "Processed data to silver");
        emit!(RowsProcessed {
            count: rows as u64,
            table: target,
        });
        Ok(rows)
    }

    async fn read_pending(
        &self,
        request: &ProcessRequest,
        target: &str,
    ) -> Result<Batch, TransformationError> {
        let exists = self
            .store
            .exists(target)
            .await
            .context(crate::error::ReadSourceSnafu { table: target })?;
        let since = if request.incremental && exists {
            self.last_watermark(&request.target_table, &request.watermark_column)
                .await?
        } else {
            None
        };
        let options = match since {
            Some(since) => {
                ReadOptions::filtered(Filter::Gt(request.watermark_column.clone(), since))
            }
            None => ReadOptions::all(),
        };
        self.bronze
            .read(&request.source_table, options)
            .await
            .context(crate::error::ReadSourceSnafu {
                table: &request.source_table,
            })
    }

    fn standard_cleaning(&self, mut batch: Batch) -> Batch {
        let columns: Vec<String> = batch.column_names().map(str::to_string).collect();
        for name in columns {
            // Provenance columns are never string-cleaned.
            if name.starts_with('_') {
                continue;
            }
            batch.map_column(&name, |value| match value {
                Value::Str(s) => {
                    let s = if self.cleaning.trim_whitespace {
                        s.trim()
                    } else {
                        s.as_str()
                    };
                    if self
                        .cleaning
                        .null_string_values
                        .iter()
                        .any(|sentinel| sentinel == s)
                    {
                        Value::Null
                    } else {
                        Value::Str(s.to_string())
                    }
                }
                other => other.clone(),
            });
        }
        batch
    }

    /// Keep the latest row per key, ordered by the watermark column when
    /// present, otherwise by batch position.
    fn deduplicate(
        &self,
        batch: Batch,
        columns: &[String],
        order_column: &str,
        target: &str,
    ) -> Result<Batch, TransformationError> {
        for column in columns {
            if !batch.has_column(column) {
                return crate::error::MissingColumnSnafu {
                    stage: "deduplicate",
                    column,
                }
                .fail();
            }
        }

        // Per key, keep the row with the greatest watermark value; ties and
        // missing values fall back to batch position, so the latest
        // occurrence wins either way.
        let times = batch.column(order_column);
        let mut best: IndexMap<Vec<Value>, usize> = IndexMap::new();
        for row in 0..batch.num_rows() {
            let key = batch.key_at(row, columns);
            match best.get_mut(&key) {
                None => {
                    best.insert(key, row);
                }
                Some(winner) => {
                    let older = times.is_some_and(|ts| {
                        ts[row].partial_cmp(&ts[*winner]) == Some(std::cmp::Ordering::Less)
                    });
                    if !older {
                        *winner = row;
                    }
                }
            }
        }
        let mut keep: Vec<usize> = best.into_values().collect();
        keep.sort_unstable();
        let deduped = batch.take_rows(&keep);

        let removed = batch.num_rows() - deduped.num_rows();
        if removed > 0 {
            info!(removed, columns = ?columns, "Deduplicated rows");
            emit!(DuplicatesDropped {
                count: removed as u64,
                table: target.to_string(),
            });
        }
        Ok(deduped)
    }

    fn add_metadata(&self, batch: &mut Batch, bronze_table: &str, processing_time: DateTime<Utc>) {
        let bronze_batch_id = batch
            .get("_batch_id", 0)
            .cloned()
            .unwrap_or(Value::Null);
        batch.set_literal("_processing_time", Value::Timestamp(processing_time));
        batch.set_literal("_bronze_table", Value::Str(bronze_table.to_string()));
        batch.set_literal("_bronze_batch_id", bronze_batch_id);
        batch.set_literal(
            "_processing_date",
            Value::Date(processing_time.date_naive()),
        );
    }

    async fn write(
        &self,
        target: &str,
        batch: &Batch,
        processing_time: DateTime<Utc>,
    ) -> Result<(), crate::error::StoreError> {
        if self.store.exists(target).await? {
            return self.store.append(target, batch).await;
        }
        let properties = HashMap::from([
            ("floe.layer".to_string(), "silver".to_string()),
            ("floe.created".to_string(), processing_time.to_rfc3339()),
        ]);
        match self
            .store
            .create_from_batch(target, batch, &self.partition_by, properties)
            .await
        {
            // Lost a create race with a concurrent first writer.
            Err(crate::error::StoreError::TableExists { .. }) => {
                self.store.append(target, batch).await
            }
            other => other,
        }
    }

    pub async fn read(
        &self,
        table: &str,
        options: ReadOptions,
    ) -> Result<Batch, crate::error::StoreError> {
        self.store.read(&self.qualified(table), options).await
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool, crate::error::StoreError> {
        self.store.exists(&self.qualified(table)).await
    }

    /// Tables in this layer's namespace, without the namespace prefix.
    pub async fn list_tables(&self) -> Result<Vec<String>, crate::error::StoreError> {
        let prefix = format!("{}.", self.namespace);
        let mut tables: Vec<String> = self
            .store
            .list_tables()
            .await?
            .into_iter()
            .filter_map(|name| name.strip_prefix(&prefix).map(str::to_string))
            .collect();
        tables.sort();
        Ok(tables)
    }

    /// The incremental gate: the greatest value of the watermark column
    /// already written to the target, or `None` for a fresh table or a
    /// target without that column.
    pub async fn last_watermark(
        &self,
        table: &str,
        column: &str,
    ) -> Result<Option<Value>, TransformationError> {
        let target = self.qualified(table);
        let options = ReadOptions {
            columns: Some(vec![column.to_string()]),
            ..ReadOptions::default()
        };
        let values = match self.store.read(&target, options).await {
            Ok(values) => values,
            Err(crate::error::StoreError::ColumnNotFound { .. }) => return Ok(None),
            Err(source) => {
                return Err(source).context(crate::error::ReadSourceSnafu { table: &target })
            }
        };
        Ok(values.max_of(column))
    }
}
