//! Gold layer: business-level aggregations.
//!
//! The gold aggregator reads a silver table, groups it, and writes the
//! aggregated result to a gold table. The aggregation set is closed: COUNT,
//! SUM, AVG, MIN, and MAX. Output row order is not specified.
//!
//! An empty source still produces the target table with the full output
//! schema and zero rows, so downstream consumers can rely on the table
//! existing after the first run.

use crate::batch::{Batch, Value};
use crate::config::LayerConfig;
use crate::emit;
use crate::error::TransformationError;
use crate::metrics::events::RowsAggregated;
use crate::store::{Filter, ReadOptions, TableStore};
use chrono::{Datelike, Days, NaiveDate, Utc};
use indexmap::IndexMap;
use snafu::ResultExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// The closed set of aggregation functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFn {
    fn as_str(&self) -> &'static str {
        match self {
            AggregateFn::Count => "count",
            AggregateFn::Sum => "sum",
            AggregateFn::Avg => "avg",
            AggregateFn::Min => "min",
            AggregateFn::Max => "max",
        }
    }
}

/// One output column of an aggregation.
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub output: String,
    pub input: String,
    pub func: AggregateFn,
}

impl Aggregation {
    pub fn new(
        output: impl Into<String>,
        input: impl Into<String>,
        func: AggregateFn,
    ) -> Self {
        Self {
            output: output.into(),
            input: input.into(),
            func,
        }
    }
}

/// Calendar truncation for time-bucketed metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeGranularity {
    Day,
    Week,
    Month,
    Year,
}

impl TimeGranularity {
    fn as_str(&self) -> &'static str {
        match self {
            TimeGranularity::Day => "day",
            TimeGranularity::Week => "week",
            TimeGranularity::Month => "month",
            TimeGranularity::Year => "year",
        }
    }

    /// First day of the bucket containing `date`. Weeks start on Monday.
    fn truncate(&self, date: NaiveDate) -> NaiveDate {
        match self {
            TimeGranularity::Day => date,
            TimeGranularity::Week => {
                let back = u64::from(date.weekday().num_days_from_monday());
                date.checked_sub_days(Days::new(back)).unwrap_or(date)
            }
            TimeGranularity::Month => date.with_day(1).unwrap_or(date),
            TimeGranularity::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
        }
    }
}

/// How the result lands in the target table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Replace the target contents (full recompute).
    #[default]
    Overwrite,
    /// Add to the existing target.
    Append,
}

/// One silver-to-gold aggregation run.
#[derive(Debug, Clone)]
pub struct AggregateRequest {
    pub source_table: String,
    pub target_table: String,
    pub group_by: Vec<String>,
    pub aggregations: Vec<Aggregation>,
    /// Row filter applied before grouping.
    pub filter: Option<Filter>,
    /// Calendar bucket derived from a timestamp or date column and added to
    /// the grouping key.
    pub time_bucket: Option<(String, TimeGranularity)>,
    pub mode: WriteMode,
}

impl AggregateRequest {
    pub fn new(source_table: impl Into<String>, target_table: impl Into<String>) -> Self {
        Self {
            source_table: source_table.into(),
            target_table: target_table.into(),
            group_by: Vec::new(),
            aggregations: Vec::new(),
            filter: None,
            time_bucket: None,
            mode: WriteMode::default(),
        }
    }

    pub fn group_by(mut self, columns: &[&str]) -> Self {
        self.group_by = columns.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn aggregate(
        mut self,
        output: impl Into<String>,
        input: impl Into<String>,
        func: AggregateFn,
    ) -> Self {
        self.aggregations.push(Aggregation::new(output, input, func));
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Group by a calendar bucket of a timestamp or date column. The derived
    /// column is named `{column}_{granularity}`.
    pub fn time_bucket(
        mut self,
        column: impl Into<String>,
        granularity: TimeGranularity,
    ) -> Self {
        self.time_bucket = Some((column.into(), granularity));
        self
    }

    pub fn mode(mut self, mode: WriteMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Computes group-by aggregations from silver into gold tables.
pub struct GoldAggregator {
    store: Arc<dyn TableStore>,
    namespace: String,
    silver_namespace: String,
    partition_by: Vec<String>,
}

impl GoldAggregator {
    pub fn new(store: Arc<dyn TableStore>, gold: &LayerConfig, silver: &LayerConfig) -> Self {
        Self {
            store,
            namespace: gold.namespace.clone(),
            silver_namespace: silver.namespace.clone(),
            partition_by: gold.partition_by.clone(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", self.namespace, table)
    }

    /// Run the aggregation and return the number of rows written.
    pub async fn aggregate(&self, request: AggregateRequest) -> Result<usize, TransformationError> {
        let source = format!("{}.{}", self.silver_namespace, request.source_table);
        let target = self.qualified(&request.target_table);

        let options = ReadOptions {
            filter: request.filter.clone(),
            ..ReadOptions::default()
        };
        let batch = self
            .store
            .read(&source, options)
            .await
            .context(crate::error::ReadSourceSnafu { table: &source })?;

        let result = if batch.is_empty() {
            warn!(source = %source, "No data to aggregate, writing empty schema");
            self.empty_result(&request)
        } else {
            self.compute(batch, &request)?
        };

        let rows = result.num_rows();
        self.write(&target, &result, request.mode)
            .await
            .context(crate::error::WriteTargetSnafu { table: &target })?;

        info!(table = %target, rows, mode = ?request.mode, "Aggregated data to gold");
        emit!(RowsAggregated {
            count: rows as u64,
            table: target,
        });
        Ok(rows)
    }

    fn compute(
        &self,
        mut batch: Batch,
        request: &AggregateRequest,
    ) -> Result<Batch, TransformationError> {
        let mut group_by = request.group_by.clone();
        if let Some((column, granularity)) = &request.time_bucket {
            let bucket = bucket_column(&batch, column, *granularity)?;
            let name = format!("{column}_{}", granularity.as_str());
            batch
                .push_column(name.clone(), bucket)
                .map_err(|e| TransformationError::Stage {
                    stage: "aggregate".to_string(),
                    message: e.to_string(),
                })?;
            group_by.push(name);
        }

        for column in &group_by {
            if !batch.has_column(column) {
                return crate::error::MissingColumnSnafu {
                    stage: "aggregate",
                    column,
                }
                .fail();
            }
        }
        for aggregation in &request.aggregations {
            if !batch.has_column(&aggregation.input) {
                return crate::error::MissingColumnSnafu {
                    stage: "aggregate",
                    column: &aggregation.input,
                }
                .fail();
            }
        }

        // First-seen group order.
        let mut groups: IndexMap<Vec<Value>, Vec<usize>> = IndexMap::new();
        for row in 0..batch.num_rows() {
            groups
                .entry(batch.key_at(row, &group_by))
                .or_default()
                .push(row);
        }

        let computed_time = Utc::now();
        let mut columns: IndexMap<String, Vec<Value>> = IndexMap::new();
        for column in &group_by {
            columns.insert(column.clone(), Vec::with_capacity(groups.len()));
        }
        for aggregation in &request.aggregations {
            columns.insert(aggregation.output.clone(), Vec::with_capacity(groups.len()));
        }
        for (key, rows) in &groups {
            for (column, value) in group_by.iter().zip(key) {
                if let Some(out) = columns.get_mut(column) {
                    out.push(value.clone());
                }
            }
            for aggregation in &request.aggregations {
                let values: Vec<&Value> = rows
                    .iter()
                    .filter_map(|&row| batch.get(&aggregation.input, row))
                    .collect();
                let value = apply_aggregate(aggregation, &values)?;
                if let Some(out) = columns.get_mut(&aggregation.output) {
                    out.push(value);
                }
            }
        }

        let mut out = Batch::from_columns(columns).map_err(|e| TransformationError::Stage {
            stage: "aggregate".to_string(),
            message: e.to_string(),
        })?;
        out.set_literal("_computed_time", Value::Timestamp(computed_time));
        out.set_literal(
            "_source_tables",
            Value::Str(request.source_table.clone()),
        );
        Ok(out)
    }

    // The output schema with zero rows: group columns, aggregation outputs,
    // then metadata.
    fn empty_result(&self, request: &AggregateRequest) -> Batch {
        let mut batch = Batch::new();
        for column in &request.group_by {
            let _ = batch.push_column(column.clone(), Vec::new());
        }
        if let Some((column, granularity)) = &request.time_bucket {
            let _ = batch.push_column(format!("{column}_{}", granularity.as_str()), Vec::new());
        }
        for aggregation in &request.aggregations {
            let _ = batch.push_column(aggregation.output.clone(), Vec::new());
        }
        let _ = batch.push_column("_computed_time", Vec::new());
        let _ = batch.push_column("_source_tables", Vec::new());
        batch
    }

    async fn write(
        &self,
        target: &str,
        batch: &Batch,
        mode: WriteMode,
    ) -> Result<(), crate::error::StoreError> {
        if !self.store.exists(target).await? {
            let properties =
                HashMap::from([("floe.layer".to_string(), "gold".to_string())]);
            match self
                .store
                .create_from_batch(target, batch, &self.partition_by, properties)
                .await
            {
                // Lost a create race with a concurrent first writer; fall
                // through to the requested mode.
                Err(crate::error::StoreError::TableExists { .. }) => {}
                other => return other,
            }
        }
        match mode {
            WriteMode::Overwrite => self.store.overwrite(target, batch).await,
            WriteMode::Append => self.store.append(target, batch).await,
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
}

/// Resolve a timestamp or date column into per-row bucket start dates.
/// Nulls pass through and form their own group.
fn bucket_column(
    batch: &Batch,
    column: &str,
    granularity: TimeGranularity,
) -> Result<Vec<Value>, TransformationError> {
    let Some(values) = batch.column(column) else {
        return crate::error::MissingColumnSnafu {
            stage: "aggregate",
            column,
        }
        .fail();
    };
    values
        .iter()
        .map(|value| match value {
            Value::Timestamp(ts) => Ok(Value::Date(granularity.truncate(ts.date_naive()))),
            Value::Date(date) => Ok(Value::Date(granularity.truncate(*date))),
            Value::Null => Ok(Value::Null),
            other => Err(TransformationError::Stage {
                stage: "aggregate".to_string(),
                message: format!(
                    "time bucket over non-temporal value of kind {}",
                    other.kind()
                ),
            }),
        })
        .collect()
}

/// Apply one aggregation to a group's cells. Nulls are skipped by every
/// function; a group with no usable values yields null (count yields 0).
fn apply_aggregate(
    aggregation: &Aggregation,
    values: &[&Value],
) -> Result<Value, TransformationError> {
    let non_null: Vec<&Value> = values.iter().copied().filter(|v| !v.is_null()).collect();
    match aggregation.func {
        AggregateFn::Count => Ok(Value::Int(non_null.len() as i64)),
        AggregateFn::Sum => {
            let mut int_sum = 0i64;
            let mut float_sum = 0.0f64;
            let mut saw_float = false;
            let mut saw_any = false;
            for value in &non_null {
                match value {
                    Value::Int(i) => {
                        int_sum += i;
                        saw_any = true;
                    }
                    Value::Float(f) => {
                        float_sum += f;
                        saw_float = true;
                        saw_any = true;
                    }
                    other => return non_numeric(aggregation, other),
                }
            }
            Ok(if !saw_any {
                Value::Null
            } else if saw_float {
                Value::Float(float_sum + int_sum as f64)
            } else {
                Value::Int(int_sum)
            })
        }
        AggregateFn::Avg => {
            let mut sum = 0.0f64;
            let mut count = 0usize;
            for value in &non_null {
                match value {
                    Value::Int(i) => sum += *i as f64,
                    Value::Float(f) => sum += f,
                    other => return non_numeric(aggregation, other),
                }
                count += 1;
            }
            Ok(if count == 0 {
                Value::Null
            } else {
                Value::Float(sum / count as f64)
            })
        }
        AggregateFn::Min | AggregateFn::Max => {
            let mut best: Option<&Value> = None;
            for &value in &non_null {
                match best {
                    None => best = Some(value),
                    Some(current) => {
                        let Some(ordering) = value.partial_cmp(current) else {
                            return Err(TransformationError::Stage {
                                stage: "aggregate".to_string(),
                                message: format!(
                                    "{}({}) over values of mixed kinds",
                                    aggregation.func.as_str(),
                                    aggregation.input
                                ),
                            });
                        };
                        let take = match aggregation.func {
                            AggregateFn::Min => ordering == std::cmp::Ordering::Less,
                            _ => ordering == std::cmp::Ordering::Greater,
                        };
                        if take {
                            best = Some(value);
                        }
                    }
                }
            }
            Ok(best.cloned().unwrap_or(Value::Null))
        }
    }
}

fn non_numeric(aggregation: &Aggregation, value: &Value) -> Result<Value, TransformationError> {
    Err(TransformationError::Stage {
        stage: "aggregate".to_string(),
        message: format!(
            "{}({}) over non-numeric value of kind {}",
            aggregation.func.as_str(),
            aggregation.input,
            value.kind()
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Batch;
    use crate::store::MemoryTableStore;

    async fn seed_silver(store: &Arc<MemoryTableStore>) {
        let batch = Batch::from_columns(vec![
            (
                "region",
                vec![
                    Value::Str("eu".into()),
                    Value::Str("eu".into()),
                    Value::Str("us".into()),
                ],
            ),
            (
                "amount",
                vec![Value::Float(10.0), Value::Float(30.0), Value::Float(5.0)],
            ),
        ])
        .unwrap();
        store
            .create_from_batch("silver.orders", &batch, &[], HashMap::new())
            .await
            .unwrap();
    }

    fn aggregator(store: Arc<dyn TableStore>) -> GoldAggregator {
        let gold = LayerConfig {
            namespace: "gold".to_string(),
            partition_by: vec![],
        };
        let silver = LayerConfig {
            namespace: "silver".to_string(),
            partition_by: vec![],
        };
        GoldAggregator::new(store, &gold, &silver)
    }

    #[tokio::test]
    async fn test_group_by_aggregation() {
        let store = Arc::new(MemoryTableStore::new());
        seed_silver(&store).await;
        let gold = aggregator(store);

        let request = AggregateRequest::new("orders", "revenue_by_region")
            .group_by(&["region"])
            .aggregate("order_count", "amount", AggregateFn::Count)
            .aggregate("total", "amount", AggregateFn::Sum)
            .aggregate("avg_amount", "amount", AggregateFn::Avg);
        let rows = gold.aggregate(request).await.unwrap();
        assert_eq!(rows, 2);

        let data = gold
            .read("revenue_by_region", ReadOptions::all())
            .await
            .unwrap();
        assert_eq!(data.get("region", 0), Some(&Value::Str("eu".into())));
        assert_eq!(data.get("order_count", 0), Some(&Value::Int(2)));
        assert_eq!(data.get("total", 0), Some(&Value::Float(40.0)));
        assert_eq!(data.get("avg_amount", 0), Some(&Value::Float(20.0)));
        assert!(data.has_column("_computed_time"));
        assert_eq!(
            data.get("_source_tables", 0),
            Some(&Value::Str("orders".into()))
        );
    }

    #[tokio::test]
    async fn test_overwrite_is_full_recompute() {
        let store = Arc::new(MemoryTableStore::new());
        seed_silver(&store).await;
        let gold = aggregator(store);

        let request = || {
            AggregateRequest::new("orders", "by_region")
                .group_by(&["region"])
                .aggregate("n", "amount", AggregateFn::Count)
        };
        gold.aggregate(request()).await.unwrap();
        gold.aggregate(request()).await.unwrap();
        let data = gold.read("by_region", ReadOptions::all()).await.unwrap();
        // Overwrite mode: still one row per region.
        assert_eq!(data.num_rows(), 2);
    }

    #[tokio::test]
    async fn test_append_mode_accumulates() {
        let store = Arc::new(MemoryTableStore::new());
        seed_silver(&store).await;
        let gold = aggregator(store);

        let request = || {
            AggregateRequest::new("orders", "snapshots")
                .group_by(&["region"])
                .aggregate("n", "amount", AggregateFn::Count)
                .mode(WriteMode::Append)
        };
        gold.aggregate(request()).await.unwrap();
        gold.aggregate(request()).await.unwrap();
        let data = gold.read("snapshots", ReadOptions::all()).await.unwrap();
        assert_eq!(data.num_rows(), 4);
    }

    #[tokio::test]
    async fn test_lost_create_race_falls_back_to_write_mode() {
        let store = Arc::new(crate::store::test_util::FirstWriterRaceStore::new());
        let batch = Batch::from_columns(vec![(
            "region",
            vec![Value::Str("eu".into()), Value::Str("us".into())],
        )])
        .unwrap();
        store
            .create_from_batch("silver.orders", &batch, &[], HashMap::new())
            .await
            .unwrap();
        let gold = aggregator(store);

        let request = || {
            AggregateRequest::new("orders", "snapshots")
                .group_by(&["region"])
                .aggregate("n", "region", AggregateFn::Count)
                .mode(WriteMode::Append)
        };
        // The store claims the target is absent both times, so the second
        // run attempts a create, hits TableExists, and appends instead.
        gold.aggregate(request()).await.unwrap();
        gold.aggregate(request()).await.unwrap();
        let data = gold.read("snapshots", ReadOptions::all()).await.unwrap();
        assert_eq!(data.num_rows(), 4);
    }

    #[tokio::test]
    async fn test_empty_source_writes_schema_only() {
        let store = Arc::new(MemoryTableStore::new());
        store
            .create_from_batch("silver.orders", &Batch::new(), &[], HashMap::new())
            .await
            .unwrap();
        let gold = aggregator(store);

        let request = AggregateRequest::new("orders", "by_region")
            .group_by(&["region"])
            .aggregate("total", "amount", AggregateFn::Sum);
        let rows = gold.aggregate(request).await.unwrap();
        assert_eq!(rows, 0);

        let data = gold.read("by_region", ReadOptions::all()).await.unwrap();
        assert_eq!(data.num_rows(), 0);
        for column in ["region", "total", "_computed_time", "_source_tables"] {
            assert!(data.has_column(column), "missing {column}");
        }
    }

    #[test]
    fn test_week_truncates_to_monday() {
        // 2024-01-18 is a Thursday.
        let date = NaiveDate::from_ymd_opt(2024, 1, 18).unwrap();
        assert_eq!(
            TimeGranularity::Week.truncate(date),
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
        );
        // A Monday is its own bucket start.
        let monday = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(TimeGranularity::Week.truncate(monday), monday);
    }

    #[tokio::test]
    async fn test_time_bucket_groups_by_month() {
        use chrono::TimeZone;

        let store = Arc::new(MemoryTableStore::new());
        let orders = Batch::from_columns(vec![
            (
                "created_at",
                vec![
                    Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, 5, 8, 0, 0).unwrap()),
                    Value::Timestamp(Utc.with_ymd_and_hms(2024, 1, 20, 9, 0, 0).unwrap()),
                    Value::Timestamp(Utc.with_ymd_and_hms(2024, 2, 3, 10, 0, 0).unwrap()),
                ],
            ),
            (
                "amount",
                vec![Value::Float(10.0), Value::Float(30.0), Value::Float(5.0)],
            ),
        ])
        .unwrap();
        store
            .create_from_batch("silver.orders", &orders, &[], HashMap::new())
            .await
            .unwrap();
        let gold = aggregator(store);

        let request = AggregateRequest::new("orders", "monthly_revenue")
            .time_bucket("created_at", TimeGranularity::Month)
            .aggregate("total", "amount", AggregateFn::Sum);
        let rows = gold.aggregate(request).await.unwrap();
        assert_eq!(rows, 2);

        let data = gold
            .read("monthly_revenue", ReadOptions::all())
            .await
            .unwrap();
        assert_eq!(
            data.get("created_at_month", 0),
            Some(&Value::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()))
        );
        assert_eq!(data.get("total", 0), Some(&Value::Float(40.0)));
        assert_eq!(
            data.get("created_at_month", 1),
            Some(&Value::Date(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()))
        );
        assert_eq!(data.get("total", 1), Some(&Value::Float(5.0)));
    }

    #[tokio::test]
    async fn test_min_max_on_strings() {
        let store = Arc::new(MemoryTableStore::new());
        seed_silver(&store).await;
        let gold = aggregator(store);

        let request = AggregateRequest::new("orders", "bounds")
            .aggregate("first_region", "region", AggregateFn::Min)
            .aggregate("last_region", "region", AggregateFn::Max);
        gold.aggregate(request).await.unwrap();
        let data = gold.read("bounds", ReadOptions::all()).await.unwrap();
        assert_eq!(
            data.get("first_region", 0),
            Some(&Value::Str("eu".into()))
        );
        assert_eq!(data.get("last_region", 0), Some(&Value::Str("us".into())));
    }

    #[tokio::test]
    async fn test_sum_of_strings_fails() {
        let store = Arc::new(MemoryTableStore::new());
        seed_silver(&store).await;
        let gold = aggregator(store);

        let request = AggregateRequest::new("orders", "bad")
            .aggregate("total", "region", AggregateFn::Sum);
        assert!(matches!(
            gold.aggregate(request).await,
            Err(TransformationError::Stage { .. })
        ));
    }
}
