//! Bronze layer: raw data ingestion.
//!
//! The bronze layer stores data exactly as received. Every ingested batch is
//! stamped with provenance columns before it is appended:
//!
//! - `_ingestion_time` — one timestamp shared by all rows of the call
//! - `_source` — logical source identifier
//! - `_source_file` — originating file, when known
//! - `_batch_id` — caller-supplied or generated per call
//! - `_ingestion_date` — date of `_ingestion_time`, used for partitioning
//!
//! Bronze tables are append-only; nothing in this module rewrites or deletes
//! rows.

use crate::batch::{Batch, Value};
use crate::config::LayerConfig;
use crate::emit;
use crate::error::{LoadError, StoreError};
use crate::metrics::events::RowsIngested;
use crate::store::{Filter, ReadOptions, TableStore};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use snafu::ResultExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Provenance columns stamped on every bronze table.
pub const METADATA_COLUMNS: [&str; 5] = [
    "_ingestion_time",
    "_source",
    "_source_file",
    "_batch_id",
    "_ingestion_date",
];

/// Optional per-call ingestion parameters.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Originating file name, stamped as `_source_file`.
    pub source_file: Option<String>,
    /// Batch identifier; generated when absent.
    pub batch_id: Option<String>,
    /// Extra metadata stamped as `_meta_<key>` columns.
    pub additional_metadata: IndexMap<String, Value>,
}

/// Outcome of one ingestion call.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReceipt {
    pub rows: usize,
    /// `None` when the input was empty and nothing was written.
    pub batch_id: Option<String>,
}

impl IngestReceipt {
    fn skipped() -> Self {
        Self {
            rows: 0,
            batch_id: None,
        }
    }
}

/// Raw content for unstructured ingestion.
#[derive(Debug, Clone)]
pub enum UnstructuredContent {
    Bytes(Bytes),
    Text(String),
}

/// Appends provenance-stamped raw data to bronze tables.
pub struct BronzeIngestor {
    store: Arc<dyn TableStore>,
    namespace: String,
    partition_by: Vec<String>,
}

impl BronzeIngestor {
    pub fn new(store: Arc<dyn TableStore>, config: &LayerConfig) -> Self {
        Self {
            store,
            namespace: config.namespace.clone(),
            partition_by: config.partition_by.clone(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", self.namespace, table)
    }

    /// Ingest a structured batch.
    ///
    /// An empty batch is a no-op and returns a zero-row receipt. The table
    /// is created on first ingestion with the layer's partition columns;
    /// afterwards rows are appended, widening the schema as needed.
    pub async fn ingest(
        &self,
        table: &str,
        mut batch: Batch,
        source: &str,
        options: IngestOptions,
    ) -> Result<IngestReceipt, LoadError> {
        let target = self.qualified(table);
        if batch.is_empty() {
            warn!(table = %target, source, "Empty batch, skipping ingestion");
            return Ok(IngestReceipt::skipped());
        }

        let ingestion_time = Utc::now();
        let batch_id = options
            .batch_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        batch.set_literal("_ingestion_time", Value::Timestamp(ingestion_time));
        batch.set_literal("_source", Value::Str(source.to_string()));
        batch.set_literal(
            "_source_file",
            options
                .source_file
                .map_or(Value::Null, Value::Str),
        );
        batch.set_literal("_batch_id", Value::Str(batch_id.clone()));
        batch.set_literal(
            "_ingestion_date",
            Value::Date(ingestion_time.date_naive()),
        );
        for (key, value) in options.additional_metadata {
            batch.set_literal(format!("_meta_{key}"), value);
        }

        let rows = batch.num_rows();
        self.write(&target, &batch, source)
            .await
            .context(crate::error::StoreWriteSnafu { target: &target })?;

        info!(table = %target, rows, source, "Ingested data to bronze");
        emit!(RowsIngested {
            count: rows as u64,
            table: target,
        });
        Ok(IngestReceipt {
            rows,
            batch_id: Some(batch_id),
        })
    }

    /// Ingest JSON records, preserving each record verbatim in a
    /// `_raw_json` column alongside the inferred columns.
    pub async fn ingest_semi_structured(
        &self,
        table: &str,
        records: Vec<serde_json::Value>,
        source: &str,
        options: IngestOptions,
    ) -> Result<IngestReceipt, LoadError> {
        let target = self.qualified(table);
        let raw: Vec<Value> = records
            .iter()
            .map(|record| {
                serde_json::to_string(record)
                    .map(Value::Str)
                    .context(crate::error::RawSerializeSnafu { target: &target })
            })
            .collect::<Result<_, _>>()?;
        let mut batch =
            Batch::from_json_records(records).map_err(|e| LoadError::InvalidPayload {
                target: target.clone(),
                message: e.to_string(),
            })?;
        batch
            .push_column("_raw_json", raw)
            .map_err(|e| LoadError::InvalidPayload {
                target,
                message: e.to_string(),
            })?;
        self.ingest(table, batch, source, options).await
    }

    /// Ingest one unstructured document as a single row carrying its raw
    /// bytes, decoded text when valid UTF-8, content type, and size.
    pub async fn ingest_unstructured(
        &self,
        table: &str,
        content: UnstructuredContent,
        source: &str,
        content_type: &str,
        options: IngestOptions,
    ) -> Result<IngestReceipt, LoadError> {
        let (bytes, text) = match content {
            UnstructuredContent::Text(text) => (text.clone().into_bytes(), Some(text)),
            UnstructuredContent::Bytes(bytes) => {
                let text = std::str::from_utf8(&bytes).ok().map(str::to_string);
                (bytes.to_vec(), text)
            }
        };
        let size = bytes.len() as i64;
        let batch = Batch::from_columns(vec![
            ("_content_bytes", vec![Value::Bytes(bytes)]),
            ("_content_text", vec![text.map_or(Value::Null, Value::Str)]),
            (
                "_content_type",
                vec![Value::Str(content_type.to_string())],
            ),
            ("_content_size", vec![Value::Int(size)]),
        ])
        .map_err(|e| LoadError::InvalidPayload {
            target: self.qualified(table),
            message: e.to_string(),
        })?;
        self.ingest(table, batch, source, options).await
    }

    /// Read from a bronze table with optional projection, filter, and
    /// limit.
    pub async fn read(&self, table: &str, options: ReadOptions) -> Result<Batch, StoreError> {
        self.store.read(&self.qualified(table), options).await
    }

    /// Rows ingested strictly after `since`, for incremental processing.
    pub async fn read_new_since(
        &self,
        table: &str,
        since: DateTime<Utc>,
    ) -> Result<Batch, StoreError> {
        let filter = Filter::Gt("_ingestion_time".to_string(), Value::Timestamp(since));
        self.read(table, ReadOptions::filtered(filter)).await
    }

    /// The most recent `_ingestion_time` in a table, or `None` when the
    /// table is missing or empty.
    pub async fn latest_ingestion_time(
        &self,
        table: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let target = self.qualified(table);
        if !self.store.exists(&target).await? {
            return Ok(None);
        }
        let options = ReadOptions {
            columns: Some(vec!["_ingestion_time".to_string()]),
            ..ReadOptions::default()
        };
        let times = self.store.read(&target, options).await?;
        Ok(match times.max_of("_ingestion_time") {
            Some(Value::Timestamp(ts)) => Some(ts),
            _ => None,
        })
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        self.store.exists(&self.qualified(table)).await
    }

    /// Tables in this layer's namespace, without the namespace prefix.
    pub async fn list_tables(&self) -> Result<Vec<String>, StoreError> {
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

    async fn write(&self, target: &str, batch: &Batch, source: &str) -> Result<(), StoreError> {
        if self.store.exists(target).await? {
            return self.store.append(target, batch).await;
        }
        let properties = HashMap::from([
            ("floe.layer".to_string(), "bronze".to_string()),
            ("floe.source".to_string(), source.to_string()),
        ]);
        match self
            .store
            .create_from_batch(target, batch, &self.partition_by, properties)
            .await
        {
            // Lost a create race with a concurrent first writer.
            Err(StoreError::TableExists { .. }) => self.store.append(target, batch).await,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTableStore;

    fn ingestor() -> BronzeIngestor {
        let config = LayerConfig {
            namespace: "bronze".to_string(),
            partition_by: vec!["_ingestion_date".to_string()],
        };
        BronzeIngestor::new(Arc::new(MemoryTableStore::new()), &config)
    }

    fn orders() -> Batch {
        Batch::from_columns(vec![
            ("order_id", vec![Value::Int(1), Value::Int(2)]),
            (
                "amount",
                vec![Value::Float(10.5), Value::Float(20.0)],
            ),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn test_ingest_stamps_provenance() {
        let bronze = ingestor();
        let receipt = bronze
            .ingest("orders", orders(), "crm", IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(receipt.rows, 2);
        let batch_id = receipt.batch_id.unwrap();

        let data = bronze.read("orders", ReadOptions::all()).await.unwrap();
        for column in METADATA_COLUMNS {
            assert!(data.has_column(column), "missing {column}");
        }
        // One uniform batch id and timestamp across the call.
        assert_eq!(data.get("_batch_id", 0), Some(&Value::Str(batch_id.clone())));
        assert_eq!(data.get("_batch_id", 1), Some(&Value::Str(batch_id)));
        assert_eq!(
            data.get("_ingestion_time", 0),
            data.get("_ingestion_time", 1)
        );
        assert_eq!(data.get("_source", 0), Some(&Value::Str("crm".into())));
        assert_eq!(data.get("_source_file", 0), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let bronze = ingestor();
        let receipt = bronze
            .ingest("orders", Batch::new(), "crm", IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(receipt, IngestReceipt::skipped());
        assert!(!bronze.table_exists("orders").await.unwrap());
    }

    #[tokio::test]
    async fn test_lost_create_race_falls_back_to_append() {
        let config = LayerConfig {
            namespace: "bronze".to_string(),
            partition_by: vec![],
        };
        let store = Arc::new(crate::store::test_util::FirstWriterRaceStore::new());
        let bronze = BronzeIngestor::new(store as Arc<dyn TableStore>, &config);

        // The store claims the table is absent both times, so the second
        // ingest attempts a create, hits TableExists, and appends instead.
        bronze
            .ingest("orders", orders(), "crm", IngestOptions::default())
            .await
            .unwrap();
        bronze
            .ingest("orders", orders(), "crm", IngestOptions::default())
            .await
            .unwrap();
        let data = bronze.read("orders", ReadOptions::all()).await.unwrap();
        assert_eq!(data.num_rows(), 4);
    }

    #[tokio::test]
    async fn test_read_new_since_filters_on_ingestion_time() {
        let bronze = ingestor();
        bronze
            .ingest("orders", orders(), "crm", IngestOptions::default())
            .await
            .unwrap();
        let first_max = bronze
            .latest_ingestion_time("orders")
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let more =
            Batch::from_columns(vec![("order_id", vec![Value::Int(3)])]).unwrap();
        bronze
            .ingest("orders", more, "crm", IngestOptions::default())
            .await
            .unwrap();

        let fresh = bronze.read_new_since("orders", first_max).await.unwrap();
        assert_eq!(fresh.num_rows(), 1);
        assert_eq!(fresh.get("order_id", 0), Some(&Value::Int(3)));
    }

    #[tokio::test]
    async fn test_reingest_appends() {
        let bronze = ingestor();
        bronze
            .ingest("orders", orders(), "crm", IngestOptions::default())
            .await
            .unwrap();
        bronze
            .ingest("orders", orders(), "crm", IngestOptions::default())
            .await
            .unwrap();
        let data = bronze.read("orders", ReadOptions::all()).await.unwrap();
        assert_eq!(data.num_rows(), 4);
    }

    #[tokio::test]
    async fn test_additional_metadata_columns() {
        let bronze = ingestor();
        let options = IngestOptions {
            additional_metadata: IndexMap::from([(
                "region".to_string(),
                Value::Str("eu".to_string()),
            )]),
            ..IngestOptions::default()
        };
        bronze
            .ingest("orders", orders(), "crm", options)
            .await
            .unwrap();
        let data = bronze.read("orders", ReadOptions::all()).await.unwrap();
        assert_eq!(
            data.get("_meta_region", 1),
            Some(&Value::Str("eu".into()))
        );
    }

    #[tokio::test]
    async fn test_semi_structured_preserves_raw_json() {
        let bronze = ingestor();
        let records = vec![
            serde_json::json!({"id": 1, "tags": ["a", "b"]}),
            serde_json::json!({"id": 2}),
        ];
        bronze
            .ingest_semi_structured("events", records, "api", IngestOptions::default())
            .await
            .unwrap();
        let data = bronze.read("events", ReadOptions::all()).await.unwrap();
        assert_eq!(data.num_rows(), 2);
        let raw = data.get("_raw_json", 0).unwrap();
        assert!(matches!(raw, Value::Str(s) if s.contains("\"tags\"")));
        // Nested arrays survive as JSON values.
        assert!(matches!(data.get("tags", 0), Some(Value::Json(_))));
    }

    #[tokio::test]
    async fn test_unstructured_single_row() {
        let bronze = ingestor();
        let receipt = bronze
            .ingest_unstructured(
                "documents",
                UnstructuredContent::Text("hello world".to_string()),
                "uploads",
                "text/plain",
                IngestOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(receipt.rows, 1);
        let data = bronze.read("documents", ReadOptions::all()).await.unwrap();
        assert_eq!(data.get("_content_size", 0), Some(&Value::Int(11)));
        assert_eq!(
            data.get("_content_text", 0),
            Some(&Value::Str("hello world".into()))
        );
    }

    #[tokio::test]
    async fn test_latest_ingestion_time() {
        let bronze = ingestor();
        assert_eq!(bronze.latest_ingestion_time("orders").await.unwrap(), None);
        bronze
            .ingest("orders", orders(), "crm", IngestOptions::default())
            .await
            .unwrap();
        assert!(bronze.latest_ingestion_time("orders").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_list_tables_scoped_to_namespace() {
        let bronze = ingestor();
        bronze
            .ingest("orders", orders(), "crm", IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(bronze.list_tables().await.unwrap(), vec!["orders"]);
    }
}
