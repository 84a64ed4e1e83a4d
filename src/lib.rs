//! floe: a medallion-architecture transformation and versioning engine.
//!
//! Data flows through three layers over one abstract table store:
//!
//! - `bronze/` - Raw ingestion with provenance metadata (structured,
//!   semi-structured, and unstructured payloads)
//! - `silver/` - Cleaning, transformation, deduplication, and quality
//!   checks, incremental by default
//! - `gold/` - Grouped aggregation into reporting tables
//! - `scd2/` - SCD Type 2 versioned dimensions with point-in-time reads
//! - `extract/` - Connector-based extraction: paged batches, bounded
//!   parallelism, retry, and watermark-driven incremental pulls
//! - `watermark/` - Monotonic per-source watermarks persisted to an
//!   object store
//! - `store/` - The `TableStore` trait and an in-memory implementation
//! - `batch/` - The columnar in-memory batch the layers exchange

pub mod batch;
pub mod bronze;
pub mod config;
pub mod error;
pub mod extract;
pub mod gold;
pub mod lakehouse;
pub mod metrics;
pub mod retry;
pub mod scd2;
pub mod silver;
pub mod store;
pub mod tracing;
pub mod watermark;

// Re-export commonly used items
pub use batch::{Batch, Value};
pub use bronze::{BronzeIngestor, IngestOptions, IngestReceipt, UnstructuredContent};
pub use config::{CleaningConfig, EngineConfig, ExtractionConfig, LayerConfig};
pub use error::{
    ConfigError, ExtractionError, LoadError, PipelineError, StoreError, TransformationError,
    WatermarkError,
};
pub use extract::{
    BatchExtractor, BatchOutcome, BatchStats, Connector, ConnectorKind, ConnectorSpec,
    ExtractRequest, ExtractionStatus, FileConnector, IncrementalExtractor, IncrementalOutcome,
    MemoryConnector, SourceState,
};
pub use gold::{AggregateFn, AggregateRequest, GoldAggregator, TimeGranularity, WriteMode};
pub use lakehouse::{IngestPayload, Lakehouse};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use scd2::{Scd2Manager, Scd2Report, Scd2Request};
pub use silver::{ProcessRequest, SilverProcessor, Stage};
pub use store::{Filter, MemoryTableStore, ReadOptions, TableStore};
pub use tracing::init_tracing;
pub use watermark::{Watermark, WatermarkStore, WatermarkValue};
