//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the engine.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! counter metric, labelled by table or source so multi-table deployments
//! can be observed per component.

use metrics::counter;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when raw rows land in a bronze table.
pub struct RowsIngested {
    pub count: u64,
    /// Fully qualified target table.
    pub table: String,
}

impl InternalEvent for RowsIngested {
    fn emit(self) {
        trace!(count = self.count, table = %self.table, "Rows ingested");
        counter!("floe_rows_ingested_total", "table" => self.table).increment(self.count);
    }
}

/// Event emitted when cleaned rows land in a silver table.
pub struct RowsProcessed {
    pub count: u64,
    pub table: String,
}

impl InternalEvent for RowsProcessed {
    fn emit(self) {
        trace!(count = self.count, table = %self.table, "Rows processed");
        counter!("floe_rows_processed_total", "table" => self.table).increment(self.count);
    }
}

/// Event emitted when aggregated rows land in a gold table.
pub struct RowsAggregated {
    pub count: u64,
    pub table: String,
}

impl InternalEvent for RowsAggregated {
    fn emit(self) {
        trace!(count = self.count, table = %self.table, "Rows aggregated");
        counter!("floe_rows_aggregated_total", "table" => self.table).increment(self.count);
    }
}

/// Event emitted when deduplication drops rows on the way to silver.
pub struct DuplicatesDropped {
    pub count: u64,
    pub table: String,
}

impl InternalEvent for DuplicatesDropped {
    fn emit(self) {
        trace!(count = self.count, table = %self.table, "Duplicates dropped");
        counter!("floe_duplicates_dropped_total", "table" => self.table).increment(self.count);
    }
}

/// Event emitted when a source watermark advances.
pub struct WatermarkAdvanced {
    /// Source the watermark belongs to.
    pub source: String,
}

impl InternalEvent for WatermarkAdvanced {
    fn emit(self) {
        trace!(source = %self.source, "Watermark advanced");
        counter!("floe_watermark_updates_total", "source" => self.source).increment(1);
    }
}

/// Event emitted after a dimension merge, carrying the per-outcome row
/// counts.
pub struct DimensionMerged {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub table: String,
}

impl InternalEvent for DimensionMerged {
    fn emit(self) {
        trace!(
            inserted = self.inserted,
            updated = self.updated,
            unchanged = self.unchanged,
            table = %self.table,
            "Dimension merged"
        );
        counter!("floe_scd2_rows_total", "table" => self.table.clone(), "outcome" => "inserted")
            .increment(self.inserted);
        counter!("floe_scd2_rows_total", "table" => self.table.clone(), "outcome" => "updated")
            .increment(self.updated);
        counter!("floe_scd2_rows_total", "table" => self.table, "outcome" => "unchanged")
            .increment(self.unchanged);
    }
}

/// Event emitted when an extraction batch is fetched from a connector.
pub struct BatchExtracted {
    pub rows: u64,
    pub source: String,
}

impl InternalEvent for BatchExtracted {
    fn emit(self) {
        trace!(rows = self.rows, source = %self.source, "Batch extracted");
        counter!("floe_batches_extracted_total", "source" => self.source.clone()).increment(1);
        counter!("floe_rows_extracted_total", "source" => self.source).increment(self.rows);
    }
}

/// Event emitted when an extraction attempt fails and will be retried.
pub struct ExtractionRetried {
    pub source: String,
    pub attempt: u32,
}

impl InternalEvent for ExtractionRetried {
    fn emit(self) {
        trace!(source = %self.source, attempt = self.attempt, "Extraction retried");
        counter!("floe_extraction_retries_total", "source" => self.source).increment(1);
    }
}
