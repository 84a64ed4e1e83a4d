//! The layered engine behind one handle.

use crate::batch::Batch;
use crate::bronze::{BronzeIngestor, IngestOptions, IngestReceipt, UnstructuredContent};
use crate::config::EngineConfig;
use crate::error::PipelineError;
use crate::extract::{BatchExtractor, IncrementalExtractor};
use crate::gold::GoldAggregator;
use crate::scd2::Scd2Manager;
use crate::silver::SilverProcessor;
use crate::store::TableStore;
use crate::watermark::WatermarkStore;
use object_store::ObjectStore;
use std::sync::Arc;

/// The shapes of data a bronze table can take in.
pub enum IngestPayload {
    /// Tabular rows, stored as-is.
    Structured(Batch),
    /// JSON records; one row per record, nested values preserved.
    SemiStructured(Vec<serde_json::Value>),
    /// A single opaque document with its media type.
    Unstructured {
        content: UnstructuredContent,
        content_type: String,
    },
}

/// One handle over all layers of a lakehouse.
///
/// Every layer shares the same [`TableStore`], so table names resolved
/// through one layer's namespace are visible to the next.
pub struct Lakehouse {
    bronze: BronzeIngestor,
    silver: SilverProcessor,
    gold: GoldAggregator,
    dimensions: Scd2Manager,
    extraction: IncrementalExtractor,
    batch_extraction: BatchExtractor,
    watermarks: Arc<WatermarkStore>,
}

impl Lakehouse {
    /// Assemble the layers. `tables` backs the medallion tables and
    /// `state` backs watermark documents; they may be the same store.
    pub fn new(
        tables: Arc<dyn TableStore>,
        state: Arc<dyn ObjectStore>,
        config: &EngineConfig,
    ) -> Self {
        let watermarks = Arc::new(WatermarkStore::new(state));
        Self {
            bronze: BronzeIngestor::new(Arc::clone(&tables), &config.bronze),
            silver: SilverProcessor::new(
                Arc::clone(&tables),
                &config.silver,
                &config.bronze,
                config.cleaning.clone(),
            ),
            gold: GoldAggregator::new(Arc::clone(&tables), &config.gold, &config.silver),
            dimensions: Scd2Manager::new(tables, config.gold.namespace.clone()),
            extraction: IncrementalExtractor::new(&config.extraction, Arc::clone(&watermarks)),
            batch_extraction: BatchExtractor::new(&config.extraction),
            watermarks,
        }
    }

    /// Land a payload in a bronze table, dispatching on its shape.
    pub async fn ingest(
        &self,
        table: &str,
        payload: IngestPayload,
        source: &str,
        options: IngestOptions,
    ) -> Result<IngestReceipt, PipelineError> {
        let receipt = match payload {
            IngestPayload::Structured(batch) => {
                self.bronze.ingest(table, batch, source, options).await?
            }
            IngestPayload::SemiStructured(records) => {
                self.bronze
                    .ingest_semi_structured(table, records, source, options)
                    .await?
            }
            IngestPayload::Unstructured {
                content,
                content_type,
            } => {
                self.bronze
                    .ingest_unstructured(table, content, source, &content_type, options)
                    .await?
            }
        };
        Ok(receipt)
    }

    pub fn bronze(&self) -> &BronzeIngestor {
        &self.bronze
    }

    pub fn silver(&self) -> &SilverProcessor {
        &self.silver
    }

    pub fn gold(&self) -> &GoldAggregator {
        &self.gold
    }

    /// SCD Type 2 dimension management, in the gold namespace.
    pub fn dimensions(&self) -> &Scd2Manager {
        &self.dimensions
    }

    pub fn extraction(&self) -> &IncrementalExtractor {
        &self.extraction
    }

    pub fn batch_extraction(&self) -> &BatchExtractor {
        &self.batch_extraction
    }

    pub fn watermarks(&self) -> &WatermarkStore {
        &self.watermarks
    }
}
