//! Paged batch extraction.

use super::{Connector, ExtractRequest};
use crate::batch::Batch;
use crate::bronze::{BronzeIngestor, IngestOptions, IngestReceipt};
use crate::config::ExtractionConfig;
use crate::emit;
use crate::error::{ExtractionError, PipelineError};
use crate::metrics::events::BatchExtracted;
use crate::retry::{retry_with_backoff, RetryPolicy};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Throughput numbers for one extraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchStats {
    pub rows: usize,
    pub batches: usize,
    pub duration: Duration,
}

impl BatchStats {
    pub fn rows_per_second(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.rows as f64 / secs
        } else {
            0.0
        }
    }
}

/// The extracted data plus its stats.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub data: Batch,
    pub stats: BatchStats,
}

type PageTransform = Arc<dyn Fn(Batch) -> Result<Batch, ExtractionError> + Send + Sync>;

/// Drives connectors page by page, with per-page retry and bounded
/// parallelism across sources.
#[derive(Clone)]
pub struct BatchExtractor {
    batch_size: usize,
    parallel_workers: usize,
    retry: RetryPolicy,
    transform: Option<PageTransform>,
}

impl std::fmt::Debug for BatchExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchExtractor")
            .field("batch_size", &self.batch_size)
            .field("parallel_workers", &self.parallel_workers)
            .field("retry", &self.retry)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

impl BatchExtractor {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            parallel_workers: config.parallel_workers,
            retry: config.retry.clone(),
            transform: None,
        }
    }

    /// Apply a transformation to every page before it is accumulated or
    /// handed to the page callback.
    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(Batch) -> Result<Batch, ExtractionError> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Pull everything the request matches from one connector, page by
    /// page. Each page fetch is retried under the configured policy.
    pub async fn extract(
        &self,
        connector: &dyn Connector,
        request: &ExtractRequest,
    ) -> Result<BatchOutcome, ExtractionError> {
        let mut pages = Vec::new();
        let stats = self
            .extract_each(connector, request, |page| {
                pages.push(page);
                Ok(())
            })
            .await?;
        Ok(BatchOutcome {
            data: Batch::concat(pages),
            stats,
        })
    }

    /// Like [`extract`](Self::extract), but hands each page to `on_batch`
    /// instead of accumulating, so large sources can be worked through in
    /// bounded memory.
    pub async fn extract_each<F>(
        &self,
        connector: &dyn Connector,
        request: &ExtractRequest,
        mut on_batch: F,
    ) -> Result<BatchStats, ExtractionError>
    where
        F: FnMut(Batch) -> Result<(), ExtractionError>,
    {
        let source = connector.name().to_string();
        let started = Utc::now();
        let mut offset = 0usize;
        let mut batches = 0usize;
        let mut rows = 0usize;

        info!(source = %source, batch_size = self.batch_size, "Starting batch extraction");
        loop {
            let page = retry_with_backoff(&self.retry, &source, || {
                connector.extract_page(request, offset, self.batch_size)
            })
            .await?;
            let Some(page) = page else { break };
            batches += 1;
            offset += page.num_rows();
            debug!(source = %source, batch = batches, rows = page.num_rows(), "Processed batch");
            emit!(BatchExtracted {
                rows: page.num_rows() as u64,
                source: source.clone(),
            });
            let exhausted = page.num_rows() < self.batch_size;
            let page = match &self.transform {
                Some(transform) => transform(page)?,
                None => page,
            };
            rows += page.num_rows();
            on_batch(page)?;
            if exhausted {
                break;
            }
        }

        let stats = BatchStats {
            rows,
            batches,
            duration: (Utc::now() - started).to_std().unwrap_or(Duration::ZERO),
        };
        info!(
            source = %source,
            total_rows = stats.rows,
            batches = stats.batches,
            duration_ms = stats.duration.as_millis() as u64,
            "Batch extraction completed"
        );
        Ok(stats)
    }

    /// Extract from several sources concurrently, at most
    /// `parallel_workers` at a time. Fails with the first source whose
    /// retries are exhausted.
    pub async fn extract_many(
        &self,
        connectors: Vec<Arc<dyn Connector>>,
        request: &ExtractRequest,
    ) -> Result<Vec<(String, BatchOutcome)>, ExtractionError> {
        let semaphore = Arc::new(Semaphore::new(self.parallel_workers.max(1)));
        let mut tasks: JoinSet<(String, Result<BatchOutcome, ExtractionError>)> = JoinSet::new();

        for connector in connectors {
            let semaphore = Arc::clone(&semaphore);
            let extractor = self.clone();
            let request = request.clone();
            let source = connector.name().to_string();
            tasks.spawn(async move {
                // Closed only when the set is dropped.
                let _permit = semaphore.acquire().await;
                let outcome = extractor.extract(connector.as_ref(), &request).await;
                (source, outcome)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((source, Ok(outcome))) => outcomes.push((source, outcome)),
                Ok((_, Err(error))) => return Err(error),
                Err(join_error) => {
                    return Err(ExtractionError::TaskJoin {
                        src: "extract_many".to_string(),
                        source: join_error,
                    });
                }
            }
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(outcomes)
    }

    /// Extract and land the result directly in a bronze table.
    pub async fn extract_to_bronze(
        &self,
        connector: &dyn Connector,
        request: &ExtractRequest,
        bronze: &BronzeIngestor,
        table: &str,
    ) -> Result<(IngestReceipt, BatchStats), PipelineError> {
        let outcome = self.extract(connector, request).await?;
        let receipt = bronze
            .ingest(
                table,
                outcome.data,
                connector.name(),
                IngestOptions::default(),
            )
            .await?;
        Ok((receipt, outcome.stats))
    }
}
