//! Source extraction.
//!
//! Connectors pull rows out of external systems; the extractors in
//! [`batch`] and [`incremental`] drive them with pagination, retry, and
//! watermark bookkeeping, and can land the result straight in bronze.

mod batch;
mod connector;
mod file;
mod incremental;
mod memory;

pub use batch::{BatchExtractor, BatchOutcome, BatchStats};
pub use connector::{Connector, ConnectorKind, ConnectorSpec, ExtractRequest};
pub use file::FileConnector;
pub use incremental::{ExtractionStatus, IncrementalExtractor, IncrementalOutcome, SourceState};
pub use memory::MemoryConnector;
