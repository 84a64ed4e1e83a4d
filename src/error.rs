//! Error types for the medallion engine.
//!
//! Each concern gets its own snafu enum so callers can match on the failure
//! class without string inspection; every variant carries enough context
//! (table, source, or stage name) to locate the failing unit.

use snafu::prelude::*;

// ============ Store Errors ============

/// Errors that can occur in the table store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// Table does not exist. Table names are namespace-qualified.
    #[snafu(display("Table not found: {table}"))]
    TableNotFound { table: String },

    /// Table already exists.
    #[snafu(display("Table already exists: {table}"))]
    TableExists { table: String },

    /// A referenced column does not exist in the table.
    #[snafu(display("Column {column} not found in {table}"))]
    ColumnNotFound { table: String, column: String },

    /// Appended batch is incompatible with the table schema.
    #[snafu(display("Schema mismatch appending to {table}: {message}"))]
    SchemaMismatch { table: String, message: String },

    /// Underlying storage operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during store operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },
}

// ============ Load Errors ============

/// Errors that can occur while writing to the bronze layer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LoadError {
    /// The underlying store rejected the write.
    #[snafu(display("Failed to write to {target}: {source}"))]
    StoreWrite { target: String, source: StoreError },

    /// Unstructured content could not be prepared for ingestion.
    #[snafu(display("Failed to prepare payload for {target}: {message}"))]
    InvalidPayload { target: String, message: String },

    /// Semi-structured payload could not be serialized for raw preservation.
    #[snafu(display("Failed to serialize raw payload for {target}: {source}"))]
    RawSerialize {
        target: String,
        source: serde_json::Error,
    },
}

// ============ Transformation Errors ============

/// Errors raised by the silver/gold processing pipelines.
///
/// Always names the failing stage so a pipeline author can locate the
/// offending transform without stack inspection.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransformationError {
    /// A named pipeline stage failed.
    #[snafu(display("Stage '{stage}' failed: {message}"))]
    Stage { stage: String, message: String },

    /// Reading the source table failed.
    #[snafu(display("Failed to read source table {table}: {source}"))]
    ReadSource { table: String, source: StoreError },

    /// Writing the processed output failed.
    #[snafu(display("Failed to write to {table}: {source}"))]
    WriteTarget { table: String, source: StoreError },

    /// A column required by the pipeline is missing.
    #[snafu(display("Stage '{stage}' requires column {column}"))]
    MissingColumn { stage: String, column: String },
}

// ============ Watermark Errors ============

/// Errors that can occur during watermark persistence.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WatermarkError {
    /// Failed to read the persisted watermark document.
    #[snafu(display("Failed to load watermark for {src}: {source}"))]
    Load {
        src: String,
        source: object_store::Error,
    },

    /// Failed to persist the watermark document.
    #[snafu(display("Failed to persist watermark for {src}: {source}"))]
    Persist {
        src: String,
        source: object_store::Error,
    },

    /// Failed to encode/decode the watermark document.
    #[snafu(display("Invalid watermark document for {src}: {source}"))]
    Codec {
        src: String,
        source: serde_json::Error,
    },

    /// New value cannot be compared against the stored watermark.
    #[snafu(display("Watermark type mismatch for {src}: stored {stored}, new {new}"))]
    TypeMismatch {
        src: String,
        stored: &'static str,
        new: &'static str,
    },
}

// ============ Extraction Errors ============

/// Errors that can occur while extracting from a source connector.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ExtractionError {
    /// The source read failed. Retryable.
    #[snafu(display("Extraction from '{src}' failed: {message}"))]
    Source { src: String, message: String },

    /// Source payload could not be decoded into a batch.
    #[snafu(display("Failed to decode records from '{src}': {source}"))]
    Decode {
        src: String,
        source: serde_json::Error,
    },

    /// Reading a source file failed.
    #[snafu(display("Failed to read source file '{path}': {source}"))]
    SourceFile {
        path: String,
        source: object_store::Error,
    },

    /// Connector configuration is invalid.
    #[snafu(display("Invalid connector config '{name}': {message}"))]
    InvalidConfig { name: String, message: String },

    /// All retry attempts are exhausted. Wraps the final underlying error.
    #[snafu(display("Extraction from '{src}' failed after {attempts} attempts: {source}"))]
    RetryExhausted {
        src: String,
        attempts: u32,
        #[snafu(source(from(ExtractionError, Box::new)))]
        source: Box<ExtractionError>,
    },

    /// A spawned extraction task panicked or was cancelled.
    #[snafu(display("Extraction task for '{src}' failed: {source}"))]
    TaskJoin {
        src: String,
        source: tokio::task::JoinError,
    },
}

impl ExtractionError {
    /// Number of attempts behind this error (1 unless retries were exhausted).
    pub fn attempts(&self) -> u32 {
        match self {
            ExtractionError::RetryExhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// A layer namespace is empty.
    #[snafu(display("Namespace for the {layer} layer cannot be empty"))]
    EmptyNamespace { layer: String },

    /// Two layers share the same namespace.
    #[snafu(display("Namespace '{namespace}' is claimed by more than one layer"))]
    NamespaceConflict { namespace: String },

    /// Batch size of zero would never make progress.
    #[snafu(display("extraction.batch_size must be at least 1"))]
    ZeroBatchSize,

    /// Extraction worker cap must be non-zero.
    #[snafu(display("extraction.parallel_workers must be at least 1"))]
    ZeroWorkers,

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file"))]
    ReadFile { source: std::io::Error },
}

// ============ Top-level ============

/// Top-level engine errors.
///
/// Wrapping is pure (`context(false)`), so the generated `From` impls cover
/// `?` conversion and no context selectors collide with the per-concern
/// enums above.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error: {source}"), context(false))]
    Config { source: ConfigError },

    /// Store error.
    #[snafu(display("Store error: {source}"), context(false))]
    Store { source: StoreError },

    /// Bronze load error.
    #[snafu(display("Load error: {source}"), context(false))]
    Load { source: LoadError },

    /// Transformation error.
    #[snafu(display("Transformation error: {source}"), context(false))]
    Transformation { source: TransformationError },

    /// Watermark error.
    #[snafu(display("Watermark error: {source}"), context(false))]
    Watermark { source: WatermarkError },

    /// Extraction error.
    #[snafu(display("Extraction error: {source}"), context(false))]
    Extraction { source: ExtractionError },
}
