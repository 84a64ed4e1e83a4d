//! The connector abstraction.

use crate::batch::Batch;
use crate::error::ExtractionError;
use crate::watermark::WatermarkValue;
use async_trait::async_trait;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The closed set of connector families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    Database,
    File,
    Api,
    Streaming,
    Unstructured,
}

/// What to pull from a connector.
#[derive(Debug, Clone, Default)]
pub struct ExtractRequest {
    /// Source-side table or collection name, for connectors that have one.
    pub table: Option<String>,
    /// Ordering column for incremental extraction.
    pub watermark_column: Option<String>,
    /// Only rows where the watermark column is strictly greater than this.
    pub since: Option<WatermarkValue>,
}

impl ExtractRequest {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn since(mut self, column: impl Into<String>, value: WatermarkValue) -> Self {
        self.watermark_column = Some(column.into());
        self.since = Some(value);
        self
    }
}

/// A source of batches.
///
/// `extract` fetches everything the request matches in one call;
/// `extract_page` fetches a row-offset window of the same result, returning
/// `None` once exhausted, so callers can work through large sources in
/// bounded memory.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Source identifier, used for watermarks and error context.
    fn name(&self) -> &str;

    fn kind(&self) -> ConnectorKind;

    async fn extract(&self, request: &ExtractRequest) -> Result<Batch, ExtractionError>;

    async fn extract_page(
        &self,
        request: &ExtractRequest,
        offset: usize,
        limit: usize,
    ) -> Result<Option<Batch>, ExtractionError> {
        let all = self.extract(request).await?;
        if offset >= all.num_rows() {
            return Ok(None);
        }
        let end = (offset + limit).min(all.num_rows());
        let indices: Vec<usize> = (offset..end).collect();
        Ok(Some(all.take_rows(&indices)))
    }
}

/// Declarative connector configuration, buildable from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectorSpec {
    /// NDJSON files under a prefix in an object store.
    File {
        name: String,
        /// Object store prefix to list.
        prefix: String,
    },
    /// Canned JSON records, for tests and fixtures.
    Memory {
        name: String,
        records: Vec<serde_json::Value>,
    },
}

impl ConnectorSpec {
    pub fn name(&self) -> &str {
        match self {
            ConnectorSpec::File { name, .. } => name,
            ConnectorSpec::Memory { name, .. } => name,
        }
    }

    /// Build the connector. The object store backs file connectors; memory
    /// connectors ignore it.
    pub fn build(
        &self,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Box<dyn Connector>, ExtractionError> {
        match self {
            ConnectorSpec::File { name, prefix } => {
                if prefix.is_empty() {
                    return crate::error::InvalidConfigSnafu {
                        name,
                        message: "file connector needs a non-empty prefix",
                    }
                    .fail();
                }
                Ok(Box::new(super::FileConnector::new(name, store, prefix)))
            }
            ConnectorSpec::Memory { name, records } => Ok(Box::new(
                super::MemoryConnector::from_records(name, records.clone())?,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    #[test]
    fn test_spec_yaml_round_trip() {
        let yaml = r#"
type: file
name: crm
prefix: incoming/crm
"#;
        let spec: ConnectorSpec = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(spec, ConnectorSpec::File { .. }));
        assert_eq!(spec.name(), "crm");
    }

    #[test]
    fn test_file_spec_rejects_empty_prefix() {
        let spec = ConnectorSpec::File {
            name: "crm".to_string(),
            prefix: String::new(),
        };
        let result = spec.build(Arc::new(InMemory::new()));
        assert!(matches!(
            result,
            Err(ExtractionError::InvalidConfig { .. })
        ));
    }
}
