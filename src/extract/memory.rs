//! In-memory connector for tests and fixtures.

use super::file::apply_since;
use super::{Connector, ConnectorKind, ExtractRequest};
use crate::batch::Batch;
use crate::error::ExtractionError;
use async_trait::async_trait;

/// Serves a fixed batch. Useful for tests and as the simplest possible
/// connector implementation.
pub struct MemoryConnector {
    name: String,
    data: Batch,
    kind: ConnectorKind,
}

impl MemoryConnector {
    pub fn new(name: impl Into<String>, data: Batch) -> Self {
        Self {
            name: name.into(),
            data,
            kind: ConnectorKind::Streaming,
        }
    }

    pub fn from_records(
        name: impl Into<String>,
        records: Vec<serde_json::Value>,
    ) -> Result<Self, ExtractionError> {
        let name = name.into();
        let data = Batch::from_json_records(records).map_err(|e| ExtractionError::Source {
            src: name.clone(),
            message: e.to_string(),
        })?;
        Ok(Self::new(name, data))
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ConnectorKind {
        self.kind
    }

    async fn extract(&self, request: &ExtractRequest) -> Result<Batch, ExtractionError> {
        Ok(apply_since(self.data.clone(), request))
    }
}
