//! Configuration for the medallion engine.

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Configuration for one medallion layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerConfig {
    /// Namespace prefix for the layer's tables (e.g. `bronze` makes
    /// `bronze.orders`).
    pub namespace: String,
    /// Columns to partition the layer's tables by.
    #[serde(default)]
    pub partition_by: Vec<String>,
}

impl LayerConfig {
    fn named(namespace: &str, partition_by: &[&str]) -> Self {
        Self {
            namespace: namespace.to_string(),
            partition_by: partition_by.iter().map(|s| s.to_string()).collect(),
        }
    }
}

fn default_bronze() -> LayerConfig {
    LayerConfig::named("bronze", &["_ingestion_date"])
}

fn default_silver() -> LayerConfig {
    LayerConfig::named("silver", &["_processing_date"])
}

fn default_gold() -> LayerConfig {
    LayerConfig::named("gold", &[])
}

/// Standard cleaning applied on the way to silver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleaningConfig {
    /// Trim leading and trailing whitespace from string values.
    #[serde(default = "default_true")]
    pub trim_whitespace: bool,
    /// String values treated as null after trimming.
    #[serde(default = "default_null_strings")]
    pub null_string_values: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_null_strings() -> Vec<String> {
    vec![
        String::new(),
        "null".to_string(),
        "NULL".to_string(),
        "None".to_string(),
        "N/A".to_string(),
    ]
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            trim_whitespace: true,
            null_string_values: default_null_strings(),
        }
    }
}

/// Configuration for batch and incremental extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Maximum rows fetched per connector call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Concurrent extractions when running multiple sources.
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,
    /// Default ordering column used for watermarks.
    #[serde(default = "default_watermark_column")]
    pub watermark_column: String,
    /// Re-read this many seconds before the stored watermark to pick up
    /// late-arriving rows.
    #[serde(default)]
    pub lookback_seconds: u64,
    /// Retry schedule for failed extraction calls.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_batch_size() -> usize {
    10_000
}

fn default_parallel_workers() -> usize {
    4
}

fn default_watermark_column() -> String {
    "updated_at".to_string()
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            parallel_workers: default_parallel_workers(),
            watermark_column: default_watermark_column(),
            lookback_seconds: 0,
            retry: RetryPolicy::default(),
        }
    }
}

/// Main configuration for the engine.
///
/// # Example
///
/// ```yaml
/// bronze:
///   namespace: bronze
///   partition_by: [_ingestion_date]
/// silver:
///   namespace: silver
/// cleaning:
///   trim_whitespace: true
/// extraction:
///   batch_size: 5000
///   parallel_workers: 8
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_bronze")]
    pub bronze: LayerConfig,
    #[serde(default = "default_silver")]
    pub silver: LayerConfig,
    #[serde(default = "default_gold")]
    pub gold: LayerConfig,
    #[serde(default)]
    pub cleaning: CleaningConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bronze: default_bronze(),
            silver: default_silver(),
            gold: default_gold(),
            cleaning: CleaningConfig::default(),
            extraction: ExtractionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile { source })?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig =
            serde_yaml::from_str(contents).map_err(|source| ConfigError::YamlParse { source })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Checks:
    /// - Every layer has a non-empty namespace
    /// - No two layers share a namespace
    /// - Extraction batch size and worker count are non-zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for (layer, config) in [
            ("bronze", &self.bronze),
            ("silver", &self.silver),
            ("gold", &self.gold),
        ] {
            if config.namespace.is_empty() {
                return Err(ConfigError::EmptyNamespace {
                    layer: layer.to_string(),
                });
            }
            if !seen.insert(config.namespace.clone()) {
                return Err(ConfigError::NamespaceConflict {
                    namespace: config.namespace.clone(),
                });
            }
        }
        if self.extraction.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.extraction.parallel_workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        Ok(())
    }
}
