//! Per-source extraction watermarks.
//!
//! A watermark records the highest value of an ordering column that has been
//! extracted from a source, so the next run can start where the last one
//! stopped. Watermarks are persisted as one JSON document per source under
//! `watermarks/` in the backing object store, and each document is written
//! atomically (temp object then rename) so a crashed writer never leaves a
//! torn file behind.

use crate::batch::{Batch, Value};
use crate::error::WatermarkError;
use crate::emit;
use crate::metrics::events::WatermarkAdvanced;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use object_store::{path::Path, ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const WATERMARK_PREFIX: &str = "watermarks";

/// The comparable value a watermark tracks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum WatermarkValue {
    Timestamp(DateTime<Utc>),
    Int(i64),
    Float(f64),
    Str(String),
}

impl WatermarkValue {
    pub fn kind(&self) -> &'static str {
        match self {
            WatermarkValue::Timestamp(_) => "timestamp",
            WatermarkValue::Int(_) => "int",
            WatermarkValue::Float(_) => "float",
            WatermarkValue::Str(_) => "str",
        }
    }

    /// Comparison is only defined between values of the same kind.
    fn partial_cmp(&self, other: &WatermarkValue) -> Option<Ordering> {
        match (self, other) {
            (WatermarkValue::Timestamp(a), WatermarkValue::Timestamp(b)) => Some(a.cmp(b)),
            (WatermarkValue::Int(a), WatermarkValue::Int(b)) => Some(a.cmp(b)),
            (WatermarkValue::Float(a), WatermarkValue::Float(b)) => a.partial_cmp(b),
            (WatermarkValue::Str(a), WatermarkValue::Str(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Convert a batch cell to a watermark value. Nulls and non-orderable
    /// kinds yield `None`.
    pub fn from_value(value: &Value) -> Option<WatermarkValue> {
        match value {
            Value::Timestamp(ts) => Some(WatermarkValue::Timestamp(*ts)),
            Value::Int(i) => Some(WatermarkValue::Int(*i)),
            Value::Float(f) => Some(WatermarkValue::Float(*f)),
            Value::Str(s) => Some(WatermarkValue::Str(s.clone())),
            _ => None,
        }
    }

    /// The batch-side representation, for use in read filters.
    pub fn to_value(&self) -> Value {
        match self {
            WatermarkValue::Timestamp(ts) => Value::Timestamp(*ts),
            WatermarkValue::Int(i) => Value::Int(*i),
            WatermarkValue::Float(f) => Value::Float(*f),
            WatermarkValue::Str(s) => Value::Str(s.clone()),
        }
    }
}

impl std::fmt::Display for WatermarkValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatermarkValue::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            WatermarkValue::Int(i) => write!(f, "{i}"),
            WatermarkValue::Float(v) => write!(f, "{v}"),
            WatermarkValue::Str(s) => write!(f, "{s}"),
        }
    }
}

/// A persisted watermark for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    pub source: String,
    /// The source column the value was taken from.
    pub column: String,
    pub value: WatermarkValue,
    pub updated_at: DateTime<Utc>,
    /// Free-form annotations carried with the document.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

/// Watermark persistence over an object store.
///
/// Updates to a single source are serialized through a per-source mutex, so
/// the read-compare-write cycle never races with itself within a process.
pub struct WatermarkStore {
    store: Arc<dyn ObjectStore>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl WatermarkStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(source: &str) -> Path {
        Path::from(format!("{WATERMARK_PREFIX}/{source}.json"))
    }

    async fn lock_for(&self, source: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(source.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// The last persisted watermark for a source, or `None` if the source
    /// has never been extracted.
    pub async fn get(&self, source: &str) -> Result<Option<Watermark>, WatermarkError> {
        let result = self.store.get(&Self::path_for(source)).await;
        let data = match result {
            Ok(response) => response
                .bytes()
                .await
                .context(crate::error::LoadSnafu { src: source })?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(source_err) => {
                return Err(source_err).context(crate::error::LoadSnafu { src: source })
            }
        };
        let watermark =
            serde_json::from_slice(&data).context(crate::error::CodecSnafu { src: source })?;
        Ok(Some(watermark))
    }

    /// Persist a watermark unconditionally, overwriting whatever is stored.
    /// The caller owns monotonicity here; [`Self::update_from_batch`] is the
    /// guarded path for routine advancement.
    pub async fn set(
        &self,
        source: &str,
        column: &str,
        value: WatermarkValue,
        metadata: HashMap<String, String>,
    ) -> Result<Watermark, WatermarkError> {
        let lock = self.lock_for(source).await;
        let _guard = lock.lock().await;

        let watermark = Watermark {
            source: source.to_string(),
            column: column.to_string(),
            value,
            updated_at: Utc::now(),
            metadata,
        };
        self.persist(&watermark).await?;
        emit!(WatermarkAdvanced {
            source: source.to_string(),
        });
        Ok(watermark)
    }

    /// Advance the watermark to the maximum non-null value of a batch
    /// column. Returns `None` without touching storage when the column is
    /// missing, all-null, or not an orderable kind. A maximum lower than the
    /// stored value leaves the stored watermark in place and returns it
    /// unchanged; a maximum of a different kind than the stored value is
    /// rejected.
    pub async fn update_from_batch(
        &self,
        source: &str,
        batch: &Batch,
        column: &str,
    ) -> Result<Option<Watermark>, WatermarkError> {
        let Some(max) = batch.max_of(column).as_ref().and_then(WatermarkValue::from_value)
        else {
            return Ok(None);
        };

        let lock = self.lock_for(source).await;
        let _guard = lock.lock().await;

        if let Some(current) = self.get(source).await? {
            match current.value.partial_cmp(&max) {
                None => {
                    return crate::error::TypeMismatchSnafu {
                        src: source,
                        stored: current.value.kind(),
                        new: max.kind(),
                    }
                    .fail();
                }
                Some(Ordering::Greater) | Some(Ordering::Equal) => return Ok(Some(current)),
                Some(Ordering::Less) => {}
            }
        }

        let watermark = Watermark {
            source: source.to_string(),
            column: column.to_string(),
            value: max,
            updated_at: Utc::now(),
            metadata: HashMap::new(),
        };
        self.persist(&watermark).await?;
        emit!(WatermarkAdvanced {
            source: source.to_string(),
        });
        Ok(Some(watermark))
    }

    /// Remove the watermark so the next extraction starts from scratch.
    pub async fn delete(&self, source: &str) -> Result<(), WatermarkError> {
        let lock = self.lock_for(source).await;
        let _guard = lock.lock().await;
        match self.store.delete(&Self::path_for(source)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(source_err) => Err(source_err).context(crate::error::PersistSnafu { src: source }),
        }
    }

    /// All sources with a persisted watermark.
    pub async fn list_sources(&self) -> Result<Vec<String>, WatermarkError> {
        let prefix = Path::from(WATERMARK_PREFIX);
        let objects: Vec<_> = self
            .store
            .list(Some(&prefix))
            .try_collect()
            .await
            .context(crate::error::LoadSnafu { src: "*" })?;
        let mut sources: Vec<String> = objects
            .into_iter()
            .filter_map(|meta| {
                meta.location
                    .filename()
                    .and_then(|name| name.strip_suffix(".json"))
                    .map(str::to_string)
            })
            .collect();
        sources.sort();
        Ok(sources)
    }

    // Write to a temp object first so readers never see a partial document.
    async fn persist(&self, watermark: &Watermark) -> Result<(), WatermarkError> {
        let src = watermark.source.as_str();
        let data =
            serde_json::to_vec_pretty(watermark).context(crate::error::CodecSnafu { src })?;
        let target = Self::path_for(src);
        let tmp = Path::from(format!("{WATERMARK_PREFIX}/.{src}.json.tmp"));
        self.store
            .put(&tmp, PutPayload::from(data))
            .await
            .context(crate::error::PersistSnafu { src })?;
        self.store
            .rename(&tmp, &target)
            .await
            .context(crate::error::PersistSnafu { src })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use object_store::memory::InMemory;

    fn store() -> WatermarkStore {
        WatermarkStore::new(Arc::new(InMemory::new()))
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_get_missing_source_is_none() {
        let watermarks = store();
        assert_eq!(watermarks.get("crm").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_then_get_round_trips() {
        let watermarks = store();
        let metadata = HashMap::from([("run_id".to_string(), "r-42".to_string())]);
        watermarks
            .set("crm", "updated_at", WatermarkValue::Timestamp(ts(100)), metadata)
            .await
            .unwrap();
        let loaded = watermarks.get("crm").await.unwrap().unwrap();
        assert_eq!(loaded.value, WatermarkValue::Timestamp(ts(100)));
        assert_eq!(loaded.source, "crm");
        assert_eq!(loaded.column, "updated_at");
        assert_eq!(loaded.metadata.get("run_id").map(String::as_str), Some("r-42"));
    }

    #[tokio::test]
    async fn test_set_overwrites_unconditionally() {
        let watermarks = store();
        watermarks
            .set("crm", "id", WatermarkValue::Int(10), HashMap::new())
            .await
            .unwrap();
        // Explicit set is an operator override: lower values and kind
        // changes both stick.
        watermarks
            .set("crm", "id", WatermarkValue::Int(5), HashMap::new())
            .await
            .unwrap();
        let loaded = watermarks.get("crm").await.unwrap().unwrap();
        assert_eq!(loaded.value, WatermarkValue::Int(5));
    }

    #[tokio::test]
    async fn test_update_from_batch_never_regresses() {
        let watermarks = store();
        let high = Batch::from_columns(vec![("id", vec![Value::Int(10)])]).unwrap();
        let low = Batch::from_columns(vec![("id", vec![Value::Int(5)])]).unwrap();
        watermarks
            .update_from_batch("crm", &high, "id")
            .await
            .unwrap();
        let kept = watermarks
            .update_from_batch("crm", &low, "id")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(kept.value, WatermarkValue::Int(10));
        let loaded = watermarks.get("crm").await.unwrap().unwrap();
        assert_eq!(loaded.value, WatermarkValue::Int(10));
    }

    #[tokio::test]
    async fn test_update_from_batch_rejects_kind_change() {
        let watermarks = store();
        watermarks
            .set("crm", "id", WatermarkValue::Int(10), HashMap::new())
            .await
            .unwrap();
        let strings = Batch::from_columns(vec![("id", vec![Value::Str("2024".into())])]).unwrap();
        let result = watermarks.update_from_batch("crm", &strings, "id").await;
        assert!(matches!(result, Err(WatermarkError::TypeMismatch { .. })));
    }

    #[tokio::test]
    async fn test_update_from_batch_takes_max() {
        let watermarks = store();
        let batch = Batch::from_columns(vec![(
            "updated_at",
            vec![
                Value::Timestamp(ts(10)),
                Value::Null,
                Value::Timestamp(ts(30)),
            ],
        )])
        .unwrap();
        let advanced = watermarks
            .update_from_batch("crm", &batch, "updated_at")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(advanced.value, WatermarkValue::Timestamp(ts(30)));
    }

    #[tokio::test]
    async fn test_update_from_batch_missing_column_is_noop() {
        let watermarks = store();
        let batch = Batch::from_columns(vec![("a", vec![Value::Int(1)])]).unwrap();
        let result = watermarks
            .update_from_batch("crm", &batch, "updated_at")
            .await
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(watermarks.get("crm").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_then_list() {
        let watermarks = store();
        watermarks
            .set("a", "id", WatermarkValue::Int(1), HashMap::new())
            .await
            .unwrap();
        watermarks
            .set("b", "id", WatermarkValue::Int(2), HashMap::new())
            .await
            .unwrap();
        watermarks.delete("a").await.unwrap();
        assert_eq!(watermarks.list_sources().await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_survives_process_restart_on_local_fs() {
        let dir = tempfile::tempdir().unwrap();
        let backing = || {
            Arc::new(
                object_store::local::LocalFileSystem::new_with_prefix(dir.path()).unwrap(),
            )
        };
        WatermarkStore::new(backing())
            .set("crm", "updated_at", WatermarkValue::Timestamp(ts(100)), HashMap::new())
            .await
            .unwrap();

        // A fresh store over the same directory sees the same watermark.
        let reopened = WatermarkStore::new(backing());
        let loaded = reopened.get("crm").await.unwrap().unwrap();
        assert_eq!(loaded.value, WatermarkValue::Timestamp(ts(100)));
    }
}
