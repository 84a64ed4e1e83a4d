//! End-to-end flows through the public API: bronze ingestion, silver
//! processing, gold aggregation, dimension versioning, and watermarks.

use chrono::{TimeZone, Utc};
use floe::{
    AggregateFn, AggregateRequest, Batch, EngineConfig, IngestOptions, IngestPayload, Lakehouse,
    ProcessRequest, Scd2Request, Value, WatermarkStore, WatermarkValue,
};
use indexmap::IndexMap;
use object_store::memory::InMemory;
use std::sync::Arc;

fn lakehouse() -> Lakehouse {
    Lakehouse::new(
        Arc::new(floe::MemoryTableStore::new()),
        Arc::new(InMemory::new()),
        &EngineConfig::default(),
    )
}

fn orders(ids: &[i64], amounts: &[f64], customers: &[&str]) -> Batch {
    Batch::from_columns(vec![
        ("order_id", ids.iter().copied().map(Value::Int).collect()),
        (
            "amount",
            amounts.iter().copied().map(Value::Float).collect(),
        ),
        (
            "customer",
            customers
                .iter()
                .map(|c| Value::Str(c.to_string()))
                .collect(),
        ),
    ])
    .unwrap()
}

fn customer_key(id: &str) -> IndexMap<String, Value> {
    IndexMap::from([("customer_id".to_string(), Value::Str(id.to_string()))])
}

#[tokio::test]
async fn test_reingesting_same_batch_appends_rows() {
    let lakehouse = lakehouse();
    let batch = orders(&[1, 2], &[10.0, 20.0], &["a", "b"]);
    let options = IngestOptions {
        batch_id: Some("batch-001".to_string()),
        ..IngestOptions::default()
    };

    let first = lakehouse
        .bronze()
        .ingest("orders", batch.clone(), "erp", options.clone())
        .await
        .unwrap();
    let second = lakehouse
        .bronze()
        .ingest("orders", batch, "erp", options)
        .await
        .unwrap();
    assert_eq!(first.rows, 2);
    assert_eq!(second.rows, 2);

    let data = lakehouse
        .bronze()
        .read("orders", floe::ReadOptions::all())
        .await
        .unwrap();
    assert_eq!(data.num_rows(), 4);
    for row in 0..4 {
        assert_eq!(
            data.get("_batch_id", row),
            Some(&Value::Str("batch-001".to_string()))
        );
        assert!(matches!(
            data.get("_ingestion_time", row),
            Some(Value::Timestamp(_))
        ));
    }
}

#[tokio::test]
async fn test_silver_incremental_matches_single_pass() {
    let incremental = lakehouse();
    let single = lakehouse();
    let first = orders(&[1, 2], &[10.0, 20.0], &["a", "b"]);
    let second = orders(&[3], &[30.0], &["a"]);

    // Two ingest-process rounds.
    incremental
        .bronze()
        .ingest("orders", first.clone(), "erp", IngestOptions::default())
        .await
        .unwrap();
    incremental
        .silver()
        .process(ProcessRequest::new("orders", "orders_clean"))
        .await
        .unwrap();
    incremental
        .bronze()
        .ingest("orders", second.clone(), "erp", IngestOptions::default())
        .await
        .unwrap();
    let appended = incremental
        .silver()
        .process(ProcessRequest::new("orders", "orders_clean"))
        .await
        .unwrap();
    assert_eq!(appended, 1);

    // One ingest of the union, processed once.
    single
        .bronze()
        .ingest("orders", Batch::concat(vec![first, second]), "erp", IngestOptions::default())
        .await
        .unwrap();
    single
        .silver()
        .process(ProcessRequest::new("orders", "orders_clean"))
        .await
        .unwrap();

    let gather = |batch: &Batch| -> Vec<(Option<Value>, Option<Value>)> {
        let mut rows: Vec<_> = (0..batch.num_rows())
            .map(|row| {
                (
                    batch.get("order_id", row).cloned(),
                    batch.get("amount", row).cloned(),
                )
            })
            .collect();
        rows.sort_by(|a, b| format!("{a:?}").cmp(&format!("{b:?}")));
        rows
    };
    let from_incremental = incremental
        .silver()
        .read("orders_clean", floe::ReadOptions::all())
        .await
        .unwrap();
    let from_single = single
        .silver()
        .read("orders_clean", floe::ReadOptions::all())
        .await
        .unwrap();
    assert_eq!(from_incremental.num_rows(), 3);
    assert_eq!(gather(&from_incremental), gather(&from_single));
}

#[tokio::test]
async fn test_bronze_to_gold_aggregation() {
    let lakehouse = lakehouse();
    lakehouse
        .bronze()
        .ingest(
            "orders",
            orders(&[1, 2, 3], &[10.0, 20.0, 5.0], &["a", "a", "b"]),
            "erp",
            IngestOptions::default(),
        )
        .await
        .unwrap();
    lakehouse
        .silver()
        .process(ProcessRequest::new("orders", "orders_clean"))
        .await
        .unwrap();
    let rows = lakehouse
        .gold()
        .aggregate(
            AggregateRequest::new("orders_clean", "revenue_by_customer")
                .group_by(&["customer"])
                .aggregate("order_count", "order_id", AggregateFn::Count)
                .aggregate("revenue", "amount", AggregateFn::Sum),
        )
        .await
        .unwrap();
    assert_eq!(rows, 2);

    let report = lakehouse
        .gold()
        .read("revenue_by_customer", floe::ReadOptions::all())
        .await
        .unwrap();
    let row_a = (0..report.num_rows())
        .find(|&row| report.get("customer", row) == Some(&Value::Str("a".to_string())))
        .unwrap();
    assert_eq!(report.get("order_count", row_a), Some(&Value::Int(2)));
    assert_eq!(report.get("revenue", row_a), Some(&Value::Float(30.0)));
}

#[tokio::test]
async fn test_scd2_tier_change_lifecycle() {
    let lakehouse = lakehouse();
    let jan = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let feb = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
    let request = Scd2Request::new("dim_customer", &["customer_id"]);
    let snapshot = |tier: &str| {
        Batch::from_columns(vec![
            ("customer_id", vec![Value::Str("C001".to_string())]),
            ("tier", vec![Value::Str(tier.to_string())]),
        ])
        .unwrap()
    };

    let initial = lakehouse
        .dimensions()
        .apply(snapshot("Gold"), &request.clone().effective_at(jan))
        .await
        .unwrap();
    assert_eq!(initial.inserted, 1);

    // The same snapshot again opens no new version.
    let repeat = lakehouse
        .dimensions()
        .apply(snapshot("Gold"), &request.clone().effective_at(feb))
        .await
        .unwrap();
    assert_eq!(repeat.unchanged, 1);
    assert_eq!(repeat.updated, 0);

    let change = lakehouse
        .dimensions()
        .apply(snapshot("Platinum"), &request.clone().effective_at(feb))
        .await
        .unwrap();
    assert_eq!(change.updated, 1);

    // At most one current row per key, and it carries the new payload.
    let current = lakehouse
        .dimensions()
        .current("dim_customer", None)
        .await
        .unwrap();
    assert_eq!(current.num_rows(), 1);
    assert_eq!(
        current.get("tier", 0),
        Some(&Value::Str("Platinum".to_string()))
    );
    assert_eq!(current.get("_scd_version", 0), Some(&Value::Int(2)));

    // Intervals are contiguous: v1 closes exactly where v2 opens.
    let history = lakehouse
        .dimensions()
        .history("dim_customer", &customer_key("C001"))
        .await
        .unwrap();
    assert_eq!(history.num_rows(), 2);
    assert_eq!(
        history.get("_scd_effective_to", 0),
        Some(&Value::Timestamp(feb))
    );
    assert_eq!(
        history.get("_scd_effective_from", 1),
        Some(&Value::Timestamp(feb))
    );
    assert_eq!(history.get("_scd_effective_to", 1), Some(&Value::Null));
}

#[tokio::test]
async fn test_scd2_point_in_time_reads() {
    let lakehouse = lakehouse();
    let jan = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let feb = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
    let request = Scd2Request::new("dim_customer", &["customer_id"]);
    let snapshot = |tier: &str| {
        Batch::from_columns(vec![
            ("customer_id", vec![Value::Str("C001".to_string())]),
            ("tier", vec![Value::Str(tier.to_string())]),
        ])
        .unwrap()
    };
    lakehouse
        .dimensions()
        .apply(snapshot("Gold"), &request.clone().effective_at(jan))
        .await
        .unwrap();
    lakehouse
        .dimensions()
        .apply(snapshot("Platinum"), &request.clone().effective_at(feb))
        .await
        .unwrap();

    let key = customer_key("C001");
    let mid_jan = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
    let mid_feb = Utc.with_ymd_and_hms(2024, 2, 15, 0, 0, 0).unwrap();
    let before = Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap();

    let v1 = lakehouse
        .dimensions()
        .record_at("dim_customer", &key, mid_jan)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(v1.get("tier", 0), Some(&Value::Str("Gold".to_string())));

    let v2 = lakehouse
        .dimensions()
        .record_at("dim_customer", &key, mid_feb)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(v2.get("tier", 0), Some(&Value::Str("Platinum".to_string())));

    assert!(lakehouse
        .dimensions()
        .record_at("dim_customer", &key, before)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_scd2_soft_delete() {
    let lakehouse = lakehouse();
    let jan = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let mar = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let request = Scd2Request::new("dim_customer", &["customer_id"]).delete_indicator("_deleted");

    let initial = Batch::from_columns(vec![
        (
            "customer_id",
            vec![
                Value::Str("C001".to_string()),
                Value::Str("C003".to_string()),
            ],
        ),
        (
            "tier",
            vec![
                Value::Str("Gold".to_string()),
                Value::Str("Silver".to_string()),
            ],
        ),
    ])
    .unwrap();
    lakehouse
        .dimensions()
        .merge(initial, &request.clone().effective_at(jan))
        .await
        .unwrap();

    let deletion = Batch::from_columns(vec![
        ("customer_id", vec![Value::Str("C003".to_string())]),
        ("tier", vec![Value::Str("Silver".to_string())]),
        ("_deleted", vec![Value::Bool(true)]),
    ])
    .unwrap();
    let report = lakehouse
        .dimensions()
        .merge(deletion, &request.clone().effective_at(mar))
        .await
        .unwrap();
    assert_eq!(report.deleted, 1);

    // C003 is gone from the current view but keeps its history.
    let current = lakehouse
        .dimensions()
        .current("dim_customer", None)
        .await
        .unwrap();
    assert_eq!(current.num_rows(), 1);
    assert_eq!(
        current.get("customer_id", 0),
        Some(&Value::Str("C001".to_string()))
    );

    let history = lakehouse
        .dimensions()
        .history("dim_customer", &customer_key("C003"))
        .await
        .unwrap();
    assert_eq!(history.num_rows(), 1);
    assert_eq!(
        history.get("_scd_effective_to", 0),
        Some(&Value::Timestamp(mar))
    );
    assert_eq!(history.get("_scd_is_current", 0), Some(&Value::Bool(false)));
}

#[tokio::test]
async fn test_watermark_never_regresses() {
    let watermarks = WatermarkStore::new(Arc::new(InMemory::new()));
    let sequence = [5i64, 3, 7, 2, 7, 9];
    let mut highest = i64::MIN;
    for value in sequence {
        let batch =
            Batch::from_columns(vec![("updated_at", vec![Value::Int(value)])]).unwrap();
        watermarks
            .update_from_batch("events", &batch, "updated_at")
            .await
            .unwrap();
        highest = highest.max(value);
        let stored = watermarks.get("events").await.unwrap().unwrap();
        assert_eq!(stored.value, WatermarkValue::Int(highest));
    }
}
