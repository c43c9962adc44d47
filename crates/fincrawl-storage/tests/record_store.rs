use chrono::NaiveDate;
use fincrawl_core::{ColumnType, Record, TableSchema, Value};
use fincrawl_storage::{MemoryStore, RecordStore, StoreError};

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn codes() -> TableSchema {
    TableSchema::new("codes")
        .column("code", ColumnType::Text, false)
        .column("value", ColumnType::Int, true)
        .column("label", ColumnType::Text, true)
        .unique_key(&["code"])
        .updated_at("updated_at")
        .validate()
        .unwrap()
}

fn navs() -> TableSchema {
    TableSchema::new("navs")
        .column("wind_code", ColumnType::Text, false)
        .column("trade_dt", ColumnType::Date, false)
        .column("unit_nav", ColumnType::Float, true)
        .unique_key(&["wind_code", "trade_dt"])
        .updated_at("updated_at")
        .validate()
        .unwrap()
}

fn key(cols: &[&str]) -> Vec<String> {
    cols.iter().map(|c| c.to_string()).collect()
}

#[tokio::test]
async fn upsert_is_idempotent() {
    let store = MemoryStore::new();
    let batch = vec![
        Record::new().with("code", "A").with("value", 1i64),
        Record::new().with("code", "B").with("value", 2i64).with("label", "b"),
    ];
    store.upsert(&codes(), &key(&["code"]), &batch).await.unwrap();
    let once = store.rows("codes").await;
    store.upsert(&codes(), &key(&["code"]), &batch).await.unwrap();
    assert_eq!(store.rows("codes").await, once);
    assert_eq!(once.len(), 2);
}

#[tokio::test]
async fn null_fields_never_overwrite_stored_values() {
    let store = MemoryStore::new();
    let keys = key(&["code"]);
    store
        .upsert(&codes(), &keys, &[Record::new().with("code", "A").with("value", 5i64)])
        .await
        .unwrap();
    store
        .upsert(
            &codes(),
            &keys,
            &[Record::new().with("code", "A").with("value", Value::Null).with("label", "x")],
        )
        .await
        .unwrap();

    let rows = store.rows("codes").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].value("value"), &Value::Int(5));
    assert_eq!(rows[0].value("label"), &Value::Text("x".into()));
}

#[tokio::test]
async fn bulk_insert_then_clean_leaves_one_row_per_key() {
    let store = MemoryStore::new();
    let keys = key(&["wind_code", "trade_dt"]);
    let window = |nav: f64| {
        vec![
            Record::new().with("wind_code", "F1").with("trade_dt", d(2024, 1, 2)).with("unit_nav", nav),
            Record::new().with("wind_code", "F1").with("trade_dt", d(2024, 1, 3)).with("unit_nav", nav),
        ]
    };
    // Overlapping re-fetch of the same two days.
    store.bulk_insert(&navs(), &window(1.0)).await.unwrap();
    store.bulk_insert(&navs(), &window(1.1)).await.unwrap();
    assert_eq!(store.row_count("navs").await, 4);

    assert_eq!(store.clean_duplicates(&navs(), &keys).await.unwrap(), 2);
    let rows = store.rows("navs").await;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.value("unit_nav") == &Value::Float(1.1)));

    assert_eq!(store.clean_duplicates(&navs(), &keys).await.unwrap(), 0);
}

#[tokio::test]
async fn rejected_batch_writes_nothing() {
    let store = MemoryStore::new();
    let batch = vec![
        Record::new().with("code", "A").with("value", 1i64),
        Record::new().with("value", 2i64),
    ];
    let err = store.upsert(&codes(), &key(&["code"]), &batch).await.unwrap_err();
    assert!(matches!(err, StoreError::ConstraintViolation { .. }));
    assert_eq!(store.row_count("codes").await, 0);

    let unknown = vec![Record::new().with("code", "A").with("nope", 1i64)];
    let err = store.bulk_insert(&codes(), &unknown).await.unwrap_err();
    assert!(matches!(err, StoreError::Schema(_)));
}

#[tokio::test]
async fn clean_rejects_unknown_key_columns() {
    let store = MemoryStore::new();
    assert!(matches!(
        store.clean_duplicates(&navs(), &key(&["missing"])).await,
        Err(StoreError::Schema(_))
    ));
}
