//! In-process [`RecordStore`] used by tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use fincrawl_core::{Record, SyncCursor, TableSchema, Value};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    bulk_columns, check_key_columns, prepare_upsert, CursorFilter, CursorQuery, RecordStore,
    StoreError,
};

#[derive(Debug, Clone)]
struct StoredRow {
    /// Insertion order; plays the role of the physical row id.
    row_id: u64,
    /// Write sequence; plays the role of `updated_at`.
    written: u64,
    record: Record,
}

#[derive(Debug, Default)]
struct Tables {
    next_seq: u64,
    tables: BTreeMap<String, Vec<StoredRow>>,
}

impl Tables {
    fn bump(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

fn key_repr(record: &Record, columns: &[String]) -> Vec<String> {
    columns.iter().map(|c| record.value(c).key_repr()).collect()
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows of `table` in physical order.
    pub async fn rows(&self, table: &str) -> Vec<Record> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table)
            .map(|rows| rows.iter().map(|r| r.record.clone()).collect())
            .unwrap_or_default()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        self.inner
            .lock()
            .await
            .tables
            .get(table)
            .map_or(0, Vec::len)
    }

    /// Load rows without validation, for fixtures.
    pub async fn seed(&self, table: &str, records: impl IntoIterator<Item = Record>) {
        let mut inner = self.inner.lock().await;
        for record in records {
            let seq = inner.bump();
            inner.tables.entry(table.to_string()).or_default().push(StoredRow {
                row_id: seq,
                written: seq,
                record,
            });
        }
    }
}

fn entity_passes(filter: &CursorFilter, row: &Record, key: &str, as_of: NaiveDate) -> bool {
    match filter {
        CursorFilter::ActiveAfterToday(col) => row.value(col).as_date().is_some_and(|d| d > as_of),
        CursorFilter::DateAfter(col, date) => row.value(col).as_date().is_some_and(|d| d > *date),
        CursorFilter::KeyMaxLen(n) => key.chars().count() <= *n,
        CursorFilter::Equals(col, Value::Null) | CursorFilter::IsNull(col) => row.is_null(col),
        CursorFilter::Equals(col, value) => row.value(col).key_repr() == value.key_repr(),
        CursorFilter::CursorBefore(_) => true,
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn upsert(
        &self,
        schema: &TableSchema,
        unique_keys: &[String],
        records: &[Record],
    ) -> Result<u64, StoreError> {
        let groups = prepare_upsert(schema, unique_keys, records)?;
        let mut inner = self.inner.lock().await;
        let mut written = 0u64;
        for record in groups.into_iter().flat_map(|g| g.records) {
            let seq = inner.bump();
            let key = key_repr(&record, unique_keys);
            let rows = inner.tables.entry(schema.name().to_string()).or_default();
            match rows.iter_mut().find(|r| key_repr(&r.record, unique_keys) == key) {
                Some(existing) => {
                    existing.record.merge_non_null(&record);
                    existing.written = seq;
                }
                None => rows.push(StoredRow {
                    row_id: seq,
                    written: seq,
                    record,
                }),
            }
            written += 1;
        }
        Ok(written)
    }

    async fn bulk_insert(&self, schema: &TableSchema, records: &[Record]) -> Result<u64, StoreError> {
        let columns = bulk_columns(schema, records)?;
        let mut inner = self.inner.lock().await;
        for record in records {
            let seq = inner.bump();
            let mut row = record.clone();
            row.retain(|c, _| columns.iter().any(|k| k == c));
            inner
                .tables
                .entry(schema.name().to_string())
                .or_default()
                .push(StoredRow {
                    row_id: seq,
                    written: seq,
                    record: row,
                });
        }
        Ok(records.len() as u64)
    }

    async fn clean_duplicates(
        &self,
        schema: &TableSchema,
        key_columns: &[String],
    ) -> Result<u64, StoreError> {
        check_key_columns(schema, key_columns)?;
        let mut inner = self.inner.lock().await;
        let Some(rows) = inner.tables.get_mut(schema.name()) else {
            return Ok(0);
        };
        let mut newest: BTreeMap<Vec<String>, (u64, u64)> = BTreeMap::new();
        for row in rows.iter() {
            let rank = (row.written, row.row_id);
            newest
                .entry(key_repr(&row.record, key_columns))
                .and_modify(|best| *best = (*best).max(rank))
                .or_insert(rank);
        }
        let before = rows.len();
        rows.retain(|row| newest.get(&key_repr(&row.record, key_columns)) == Some(&(row.written, row.row_id)));
        let removed = (before - rows.len()) as u64;
        debug!(table = schema.name(), removed, "duplicates cleaned");
        Ok(removed)
    }

    async fn load_cursors(&self, query: &CursorQuery) -> Result<Vec<SyncCursor>, StoreError> {
        query.validate()?;
        let inner = self.inner.lock().await;
        let empty = Vec::new();
        let entities = inner.tables.get(query.entity.name()).unwrap_or(&empty);
        let facts = inner.tables.get(query.fact.name()).unwrap_or(&empty);

        let mut latest: BTreeMap<String, NaiveDate> = BTreeMap::new();
        for fact in facts {
            let (Some(key), Some(day)) = (
                fact.record.value(&query.key_column).as_text(),
                fact.record.value(&query.fact_date).as_date(),
            ) else {
                continue;
            };
            latest
                .entry(key.to_string())
                .and_modify(|d| *d = (*d).max(day))
                .or_insert(day);
        }

        let carried = query.carried_columns();
        let mut seen = BTreeSet::new();
        let mut cursors = Vec::new();
        for entity in entities {
            let Some(key) = entity.record.value(&query.key_column).as_text() else {
                continue;
            };
            if !seen.insert(key.to_string())
                || !query
                    .filters
                    .iter()
                    .all(|f| entity_passes(f, &entity.record, key, query.as_of))
            {
                continue;
            }
            let base = entity.record.value(&query.base_date).as_date();
            let Some(last_synced) = base.max(latest.get(key).copied()) else {
                continue;
            };
            let before_bounds = query.filters.iter().all(|f| match f {
                CursorFilter::CursorBefore(col) => entity
                    .record
                    .value(col)
                    .as_date()
                    .is_some_and(|bound| last_synced < bound),
                _ => true,
            });
            if !before_bounds {
                continue;
            }
            let mut cursor = SyncCursor::new(key, last_synced);
            for col in &carried {
                cursor.attributes.set(col.clone(), entity.record.value(col).clone());
            }
            cursors.push(cursor);
        }
        cursors.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(cursors)
    }

    async fn distinct_values(
        &self,
        schema: &TableSchema,
        column: &str,
    ) -> Result<Vec<String>, StoreError> {
        schema.check_columns([column])?;
        let inner = self.inner.lock().await;
        let values: BTreeSet<String> = inner
            .tables
            .get(schema.name())
            .into_iter()
            .flatten()
            .map(|row| row.record.value(column))
            .filter(|v| !v.is_null())
            .map(ToString::to_string)
            .collect();
        Ok(values.into_iter().collect())
    }

    async fn truncate(&self, schema: &TableSchema) -> Result<(), StoreError> {
        self.inner.lock().await.tables.remove(schema.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fincrawl_core::ColumnType;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn prices() -> TableSchema {
        TableSchema::new("prices")
            .column("code", ColumnType::Text, false)
            .column("day", ColumnType::Date, false)
            .column("close", ColumnType::Float, true)
            .unique_key(&["code", "day"])
            .updated_at("updated_at")
            .validate()
            .unwrap()
    }

    fn entities() -> TableSchema {
        TableSchema::new("entities")
            .column("code", ColumnType::Text, false)
            .column("base", ColumnType::Date, true)
            .column("expire", ColumnType::Date, true)
            .column("localized", ColumnType::Int, true)
            .unique_key(&["code"])
            .validate()
            .unwrap()
    }

    #[tokio::test]
    async fn clean_keeps_the_latest_written_row() {
        let store = MemoryStore::new();
        let keys = vec!["code".to_string(), "day".to_string()];
        let first = Record::new().with("code", "A").with("day", d(2024, 1, 1)).with("close", 1.0);
        let second = first.clone().with("close", 2.0);
        store.bulk_insert(&prices(), &[first, second]).await.unwrap();

        assert_eq!(store.clean_duplicates(&prices(), &keys).await.unwrap(), 1);
        let rows = store.rows("prices").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value("close"), &Value::Float(2.0));
    }

    #[tokio::test]
    async fn cursors_combine_base_date_and_latest_fact() {
        let store = MemoryStore::new();
        store
            .seed(
                "entities",
                vec![
                    Record::new().with("code", "A").with("base", d(2020, 1, 1)).with("expire", d(2099, 1, 1)).with("localized", 1i64),
                    Record::new().with("code", "B").with("base", d(2021, 1, 1)).with("expire", d(2099, 1, 1)),
                    Record::new().with("code", "C").with("base", d(2020, 1, 1)).with("expire", d(2020, 6, 1)),
                    Record::new().with("code", "D").with("expire", d(2099, 1, 1)),
                ],
            )
            .await;
        store
            .seed(
                "prices",
                vec![
                    Record::new().with("code", "A").with("day", d(2023, 5, 1)),
                    Record::new().with("code", "A").with("day", d(2023, 5, 3)),
                ],
            )
            .await;

        let query = CursorQuery::new(&entities(), &prices(), "code", "base", "day", d(2024, 1, 1))
            .attribute("localized")
            .filter(CursorFilter::ActiveAfterToday("expire".into()));
        let cursors = store.load_cursors(&query).await.unwrap();
        let got: Vec<_> = cursors.iter().map(|c| (c.key.as_str(), c.last_synced)).collect();
        assert_eq!(got, vec![("A", d(2023, 5, 3)), ("B", d(2021, 1, 1))]);
        assert_eq!(cursors[0].attributes.value("localized"), &Value::Int(1));
        assert!(cursors[1].attributes.is_null("localized"));

        let localized = query.filter(CursorFilter::IsNull("localized".into()));
        let cursors = store.load_cursors(&localized).await.unwrap();
        assert_eq!(cursors.len(), 1);
        assert_eq!(cursors[0].key, "B");
    }

    #[tokio::test]
    async fn distinct_values_and_truncate() {
        let store = MemoryStore::new();
        store
            .seed(
                "entities",
                vec![
                    Record::new().with("code", "B"),
                    Record::new().with("code", "A"),
                    Record::new().with("code", "B"),
                ],
            )
            .await;
        assert_eq!(store.distinct_values(&entities(), "code").await.unwrap(), vec!["A", "B"]);
        store.truncate(&entities()).await.unwrap();
        assert_eq!(store.row_count("entities").await, 0);
    }
}
