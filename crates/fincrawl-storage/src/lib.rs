//! Table writes (upsert, bulk insert), duplicate cleanup and sync-cursor reads.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::NaiveDate;
use fincrawl_core::{Record, SchemaError, SyncCursor, TableSchema, Value};
use thiserror::Error;

pub mod memory;
pub mod pg;

pub use memory::MemoryStore;
pub use pg::PgStore;

pub const CRATE_NAME: &str = "fincrawl-storage";

/// Postgres caps one statement at 65535 bind parameters.
pub const MAX_BIND_PARAMS: usize = 65_535;
pub const MAX_ROWS_PER_STATEMENT: usize = 1_000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("{table}: constraint violated: {message}")]
    ConstraintViolation { table: String, message: String },
    #[error("{table}: database error: {source}")]
    Database {
        table: String,
        #[source]
        source: sqlx::Error,
    },
}

impl StoreError {
    fn missing_key(table: &str, column: &str, index: usize) -> Self {
        Self::ConstraintViolation {
            table: table.to_string(),
            message: format!("record {index} has no value for key column `{column}`"),
        }
    }
}

/// Restriction applied while computing sync cursors.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorFilter {
    /// Entity column lies strictly after the query's `as_of` date.
    ActiveAfterToday(String),
    /// Cursor date lies strictly before this entity column.
    CursorBefore(String),
    /// Entity column lies strictly after the given date.
    DateAfter(String, NaiveDate),
    /// Entity key has at most this many characters.
    KeyMaxLen(usize),
    Equals(String, Value),
    IsNull(String),
}

impl CursorFilter {
    fn column(&self) -> Option<&str> {
        match self {
            Self::ActiveAfterToday(c)
            | Self::CursorBefore(c)
            | Self::DateAfter(c, _)
            | Self::Equals(c, _)
            | Self::IsNull(c) => Some(c),
            Self::KeyMaxLen(_) => None,
        }
    }
}

/// Per-entity "last synced" aggregate: `GREATEST(base_date, MAX(fact_date))`
/// over the entity table left-joined to its fact table.
#[derive(Debug, Clone)]
pub struct CursorQuery {
    pub entity: TableSchema,
    pub fact: TableSchema,
    pub key_column: String,
    pub base_date: String,
    pub fact_date: String,
    pub attributes: Vec<String>,
    pub filters: Vec<CursorFilter>,
    pub as_of: NaiveDate,
}

impl CursorQuery {
    pub fn new(
        entity: &TableSchema,
        fact: &TableSchema,
        key_column: &str,
        base_date: &str,
        fact_date: &str,
        as_of: NaiveDate,
    ) -> Self {
        Self {
            entity: entity.clone(),
            fact: fact.clone(),
            key_column: key_column.to_string(),
            base_date: base_date.to_string(),
            fact_date: fact_date.to_string(),
            attributes: Vec::new(),
            filters: Vec::new(),
            as_of,
        }
    }

    pub fn attribute(mut self, column: &str) -> Self {
        if !self.attributes.iter().any(|c| c == column) {
            self.attributes.push(column.to_string());
        }
        self
    }

    pub fn filter(mut self, filter: CursorFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Entity columns carried on each cursor: requested attributes plus
    /// anything a filter reads.
    pub fn carried_columns(&self) -> Vec<String> {
        let mut cols = self.attributes.clone();
        for col in self.filters.iter().filter_map(CursorFilter::column) {
            if !cols.iter().any(|c| c == col) {
                cols.push(col.to_string());
            }
        }
        cols
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        self.entity
            .check_columns([self.key_column.as_str(), self.base_date.as_str()])?;
        self.fact
            .check_columns([self.key_column.as_str(), self.fact_date.as_str()])?;
        let carried = self.carried_columns();
        self.entity.check_columns(carried.iter().map(String::as_str))?;
        Ok(())
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert-or-update `records` by `unique_keys`; null fields never
    /// overwrite stored values. Returns the number of rows written.
    async fn upsert(
        &self,
        schema: &TableSchema,
        unique_keys: &[String],
        records: &[Record],
    ) -> Result<u64, StoreError>;

    /// Plain multi-row insert; uniqueness is restored later by
    /// [`RecordStore::clean_duplicates`].
    async fn bulk_insert(&self, schema: &TableSchema, records: &[Record]) -> Result<u64, StoreError>;

    /// Keep only the most recently written row per key. Returns rows removed.
    async fn clean_duplicates(
        &self,
        schema: &TableSchema,
        key_columns: &[String],
    ) -> Result<u64, StoreError>;

    async fn load_cursors(&self, query: &CursorQuery) -> Result<Vec<SyncCursor>, StoreError>;

    /// Distinct non-null values of `column`, rendered as text, sorted.
    async fn distinct_values(
        &self,
        schema: &TableSchema,
        column: &str,
    ) -> Result<Vec<String>, StoreError>;

    async fn truncate(&self, schema: &TableSchema) -> Result<(), StoreError>;
}

/// Records sharing one non-null column set, written by a single statement shape.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertGroup {
    pub columns: Vec<String>,
    pub records: Vec<Record>,
}

/// Validate, merge in-batch key repeats (later non-null values win) and group
/// by non-null column signature. Group order follows first appearance.
pub fn prepare_upsert(
    schema: &TableSchema,
    unique_keys: &[String],
    records: &[Record],
) -> Result<Vec<UpsertGroup>, StoreError> {
    if unique_keys.is_empty() {
        return Err(SchemaError::EmptyKey {
            table: schema.name().to_string(),
        }
        .into());
    }
    schema.check_columns(unique_keys.iter().map(String::as_str))?;

    let mut merged: Vec<Record> = Vec::new();
    let mut by_key: BTreeMap<Vec<String>, usize> = BTreeMap::new();
    for (index, record) in records.iter().enumerate() {
        schema.check_columns(record.columns())?;
        let key = match record.key_of(unique_keys) {
            Some(key) => key,
            None => {
                let column = unique_keys
                    .iter()
                    .find(|k| record.is_null(k))
                    .map(String::as_str)
                    .unwrap_or_default();
                return Err(StoreError::missing_key(schema.name(), column, index));
            }
        };
        match by_key.get(&key) {
            Some(&slot) => merged[slot].merge_non_null(record),
            None => {
                by_key.insert(key, merged.len());
                merged.push(record.clone());
            }
        }
    }

    let mut groups: Vec<UpsertGroup> = Vec::new();
    for mut record in merged {
        record.retain(|_, v| !v.is_null());
        let columns: Vec<String> = record.columns().map(str::to_string).collect();
        match groups.iter_mut().find(|g| g.columns == columns) {
            Some(group) => group.records.push(record),
            None => groups.push(UpsertGroup {
                columns,
                records: vec![record],
            }),
        }
    }
    Ok(groups)
}

/// Schema columns present (in any record) for a bulk insert, in schema order.
pub fn bulk_columns(schema: &TableSchema, records: &[Record]) -> Result<Vec<String>, StoreError> {
    for record in records {
        schema.check_columns(record.columns())?;
    }
    Ok(schema
        .columns()
        .iter()
        .filter(|c| records.iter().any(|r| r.get(&c.name).is_some()))
        .map(|c| c.name.clone())
        .collect())
}

pub fn rows_per_statement(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / column_count.max(1)).clamp(1, MAX_ROWS_PER_STATEMENT)
}

pub(crate) fn check_key_columns(
    schema: &TableSchema,
    key_columns: &[String],
) -> Result<(), StoreError> {
    if key_columns.is_empty() {
        return Err(SchemaError::EmptyKey {
            table: schema.name().to_string(),
        }
        .into());
    }
    schema.check_columns(key_columns.iter().map(String::as_str))?;
    Ok(())
}
