//! PostgreSQL implementation of [`RecordStore`] over `sqlx`.

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use fincrawl_core::{ColumnType, Record, SyncCursor, TableSchema, Value};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::query_builder::Separated;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::{debug, info};

use crate::{
    bulk_columns, check_key_columns, prepare_upsert, rows_per_statement, CursorFilter,
    CursorQuery, RecordStore, StoreError,
};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

fn quoted_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_type(schema: &TableSchema, column: &str) -> ColumnType {
    schema
        .column_def(column)
        .map(|c| c.ty)
        .unwrap_or(ColumnType::Text)
}

fn sql_type(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Text => "text",
        ColumnType::Date => "date",
        ColumnType::Float => "float8",
        ColumnType::Int => "int8",
    }
}

/// Integrity (23) and data (22) exception classes are the caller's fault.
fn store_error(table: &str, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        let class = db.code().map(|c| c.chars().take(2).collect::<String>());
        if matches!(class.as_deref(), Some("22") | Some("23")) {
            return StoreError::ConstraintViolation {
                table: table.to_string(),
                message: db.message().to_string(),
            };
        }
    }
    StoreError::Database {
        table: table.to_string(),
        source: err,
    }
}

/// Nulls are bound with the column's type so Postgres can place them.
fn bind_value<Sep: std::fmt::Display>(
    row: &mut Separated<'_, 'static, Postgres, Sep>,
    value: &Value,
    ty: ColumnType,
) {
    match (value, ty) {
        (Value::Text(s), _) => row.push_bind(s.clone()),
        (Value::Date(d), _) => row.push_bind(*d),
        (Value::Float(v), _) => row.push_bind(*v),
        (Value::Int(v), ColumnType::Float) => row.push_bind(*v as f64),
        (Value::Int(v), _) => row.push_bind(*v),
        (Value::Null, ColumnType::Text) => row.push_bind(None::<String>),
        (Value::Null, ColumnType::Date) => row.push_bind(None::<NaiveDate>),
        (Value::Null, ColumnType::Float) => row.push_bind(None::<f64>),
        (Value::Null, ColumnType::Int) => row.push_bind(None::<i64>),
    };
}

fn insert_prefix(schema: &TableSchema, columns: &[String]) -> QueryBuilder<'static, Postgres> {
    let mut cols = quoted_list(columns);
    if let Some(stamp) = schema.updated_at_column() {
        cols.push_str(", ");
        cols.push_str(&quote_ident(stamp));
    }
    QueryBuilder::new(format!("INSERT INTO {} ({cols}) ", quote_ident(schema.name())))
}

fn push_rows(
    qb: &mut QueryBuilder<'static, Postgres>,
    schema: &TableSchema,
    columns: &[String],
    records: &[Record],
) {
    let stamped = schema.updated_at_column().is_some();
    qb.push_values(records, |mut row, record| {
        for column in columns {
            bind_value(&mut row, record.value(column), column_type(schema, column));
        }
        if stamped {
            row.push("CURRENT_TIMESTAMP");
        }
    });
}

pub(crate) fn upsert_statement(
    schema: &TableSchema,
    unique_keys: &[String],
    columns: &[String],
    records: &[Record],
) -> QueryBuilder<'static, Postgres> {
    let mut qb = insert_prefix(schema, columns);
    push_rows(&mut qb, schema, columns, records);

    let mut updates: Vec<String> = columns
        .iter()
        .filter(|c| !unique_keys.contains(c))
        .map(|c| {
            let q = quote_ident(c);
            format!("{q} = EXCLUDED.{q}")
        })
        .collect();
    if let Some(stamp) = schema.updated_at_column() {
        updates.push(format!("{} = CURRENT_TIMESTAMP", quote_ident(stamp)));
    }
    qb.push(format!(" ON CONFLICT ({}) ", quoted_list(unique_keys)));
    if updates.is_empty() {
        qb.push("DO NOTHING");
    } else {
        qb.push("DO UPDATE SET ");
        qb.push(updates.join(", "));
    }
    qb
}

pub(crate) fn insert_statement(
    schema: &TableSchema,
    columns: &[String],
    records: &[Record],
) -> QueryBuilder<'static, Postgres> {
    let mut qb = insert_prefix(schema, columns);
    push_rows(&mut qb, schema, columns, records);
    qb
}

/// Keep the newest row per key; physical row identity breaks ties.
pub(crate) fn clean_duplicates_sql(schema: &TableSchema, key_columns: &[String]) -> String {
    let table = quote_ident(schema.name());
    let order = match schema.updated_at_column() {
        Some(stamp) => format!("{} DESC NULLS LAST, ctid DESC", quote_ident(stamp)),
        None => "ctid DESC".to_string(),
    };
    format!(
        "DELETE FROM {table} AS target USING (\
         SELECT ctid AS row_ctid, ROW_NUMBER() OVER (PARTITION BY {keys} ORDER BY {order}) AS rn \
         FROM {table}) AS ranked \
         WHERE target.ctid = ranked.row_ctid AND ranked.rn > 1",
        keys = quoted_list(key_columns),
    )
}

pub(crate) fn cursor_statement(query: &CursorQuery) -> QueryBuilder<'static, Postgres> {
    let key = quote_ident(&query.key_column);
    let carried = query.carried_columns();

    let mut select = format!(
        "SELECT e.{key}::text AS cursor_key, \
         GREATEST(e.{base}::date, MAX(f.{fact_date})::date) AS cursor_date",
        base = quote_ident(&query.base_date),
        fact_date = quote_ident(&query.fact_date),
    );
    let mut group_by = vec![format!("e.{key}"), format!("e.{}", quote_ident(&query.base_date))];
    for col in &carried {
        let q = quote_ident(col);
        let ty = sql_type(column_type(&query.entity, col));
        select.push_str(&format!(", e.{q}::{ty} AS {q}"));
        group_by.push(format!("e.{q}"));
    }

    let mut qb = QueryBuilder::new(format!(
        "SELECT c.* FROM ({select} FROM {entity} AS e LEFT JOIN {fact} AS f ON f.{key} = e.{key} WHERE TRUE",
        entity = quote_ident(query.entity.name()),
        fact = quote_ident(query.fact.name()),
    ));
    let mut cursor_before = Vec::new();
    for filter in &query.filters {
        match filter {
            CursorFilter::ActiveAfterToday(col) => {
                qb.push(format!(" AND e.{} > ", quote_ident(col)));
                qb.push_bind(query.as_of);
            }
            CursorFilter::DateAfter(col, date) => {
                qb.push(format!(" AND e.{} > ", quote_ident(col)));
                qb.push_bind(*date);
            }
            CursorFilter::KeyMaxLen(n) => {
                qb.push(format!(" AND char_length(e.{key}) <= "));
                qb.push_bind(*n as i64);
            }
            CursorFilter::Equals(col, Value::Null) | CursorFilter::IsNull(col) => {
                qb.push(format!(" AND e.{} IS NULL", quote_ident(col)));
            }
            CursorFilter::Equals(col, value) => {
                qb.push(format!(" AND e.{} = ", quote_ident(col)));
                match value {
                    Value::Text(s) => qb.push_bind(s.clone()),
                    Value::Date(d) => qb.push_bind(*d),
                    Value::Float(v) => qb.push_bind(*v),
                    Value::Int(v) => qb.push_bind(*v),
                    Value::Null => qb.push("NULL"),
                };
            }
            CursorFilter::CursorBefore(col) => cursor_before.push(quote_ident(col)),
        }
    }
    qb.push(format!(" GROUP BY {}) AS c WHERE c.cursor_date IS NOT NULL", group_by.join(", ")));
    for col in cursor_before {
        qb.push(format!(" AND c.cursor_date < c.{col}"));
    }
    qb.push(" ORDER BY c.cursor_key");
    qb
}

fn decode_value(row: &PgRow, column: &str, ty: ColumnType) -> Result<Value, sqlx::Error> {
    Ok(match ty {
        ColumnType::Text => row.try_get::<Option<String>, _>(column)?.into(),
        ColumnType::Date => row.try_get::<Option<NaiveDate>, _>(column)?.into(),
        ColumnType::Float => row.try_get::<Option<f64>, _>(column)?.into(),
        ColumnType::Int => row.try_get::<Option<i64>, _>(column)?.into(),
    })
}

#[async_trait]
impl RecordStore for PgStore {
    async fn upsert(
        &self,
        schema: &TableSchema,
        unique_keys: &[String],
        records: &[Record],
    ) -> Result<u64, StoreError> {
        let table = schema.name();
        let groups = prepare_upsert(schema, unique_keys, records)?;
        if groups.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(|e| store_error(table, e))?;
        let mut written = 0u64;
        for group in &groups {
            for chunk in group.records.chunks(rows_per_statement(group.columns.len() + 1)) {
                let mut qb = upsert_statement(schema, unique_keys, &group.columns, chunk);
                let done = qb
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| store_error(table, e))?;
                written += done.rows_affected();
            }
        }
        tx.commit().await.map_err(|e| store_error(table, e))?;
        info!(table, records = records.len(), written, groups = groups.len(), "upserted");
        Ok(written)
    }

    async fn bulk_insert(&self, schema: &TableSchema, records: &[Record]) -> Result<u64, StoreError> {
        let table = schema.name();
        let columns = bulk_columns(schema, records)?;
        if records.is_empty() || columns.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(|e| store_error(table, e))?;
        let mut inserted = 0u64;
        for chunk in records.chunks(rows_per_statement(columns.len() + 1)) {
            let mut qb = insert_statement(schema, &columns, chunk);
            let done = qb
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| store_error(table, e))?;
            inserted += done.rows_affected();
        }
        tx.commit().await.map_err(|e| store_error(table, e))?;
        info!(table, inserted, "bulk inserted");
        Ok(inserted)
    }

    async fn clean_duplicates(
        &self,
        schema: &TableSchema,
        key_columns: &[String],
    ) -> Result<u64, StoreError> {
        let table = schema.name();
        check_key_columns(schema, key_columns)?;
        let sql = clean_duplicates_sql(schema, key_columns);
        debug!(table, %sql, "cleaning duplicates");
        let mut tx = self.pool.begin().await.map_err(|e| store_error(table, e))?;
        let removed = sqlx::query(&sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| store_error(table, e))?
            .rows_affected();
        tx.commit().await.map_err(|e| store_error(table, e))?;
        info!(table, removed, "duplicates cleaned");
        Ok(removed)
    }

    async fn load_cursors(&self, query: &CursorQuery) -> Result<Vec<SyncCursor>, StoreError> {
        query.validate()?;
        let table = query.entity.name();
        let mut qb = cursor_statement(query);
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| store_error(table, e))?;

        let carried = query.carried_columns();
        let mut cursors = Vec::with_capacity(rows.len());
        for row in &rows {
            let key: String = row.try_get("cursor_key").map_err(|e| store_error(table, e))?;
            let last_synced: NaiveDate =
                row.try_get("cursor_date").map_err(|e| store_error(table, e))?;
            let mut cursor = SyncCursor::new(key, last_synced);
            for col in &carried {
                let ty = column_type(&query.entity, col);
                let value = decode_value(row, col, ty).map_err(|e| store_error(table, e))?;
                cursor.attributes.set(col.clone(), value);
            }
            cursors.push(cursor);
        }
        debug!(table, cursors = cursors.len(), "loaded sync cursors");
        Ok(cursors)
    }

    async fn distinct_values(
        &self,
        schema: &TableSchema,
        column: &str,
    ) -> Result<Vec<String>, StoreError> {
        schema.check_columns([column])?;
        let col = quote_ident(column);
        let sql = format!(
            "SELECT DISTINCT {col}::text AS v FROM {} WHERE {col} IS NOT NULL ORDER BY 1",
            quote_ident(schema.name())
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| store_error(schema.name(), e))?;
        rows.iter()
            .map(|r| r.try_get::<String, _>(0).map_err(|e| store_error(schema.name(), e)))
            .collect()
    }

    async fn truncate(&self, schema: &TableSchema) -> Result<(), StoreError> {
        let sql = format!("TRUNCATE TABLE {}", quote_ident(schema.name()));
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| store_error(schema.name(), e))?;
        info!(table = schema.name(), "truncated");
        Ok(())
    }
}
