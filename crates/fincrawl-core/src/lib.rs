//! Core data model for the fincrawl sync engine: records, table schemas,
//! fetch windows and sync cursors.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "fincrawl-core";

/// Stand-in for an open-ended date (no maturity, no expiry, tenure not ended).
pub fn far_future() -> NaiveDate {
    NaiveDate::from_ymd_opt(9999, 12, 31).unwrap_or(NaiveDate::MAX)
}

/// Stand-in for an unknown start date. Reads filter on `> 1900-01-01` to skip it.
pub fn far_past() -> NaiveDate {
    NaiveDate::from_ymd_opt(1900, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// Scalar cell value flowing from a vendor frame into a table row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Text(String),
    Date(NaiveDate),
    Float(f64),
    Int(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Type-tagged rendering used when values are compared as grouping keys.
    pub fn key_repr(&self) -> String {
        match self {
            Value::Null => "n:".to_string(),
            Value::Text(s) => format!("s:{s}"),
            Value::Date(d) => format!("d:{d}"),
            Value::Float(v) => format!("f:{v}"),
            Value::Int(v) => format!("i:{v}"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Float(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// One row keyed by target column name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    values: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(column.into(), value.into());
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Value of `column`, treating an absent column as null.
    pub fn value(&self, column: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.values.get(column).unwrap_or(&NULL)
    }

    pub fn is_null(&self, column: &str) -> bool {
        self.value(column).is_null()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&str, &Value) -> bool) {
        self.values.retain(|k, v| keep(k, v));
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Overlay the non-null values of `other` onto this record.
    pub fn merge_non_null(&mut self, other: &Record) {
        for (column, value) in other.iter() {
            if !value.is_null() {
                self.values.insert(column.to_string(), value.clone());
            }
        }
    }

    /// Grouping key over `columns`; `None` when any of them is null.
    pub fn key_of(&self, columns: &[String]) -> Option<Vec<String>> {
        columns
            .iter()
            .map(|c| {
                let v = self.value(c);
                (!v.is_null()).then(|| v.key_repr())
            })
            .collect()
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Date,
    Float,
    Int,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("table {table}: unknown column `{column}`")]
    UnknownColumn { table: String, column: String },
    #[error("table {table}: column `{column}` declared twice")]
    DuplicateColumn { table: String, column: String },
    #[error("table {table}: uniqueness key is empty")]
    EmptyKey { table: String },
    #[error("table {table}: key column `{column}` must not be nullable")]
    NullableKey { table: String, column: String },
}

/// Ordered column contract of one target table plus its uniqueness key.
///
/// The `updated_at` column, when declared, is owned by the writer: records never
/// carry it and upserts stamp it on every update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    name: String,
    columns: Vec<ColumnDef>,
    unique_key: Vec<String>,
    updated_at: Option<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            unique_key: Vec::new(),
            updated_at: None,
        }
    }

    pub fn column(mut self, name: impl Into<String>, ty: ColumnType, nullable: bool) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            ty,
            nullable,
        });
        self
    }

    pub fn unique_key(mut self, columns: &[&str]) -> Self {
        self.unique_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn updated_at(mut self, column: impl Into<String>) -> Self {
        self.updated_at = Some(column.into());
        self
    }

    /// Check the declaration once at startup.
    pub fn validate(self) -> Result<Self, SchemaError> {
        for (idx, col) in self.columns.iter().enumerate() {
            if self.columns[..idx].iter().any(|c| c.name == col.name) {
                return Err(SchemaError::DuplicateColumn {
                    table: self.name.clone(),
                    column: col.name.clone(),
                });
            }
        }
        if self.unique_key.is_empty() {
            return Err(SchemaError::EmptyKey {
                table: self.name.clone(),
            });
        }
        for key in &self.unique_key {
            match self.column_def(key) {
                None => {
                    return Err(SchemaError::UnknownColumn {
                        table: self.name.clone(),
                        column: key.clone(),
                    })
                }
                Some(def) if def.nullable => {
                    return Err(SchemaError::NullableKey {
                        table: self.name.clone(),
                        column: key.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column_def(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_def(name).is_some()
    }

    pub fn key_columns(&self) -> &[String] {
        &self.unique_key
    }

    pub fn updated_at_column(&self) -> Option<&str> {
        self.updated_at.as_deref()
    }

    /// Fail on the first name that is not a declared column.
    pub fn check_columns<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), SchemaError> {
        for name in names {
            if !self.has_column(name) {
                return Err(SchemaError::UnknownColumn {
                    table: self.name.clone(),
                    column: name.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Half-open `[start, end)` date range covered by one vendor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl FetchWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    /// Inclusive last day, which is what vendors take as `end_date`.
    pub fn last_day(&self) -> NaiveDate {
        self.end - Duration::days(1)
    }
}

impl fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}..{}",
            self.start.format("%Y-%m-%d"),
            self.last_day().format("%Y-%m-%d")
        )
    }
}

/// Last synced date for one entity, recomputed from the data tables each run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub key: String,
    pub last_synced: NaiveDate,
    /// Extra entity columns the job asked for alongside the cursor.
    pub attributes: Record,
}

impl SyncCursor {
    pub fn new(key: impl Into<String>, last_synced: NaiveDate) -> Self {
        Self {
            key: key.into(),
            last_synced,
            attributes: Record::new(),
        }
    }

    /// Step the cursor back to re-fetch a trailing overlap.
    pub fn rewound(mut self, days: i64) -> Self {
        self.last_synced -= Duration::days(days);
        self
    }
}
