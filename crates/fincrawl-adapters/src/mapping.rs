//! Vendor column names and cell encodings to target-table records.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use fincrawl_core::{ColumnType, Record, SchemaError, TableSchema, Value};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

use crate::RawFrame;

/// Cell spellings vendors use for "no value".
const NULL_SENTINELS: [&str; 9] = ["", "-", "--", "None", "none", "null", "nan", "NaN", "NaT"];
/// Dates additionally use a literal zero.
const NULL_DATE_SENTINELS: [&str; 2] = ["0", "00000000"];
const DATE_FORMATS: [&str; 3] = ["%Y%m%d", "%Y-%m-%d", "%Y/%m/%d"];
const DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y%m%d %H:%M:%S"];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("row {row}: column `{column}`: cannot read {value} as {expected:?}")]
    Cell {
        row: usize,
        column: String,
        value: String,
        expected: ColumnType,
    },
    #[error("row {row}: key column `{column}` is empty")]
    MissingKey { row: usize, column: String },
    #[error("frame: {0}")]
    Frame(String),
}

/// Default applied to a column left null by the vendor.
#[derive(Debug, Clone, PartialEq)]
pub struct FillRule {
    pub column: String,
    pub value: Value,
    /// Only fill when this other column carries a value.
    pub when_present: Option<String>,
}

impl FillRule {
    pub fn always(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
            when_present: None,
        }
    }

    pub fn when_present(
        column: impl Into<String>,
        value: impl Into<Value>,
        other: impl Into<String>,
    ) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
            when_present: Some(other.into()),
        }
    }

    fn applies(&self, record: &Record) -> bool {
        record.is_null(&self.column)
            && self
                .when_present
                .as_deref()
                .map_or(true, |other| !record.is_null(other))
    }
}

/// Numeric combination of vendor columns; `None` leaves the target null.
pub type NumericDerivation = fn(&[Option<f64>]) -> Option<f64>;

#[derive(Clone)]
struct Derived {
    target: String,
    sources: Vec<String>,
    compute: NumericDerivation,
}

impl fmt::Debug for Derived {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Derived")
            .field("target", &self.target)
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

/// Declarative source-to-target column table for one job.
#[derive(Debug, Clone, Default)]
pub struct ColumnMapping {
    renames: Vec<(String, String)>,
    derived: Vec<Derived>,
    constants: Vec<(String, Value)>,
    fills: Vec<FillRule>,
    key_columns: Option<Vec<String>>,
}

impl ColumnMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `source` onto `target`. Later entries outrank earlier ones for the same target.
    pub fn rename(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.renames.push((source.into(), target.into()));
        self
    }

    pub fn renames<'a>(mut self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        for (source, target) in pairs {
            self.renames.push((source.to_string(), target.to_string()));
        }
        self
    }

    /// Compute `target` from vendor columns read as numbers; the sources need
    /// not exist in the table.
    pub fn derive(mut self, target: impl Into<String>, sources: &[&str], compute: NumericDerivation) -> Self {
        self.derived.push(Derived {
            target: target.into(),
            sources: sources.iter().map(|s| s.to_string()).collect(),
            compute,
        });
        self
    }

    /// Set `column` to `value` on every row.
    pub fn assign(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constants.push((column.into(), value.into()));
        self
    }

    pub fn fill(mut self, rule: FillRule) -> Self {
        self.fills.push(rule);
        self
    }

    /// Identity columns rows are dropped without; defaults to the schema key.
    pub fn key_columns(mut self, columns: &[&str]) -> Self {
        self.key_columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Validate every target against `schema` and freeze the mapping.
    pub fn bind(self, schema: &TableSchema) -> Result<ColumnMapper, SchemaError> {
        schema.check_columns(self.renames.iter().map(|(_, t)| t.as_str()))?;
        schema.check_columns(self.derived.iter().map(|d| d.target.as_str()))?;
        schema.check_columns(self.constants.iter().map(|(c, _)| c.as_str()))?;
        schema.check_columns(self.fills.iter().map(|f| f.column.as_str()))?;
        schema.check_columns(self.fills.iter().filter_map(|f| f.when_present.as_deref()))?;
        let key_columns = match self.key_columns {
            Some(keys) => {
                schema.check_columns(keys.iter().map(String::as_str))?;
                keys
            }
            None => schema.key_columns().to_vec(),
        };
        let types = schema
            .columns()
            .iter()
            .map(|c| (c.name.clone(), c.ty))
            .collect();
        Ok(ColumnMapper {
            table: schema.name().to_string(),
            renames: self.renames,
            derived: self.derived,
            constants: self.constants,
            fills: self.fills,
            key_columns,
            types,
        })
    }
}

/// Rows that made it through mapping plus the ones dropped on the way.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedBatch {
    pub records: Vec<Record>,
    pub rejected: Vec<ParseError>,
    /// Non-key cells that failed coercion and were nulled.
    pub nulled_cells: usize,
}

/// A [`ColumnMapping`] checked against its target table.
#[derive(Debug, Clone)]
pub struct ColumnMapper {
    table: String,
    renames: Vec<(String, String)>,
    derived: Vec<Derived>,
    constants: Vec<(String, Value)>,
    fills: Vec<FillRule>,
    key_columns: Vec<String>,
    types: BTreeMap<String, ColumnType>,
}

impl ColumnMapper {
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Source positions feeding each target column, lowest precedence first.
    fn plan(&self, frame: &RawFrame) -> Vec<(String, Vec<usize>)> {
        let mut sources: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, field) in frame.fields.iter().enumerate() {
            let renamed = self.renames.iter().any(|(s, _)| s == field);
            if !renamed && self.types.contains_key(field) {
                sources.entry(field.clone()).or_default().push(idx);
            }
        }
        for (source, target) in &self.renames {
            if let Some(idx) = frame.column_index(source) {
                sources.entry(target.clone()).or_default().push(idx);
            }
        }
        sources.into_iter().collect()
    }

    pub fn map(&self, frame: &RawFrame) -> Result<MappedBatch, ParseError> {
        if let Some(bad) = frame.items.iter().position(|r| r.len() != frame.fields.len()) {
            return Err(ParseError::Frame(format!(
                "{}: row {bad} has {} cells for {} fields",
                self.table,
                frame.items[bad].len(),
                frame.fields.len()
            )));
        }
        let plan = self.plan(frame);
        let mut batch = MappedBatch::default();

        'rows: for (row_idx, row) in frame.items.iter().enumerate() {
            let mut record = Record::new();
            for (target, positions) in &plan {
                let ty = self.types[target];
                let mut value = Value::Null;
                for &pos in positions {
                    match coerce(&row[pos], ty) {
                        Ok(Value::Null) => {}
                        Ok(v) => value = v,
                        Err(raw) => {
                            let err = ParseError::Cell {
                                row: row_idx,
                                column: target.clone(),
                                value: raw,
                                expected: ty,
                            };
                            if self.key_columns.contains(target) {
                                warn!(table = %self.table, error = %err, "dropping row with unreadable key");
                                batch.rejected.push(err);
                                continue 'rows;
                            }
                            debug!(table = %self.table, error = %err, "nulling unreadable cell");
                            batch.nulled_cells += 1;
                        }
                    }
                }
                record.set(target.clone(), value);
            }

            for derived in &self.derived {
                let inputs: Vec<Option<f64>> = derived
                    .sources
                    .iter()
                    .map(|s| frame.column_index(s).and_then(|i| parse_f64(&row[i])))
                    .collect();
                let value = (derived.compute)(&inputs).filter(|v| v.is_finite());
                record.set(derived.target.clone(), value);
            }
            for (column, value) in &self.constants {
                record.set(column.clone(), value.clone());
            }
            for rule in &self.fills {
                if rule.applies(&record) {
                    record.set(rule.column.clone(), rule.value.clone());
                }
            }

            if let Some(column) = self.key_columns.iter().find(|k| record.is_null(k)) {
                let err = ParseError::MissingKey {
                    row: row_idx,
                    column: column.clone(),
                };
                warn!(table = %self.table, error = %err, "dropping row without key");
                batch.rejected.push(err);
                continue;
            }
            batch.records.push(record);
        }
        Ok(batch)
    }
}

fn raw_text(cell: &JsonValue) -> String {
    match cell {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Coerce one vendor cell to `ty`; `Err` carries the raw text of an unreadable cell.
fn coerce(cell: &JsonValue, ty: ColumnType) -> Result<Value, String> {
    if let JsonValue::String(s) = cell {
        let s = s.trim();
        if NULL_SENTINELS.contains(&s) || (ty == ColumnType::Date && NULL_DATE_SENTINELS.contains(&s)) {
            return Ok(Value::Null);
        }
    }
    if cell.is_null() {
        return Ok(Value::Null);
    }
    match ty {
        ColumnType::Text => Ok(Value::Text(text_of(cell))),
        ColumnType::Date => parse_date(cell).map(Value::Date).ok_or_else(|| raw_text(cell)),
        ColumnType::Float => parse_f64(cell).map(Value::Float).ok_or_else(|| raw_text(cell)),
        ColumnType::Int => parse_i64(cell).map(Value::Int).ok_or_else(|| raw_text(cell)),
    }
}

/// Text rendering; integral floats lose their decimals (`647006000.0` -> `647006000`).
fn text_of(cell: &JsonValue) -> String {
    match cell {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) if f.fract() == 0.0 && f.abs() < 1e18 => format!("{f:.0}"),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

fn parse_date(cell: &JsonValue) -> Option<NaiveDate> {
    let text = match cell {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.as_u64()?.to_string(),
        _ => return None,
    };
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&text, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(&text, fmt).ok())
                .map(|dt| dt.date())
        })
}

fn parse_f64(cell: &JsonValue) -> Option<f64> {
    let v = match cell {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

fn parse_i64(cell: &JsonValue) -> Option<i64> {
    match cell {
        JsonValue::Number(n) => n.as_i64().or_else(|| integral(n.as_f64()?)),
        JsonValue::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| integral(s.parse::<f64>().ok()?))
        }
        _ => None,
    }
}

fn integral(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15).then_some(f as i64)
}
