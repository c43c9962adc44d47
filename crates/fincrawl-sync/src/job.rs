//! Crawler job contract: declared arguments, validation, run summary.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use fincrawl_adapters::{FetchEvent, VendorCallError, WindowError};
use fincrawl_core::SchemaError;
use fincrawl_storage::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

use crate::JobContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgType {
    Int,
    Float,
    String,
    Bool,
}

impl ArgType {
    fn accepts(self, value: &JsonValue) -> bool {
        match self {
            ArgType::Int => value.is_i64() || value.is_u64(),
            ArgType::Float => value.is_number(),
            ArgType::String => value.is_string(),
            ArgType::Bool => value.is_boolean(),
        }
    }
}

/// One declared positional argument, also accepted by name.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetaArg {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub ty: ArgType,
    pub description: &'static str,
}

impl MetaArg {
    pub const fn new(name: &'static str, ty: ArgType, description: &'static str) -> Self {
        Self {
            name,
            ty,
            description,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ArgumentError {
    #[error("expected at most {expected} positional arguments, got {got}")]
    TooMany { expected: usize, got: usize },
    #[error("unknown keyword argument `{0}`")]
    UnknownKeyword(String),
    #[error("argument `{0}` given both positionally and by keyword")]
    Duplicate(String),
    #[error("argument `{name}` must be {expected:?}, got {got}")]
    WrongType {
        name: String,
        expected: ArgType,
        got: String,
    },
    #[error("missing required argument `{0}`")]
    Missing(String),
    #[error("argument `{name}`: {reason}")]
    Invalid { name: String, reason: String },
}

/// Raw arguments as an operator or the schedule supplies them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobArgs {
    #[serde(default)]
    pub args: Vec<JsonValue>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, JsonValue>,
}

impl JobArgs {
    pub fn positional(args: Vec<JsonValue>) -> Self {
        Self {
            args,
            kwargs: BTreeMap::new(),
        }
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.kwargs.insert(name.into(), value);
        self
    }
}

/// Arguments checked against a job's [`MetaArg`] list, addressed by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedArgs {
    values: BTreeMap<&'static str, JsonValue>,
}

impl ResolvedArgs {
    pub fn get(&self, name: &str) -> Option<&JsonValue> {
        self.values.get(name)
    }

    pub fn int(&self, name: &str, default: i64) -> i64 {
        self.get(name).and_then(JsonValue::as_i64).unwrap_or(default)
    }

    pub fn flag(&self, name: &str, default: bool) -> bool {
        self.get(name)
            .map(|v| v.as_bool().unwrap_or_else(|| v.as_i64().unwrap_or(0) != 0))
            .unwrap_or(default)
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(JsonValue::as_str)
    }

    pub fn require_string(&self, name: &str) -> Result<&str, ArgumentError> {
        self.string(name)
            .ok_or_else(|| ArgumentError::Missing(name.to_string()))
    }
}

pub fn validate_args(meta: &[MetaArg], raw: &JobArgs) -> Result<ResolvedArgs, ArgumentError> {
    if raw.args.len() > meta.len() {
        return Err(ArgumentError::TooMany {
            expected: meta.len(),
            got: raw.args.len(),
        });
    }
    let mut values = BTreeMap::new();
    for (arg, value) in meta.iter().zip(&raw.args) {
        check_type(arg, value)?;
        values.insert(arg.name, value.clone());
    }
    for (name, value) in &raw.kwargs {
        let arg = meta
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| ArgumentError::UnknownKeyword(name.clone()))?;
        if values.contains_key(arg.name) {
            return Err(ArgumentError::Duplicate(name.clone()));
        }
        check_type(arg, value)?;
        values.insert(arg.name, value.clone());
    }
    Ok(ResolvedArgs { values })
}

fn check_type(arg: &MetaArg, value: &JsonValue) -> Result<(), ArgumentError> {
    if arg.ty.accepts(value) {
        Ok(())
    } else {
        Err(ArgumentError::WrongType {
            name: arg.name.to_string(),
            expected: arg.ty,
            got: value.to_string(),
        })
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Argument(#[from] ArgumentError),
    #[error(transparent)]
    Vendor(#[from] VendorCallError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error("unknown job `{0}`")]
    UnknownJob(String),
}

/// Counters reported at the end of every job run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobSummary {
    pub job: String,
    pub entities: usize,
    pub calls: usize,
    pub records_fetched: usize,
    pub records_written: u64,
    pub rows_removed: u64,
    pub rejected_rows: usize,
    pub failures: usize,
    /// A systemic vendor failure stopped the run early.
    pub halted: bool,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl JobSummary {
    pub fn new(job: &str) -> Self {
        Self {
            job: job.to_string(),
            ..Self::default()
        }
    }

    /// Count one fetch event; failures are logged where they happen.
    pub fn record_event(&mut self, event: &FetchEvent) {
        self.calls += 1;
        match event {
            FetchEvent::Frame { frame, .. } => self.records_fetched += frame.len(),
            FetchEvent::Failed { error, .. } => {
                self.failures += 1;
                self.halted |= error.is_systemic();
            }
        }
    }

    pub fn log_summary(&self) {
        tracing::info!(
            job = %self.job,
            entities = self.entities,
            calls = self.calls,
            records_fetched = self.records_fetched,
            records_written = self.records_written,
            rows_removed = self.rows_removed,
            rejected_rows = self.rejected_rows,
            failures = self.failures,
            halted = self.halted,
            elapsed = format!("{:.1}s", self.elapsed.as_secs_f64()),
            "job finished"
        );
    }
}

#[async_trait]
pub trait CrawlerJob: Send + Sync {
    fn name(&self) -> &'static str;

    /// Operator-facing description.
    fn notes(&self) -> &'static str;

    fn meta_args(&self) -> &'static [MetaArg] {
        &[]
    }

    fn meta_args_example(&self) -> &'static str {
        "[]"
    }

    async fn run(&self, ctx: &JobContext, args: &ResolvedArgs) -> Result<JobSummary, JobError>;
}

pub fn meta_info(job: &dyn CrawlerJob) -> JsonValue {
    json!({
        "job": job.name(),
        "notes": job.notes(),
        "arguments": job.meta_args(),
        "example_arguments": job.meta_args_example(),
    })
}
