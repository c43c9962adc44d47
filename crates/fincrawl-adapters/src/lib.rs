//! Vendor contracts + HTTP vendor clients, windowed fetching and column mapping.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

pub mod mapping;
pub mod window;

pub use mapping::{
    ColumnMapper, ColumnMapping, FillRule, MappedBatch, NumericDerivation, ParseError,
};
pub use window::{
    chunk_keys, plan_windows, FetchAll, FetchChunks, FetchEvent, KeyChunking, WindowError,
    WindowPlan, WindowedFetcher,
};

pub const CRATE_NAME: &str = "fincrawl-adapters";

/// One vendor API call: endpoint name, parameters and requested fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VendorRequest {
    pub api_name: String,
    pub params: BTreeMap<String, String>,
    pub fields: Vec<String>,
}

impl VendorRequest {
    pub fn new(api_name: impl Into<String>) -> Self {
        Self {
            api_name: api_name.into(),
            ..Default::default()
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Dates travel as `YYYYMMDD`.
    pub fn date_param(self, key: impl Into<String>, date: NaiveDate) -> Self {
        self.param(key, date.format("%Y%m%d").to_string())
    }

    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }
}

/// Tabular vendor payload: field names plus positional rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    pub fields: Vec<String>,
    pub items: Vec<Vec<JsonValue>>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub total_rows: Option<u64>,
}

impl RawFrame {
    pub fn new(fields: Vec<String>, items: Vec<Vec<JsonValue>>) -> Self {
        Self {
            fields,
            items,
            has_more: false,
            total_rows: None,
        }
    }

    /// Build a frame from row objects; columns follow first appearance.
    pub fn from_objects(rows: Vec<JsonMap<String, JsonValue>>) -> Self {
        let mut fields: Vec<String> = Vec::new();
        for row in &rows {
            for key in row.keys() {
                if !fields.iter().any(|f| f == key) {
                    fields.push(key.clone());
                }
            }
        }
        let items = rows
            .into_iter()
            .map(|mut row| {
                fields
                    .iter()
                    .map(|f| row.remove(f).unwrap_or(JsonValue::Null))
                    .collect()
            })
            .collect();
        Self::new(fields, items)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }

    /// Values of one column; absent columns yield nothing.
    pub fn column<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a JsonValue> + 'a {
        let idx = self.column_index(name);
        self.items
            .iter()
            .filter_map(move |row| idx.and_then(|i| row.get(i)))
    }
}

#[derive(Debug, Error)]
pub enum VendorCallError {
    #[error("{api}: transport error: {source}")]
    Transport {
        api: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{api}: http status {status}")]
    Status { api: String, status: u16 },
    #[error("{api}: vendor error {code}: {message}")]
    Api {
        api: String,
        code: i64,
        message: String,
    },
    #[error("{api}: authentication rejected: {message}")]
    Auth { api: String, message: String },
    #[error("{api}: rate limit exhausted: {message}")]
    RateLimited { api: String, message: String },
    #[error("{api}: undecodable response: {message}")]
    Decode { api: String, message: String },
}

impl VendorCallError {
    pub fn api(&self) -> &str {
        match self {
            Self::Transport { api, .. }
            | Self::Status { api, .. }
            | Self::Api { api, .. }
            | Self::Auth { api, .. }
            | Self::RateLimited { api, .. }
            | Self::Decode { api, .. } => api,
        }
    }

    /// Failures that will hit every following call too, so the run stops.
    pub fn is_systemic(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::RateLimited { .. })
    }
}

#[async_trait]
pub trait VendorClient: Send + Sync {
    fn vendor_id(&self) -> &'static str;

    async fn call(&self, request: &VendorRequest) -> Result<RawFrame, VendorCallError>;
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bucket allowing `calls` per minute with no burst beyond that.
    pub fn per_minute(calls: u32) -> Option<Self> {
        (calls > 0).then(|| Self {
            capacity: calls,
            refill_every: Duration::from_secs(60) / calls,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            token_bucket: None,
        }
    }
}

impl HttpClientConfig {
    fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout);
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder.build().context("building reqwest client")
    }

    fn build_bucket(&self) -> Option<Arc<SimpleTokenBucket>> {
        self.token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)))
    }
}

/// Call-quota guard shared by every request a client issues.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// Tushare Pro endpoint: `POST {api_name, token, params, fields}`.
#[derive(Debug)]
pub struct TushareClient {
    client: reqwest::Client,
    url: String,
    token: String,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

#[derive(Debug, Serialize)]
struct TushareBody<'a> {
    api_name: &'a str,
    token: &'a str,
    params: &'a BTreeMap<String, String>,
    fields: String,
}

#[derive(Debug, Deserialize)]
struct TushareEnvelope {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<RawFrame>,
}

const TUSHARE_AUTH_CODES: [i64; 2] = [40001, 40101];
const TUSHARE_RATE_LIMIT_CODE: i64 = 40203;

/// Decode a Tushare response body into a frame, classifying vendor error codes.
pub fn decode_tushare_response(api: &str, body: &[u8]) -> Result<RawFrame, VendorCallError> {
    let envelope: TushareEnvelope =
        serde_json::from_slice(body).map_err(|e| VendorCallError::Decode {
            api: api.to_string(),
            message: e.to_string(),
        })?;
    let message = envelope.msg.unwrap_or_default();
    match envelope.code {
        0 => {}
        code if TUSHARE_AUTH_CODES.contains(&code) => {
            return Err(VendorCallError::Auth {
                api: api.to_string(),
                message,
            })
        }
        TUSHARE_RATE_LIMIT_CODE => {
            return Err(VendorCallError::RateLimited {
                api: api.to_string(),
                message,
            })
        }
        code => {
            return Err(VendorCallError::Api {
                api: api.to_string(),
                code,
                message,
            })
        }
    }
    let frame = envelope.data.unwrap_or_default();
    if let Some(bad) = frame.items.iter().position(|row| row.len() != frame.fields.len()) {
        return Err(VendorCallError::Decode {
            api: api.to_string(),
            message: format!("row {bad} does not match {} fields", frame.fields.len()),
        });
    }
    Ok(frame)
}

fn classify_status(api: &str, status: StatusCode) -> VendorCallError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => VendorCallError::Auth {
            api: api.to_string(),
            message: status.to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => VendorCallError::RateLimited {
            api: api.to_string(),
            message: status.to_string(),
        },
        _ => VendorCallError::Status {
            api: api.to_string(),
            status: status.as_u16(),
        },
    }
}

async fn read_body(api: &str, resp: reqwest::Response) -> Result<Vec<u8>, VendorCallError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(classify_status(api, status));
    }
    resp.bytes()
        .await
        .map(|b| b.to_vec())
        .map_err(|source| VendorCallError::Transport {
            api: api.to_string(),
            source,
        })
}

impl TushareClient {
    pub fn new(
        url: impl Into<String>,
        token: impl Into<String>,
        config: HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: config.build_client()?,
            url: url.into(),
            token: token.into(),
            token_bucket: config.build_bucket(),
        })
    }
}

#[async_trait]
impl VendorClient for TushareClient {
    fn vendor_id(&self) -> &'static str {
        "tushare"
    }

    async fn call(&self, request: &VendorRequest) -> Result<RawFrame, VendorCallError> {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }
        let api = request.api_name.as_str();
        let body = TushareBody {
            api_name: api,
            token: &self.token,
            params: &request.params,
            fields: request.fields.join(","),
        };

        let span = info_span!("vendor_call", vendor = "tushare", api);
        async {
            debug!(params = ?request.params, "calling vendor");
            let resp = self
                .client
                .post(&self.url)
                .json(&body)
                .send()
                .await
                .map_err(|source| VendorCallError::Transport {
                    api: api.to_string(),
                    source,
                })?;
            let bytes = read_body(api, resp).await?;
            let frame = decode_tushare_response(api, &bytes)?;
            debug!(rows = frame.len(), "vendor call returned");
            Ok::<_, VendorCallError>(frame)
        }
        .instrument(span)
        .await
    }
}

/// Broker fund-sales listing: `GET ?funcNo=...` returning `{results: [{data: [...]}]}`.
#[derive(Debug)]
pub struct FundSalesClient {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct SalesEnvelope {
    #[serde(default)]
    results: Vec<SalesPage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SalesPage {
    #[serde(default)]
    total_pages: u64,
    #[serde(default)]
    total_rows: Option<u64>,
    #[serde(default)]
    data: Vec<JsonMap<String, JsonValue>>,
}

/// Decode the fund-sales payload; `has_more` flags listings cut off after page one.
pub fn decode_fund_sales_response(api: &str, body: &[u8]) -> Result<RawFrame, VendorCallError> {
    let envelope: SalesEnvelope =
        serde_json::from_slice(body).map_err(|e| VendorCallError::Decode {
            api: api.to_string(),
            message: e.to_string(),
        })?;
    let page = envelope
        .results
        .into_iter()
        .next()
        .ok_or_else(|| VendorCallError::Decode {
            api: api.to_string(),
            message: "response carries no results".to_string(),
        })?;
    let mut frame = RawFrame::from_objects(page.data);
    frame.has_more = page.total_pages > 1;
    frame.total_rows = page.total_rows;
    Ok(frame)
}

impl FundSalesClient {
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: config.build_client()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl VendorClient for FundSalesClient {
    fn vendor_id(&self) -> &'static str {
        "fund-sales"
    }

    async fn call(&self, request: &VendorRequest) -> Result<RawFrame, VendorCallError> {
        let api = request.api_name.as_str();
        let span = info_span!("vendor_call", vendor = "fund-sales", api);
        async {
            let resp = self
                .client
                .get(&self.url)
                .query(&request.params)
                .send()
                .await
                .map_err(|source| VendorCallError::Transport {
                    api: api.to_string(),
                    source,
                })?;
            let bytes = read_body(api, resp).await?;
            decode_fund_sales_response(api, &bytes)
        }
        .instrument(span)
        .await
    }
}
