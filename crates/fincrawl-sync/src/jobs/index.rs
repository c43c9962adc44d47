use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::Duration;
use fincrawl_adapters::{
    chunk_keys, ColumnMapping, FetchEvent, FillRule, KeyChunking, VendorRequest, WindowedFetcher,
};
use fincrawl_core::{far_future, FetchWindow, Record, SyncCursor, Value};
use fincrawl_storage::{CursorFilter, CursorQuery};
use tracing::info;

use super::{bulk_insert, map_frame, upsert};
use crate::job::{ArgType, CrawlerJob, JobError, JobSummary, MetaArg, ResolvedArgs};
use crate::{schemas, JobContext};

/// Category code the vendor uses for fund indexes.
const FUND_INDEX_CATEGORY: &str = "647006000";
/// Cells one batch description call may return.
const DESCRIPTION_CELL_LIMIT: usize = 8_000;
/// Longest date span one `index_daily` call may cover.
const PRICE_WINDOW_DAYS: u32 = 2_999;
const PRICE_OVERLAP_DAYS: i64 = 5;

const INDEX_FIELDS: [&str; 13] = [
    "ts_code",
    "name",
    "fullname",
    "market",
    "publisher",
    "index_type",
    "category",
    "base_date",
    "base_point",
    "list_date",
    "weight_rule",
    "desc",
    "exp_date",
];

fn description_mapping() -> ColumnMapping {
    ColumnMapping::new()
        .renames([
            ("ts_code", "wind_code"),
            ("name", "short_name"),
            ("fullname", "full_name"),
            ("category", "index_code"),
            ("weight_rule", "weights_rule"),
            ("desc", "index_intro"),
            ("exp_date", "expire_date"),
        ])
        .fill(FillRule::always("expire_date", far_future()))
}

fn price_mapping() -> ColumnMapping {
    ColumnMapping::new().renames([
        ("ts_code", "wind_code"),
        ("trade_date", "trade_dt"),
        ("crncy_code", "currency"),
        ("open", "open_"),
        ("high", "high_"),
        ("low", "low_"),
        ("close", "close_"),
        ("vol", "volume_"),
        ("amount", "amount_"),
    ])
}

/// Endpoint serving refresh prices: fund indexes have their own.
fn refresh_api(cursor: &SyncCursor) -> &'static str {
    match cursor.attributes.value("index_code").as_text() {
        Some(FUND_INDEX_CATEGORY) => "index_description",
        _ => "index_basic",
    }
}

fn price_request(api: &str, cursor: &SyncCursor, window: &FetchWindow) -> VendorRequest {
    VendorRequest::new(api)
        .param("ts_code", cursor.key.clone())
        .date_param("start_date", window.start)
        .date_param("end_date", window.last_day())
}

pub struct IndexDescription;

#[async_trait]
impl CrawlerJob for IndexDescription {
    fn name(&self) -> &'static str {
        "index_description"
    }

    fn notes(&self) -> &'static str {
        "Index descriptions: listed markets, vendor fund indexes and configured extra codes."
    }

    async fn run(&self, ctx: &JobContext, _args: &ResolvedArgs) -> Result<JobSummary, JobError> {
        let schema = schemas::index_description()?;
        let keys = schema.key_columns().to_vec();
        let mut summary = JobSummary::new(self.name());
        let fetcher = WindowedFetcher::new(ctx.tushare.as_ref(), PRICE_WINDOW_DAYS)?;

        info!(markets = ctx.index.markets.len(), "listing index markets");
        let listed = description_mapping().bind(&schema)?;
        let markets: Vec<Vec<String>> = ctx.index.markets.iter().map(|m| vec![m.clone()]).collect();
        let mut fetch = fetcher.fetch_chunks(markets, |market| {
            VendorRequest::new("index_basic")
                .param("market", market.join(","))
                .fields(INDEX_FIELDS)
        });
        while let Some(event) = fetch.next().await {
            summary.record_event(&event);
            if let FetchEvent::Frame { frame, .. } = event {
                let records = map_frame(&listed, &frame, &mut summary);
                summary.entities += records.len();
                upsert(ctx, &schema, &keys, &records, &mut summary).await?;
            }
        }
        if summary.halted {
            return Ok(summary);
        }

        info!("fetching fund index descriptions");
        let fund_indexes = description_mapping()
            .assign("index_code", FUND_INDEX_CATEGORY)
            .assign("localized", 1i64)
            .bind(&schema)?;
        let mut fetch =
            fetcher.fetch_chunks(vec![vec![FUND_INDEX_CATEGORY.to_string()]], |_| {
                VendorRequest::new("index_description")
            });
        while let Some(event) = fetch.next().await {
            summary.record_event(&event);
            if let FetchEvent::Frame { frame, .. } = event {
                let records = map_frame(&fund_indexes, &frame, &mut summary);
                summary.entities += records.len();
                upsert(ctx, &schema, &keys, &records, &mut summary).await?;
            }
        }
        if summary.halted || ctx.index.extra_codes.is_empty() {
            return Ok(summary);
        }

        let extra = &ctx.index.extra_codes;
        let codes: Vec<String> = extra.keys().cloned().collect();
        let chunks = chunk_keys(
            &codes,
            KeyChunking::CellLimit {
                cell_limit: DESCRIPTION_CELL_LIMIT,
                field_count: INDEX_FIELDS.len(),
            },
        )?;
        info!(codes = codes.len(), batches = chunks.len(), "fetching configured index codes");
        let unlisted = description_mapping().assign("localized", -1i64).bind(&schema)?;
        let mut fetch = fetcher.fetch_chunks(chunks, |batch| {
            VendorRequest::new("index_basic")
                .param("ts_code", batch.join(","))
                .fields(INDEX_FIELDS)
        });
        while let Some(event) = fetch.next().await {
            summary.record_event(&event);
            if let FetchEvent::Frame { frame, .. } = event {
                let mut records = map_frame(&unlisted, &frame, &mut summary);
                for record in &mut records {
                    let category = record
                        .value("wind_code")
                        .as_text()
                        .and_then(|code| extra.get(code))
                        .cloned();
                    if let Some(category) = category {
                        record.set("index_code", category);
                    }
                }
                summary.entities += records.len();
                upsert(ctx, &schema, &keys, &records, &mut summary).await?;
            }
        }
        Ok(summary)
    }
}

const PRICE_ARGS: [MetaArg; 2] = [
    MetaArg::new("ts", ArgType::Int, "0 or 1: refresh prices of every code the vendor covers, default 1"),
    MetaArg::new(
        "check_new",
        ArgType::Int,
        "0 or 1: probe unlocalized codes for vendor coverage, default 1",
    ),
];

pub struct IndexPrice;

#[async_trait]
impl CrawlerJob for IndexPrice {
    fn name(&self) -> &'static str {
        "index_price"
    }

    fn notes(&self) -> &'static str {
        "Daily index prices, fetched in bounded windows from each code's last stored trade day."
    }

    fn meta_args(&self) -> &'static [MetaArg] {
        &PRICE_ARGS
    }

    fn meta_args_example(&self) -> &'static str {
        "[1, 1]"
    }

    async fn run(&self, ctx: &JobContext, args: &ResolvedArgs) -> Result<JobSummary, JobError> {
        let refresh = args.flag("ts", true);
        let check_new = args.flag("check_new", true);
        let description = schemas::index_description()?;
        let price = schemas::index_price()?;
        let mut summary = JobSummary::new(self.name());

        let query = CursorQuery::new(
            &description,
            &price,
            "wind_code",
            "base_date",
            "trade_dt",
            ctx.today(),
        )
        .attribute("localized")
        .attribute("index_code")
        .filter(CursorFilter::ActiveAfterToday("expire_date".into()));
        let last_trade_day = ctx.last_trade_day();
        let cursors: Vec<SyncCursor> = ctx
            .store
            .load_cursors(&query)
            .await?
            .into_iter()
            .filter(|c| c.last_synced < last_trade_day)
            .collect();
        summary.entities = cursors.len();
        info!(stale = cursors.len(), %last_trade_day, "index price cursors loaded");

        let end = ctx.today() + Duration::days(1);
        let fetcher = WindowedFetcher::new(ctx.tushare.as_ref(), PRICE_WINDOW_DAYS)?;
        let mapper = price_mapping().bind(&price)?;

        if refresh {
            let refreshed: Vec<SyncCursor> = cursors
                .iter()
                .filter(|c| c.attributes.value("localized") != &Value::Int(-1))
                .cloned()
                .map(|c| c.rewound(PRICE_OVERLAP_DAYS))
                .collect();
            info!(codes = refreshed.len(), "refreshing index prices");
            let mut fetch = fetcher.fetch_all(refreshed, end, |cursor, window| {
                price_request(refresh_api(cursor), cursor, window)
            });
            while let Some(event) = fetch.next().await {
                summary.record_event(&event);
                if let FetchEvent::Frame { frame, .. } = event {
                    let records = map_frame(&mapper, &frame, &mut summary);
                    bulk_insert(ctx, &price, &records, &mut summary).await?;
                }
            }
        }

        if check_new && !summary.halted {
            let categories: BTreeSet<&str> =
                ctx.index.categories.iter().map(String::as_str).collect();
            let probes: Vec<SyncCursor> = cursors
                .iter()
                .filter(|c| matches!(c.attributes.value("localized"), Value::Null | Value::Int(0)))
                .filter(|c| {
                    c.attributes
                        .value("index_code")
                        .as_text()
                        .is_some_and(|code| categories.contains(code))
                })
                .cloned()
                .collect();
            info!(probes = probes.len(), "probing unlocalized index codes");

            let mut coverage: BTreeMap<String, i64> = BTreeMap::new();
            let mut failed: BTreeSet<String> = BTreeSet::new();
            let mut fetch = fetcher.fetch_all(probes, end, |cursor, window| {
                price_request("index_daily", cursor, window)
            });
            while let Some(event) = fetch.next().await {
                summary.record_event(&event);
                match event {
                    // Only an empty first window means the vendor lacks the code.
                    FetchEvent::Frame { key, frame, .. } if frame.is_empty() => {
                        if !coverage.contains_key(&key) {
                            coverage.insert(key, -1);
                            fetch.skip_entity();
                        }
                    }
                    FetchEvent::Frame { key, frame, .. } => {
                        let records = map_frame(&mapper, &frame, &mut summary);
                        bulk_insert(ctx, &price, &records, &mut summary).await?;
                        coverage.insert(key, 1);
                    }
                    FetchEvent::Failed { key, .. } => {
                        failed.insert(key);
                    }
                }
            }
            coverage.retain(|code, _| !failed.contains(code));
            let updates: Vec<Record> = coverage
                .iter()
                .map(|(code, flag)| {
                    Record::new()
                        .with("wind_code", code.as_str())
                        .with("localized", *flag)
                })
                .collect();
            if !updates.is_empty() {
                let keys = description.key_columns().to_vec();
                upsert(ctx, &description, &keys, &updates, &mut summary).await?;
            }
        }

        summary.rows_removed = ctx
            .store
            .clean_duplicates(&price, price.key_columns())
            .await?;
        Ok(summary)
    }
}
