use async_trait::async_trait;
use chrono::Duration;
use fincrawl_adapters::{
    chunk_keys, ColumnMapping, FetchEvent, FillRule, KeyChunking, VendorRequest, WindowedFetcher,
};
use fincrawl_core::{far_future, far_past, Record, TableSchema};
use fincrawl_storage::{CursorFilter, CursorQuery};
use tracing::{info, warn};

use super::{bulk_insert, map_frame, upsert};
use crate::job::{ArgType, ArgumentError, CrawlerJob, JobError, JobSummary, MetaArg, ResolvedArgs};
use crate::{schemas, JobContext};

const FUND_MARKETS: [&str; 2] = ["O", "E"];

const DESCRIPTION_ARGS: [MetaArg; 1] = [MetaArg::new(
    "pre_truncate",
    ArgType::Int,
    "0 or 1: empty the description table before loading, default 0",
)];

pub struct FundDescription;

#[async_trait]
impl CrawlerJob for FundDescription {
    fn name(&self) -> &'static str {
        "fund_description"
    }

    fn notes(&self) -> &'static str {
        "Mutual fund descriptions for exchange and over-the-counter funds."
    }

    fn meta_args(&self) -> &'static [MetaArg] {
        &DESCRIPTION_ARGS
    }

    fn meta_args_example(&self) -> &'static str {
        "[1]"
    }

    async fn run(&self, ctx: &JobContext, args: &ResolvedArgs) -> Result<JobSummary, JobError> {
        let schema = schemas::fund_description()?;
        let mut summary = JobSummary::new(self.name());
        if args.flag("pre_truncate", false) {
            info!(table = schema.name(), "truncating before load");
            ctx.store.truncate(&schema).await?;
        }

        let mapper = ColumnMapping::new()
            .renames([
                ("ts_code", "wind_code"),
                ("name", "short_name"),
                ("fund_type", "invest_type"),
                ("found_date", "setup_date"),
                ("due_date", "maturity_date"),
                ("purc_startdate", "purchase_start_dt"),
                ("redm_startdate", "redemption_start_dt"),
                ("invest_type", "invest_style"),
                ("type", "fund_type"),
            ])
            .fill(FillRule::when_present("maturity_date", far_future(), "setup_date"))
            .bind(&schema)?;

        let fetcher = WindowedFetcher::new(ctx.tushare.as_ref(), 1)?;
        let markets = FUND_MARKETS.iter().map(|m| vec![m.to_string()]).collect();
        let mut fetch = fetcher.fetch_chunks(markets, |market| {
            VendorRequest::new("fund_basic").param("market", market.join(","))
        });
        let mut records = Vec::new();
        while let Some(event) = fetch.next().await {
            summary.record_event(&event);
            if let FetchEvent::Frame { frame, .. } = event {
                records.extend(map_frame(&mapper, &frame, &mut summary));
            }
        }
        summary.entities = records.len();
        info!(funds = records.len(), "saving fund descriptions");
        upsert(ctx, &schema, schema.key_columns(), &records, &mut summary).await?;
        Ok(summary)
    }
}

/// Longest date span one `fund_nav` call may cover.
const NAV_WINDOW_DAYS: u32 = 2_999;
const NAV_OVERLAP_DAYS: i64 = 7;
/// Fund codes longer than this are share classes the vendor has no navs for.
const NAV_MAX_CODE_LEN: usize = 9;
const NAV_FLUSH_ROWS: usize = 10_000;

fn adjusted_factor(inputs: &[Option<f64>]) -> Option<f64> {
    match inputs {
        [Some(adj_nav), Some(unit_nav)] if *unit_nav != 0.0 => {
            Some((adj_nav / unit_nav * 1e6).round() / 1e6)
        }
        _ => None,
    }
}

pub struct FundNav;

impl FundNav {
    async fn flush(
        ctx: &JobContext,
        schema: &TableSchema,
        buffer: &mut Vec<Record>,
        summary: &mut JobSummary,
        progress: f64,
    ) -> Result<(), JobError> {
        if buffer.is_empty() {
            return Ok(());
        }
        info!(rows = buffer.len(), progress = format!("{:.2}%", progress * 100.0), "saving fund navs");
        bulk_insert(ctx, schema, buffer, summary).await?;
        buffer.clear();
        Ok(())
    }
}

#[async_trait]
impl CrawlerJob for FundNav {
    fn name(&self) -> &'static str {
        "fund_nav"
    }

    fn notes(&self) -> &'static str {
        "Fund net asset values, fetched from each fund's last stored trade day."
    }

    async fn run(&self, ctx: &JobContext, _args: &ResolvedArgs) -> Result<JobSummary, JobError> {
        let description = schemas::fund_description()?;
        let nav = schemas::fund_nav()?;
        let mut summary = JobSummary::new(self.name());

        let query = CursorQuery::new(
            &description,
            &nav,
            "wind_code",
            "setup_date",
            "trade_dt",
            ctx.today(),
        )
        .filter(CursorFilter::CursorBefore("maturity_date".into()))
        .filter(CursorFilter::DateAfter("setup_date".into(), far_past()))
        .filter(CursorFilter::KeyMaxLen(NAV_MAX_CODE_LEN));
        let cursors: Vec<_> = ctx
            .store
            .load_cursors(&query)
            .await?
            .into_iter()
            .map(|c| c.rewound(NAV_OVERLAP_DAYS))
            .collect();
        let total = cursors.len();
        summary.entities = total;
        info!(funds = total, "fund nav cursors loaded");

        let mapper = ColumnMapping::new()
            .renames([
                ("ts_code", "wind_code"),
                ("end_date", "trade_dt"),
                ("accum_nav", "acc_nav"),
            ])
            .derive("adj_factor", &["adj_nav", "unit_nav"], adjusted_factor)
            .bind(&nav)?;

        let end = ctx.today() + Duration::days(1);
        let fetcher = WindowedFetcher::new(ctx.tushare.as_ref(), NAV_WINDOW_DAYS)?;
        let mut fetch = fetcher.fetch_all(cursors, end, |cursor, window| {
            VendorRequest::new("fund_nav")
                .param("ts_code", cursor.key.clone())
                .date_param("start_date", window.start)
                .date_param("end_date", window.last_day())
        });

        let mut buffer: Vec<Record> = Vec::new();
        let mut current = String::new();
        let mut started = 0usize;
        while let Some(event) = fetch.next().await {
            summary.record_event(&event);
            if event.key() != current {
                current = event.key().to_string();
                started += 1;
            }
            if let FetchEvent::Frame { frame, .. } = event {
                buffer.extend(map_frame(&mapper, &frame, &mut summary));
            }
            if buffer.len() > NAV_FLUSH_ROWS {
                let progress = started as f64 / total.max(1) as f64;
                Self::flush(ctx, &nav, &mut buffer, &mut summary, progress).await?;
            }
        }
        Self::flush(ctx, &nav, &mut buffer, &mut summary, 1.0).await?;

        summary.rows_removed = ctx.store.clean_duplicates(&nav, nav.key_columns()).await?;
        Ok(summary)
    }
}

const MANAGER_CHUNK: usize = 100;

pub struct FundManager;

#[async_trait]
impl CrawlerJob for FundManager {
    fn name(&self) -> &'static str {
        "fund_manager"
    }

    fn notes(&self) -> &'static str {
        "Manager tenures for every known fund."
    }

    async fn run(&self, ctx: &JobContext, _args: &ResolvedArgs) -> Result<JobSummary, JobError> {
        let description = schemas::fund_description()?;
        let schema = schemas::fund_manager()?;
        let mut summary = JobSummary::new(self.name());

        let funds = ctx.store.distinct_values(&description, "wind_code").await?;
        summary.entities = funds.len();
        let chunks = chunk_keys(&funds, KeyChunking::Fixed(MANAGER_CHUNK))?;
        info!(funds = funds.len(), batches = chunks.len(), "fetching fund managers");

        let mapper = ColumnMapping::new()
            .renames([
                ("ts_code", "wind_code"),
                ("name", "manager_name"),
                ("begin_date", "start_dt"),
                ("end_date", "end_dt"),
            ])
            .fill(FillRule::always("start_dt", far_past()))
            .fill(FillRule::always("end_dt", far_future()))
            .bind(&schema)?;

        let fetcher = WindowedFetcher::new(ctx.tushare.as_ref(), 1)?;
        let mut fetch = fetcher.fetch_chunks(chunks, |funds| {
            VendorRequest::new("fund_manager")
                .param("ts_code", funds.join(","))
                .fields(["ts_code", "ann_date", "name", "begin_date", "end_date"])
        });
        while let Some(event) = fetch.next().await {
            summary.record_event(&event);
            if let FetchEvent::Frame { frame, .. } = event {
                let records = map_frame(&mapper, &frame, &mut summary);
                upsert(ctx, &schema, schema.key_columns(), &records, &mut summary).await?;
            }
        }
        Ok(summary)
    }
}

const SALES_ARGS: [MetaArg; 1] = [MetaArg::new(
    "n_records",
    ArgType::Int,
    "page size; must exceed the number of funds on sale, default 3000",
)];

const SALES_PAGE_SIZE: i64 = 3_000;

pub struct FundSales;

#[async_trait]
impl CrawlerJob for FundSales {
    fn name(&self) -> &'static str {
        "fund_sales"
    }

    fn notes(&self) -> &'static str {
        "Funds currently on sale through the broker channel."
    }

    fn meta_args(&self) -> &'static [MetaArg] {
        &SALES_ARGS
    }

    fn meta_args_example(&self) -> &'static str {
        "[3000]"
    }

    async fn run(&self, ctx: &JobContext, args: &ResolvedArgs) -> Result<JobSummary, JobError> {
        let page_size = args.int("n_records", SALES_PAGE_SIZE);
        if page_size <= 0 {
            return Err(ArgumentError::Invalid {
                name: "n_records".into(),
                reason: format!("must be positive, got {page_size}"),
            }
            .into());
        }
        let schema = schemas::fund_sale()?;
        let mut summary = JobSummary::new(self.name());

        let request = VendorRequest::new("fund_sales")
            .param("funcNo", "742100")
            .param("curtPageNo", "1")
            .param("numPerPage", page_size.to_string())
            .param("isDxsale", "0");
        summary.calls += 1;
        let frame = ctx.fund_sales.call(&request).await?;
        summary.records_fetched += frame.len();
        if frame.has_more {
            warn!(
                n_records = page_size,
                total_rows = ?frame.total_rows,
                "listing spans more than one page; raise n_records above the total"
            );
        }

        let mapper = ColumnMapping::new().bind(&schema)?;
        let records = map_frame(&mapper, &frame, &mut summary);
        summary.entities = records.len();
        upsert(ctx, &schema, schema.key_columns(), &records, &mut summary).await?;
        Ok(summary)
    }
}
