//! Built-in crawler jobs.

use std::sync::Arc;

use fincrawl_adapters::{ColumnMapper, RawFrame};
use fincrawl_core::{Record, TableSchema};
use tracing::{debug, warn};

use crate::job::{CrawlerJob, JobError, JobSummary};
use crate::JobContext;

mod fund;
mod index;
mod maintenance;

pub use fund::{FundDescription, FundManager, FundNav, FundSales};
pub use index::{IndexDescription, IndexPrice};
pub use maintenance::CleanDuplicates;

pub fn builtin() -> Vec<Arc<dyn CrawlerJob>> {
    vec![
        Arc::new(IndexDescription),
        Arc::new(IndexPrice),
        Arc::new(FundDescription),
        Arc::new(FundNav),
        Arc::new(FundManager),
        Arc::new(FundSales),
        Arc::new(CleanDuplicates),
    ]
}

/// Map a frame, counting dropped rows against the summary. A frame that
/// cannot be read at all is rejected whole and the job carries on.
fn map_frame(mapper: &ColumnMapper, frame: &RawFrame, summary: &mut JobSummary) -> Vec<Record> {
    let batch = match mapper.map(frame) {
        Ok(batch) => batch,
        Err(error) => {
            warn!(table = mapper.table(), rows = frame.len(), %error, "frame rejected");
            summary.rejected_rows += frame.len();
            return Vec::new();
        }
    };
    summary.rejected_rows += batch.rejected.len();
    if batch.nulled_cells > 0 {
        debug!(table = mapper.table(), cells = batch.nulled_cells, "unreadable cells nulled");
    }
    batch.records
}

async fn upsert(
    ctx: &JobContext,
    schema: &TableSchema,
    unique_keys: &[String],
    records: &[Record],
    summary: &mut JobSummary,
) -> Result<(), JobError> {
    if !records.is_empty() {
        summary.records_written += ctx.store.upsert(schema, unique_keys, records).await?;
    }
    Ok(())
}

async fn bulk_insert(
    ctx: &JobContext,
    schema: &TableSchema,
    records: &[Record],
    summary: &mut JobSummary,
) -> Result<(), JobError> {
    if !records.is_empty() {
        summary.records_written += ctx.store.bulk_insert(schema, records).await?;
    }
    Ok(())
}
