use async_trait::async_trait;
use tracing::info;

use crate::job::{
    ArgType, ArgumentError, CrawlerJob, JobError, JobSummary, MetaArg, ResolvedArgs,
};
use crate::{schemas, JobContext};

const CLEAN_ARGS: [MetaArg; 1] = [MetaArg::new(
    "table",
    ArgType::String,
    "registered table whose duplicate keys are collapsed",
)];

/// Collapse rows sharing a uniqueness key, keeping the latest write.
pub struct CleanDuplicates;

#[async_trait]
impl CrawlerJob for CleanDuplicates {
    fn name(&self) -> &'static str {
        "clean_duplicates"
    }

    fn notes(&self) -> &'static str {
        "Remove duplicate rows from a table, keeping the most recently written row per key."
    }

    fn meta_args(&self) -> &'static [MetaArg] {
        &CLEAN_ARGS
    }

    fn meta_args_example(&self) -> &'static str {
        r#"["mf_org_nav"]"#
    }

    async fn run(&self, ctx: &JobContext, args: &ResolvedArgs) -> Result<JobSummary, JobError> {
        let table = args.require_string("table")?;
        let schema = schemas::by_name(table)?.ok_or_else(|| ArgumentError::Invalid {
            name: "table".into(),
            reason: format!("`{table}` is not a registered table"),
        })?;

        let mut summary = JobSummary::new(self.name());
        info!(table, key = ?schema.key_columns(), "cleaning duplicates");
        summary.rows_removed = ctx
            .store
            .clean_duplicates(&schema, schema.key_columns())
            .await?;
        Ok(summary)
    }
}
