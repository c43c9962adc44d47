use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fincrawl_sync::{
    build_scheduler, meta_info, schemas, JobArgs, JobContext, JobRegistry, JobRunner,
    ScheduleFile, SyncConfig,
};
use serde_json::Value as JsonValue;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "fincrawl")]
#[command(about = "Financial reference-data crawler")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one job now
    Run {
        job: String,
        /// Positional arguments as a JSON array, e.g. '[1, 0]'
        #[arg(long)]
        args: Option<String>,
        /// Keyword arguments as a JSON object, e.g. '{"n_records": 5000}'
        #[arg(long)]
        kwargs: Option<String>,
    },
    /// Describe registered jobs and their arguments
    Jobs,
    /// Remove duplicate rows from a table
    Clean { table: String },
    /// Run the cron schedule until interrupted
    Schedule,
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        ["fincrawl", "fincrawl_sync", "fincrawl_adapters", "fincrawl_storage"]
            .map(|target| format!("{target}={}", cli.log_level))
            .join(",")
            .into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn parse_args(args: Option<&str>, kwargs: Option<&str>) -> Result<JobArgs> {
    let args: Vec<JsonValue> = match args {
        Some(text) => serde_json::from_str(text).context("--args must be a JSON array")?,
        None => Vec::new(),
    };
    let kwargs: BTreeMap<String, JsonValue> = match kwargs {
        Some(text) => serde_json::from_str(text).context("--kwargs must be a JSON object")?,
        None => BTreeMap::new(),
    };
    Ok(JobArgs { args, kwargs })
}

/// Schedule file contents, or defaults when the file does not exist.
async fn load_schedule(config: &SyncConfig) -> Result<ScheduleFile> {
    if config.jobs_file.exists() {
        ScheduleFile::load(&config.jobs_file).await
    } else {
        tracing::debug!(path = %config.jobs_file.display(), "no schedule file; using defaults");
        Ok(ScheduleFile::default())
    }
}

async fn runner(config: &SyncConfig, schedule: &ScheduleFile) -> Result<JobRunner> {
    let ctx = JobContext::from_config(config, schedule.index.clone()).await?;
    tracing::info!("database connected");
    Ok(JobRunner::new(JobRegistry::builtin(), ctx))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = SyncConfig::from_env();
    tracing::debug!(jobs_file = %config.jobs_file.display(), "configuration loaded");

    match cli.command {
        Commands::Jobs => {
            let registry = JobRegistry::builtin();
            let described: Vec<JsonValue> =
                registry.iter().map(|job| meta_info(job.as_ref())).collect();
            println!("{}", serde_json::to_string_pretty(&described)?);
        }
        Commands::Run { job, args, kwargs } => {
            let args = parse_args(args.as_deref(), kwargs.as_deref())?;
            let schedule = load_schedule(&config).await?;
            let runner = runner(&config, &schedule).await?;
            let summary = runner.run(&job, &args).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Clean { table } => {
            if schemas::by_name(&table)?.is_none() {
                anyhow::bail!("unknown table `{table}`");
            }
            let schedule = load_schedule(&config).await?;
            let runner = runner(&config, &schedule).await?;
            let args = JobArgs::default().kwarg("table", JsonValue::String(table));
            let summary = runner.run("clean_duplicates", &args).await?;
            println!("removed {} duplicate rows", summary.rows_removed);
        }
        Commands::Schedule => {
            if !config.scheduler_enabled {
                tracing::warn!("FINCRAWL_SCHEDULER_ENABLED is not set; scheduler not started");
                return Ok(());
            }
            let schedule = load_schedule(&config).await?;
            let runner = runner(&config, &schedule).await?;
            let mut sched = build_scheduler(runner, &schedule).await?;
            sched.start().await.context("starting scheduler")?;
            tracing::info!(entries = schedule.enabled().count(), "scheduler running");

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            tracing::info!("shutdown signal received");
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cli_arguments_parse_into_job_args() {
        let args = parse_args(Some("[1, 0]"), Some(r#"{"n_records": 10}"#)).unwrap();
        assert_eq!(args.args, vec![json!(1), json!(0)]);
        assert_eq!(args.kwargs["n_records"], json!(10));
        assert!(parse_args(Some("{}"), None).is_err());
        assert_eq!(parse_args(None, None).unwrap(), JobArgs::default());
    }

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::try_parse_from([
            "fincrawl", "--log-level", "debug", "run", "index_price", "--args", "[1]",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Run { ref job, .. } if job == "index_price"));
    }
}
