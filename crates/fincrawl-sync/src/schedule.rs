//! Cron schedule of crawler jobs, read from a YAML file.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::job::{validate_args, JobArgs};
use crate::runner::{JobRegistry, JobRunner};
use crate::IndexSettings;

fn default_enabled() -> bool {
    true
}

/// One scheduled invocation of a registered job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub job: String,
    /// Six-field cron expression, seconds first.
    pub cron: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub args: JobArgs,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleFile {
    #[serde(default)]
    pub index: IndexSettings,
    #[serde(default)]
    pub jobs: Vec<ScheduleEntry>,
}

impl ScheduleFile {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing schedule yaml")
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &ScheduleEntry> {
        self.jobs.iter().filter(|e| e.enabled)
    }

    /// Every enabled entry names a registered job with acceptable arguments.
    pub fn validate(&self, registry: &JobRegistry) -> Result<()> {
        for entry in self.enabled() {
            let Some(job) = registry.get(&entry.job) else {
                bail!("schedule entry `{}` names an unknown job", entry.job);
            };
            validate_args(job.meta_args(), &entry.args)
                .with_context(|| format!("schedule entry `{}`", entry.job))?;
            if entry.cron.split_whitespace().count() != 6 {
                bail!(
                    "schedule entry `{}`: cron `{}` must have six fields",
                    entry.job,
                    entry.cron
                );
            }
        }
        Ok(())
    }
}

/// Register every enabled entry with a new scheduler; the caller starts it.
pub async fn build_scheduler(runner: JobRunner, file: &ScheduleFile) -> Result<JobScheduler> {
    file.validate(runner.registry())?;
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for entry in file.enabled() {
        let runner = runner.clone();
        let scheduled = entry.clone();
        let job = Job::new_async(entry.cron.as_str(), move |job_id, _l| {
            let runner = runner.clone();
            let entry = scheduled.clone();
            Box::pin(async move {
                if let Err(e) = runner.run_as(job_id, &entry.job, &entry.args).await {
                    error!(job = %entry.job, %job_id, error = %e, "scheduled run failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {}", entry.cron))?;
        let job_id = sched.add(job).await.context("adding scheduler job")?;
        info!(job = %entry.job, cron = %entry.cron, %job_id, "scheduled");
    }
    Ok(sched)
}
