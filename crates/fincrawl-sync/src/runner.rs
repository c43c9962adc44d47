use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::job::{validate_args, CrawlerJob, JobArgs, JobError, JobSummary};
use crate::{jobs, JobContext};

/// Jobs addressable by name.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: BTreeMap<&'static str, Arc<dyn CrawlerJob>>,
}

impl JobRegistry {
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        for job in jobs::builtin() {
            registry.register(job);
        }
        registry
    }

    pub fn register(&mut self, job: Arc<dyn CrawlerJob>) {
        self.jobs.insert(job.name(), job);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CrawlerJob>> {
        self.jobs.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.jobs.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn CrawlerJob>> {
        self.jobs.values()
    }
}

/// Runs registered jobs against one shared [`JobContext`].
#[derive(Clone)]
pub struct JobRunner {
    registry: Arc<JobRegistry>,
    ctx: Arc<JobContext>,
}

impl JobRunner {
    pub fn new(registry: JobRegistry, ctx: JobContext) -> Self {
        Self {
            registry: Arc::new(registry),
            ctx: Arc::new(ctx),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    /// Ad-hoc run: fresh job and execution ids.
    pub async fn run(&self, name: &str, args: &JobArgs) -> Result<JobSummary, JobError> {
        self.run_as(Uuid::new_v4(), name, args).await
    }

    /// Run `name` under the identity `job_id` (stable per schedule entry).
    pub async fn run_as(
        &self,
        job_id: Uuid,
        name: &str,
        args: &JobArgs,
    ) -> Result<JobSummary, JobError> {
        let execution_id = Uuid::new_v4();
        let span = info_span!("job", job = name, %job_id, %execution_id);
        async {
            let job = self
                .registry
                .get(name)
                .ok_or_else(|| JobError::UnknownJob(name.to_string()))?;
            let resolved = validate_args(job.meta_args(), args).map_err(|e| {
                error!(error = %e, "rejected job arguments");
                JobError::from(e)
            })?;

            info!(args = ?args.args, kwargs = ?args.kwargs, "job started");
            let started = Instant::now();
            match job.run(&self.ctx, &resolved).await {
                Ok(mut summary) => {
                    summary.elapsed = started.elapsed();
                    summary.log_summary();
                    Ok(summary)
                }
                Err(e) => {
                    error!(error = %e, elapsed_ms = started.elapsed().as_millis() as u64, "job failed");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }
}
