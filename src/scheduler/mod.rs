pub mod tasks;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info};

/// Recurring room maintenance (scans, heartbeat) on cron schedules
pub struct Scheduler {
    inner: JobScheduler,
    jobs: Vec<String>,
}

impl Scheduler {
    pub async fn new() -> Result<Self> {
        let inner = JobScheduler::new()
            .await
            .context("Failed to create job scheduler")?;
        Ok(Self {
            inner,
            jobs: Vec::new(),
        })
    }

    /// Run `task` whenever the six-field cron expression fires
    pub async fn every<F>(&mut self, cron_expr: &str, name: &str, task: F) -> Result<()>
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        let job_name = name.to_string();
        let job = Job::new_async(cron_expr, move |_id, _lock| {
            debug!("Job fired: {}", job_name);
            task()
        })
        .with_context(|| format!("Invalid cron '{}' for job {}", cron_expr, name))?;

        self.inner
            .add(job)
            .await
            .with_context(|| format!("Failed to schedule job {}", name))?;

        info!("Job '{}' scheduled on '{}'", name, cron_expr);
        self.jobs.push(name.to_string());
        Ok(())
    }

    #[cfg(test)]
    pub fn jobs(&self) -> &[String] {
        &self.jobs
    }

    pub async fn start(&self) -> Result<()> {
        self.inner
            .start()
            .await
            .context("Failed to start scheduler")?;
        info!("Scheduler running jobs: {}", self.jobs.join(", "));
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner
            .shutdown()
            .await
            .context("Failed to stop scheduler")?;
        info!("Scheduler stopped");
        Ok(())
    }
}
