use std::sync::Arc;

use anyhow::{Context, Result};
use listsync_core::TaskName;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::error;

use crate::{Engine, SyncConfig};

/// Recurring tasks and the config field holding each cron expression.
pub fn scheduled_tasks(config: &SyncConfig) -> [(TaskName, &str); 4] {
    [
        (TaskName::RecheckSources, config.cron_recheck.as_str()),
        (TaskName::DrainCreate, config.cron_drain_create.as_str()),
        (TaskName::SyncCreated, config.cron_sync_created.as_str()),
        (TaskName::DrainDelete, config.cron_drain_delete.as_str()),
    ]
}

/// Registers one job per recurring task. Returns `None` when the
/// scheduler is disabled. Jobs share nothing but the store.
pub async fn build_scheduler(engine: Arc<Engine>, config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for (task, cron) in scheduled_tasks(config) {
        let engine = engine.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let engine = engine.clone();
            Box::pin(async move {
                if let Err(err) = engine.run_scheduled(task).await {
                    error!(task = task.as_str(), error = %format!("{err:#}"), "scheduled run failed");
                }
            })
        })
        .with_context(|| format!("creating {task} job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}
