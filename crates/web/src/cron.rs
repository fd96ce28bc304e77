use std::sync::Arc;

use anyhow::Result;
use diffcast_jobs::{JobContext, JobStorage, recover_pipeline_runs};
use tokio_cron_scheduler::{Job, JobScheduler};

pub type Scheduler = JobScheduler;

pub async fn create(context: JobContext, jobs: Arc<JobStorage>) -> Result<Scheduler> {
    let sched = JobScheduler::new().await?;

    // Every 5 minutes: Re-queue runs whose heartbeat went stale
    {
        sched
            .add(Job::new_async("every 5 minutes", move |_uuid, _l| {
                let context = context.clone();
                let jobs = jobs.clone();
                Box::pin(async move {
                    if let Err(e) = recover_pipeline_runs(&context, &jobs, false).await {
                        tracing::error!("Failed to recover stale pipeline runs: {:?}", e);
                    }
                })
            })?)
            .await?;
    }

    sched.start().await?;
    Ok(sched)
}
