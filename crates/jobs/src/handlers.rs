use std::time::Instant;

use anyhow::{Context, Result};
use apalis::prelude::*;
use diffcast_pipeline::PipelineError;

use crate::{JobContext, JobStorage, PipelineJob};

/// Process a pipeline job.
///
/// Store outages are returned as errors so the worker's retry layer runs the
/// job again under the same claim; every other failure is already recorded
/// on the pipeline record and ends the job.
pub async fn process_pipeline_job(job: PipelineJob, ctx: Data<JobContext>) -> Result<()> {
    run_pipeline_job(&job, &ctx).await
}

pub async fn run_pipeline_job(job: &PipelineJob, ctx: &JobContext) -> Result<()> {
    tracing::info!(video_id = %job.video_id, run_id = %job.run_id, "Processing pipeline job");
    let start = Instant::now();
    match ctx.orchestrator.execute(&job.video_id, &job.run_id).await {
        Ok(Some(video)) => tracing::info!(
            video_id = %video.id,
            "Pipeline run {} ended {} at {} in {}ms",
            job.run_id,
            video.status,
            video.stage,
            start.elapsed().as_millis()
        ),
        Ok(None) => tracing::debug!(
            video_id = %job.video_id,
            "Pipeline run {} was superseded, nothing to do",
            job.run_id
        ),
        Err(e @ PipelineError::Store(_)) => {
            tracing::warn!(
                video_id = %job.video_id,
                "Pipeline run {} interrupted: {}",
                job.run_id,
                e
            );
            return Err(e).with_context(|| {
                format!("Pipeline run {} for {} failed", job.run_id, job.video_id)
            });
        }
        Err(e) => {
            tracing::error!(video_id = %job.video_id, "Pipeline run {} dropped: {}", job.run_id, e)
        }
    }
    Ok(())
}

/// Re-claim interrupted runs and queue them. With `include_fresh`, every
/// active record is taken over; otherwise only runs whose heartbeat went stale.
pub async fn recover_pipeline_runs(
    ctx: &JobContext,
    jobs: &JobStorage,
    include_fresh: bool,
) -> Result<usize> {
    let tickets = ctx
        .orchestrator
        .recover_runs(include_fresh)
        .await
        .context("Failed to recover pipeline runs")?;
    let mut queued = 0;
    for ticket in &tickets {
        match jobs.queue_run(&ctx.orchestrator, ticket).await {
            Ok(true) => queued += 1,
            Ok(false) => {}
            Err(e) => tracing::error!(video_id = %ticket.video_id, "{:?}", e),
        }
    }
    if queued > 0 {
        tracing::info!("Re-queued {} interrupted pipeline runs", queued);
    }
    Ok(queued)
}
