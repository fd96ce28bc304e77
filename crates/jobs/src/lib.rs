mod handlers;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use apalis::{
    layers::retry::{
        HasherRng, RetryPolicy,
        backoff::{ExponentialBackoffMaker, MakeBackoff},
    },
    prelude::*,
};
use apalis_codec::json::JsonCodec;
use apalis_sqlite::{CompactType, SqliteStorage, fetcher::SqliteFetcher};
use diffcast_core::config::{Config, DbConfig, WorkerConfig};
use diffcast_pipeline::{Orchestrator, RunOutcome, RunTicket};
pub use handlers::{process_pipeline_job, recover_pipeline_runs, run_pipeline_job};
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, migrate::MigrateDatabase, sqlite::SqlitePool};

/// Advance one claimed pipeline record. The run id ties the job to the claim
/// made by the trigger; a job whose claim was superseded does nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineJob {
    pub video_id: String,
    pub run_id: String,
}

impl PipelineJob {
    pub fn from_ticket(ticket: &RunTicket) -> Option<Self> {
        match (ticket.outcome, &ticket.run_id) {
            (RunOutcome::Started, Some(run_id)) => {
                Some(Self { video_id: ticket.video_id.clone(), run_id: run_id.clone() })
            }
            _ => None,
        }
    }
}

/// Shared context available to all job handlers.
#[derive(Clone)]
pub struct JobContext {
    pub config: Arc<Config>,
    pub orchestrator: Orchestrator,
}

/// Type alias for the default codec used by SqliteStorage.
type DefaultCodec = JsonCodec<CompactType>;

/// Type alias for pipeline run storage.
pub type PipelineStorage = SqliteStorage<PipelineJob, DefaultCodec, SqliteFetcher>;

/// Storage handle for pushing jobs from request handlers.
#[derive(Clone)]
pub struct JobStorage {
    pipeline: PipelineStorage,
}

impl JobStorage {
    /// Set up job storage tables and create storage instances.
    pub async fn setup(db: &DbConfig) -> Result<Arc<Self>> {
        if !Sqlite::database_exists(&db.jobs_url).await.unwrap_or(false) {
            tracing::info!(url = %db.jobs_url, "Creating job database");
            Sqlite::create_database(&db.jobs_url).await.context("Failed to create job database")?;
        }
        let pool =
            SqlitePool::connect(&db.jobs_url).await.context("Failed to connect to job database")?;
        Self::from_pool(&pool).await
    }

    /// Set up job storage on an already open pool.
    pub async fn from_pool(pool: &SqlitePool) -> Result<Arc<Self>> {
        SqliteStorage::setup(pool).await.context("Failed to set up job tables")?;
        Ok(Arc::new(Self { pipeline: create_storage(pool) }))
    }

    /// Get a clone of the pipeline storage for pushing jobs.
    pub fn pipeline(&self) -> PipelineStorage { self.pipeline.clone() }

    /// Queue the run a trigger started. Returns `false` for no-op tickets.
    /// If the job cannot be stored, the ticket's claim is released so the
    /// record does not stay in progress with no worker behind it.
    pub async fn queue_run(&self, orchestrator: &Orchestrator, ticket: &RunTicket) -> Result<bool> {
        let Some(job) = PipelineJob::from_ticket(ticket) else {
            return Ok(false);
        };
        tracing::debug!(video_id = %job.video_id, run_id = %job.run_id, "Queueing pipeline job");
        let mut storage = self.pipeline();
        if let Err(e) = storage.push(job).await.context("Failed to queue pipeline run") {
            if let Err(release) = orchestrator.release(ticket, &format!("{e:#}")).await {
                tracing::error!(
                    video_id = %ticket.video_id,
                    "Failed to release unqueued run: {}",
                    release
                );
            }
            return Err(e);
        }
        Ok(true)
    }
}

fn create_storage<T>(pool: &SqlitePool) -> SqliteStorage<T, DefaultCodec, SqliteFetcher> {
    let config = apalis_sqlite::Config::new(std::any::type_name::<T>()).with_poll_interval(
        StrategyBuilder::new()
            .apply(
                IntervalStrategy::new(Duration::from_millis(100))
                    .with_backoff(BackoffConfig::new(Duration::from_secs(1))),
            )
            .build(),
    );
    SqliteStorage::new_with_config(pool, &config)
}

/// Create the job monitor with the pipeline worker.
pub fn create_monitor(
    storage: Arc<JobStorage>,
    context: JobContext,
    config: &WorkerConfig,
) -> Result<Monitor> {
    let &WorkerConfig { pipeline_concurrency, retry_attempts, shutdown_timeout_secs } = config;

    // Only store outages reach the retry layer; the job resumes its own claim.
    let backoff = ExponentialBackoffMaker::new(
        Duration::from_secs(1),
        Duration::from_secs(120),
        1.25,
        HasherRng::default(),
    )
    .context("Invalid job retry backoff")?
    .make_backoff();
    let retry_policy = RetryPolicy::retries(retry_attempts)
        .with_backoff(backoff)
        .retry_if(|e: &BoxDynError| e.downcast_ref::<AbortError>().is_none());

    Ok(Monitor::new()
        .register(move |_| {
            WorkerBuilder::new("pipeline-worker")
                .backend(storage.pipeline())
                .retry(retry_policy.clone())
                .enable_tracing()
                .catch_panic()
                .concurrency(pipeline_concurrency.max(1))
                .data(context.clone())
                .build(process_pipeline_job)
        })
        .shutdown_timeout(Duration::from_secs(shutdown_timeout_secs)))
}
