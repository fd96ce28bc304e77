//! Drives a commit through the demo-video pipeline: stage executors, the
//! orchestrator state machine with its per-language fan-out, and the status
//! projection served to pollers.

pub mod executors;
pub mod localize;
pub mod orchestrator;
pub mod status;

use diffcast_core::video::Stage;
pub use executors::{StageError, StageOutput};
pub use orchestrator::{Orchestrator, RunOutcome, RunTicket, TriggerRequest};
pub use status::{StatusView, TrackSummary, project};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("commit {0} not found")]
    CommitNotFound(String),
    #[error("pipeline record {0} not found")]
    VideoNotFound(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("stage {stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StageError,
    },
    /// The record store could not be read or written. Retryable by the caller.
    #[error("record store unavailable: {0:#}")]
    Store(anyhow::Error),
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self { Self::Store(err) }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
