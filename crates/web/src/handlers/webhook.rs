use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use diffcast_core::AppError;
use diffcast_github::{ingest::DeliveryOutcome, webhook::GitHubEvent};
use diffcast_pipeline::TriggerRequest;

use crate::{AppState, handlers::pipeline_error};

/// Store the delivered commits, then queue a pipeline run for the commit the
/// event points at.
pub async fn webhook(
    State(state): State<AppState>,
    event: GitHubEvent,
) -> Result<Response, AppError> {
    tracing::info!(delivery_id = %event.delivery_id, "Received webhook event {}", event.kind);
    let outcome = state.ingestor.handle_event(&event).await.with_context(|| {
        format!("Failed to ingest {} delivery {}", event.kind, event.delivery_id)
    })?;
    match outcome {
        DeliveryOutcome::Duplicate => Ok((StatusCode::OK, "Duplicate delivery").into_response()),
        DeliveryOutcome::Ignored(reason) => {
            tracing::debug!(delivery_id = %event.delivery_id, "Ignored: {}", reason);
            Ok((StatusCode::OK, format!("Ignored: {reason}")).into_response())
        }
        DeliveryOutcome::Ingested { commits, trigger } => {
            if let Some(commit_id) = trigger {
                let ticket = state
                    .orchestrator
                    .trigger(&TriggerRequest::new(commit_id))
                    .await
                    .map_err(pipeline_error)?;
                state
                    .jobs
                    .queue_run(&state.orchestrator, &ticket)
                    .await
                    .map_err(AppError::Unavailable)?;
                tracing::info!(
                    delivery_id = %event.delivery_id,
                    video_id = %ticket.video_id,
                    "Pipeline trigger: {}",
                    ticket.outcome.as_str()
                );
            }
            Ok((StatusCode::OK, format!("Stored {} commits", commits.len())).into_response())
        }
    }
}
