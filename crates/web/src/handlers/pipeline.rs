use std::str::FromStr;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use diffcast_core::{AppError, video::Stage};
use diffcast_pipeline::{RunOutcome, StatusView, TriggerRequest, project};
use serde::{Deserialize, Serialize};

use crate::{
    AppState,
    handlers::{CommitSelector, pipeline_error},
};

fn parse_stage(stage: &str) -> Result<Stage, AppError> {
    Stage::from_str(stage.trim())
        .map_err(|_| AppError::bad_request(format!("unknown stage '{stage}'")))
}

#[derive(Deserialize)]
pub struct TriggerBody {
    #[serde(flatten)]
    commit: CommitSelector,
    #[serde(default)]
    languages: Option<Vec<String>>,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    from_stage: Option<String>,
}

#[derive(Serialize)]
struct TriggerResponse {
    outcome: RunOutcome,
    run_id: Option<String>,
    status: StatusView,
}

/// Claim the record and queue the run. Responds before any stage executes.
pub async fn trigger(
    State(state): State<AppState>,
    Json(body): Json<TriggerBody>,
) -> Result<Response, AppError> {
    let commit_id = body.commit.resolve()?;
    let from_stage = body.from_stage.as_deref().map(parse_stage).transpose()?;
    let request =
        TriggerRequest { commit_id, languages: body.languages, force: body.force, from_stage };
    let ticket = state.orchestrator.trigger(&request).await.map_err(pipeline_error)?;
    state.jobs.queue_run(&state.orchestrator, &ticket).await.map_err(AppError::Unavailable)?;

    let commit = state.records.get_commit(&ticket.video_id).await.map_err(AppError::Unavailable)?;
    let code = match ticket.outcome {
        RunOutcome::Started => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    let response = TriggerResponse {
        outcome: ticket.outcome,
        run_id: ticket.run_id,
        status: project(&ticket.video, commit.as_ref()),
    };
    Ok((code, Json(response)).into_response())
}

#[derive(Deserialize)]
pub struct TestStageBody {
    #[serde(flatten)]
    commit: CommitSelector,
    stage: String,
    #[serde(default)]
    language: Option<String>,
}

/// Run one stage in isolation. Nothing is persisted.
pub async fn test_stage(
    State(state): State<AppState>,
    Json(body): Json<TestStageBody>,
) -> Result<Response, AppError> {
    let commit_id = body.commit.resolve()?;
    let stage = parse_stage(&body.stage)?;
    let output = state
        .orchestrator
        .test_stage(&commit_id, stage, body.language.as_deref())
        .await
        .map_err(pipeline_error)?;
    Ok(Json(output).into_response())
}

pub async fn get_status(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
) -> Result<Response, AppError> {
    let view = state.orchestrator.status(&video_id).await.map_err(pipeline_error)?;
    Ok(Json(view).into_response())
}

pub async fn get_record(
    State(state): State<AppState>,
    Path(video_id): Path<String>,
) -> Result<Response, AppError> {
    let video = state
        .records
        .get_video(&video_id)
        .await
        .map_err(AppError::Unavailable)?
        .ok_or_else(|| AppError::not_found(format!("pipeline record {video_id} not found")))?;
    Ok(Json(video).into_response())
}
