use std::path::Path;

use axum::{
    Router,
    extract::Request,
    http::{HeaderValue, StatusCode, header},
    routing::{get, post, put},
};
use diffcast_core::{AppError, util::commit_id};
use diffcast_pipeline::PipelineError;
use serde::Deserialize;
use tower::ServiceExt;
use tower_http::services::ServeDir;

use crate::AppState;

mod pipeline;
mod repos;
mod webhook;

pub fn build_router(media_dir: &Path) -> Router<AppState> {
    Router::new()
        .nest_service(
            "/media",
            <ServeDir as ServiceExt<Request>>::map_response(
                ServeDir::new(media_dir),
                |mut response| {
                    // Artifacts are rewritten in place when a stage is replayed
                    response.headers_mut().insert(
                        header::CACHE_CONTROL,
                        HeaderValue::from_static("public, max-age=300, must-revalidate"),
                    );
                    response
                },
            ),
        )
        .route("/api/github/webhook", post(webhook::webhook))
        .route("/api/pipeline/commit", post(pipeline::trigger))
        .route("/api/pipeline/test", post(pipeline::test_stage))
        .route("/api/videos/{video_id}", get(pipeline::get_status))
        .route("/api/videos/{video_id}/record", get(pipeline::get_record))
        .route("/api/repos", get(repos::list_repos).post(repos::add_repo))
        .route("/api/repos/{owner}/{repo}", put(repos::update_repo))
        .route("/api/repos/{owner}/{repo}/commits", get(repos::list_commits))
        .route("/api/repos/{owner}/{repo}/videos", get(repos::list_videos))
        .route("/api/sync/commit", post(repos::sync_commit))
}

pub fn pipeline_error(err: PipelineError) -> AppError {
    match err {
        e @ (PipelineError::CommitNotFound(_) | PipelineError::VideoNotFound(_)) => {
            AppError::not_found(e.to_string())
        }
        PipelineError::InvalidRequest(message) => AppError::bad_request(message),
        PipelineError::Store(e) => AppError::Unavailable(e),
        e @ PipelineError::Stage { .. } => {
            AppError::Message(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        }
    }
}

/// A commit named either by id or by `owner`, `repo` and `sha`.
#[derive(Debug, Default, Deserialize)]
pub struct CommitSelector {
    pub commit_id: Option<String>,
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub sha: Option<String>,
}

impl CommitSelector {
    pub fn resolve(&self) -> Result<String, AppError> {
        if let Some(id) = self.commit_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            return Ok(id.to_string());
        }
        match (&self.owner, &self.repo, &self.sha) {
            (Some(owner), Some(repo), Some(sha)) if !sha.trim().is_empty() => {
                Ok(commit_id(owner.trim(), repo.trim(), sha.trim()))
            }
            _ => Err(AppError::bad_request("commit_id or owner, repo and sha are required")),
        }
    }
}

pub fn clamp_limit(limit: Option<usize>) -> usize { limit.unwrap_or(20).clamp(1, 100) }
