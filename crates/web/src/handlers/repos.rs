use std::str::FromStr;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use diffcast_core::{AppError, models::Repo, video::PipelineStatus};
use diffcast_db::RepoPatch;
use diffcast_github::extract_github_url;
use diffcast_pipeline::project;
use serde::{Deserialize, Deserializer};
use url::Url;

use crate::{AppState, handlers::clamp_limit};

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn check_website_url(url: &str) -> Result<(), AppError> {
    match Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(AppError::bad_request(format!("invalid website URL '{url}'"))),
    }
}

pub async fn list_repos(State(state): State<AppState>) -> Result<Response, AppError> {
    let repos = state.records.list_repos().await.map_err(AppError::Unavailable)?;
    Ok(Json(repos).into_response())
}

#[derive(Deserialize)]
pub struct AddRepoBody {
    repo_url: String,
    #[serde(default)]
    website_url: Option<String>,
}

pub async fn add_repo(
    State(state): State<AppState>,
    Json(body): Json<AddRepoBody>,
) -> Result<Response, AppError> {
    let Some((owner, name)) = extract_github_url(body.repo_url.trim()) else {
        return Err(AppError::bad_request("Invalid repository URL"));
    };
    if let Some(url) = &body.website_url {
        check_website_url(url)?;
    }
    let Some(default_branch) = state.github.default_branch(owner, name).await? else {
        return Err(AppError::not_found(format!("Repository {owner}/{name} not found")));
    };
    let mut repo = Repo::new(owner, name);
    repo.default_branch = default_branch;
    let mut repo = state.records.upsert_repo(&repo).await.map_err(AppError::Unavailable)?;
    if body.website_url.is_some() {
        let patch = RepoPatch { website_url: Some(body.website_url), ..Default::default() };
        if let Some(updated) = state
            .records
            .update_repo(owner, name, &patch)
            .await
            .map_err(AppError::Unavailable)?
        {
            repo = updated;
        }
    }
    tracing::info!("Added repository {}", repo.full_name());
    Ok((StatusCode::CREATED, Json(repo)).into_response())
}

#[derive(Deserialize)]
pub struct UpdateRepoBody {
    #[serde(default, deserialize_with = "double_option")]
    website_url: Option<Option<String>>,
    #[serde(default)]
    enabled: Option<bool>,
}

pub async fn update_repo(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Json(body): Json<UpdateRepoBody>,
) -> Result<Response, AppError> {
    if let Some(Some(url)) = &body.website_url {
        check_website_url(url)?;
    }
    let patch =
        RepoPatch { website_url: body.website_url, enabled: body.enabled, ..Default::default() };
    let repo = state
        .records
        .update_repo(&owner, &name, &patch)
        .await
        .map_err(AppError::Unavailable)?
        .ok_or_else(|| AppError::not_found(format!("Repository {owner}/{name} not found")))?;
    Ok(Json(repo).into_response())
}

#[derive(Deserialize)]
pub struct ListQuery {
    limit: Option<usize>,
    status: Option<String>,
}

pub async fn list_commits(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
) -> Result<Response, AppError> {
    let commits = state
        .records
        .list_commits(&owner, &name, clamp_limit(query.limit))
        .await
        .map_err(AppError::Unavailable)?;
    Ok(Json(commits).into_response())
}

/// Status projections of a repository's pipeline records, newest first.
pub async fn list_videos(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Query(query): Query<ListQuery>,
) -> Result<Response, AppError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            PipelineStatus::from_str(s)
                .map_err(|_| AppError::bad_request(format!("unknown status '{s}'")))?,
        ),
        None => None,
    };
    let videos = state
        .records
        .list_videos(&owner, &name, status, clamp_limit(query.limit))
        .await
        .map_err(AppError::Unavailable)?;
    let mut views = Vec::with_capacity(videos.len());
    for video in &videos {
        let commit = state.records.get_commit(&video.id).await.map_err(AppError::Unavailable)?;
        views.push(project(video, commit.as_ref()));
    }
    Ok(Json(views).into_response())
}

#[derive(Deserialize)]
pub struct SyncCommitBody {
    owner: String,
    repo: String,
    sha: String,
    #[serde(default)]
    branch: Option<String>,
}

pub async fn sync_commit(
    State(state): State<AppState>,
    Json(body): Json<SyncCommitBody>,
) -> Result<Response, AppError> {
    let commit = state
        .ingestor
        .sync_commit(&body.owner, &body.repo, body.sha.trim(), body.branch.as_deref())
        .await?
        .ok_or_else(|| {
            let key = format!("{}/{}@{}", body.owner, body.repo, body.sha);
            AppError::not_found(format!("Commit {key} not found"))
        })?;
    Ok(Json(commit).into_response())
}
