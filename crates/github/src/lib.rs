pub mod ingest;
pub mod webhook;

use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use diffcast_core::{
    config::GitHubConfig,
    models::{ChangeKind, Commit, CommitAuthor, FileChange, PullRequestRef},
};
use http::StatusCode;
use octocrab::{GitHubError, Octocrab};
use regex::Regex;
use serde::Deserialize;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

#[derive(Clone)]
pub struct GitHub {
    pub client: Octocrab,
}

/// A commit as returned by `GET /repos/{owner}/{repo}/commits/{sha}`.
/// Commits listed by a comparison carry no `files`.
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubCommit {
    pub sha: String,
    pub commit: GitCommitDetail,
    pub author: Option<GitHubUser>,
    #[serde(default)]
    pub files: Vec<GitHubFile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitCommitDetail {
    pub message: String,
    pub author: Option<GitActor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitActor {
    pub name: String,
    pub email: Option<String>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubUser {
    pub login: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubFile {
    pub filename: String,
    pub status: String,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
    pub patch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct Comparison {
    #[serde(default)]
    commits: Vec<GitHubCommit>,
}

impl GitHubCommit {
    pub fn into_commit(
        self,
        owner: &str,
        repo: &str,
        branch: &str,
        pull_request: Option<PullRequestRef>,
    ) -> Commit {
        let now = OffsetDateTime::now_utc();
        let timestamp = self
            .commit
            .author
            .as_ref()
            .and_then(|a| a.date.as_deref())
            .and_then(|d| OffsetDateTime::parse(d, &Rfc3339).ok())
            .unwrap_or(now);
        let avatar_url = self.author.and_then(|u| u.avatar_url);
        let author = self.commit.author.map(|a| CommitAuthor {
            name: a.name,
            email: a.email,
            avatar_url: avatar_url.clone(),
        });
        let message = self.commit.message.trim().to_string();
        Commit {
            owner: owner.to_string(),
            repo: repo.to_string(),
            sha: self.sha,
            branch: branch.to_string(),
            message: (!message.is_empty()).then_some(message),
            author,
            timestamp,
            pull_request,
            files: self
                .files
                .into_iter()
                .map(|f| FileChange {
                    kind: ChangeKind::from_github_status(&f.status),
                    path: f.filename,
                    additions: f.additions,
                    deletions: f.deletions,
                    patch: f.patch,
                })
                .collect(),
            diff_summary: None,
            demo_goal: None,
            demo: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Where ingestion reads commit diffs from.
#[async_trait]
pub trait CommitSource: Send + Sync {
    async fn fetch_commit(&self, owner: &str, repo: &str, sha: &str)
    -> Result<Option<GitHubCommit>>;

    /// Commits reachable from `head` but not `base`, oldest first.
    async fn compare(
        &self,
        owner: &str,
        repo: &str,
        base: &str,
        head: &str,
    ) -> Result<Vec<GitHubCommit>>;
}

fn is_not_found(e: &octocrab::Error) -> bool {
    matches!(e, octocrab::Error::GitHub { source, .. }
        if matches!(**source, GitHubError { status_code: StatusCode::NOT_FOUND, .. }))
}

impl GitHub {
    pub async fn new(config: &GitHubConfig) -> Result<Arc<Self>> {
        let client = Octocrab::builder()
            .personal_token(config.token.clone())
            .build()
            .context("Failed to create GitHub client")?;
        let profile = client.current().user().await.context("Failed to fetch current user")?;
        tracing::info!("Logged in as {}", profile.login);
        Ok(Arc::new(Self { client }))
    }

    /// Default branch of a repository, or `None` if it does not exist.
    pub async fn default_branch(&self, owner: &str, repo: &str) -> Result<Option<String>> {
        match self.client.repos(owner, repo).get().await {
            Ok(repo) => Ok(Some(repo.default_branch.unwrap_or_else(|| "main".to_string()))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to fetch repository {owner}/{repo}")),
        }
    }
}

#[async_trait]
impl CommitSource for GitHub {
    async fn fetch_commit(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<Option<GitHubCommit>> {
        let route = format!("/repos/{owner}/{repo}/commits/{sha}");
        match self.client.get::<GitHubCommit, _, ()>(route, None).await {
            Ok(commit) => Ok(Some(commit)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to fetch commit {owner}/{repo}@{sha}"))
            }
        }
    }

    async fn compare(
        &self,
        owner: &str,
        repo: &str,
        base: &str,
        head: &str,
    ) -> Result<Vec<GitHubCommit>> {
        let route = format!("/repos/{owner}/{repo}/compare/{base}...{head}");
        let comparison: Comparison = self
            .client
            .get(route, None::<&()>)
            .await
            .with_context(|| format!("Failed to compare {owner}/{repo} {base}...{head}"))?;
        Ok(comparison.commits)
    }
}

pub fn extract_github_url(url: &str) -> Option<(&str, &str)> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let caps = REGEX
        .get_or_init(|| {
            Regex::new(r"^https?://github\.com/(?P<owner>[^/]+)/(?P<repo>[^/]+?)(?:\.git)?(?:/|$)")
                .unwrap()
        })
        .captures(url)?;
    let owner = caps.name("owner").map(|m| m.as_str()).unwrap_or_default();
    let repo = caps.name("repo").map(|m| m.as_str()).unwrap_or_default();
    Some((owner, repo))
}
