use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::util::{commit_id, repo_id, short_sha};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    pub owner: String,
    pub name: String,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// Site the demo recorder drives for this repository.
    pub website_url: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

fn default_branch() -> String { "main".to_string() }

fn default_enabled() -> bool { true }

impl Repo {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            owner: owner.into(),
            name: name.into(),
            default_branch: default_branch(),
            website_url: None,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> String { repo_id(&self.owner, &self.name) }

    pub fn full_name(&self) -> String { format!("{}/{}", self.owner, self.name) }

    pub fn repo_url(&self) -> String { format!("https://github.com/{}/{}", self.owner, self.name) }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

impl ChangeKind {
    /// Map a GitHub file status onto the three kinds tracked here.
    pub fn from_github_status(status: &str) -> Self {
        match status {
            "added" => Self::Added,
            "removed" => Self::Removed,
            _ => Self::Modified,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Removed => "removed",
            Self::Modified => "modified",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    pub additions: u64,
    pub deletions: u64,
    pub patch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitAuthor {
    pub name: String,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestRef {
    pub number: u64,
    pub url: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DemoStatus {
    Running,
    Completed,
    Failed,
}

/// Outcome of the browser-driven demo recording, kept on the commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemoOutcome {
    pub status: DemoStatus,
    pub video_url: Option<String>,
    pub error: Option<String>,
}

/// Identity of a commit: repository plus the short content hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitKey {
    pub owner: String,
    pub repo: String,
    pub sha_short: String,
}

impl CommitKey {
    pub fn new(owner: &str, repo: &str, sha: &str) -> Self {
        Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            sha_short: short_sha(sha).to_string(),
        }
    }

    /// Document id shared by the commit and its pipeline record.
    pub fn id(&self) -> String { commit_id(&self.owner, &self.repo, &self.sha_short) }
}

impl fmt::Display for CommitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.owner, self.repo, self.sha_short)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub owner: String,
    pub repo: String,
    pub sha: String,
    pub branch: String,
    pub message: Option<String>,
    pub author: Option<CommitAuthor>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub pull_request: Option<PullRequestRef>,
    #[serde(default)]
    pub files: Vec<FileChange>,
    pub diff_summary: Option<String>,
    pub demo_goal: Option<String>,
    pub demo: Option<DemoOutcome>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Commit {
    pub fn key(&self) -> CommitKey { CommitKey::new(&self.owner, &self.repo, &self.sha) }

    pub fn id(&self) -> String { self.key().id() }

    pub fn sha_short(&self) -> &str { short_sha(&self.sha) }

    pub fn repo_id(&self) -> String { repo_id(&self.owner, &self.repo) }

    pub fn full_name(&self) -> String { format!("{}/{}", self.owner, self.repo) }

    pub fn demo_in_flight(&self) -> bool {
        self.demo.as_ref().is_some_and(|d| d.status == DemoStatus::Running)
    }
}

/// Audit record of one webhook delivery, keyed by the provider delivery id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub delivery_id: String,
    pub event: String,
    pub action: Option<String>,
    pub repo_full_name: Option<String>,
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub commits_stored: u32,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl FromStr for ChangeKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "added" => Ok(Self::Added),
            "removed" => Ok(Self::Removed),
            "modified" => Ok(Self::Modified),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_kind_from_github_status() {
        let cases = [
            ("added", ChangeKind::Added),
            ("removed", ChangeKind::Removed),
            ("modified", ChangeKind::Modified),
            ("renamed", ChangeKind::Modified),
            ("copied", ChangeKind::Modified),
        ];
        for (status, expected) in cases {
            assert_eq!(ChangeKind::from_github_status(status), expected);
        }
    }

    #[test]
    fn test_commit_key_is_content_addressed() {
        let a = CommitKey::new("octo", "hello-world", "abc1234def5678");
        let b = CommitKey::new("octo", "hello-world", "abc1234ffffff");
        assert_eq!(a.id(), "octo_hello-world_abc1234");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "octo/hello-world@abc1234");
    }
}
