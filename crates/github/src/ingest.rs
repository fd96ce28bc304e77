//! Turns webhook deliveries into stored commits. Ingestion never runs the
//! pipeline itself; it reports which commit should be triggered.

use std::sync::Arc;

use anyhow::Result;
use diffcast_capabilities::DiffSummarizer;
use diffcast_core::models::{Commit, PullRequestRef, Repo, WebhookDelivery};
use diffcast_db::{DeliveryPatch, Records};
use time::OffsetDateTime;

use crate::{
    CommitSource, GitHubCommit,
    webhook::{GitHubEvent, PullRequestEvent, PushEvent, WebhookPayload},
};

const NULL_SHA: &str = "0000000000000000000000000000000000000000";

#[derive(Debug)]
pub enum DeliveryOutcome {
    /// The delivery id was seen before.
    Duplicate,
    Ignored(String),
    Ingested {
        commits: Vec<Commit>,
        /// Commit id the pipeline should run for.
        trigger: Option<String>,
    },
}

#[derive(Clone)]
pub struct Ingestor {
    source: Arc<dyn CommitSource>,
    records: Records,
    summarizer: Arc<dyn DiffSummarizer>,
}

impl Ingestor {
    pub fn new(
        source: Arc<dyn CommitSource>,
        records: Records,
        summarizer: Arc<dyn DiffSummarizer>,
    ) -> Self {
        Self { source, records, summarizer }
    }

    /// Record the delivery and ingest it. A delivery id is ingested at most
    /// once successfully; a redelivery of one that failed is processed again.
    pub async fn handle_event(&self, event: &GitHubEvent) -> Result<DeliveryOutcome> {
        let payload = event.payload()?;
        let delivery = WebhookDelivery {
            delivery_id: event.delivery_id.clone(),
            event: event.kind.clone(),
            action: payload.action().map(str::to_string),
            repo_full_name: payload.repository().map(|r| r.full_name.clone()),
            processed: false,
            commits_stored: 0,
            error: None,
            created_at: OffsetDateTime::now_utc(),
        };
        if !self.records.record_delivery(&delivery).await? {
            let previous = self.records.get_delivery(&event.delivery_id).await?;
            let Some(failed) = previous.and_then(|d| d.error) else {
                tracing::info!(delivery_id = %event.delivery_id, "Duplicate delivery, skipping");
                return Ok(DeliveryOutcome::Duplicate);
            };
            tracing::info!(
                delivery_id = %event.delivery_id,
                "Processing redelivery of a failed event: {}",
                failed
            );
        }

        let result = match payload {
            WebhookPayload::Ping => Ok(DeliveryOutcome::Ignored("ping".to_string())),
            WebhookPayload::Push(push) => self.ingest_push(&push).await,
            WebhookPayload::PullRequest(pr) => self.ingest_pull_request(&pr).await,
            WebhookPayload::Other(kind) => Ok(DeliveryOutcome::Ignored(format!("{kind} event"))),
        };
        let patch = match &result {
            Ok(outcome) => DeliveryPatch {
                processed: Some(true),
                commits_stored: Some(match outcome {
                    DeliveryOutcome::Ingested { commits, .. } => commits.len() as u32,
                    _ => 0,
                }),
                error: Some(None),
            },
            Err(e) => DeliveryPatch {
                processed: Some(true),
                commits_stored: None,
                error: Some(Some(format!("{e:#}"))),
            },
        };
        if let Err(e) = self.records.update_delivery(&event.delivery_id, &patch).await {
            tracing::warn!(delivery_id = %event.delivery_id, "Failed to update delivery: {:?}", e);
        }
        result
    }

    pub async fn ingest_push(&self, push: &PushEvent) -> Result<DeliveryOutcome> {
        let Some(branch) = push.branch() else {
            return Ok(DeliveryOutcome::Ignored(format!("not a branch: {}", push.git_ref)));
        };
        if push.deleted || push.after == NULL_SHA {
            return Ok(DeliveryOutcome::Ignored(format!("branch {branch} deleted")));
        }
        let owner = push.repository.owner();
        let name = &push.repository.name;
        let repo = self.ensure_repo(owner, name, push.repository.default_branch.as_deref()).await?;
        if !repo.enabled {
            return Ok(DeliveryOutcome::Ignored(format!("{} is disabled", repo.full_name())));
        }

        let shas = if !push.commits.is_empty() {
            push.commits.iter().map(|c| c.id.clone()).collect()
        } else if push.before == NULL_SHA {
            vec![push.after.clone()]
        } else {
            self.source
                .compare(owner, name, &push.before, &push.after)
                .await?
                .into_iter()
                .map(|c| c.sha)
                .collect::<Vec<_>>()
        };
        let commits = self.store_all(owner, name, branch, &shas, None).await?;
        tracing::info!("Stored {} commits from push to {}/{}", commits.len(), owner, name);
        let trigger = commits.last().map(Commit::id);
        Ok(DeliveryOutcome::Ingested { commits, trigger })
    }

    pub async fn ingest_pull_request(&self, event: &PullRequestEvent) -> Result<DeliveryOutcome> {
        let pr = &event.pull_request;
        if event.action != "closed" || !pr.merged {
            return Ok(DeliveryOutcome::Ignored(format!("pull request {}", event.action)));
        }
        let owner = event.repository.owner();
        let name = &event.repository.name;
        let repo =
            self.ensure_repo(owner, name, event.repository.default_branch.as_deref()).await?;
        if !repo.enabled {
            return Ok(DeliveryOutcome::Ignored(format!("{} is disabled", repo.full_name())));
        }

        let shas = self
            .source
            .compare(owner, name, &pr.base.sha, &pr.head.sha)
            .await?
            .into_iter()
            .map(|c| c.sha)
            .collect::<Vec<_>>();
        let reference = PullRequestRef {
            number: pr.number,
            url: pr.html_url.clone(),
            title: pr.title.clone(),
        };
        let commits =
            self.store_all(owner, name, &pr.base.git_ref, &shas, Some(reference)).await?;
        tracing::info!(
            "Stored {} commits from pull request #{} in {}/{}",
            commits.len(),
            pr.number,
            owner,
            name
        );
        let trigger = commits
            .iter()
            .find(|c| c.sha == pr.head.sha)
            .or(commits.last())
            .map(Commit::id);
        Ok(DeliveryOutcome::Ingested { commits, trigger })
    }

    /// Fetch and store one commit on demand.
    pub async fn sync_commit(
        &self,
        owner: &str,
        name: &str,
        sha: &str,
        branch: Option<&str>,
    ) -> Result<Option<Commit>> {
        let repo = self.ensure_repo(owner, name, None).await?;
        let branch = branch.unwrap_or(&repo.default_branch);
        match self.source.fetch_commit(owner, name, sha).await? {
            Some(raw) => self.store(raw, owner, name, branch, None).await.map(Some),
            None => Ok(None),
        }
    }

    async fn ensure_repo(&self, owner: &str, name: &str, branch: Option<&str>) -> Result<Repo> {
        if let Some(repo) = self.records.get_repo(owner, name).await?
            && branch.is_none_or(|b| b == repo.default_branch)
        {
            return Ok(repo);
        }
        let mut repo = Repo::new(owner, name);
        if let Some(branch) = branch {
            repo.default_branch = branch.to_string();
        }
        self.records.upsert_repo(&repo).await
    }

    /// Store each commit in order. A commit that cannot be fetched is logged
    /// and skipped so the rest of the delivery still lands; the delivery fails
    /// only when nothing could be stored because of errors.
    async fn store_all(
        &self,
        owner: &str,
        name: &str,
        branch: &str,
        shas: &[String],
        pull_request: Option<PullRequestRef>,
    ) -> Result<Vec<Commit>> {
        let mut stored = Vec::with_capacity(shas.len());
        let mut last_error = None;
        for sha in shas {
            let result = match self.source.fetch_commit(owner, name, sha).await {
                Ok(Some(raw)) => self.store(raw, owner, name, branch, pull_request.clone()).await,
                Ok(None) => {
                    tracing::warn!("Commit {}/{}@{} not found", owner, name, sha);
                    continue;
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(commit) => stored.push(commit),
                Err(e) => {
                    tracing::error!("Failed to ingest {}/{}@{}: {:?}", owner, name, sha, e);
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if stored.is_empty() => {
                Err(e.context(format!("No commit of {owner}/{name} could be ingested")))
            }
            _ => Ok(stored),
        }
    }

    async fn store(
        &self,
        raw: GitHubCommit,
        owner: &str,
        name: &str,
        branch: &str,
        pull_request: Option<PullRequestRef>,
    ) -> Result<Commit> {
        let mut commit = raw.into_commit(owner, name, branch, pull_request);
        if !commit.files.is_empty() {
            match self.summarizer.summarize(&commit).await {
                Ok(summary) if !summary.trim().is_empty() => {
                    commit.diff_summary = Some(summary.trim().to_string());
                }
                Ok(_) => tracing::warn!("Empty diff summary for {}", commit.key()),
                Err(e) => tracing::warn!("Failed to summarize {}: {}", commit.key(), e),
            }
        }
        let commit = self.records.upsert_commit(&commit).await?;
        tracing::debug!("Stored commit {}", commit.key());
        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{
            Mutex,
            atomic::{AtomicBool, Ordering},
        },
    };

    use anyhow::bail;
    use async_trait::async_trait;
    use axum::body::Bytes;
    use diffcast_capabilities::{CapResult, CapabilityError};
    use diffcast_db::RepoPatch;

    use super::*;

    #[derive(Default)]
    struct FakeSource {
        commits: BTreeMap<String, serde_json::Value>,
        compares: Mutex<Vec<(String, String)>>,
        outage: Arc<AtomicBool>,
    }

    impl FakeSource {
        fn with(shas: &[&str]) -> Self {
            let commits = shas
                .iter()
                .map(|sha| {
                    let doc = serde_json::json!({
                        "sha": sha,
                        "commit": { "message": format!("commit {sha}"), "author": null },
                        "author": null,
                        "files": [{ "filename": "a.rs", "status": "modified", "additions": 1 }],
                    });
                    (sha.to_string(), doc)
                })
                .collect();
            Self { commits, ..Default::default() }
        }
    }

    #[async_trait]
    impl CommitSource for FakeSource {
        async fn fetch_commit(
            &self,
            _owner: &str,
            _repo: &str,
            sha: &str,
        ) -> Result<Option<GitHubCommit>> {
            if self.outage.load(Ordering::SeqCst) {
                bail!("GitHub 502 Bad Gateway");
            }
            Ok(self.commits.get(sha).map(|doc| serde_json::from_value(doc.clone()).unwrap()))
        }

        async fn compare(
            &self,
            _owner: &str,
            _repo: &str,
            base: &str,
            head: &str,
        ) -> Result<Vec<GitHubCommit>> {
            if self.outage.load(Ordering::SeqCst) {
                bail!("GitHub 502 Bad Gateway");
            }
            self.compares.lock().unwrap().push((base.to_string(), head.to_string()));
            let mut all = self.commits.keys().collect::<Vec<_>>();
            all.sort();
            Ok(all
                .into_iter()
                .filter(|sha| sha.as_str() > base && sha.as_str() <= head)
                .map(|sha| serde_json::from_value(self.commits[sha].clone()).unwrap())
                .collect())
        }
    }

    struct Summarizer(bool);

    #[async_trait]
    impl DiffSummarizer for Summarizer {
        async fn summarize(&self, commit: &Commit) -> CapResult<String> {
            if self.0 {
                Ok(format!("Summary of {}", commit.sha_short()))
            } else {
                Err(CapabilityError::Transient("model overloaded".into()))
            }
        }
    }

    fn ingestor(source: FakeSource, summaries: bool) -> (Ingestor, Records) {
        let records = Records::in_memory();
        let ingestor =
            Ingestor::new(Arc::new(source), records.clone(), Arc::new(Summarizer(summaries)));
        (ingestor, records)
    }

    fn event(kind: &str, delivery_id: &str, body: serde_json::Value) -> GitHubEvent {
        GitHubEvent {
            kind: kind.to_string(),
            delivery_id: delivery_id.to_string(),
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
        }
    }

    fn push(before: &str, after: &str, commits: &[&str]) -> serde_json::Value {
        serde_json::json!({
            "ref": "refs/heads/main",
            "before": before,
            "after": after,
            "commits": commits.iter().map(|id| serde_json::json!({ "id": id })).collect::<Vec<_>>(),
            "repository": { "name": "hello", "full_name": "octo/hello", "default_branch": "main" },
        })
    }

    fn merged_pr(action: &str, merged: bool) -> serde_json::Value {
        serde_json::json!({
            "action": action,
            "pull_request": {
                "number": 42,
                "title": "Dark mode",
                "html_url": "https://github.com/octo/hello/pull/42",
                "merged": merged,
                "base": { "ref": "main", "sha": "a000000" },
                "head": { "ref": "dark", "sha": "c000000" },
            },
            "repository": { "name": "hello", "full_name": "octo/hello" },
        })
    }

    #[tokio::test]
    async fn test_push_stores_commits_and_triggers_newest() {
        let (ingestor, records) = ingestor(FakeSource::with(&["b111111", "c222222"]), true);
        let outcome = ingestor
            .handle_event(&event("push", "d1", push("a000000", "c222222", &["b111111", "c222222"])))
            .await
            .unwrap();
        let DeliveryOutcome::Ingested { commits, trigger } = outcome else {
            panic!("not ingested")
        };
        assert_eq!(commits.len(), 2);
        assert_eq!(trigger.as_deref(), Some("octo_hello_c222222"));
        let stored = records.get_commit("octo_hello_b111111").await.unwrap().unwrap();
        assert_eq!(stored.diff_summary.as_deref(), Some("Summary of b111111"));
        assert_eq!(stored.branch, "main");
        assert!(records.get_repo("octo", "hello").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_skipped() {
        let (ingestor, _records) = ingestor(FakeSource::with(&["b111111"]), true);
        let body = push("a000000", "b111111", &["b111111"]);
        ingestor.handle_event(&event("push", "d1", body.clone())).await.unwrap();
        let outcome = ingestor.handle_event(&event("push", "d1", body)).await.unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Duplicate));
    }

    #[tokio::test]
    async fn test_empty_push_falls_back_to_compare() {
        let source = FakeSource::with(&["b111111", "c222222"]);
        let (ingestor, _records) = ingestor(source, true);
        let outcome = ingestor
            .handle_event(&event("push", "d2", push("a000000", "c222222", &[])))
            .await
            .unwrap();
        let DeliveryOutcome::Ingested { commits, .. } = outcome else { panic!("not ingested") };
        assert_eq!(commits.iter().map(|c| c.sha.as_str()).collect::<Vec<_>>(), [
            "b111111", "c222222"
        ]);
    }

    #[tokio::test]
    async fn test_summary_failure_still_stores_commit() {
        let (ingestor, records) = ingestor(FakeSource::with(&["b111111"]), false);
        ingestor
            .handle_event(&event("push", "d3", push("a000000", "b111111", &["b111111"])))
            .await
            .unwrap();
        let stored = records.get_commit("octo_hello_b111111").await.unwrap().unwrap();
        assert!(stored.diff_summary.is_none());
    }

    #[tokio::test]
    async fn test_disabled_repository_is_ignored() {
        let (ingestor, records) = ingestor(FakeSource::with(&["b111111"]), true);
        records.upsert_repo(&Repo::new("octo", "hello")).await.unwrap();
        let patch = RepoPatch { enabled: Some(false), ..Default::default() };
        records.update_repo("octo", "hello", &patch).await.unwrap();
        let outcome = ingestor
            .handle_event(&event("push", "d4", push("a000000", "b111111", &["b111111"])))
            .await
            .unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Ignored(_)));
        assert!(records.get_commit("octo_hello_b111111").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merged_pull_request_triggers_head() {
        let (ingestor, records) = ingestor(FakeSource::with(&["b000000", "c000000"]), true);
        let outcome =
            ingestor.handle_event(&event("pull_request", "d5", merged_pr("closed", true))).await;
        let DeliveryOutcome::Ingested { commits, trigger } = outcome.unwrap() else {
            panic!("not ingested")
        };
        assert_eq!(commits.len(), 2);
        assert_eq!(trigger.as_deref(), Some("octo_hello_c000000"));
        let stored = records.get_commit("octo_hello_b000000").await.unwrap().unwrap();
        let pr = stored.pull_request.unwrap();
        assert_eq!(pr.number, 42);
        assert_eq!(pr.title.as_deref(), Some("Dark mode"));
    }

    #[tokio::test]
    async fn test_unmerged_pull_request_is_ignored() {
        let (ingestor, _records) = ingestor(FakeSource::with(&["c000000"]), true);
        for (i, (action, merged)) in [("closed", false), ("opened", false)].into_iter().enumerate()
        {
            let event = event("pull_request", &format!("d{i}"), merged_pr(action, merged));
            let outcome = ingestor.handle_event(&event).await.unwrap();
            assert!(matches!(outcome, DeliveryOutcome::Ignored(_)), "{action}");
        }
    }

    #[tokio::test]
    async fn test_failed_delivery_is_processed_on_redelivery() {
        let source = FakeSource::with(&["b000000", "c000000"]);
        let outage = source.outage.clone();
        let (ingestor, records) = ingestor(source, true);
        let delivery = event("pull_request", "d9", merged_pr("closed", true));

        outage.store(true, Ordering::SeqCst);
        let error = ingestor.handle_event(&delivery).await.unwrap_err();
        assert!(format!("{error:#}").contains("502"));
        let stored = records.get_delivery("d9").await.unwrap().unwrap();
        assert!(stored.error.is_some());

        outage.store(false, Ordering::SeqCst);
        let outcome = ingestor.handle_event(&delivery).await.unwrap();
        let DeliveryOutcome::Ingested { trigger, .. } = outcome else { panic!("not ingested") };
        assert_eq!(trigger.as_deref(), Some("octo_hello_c000000"));
        assert!(records.get_commit("octo_hello_c000000").await.unwrap().is_some());
        let stored = records.get_delivery("d9").await.unwrap().unwrap();
        assert!(stored.processed);
        assert_eq!(stored.commits_stored, 2);
        assert!(stored.error.is_none());

        let again = ingestor.handle_event(&delivery).await.unwrap();
        assert!(matches!(again, DeliveryOutcome::Duplicate));
    }

    #[tokio::test]
    async fn test_push_fails_when_no_commit_could_be_fetched() {
        let source = FakeSource::with(&["b111111"]);
        source.outage.store(true, Ordering::SeqCst);
        let (ingestor, records) = ingestor(source, true);
        let result = ingestor
            .handle_event(&event("push", "d10", push("a000000", "b111111", &["b111111"])))
            .await;
        assert!(result.is_err());
        let stored = records.get_delivery("d10").await.unwrap().unwrap();
        assert_eq!(stored.commits_stored, 0);
        assert!(stored.error.unwrap().contains("No commit of octo/hello"));
    }

    #[tokio::test]
    async fn test_sync_commit() {
        let (ingestor, _records) = ingestor(FakeSource::with(&["b111111"]), true);
        let commit = ingestor.sync_commit("octo", "hello", "b111111", None).await.unwrap();
        assert_eq!(commit.unwrap().branch, "main");
        let missing = ingestor.sync_commit("octo", "hello", "f999999", None).await.unwrap();
        assert!(missing.is_none());
    }
}
