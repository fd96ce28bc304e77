use std::sync::Arc;

use anyhow::{Context, Result, bail};
use diffcast_core::{
    models::{Commit, Repo, WebhookDelivery},
    util::repo_id,
    video::{PipelineStatus, Video},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::{
    memory::MemoryStore,
    patch::{CommitPatch, DeliveryPatch, RepoPatch, VideoPatch},
    store::{COMMITS, DocumentStore, Query, REPOS, VIDEOS, WEBHOOK_DELIVERIES},
};

/// Commit fields owned by ingestion. Re-ingesting a commit only touches these,
/// leaving summaries and demo state alone unless new values are supplied.
const INGESTED_COMMIT_FIELDS: &[&str] = &[
    "sha",
    "branch",
    "message",
    "author",
    "timestamp",
    "pull_request",
    "files",
    "diff_summary",
];

/// Typed access to the four record collections.
#[derive(Clone)]
pub struct Records {
    store: Arc<dyn DocumentStore>,
}

impl Records {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self { Self { store } }

    pub fn in_memory() -> Self { Self::new(Arc::new(MemoryStore::new())) }

    pub fn store(&self) -> &Arc<dyn DocumentStore> { &self.store }

    async fn load<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>> {
        match self.store.get(collection, id).await? {
            Some(doc) => Ok(Some(
                serde_json::from_value(doc)
                    .with_context(|| format!("Malformed document {collection}/{id}"))?,
            )),
            None => Ok(None),
        }
    }

    async fn create<T: Serialize + DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
        doc: &T,
    ) -> Result<(T, bool)> {
        let (doc, created) =
            self.store.create_if_absent(collection, id, serde_json::to_value(doc)?).await?;
        let doc = serde_json::from_value(doc)
            .with_context(|| format!("Malformed document {collection}/{id}"))?;
        Ok((doc, created))
    }

    async fn patch<T: DeserializeOwned>(
        &self,
        collection: &str,
        id: &str,
        mut patch: Value,
        touch: bool,
    ) -> Result<Option<T>> {
        if touch && let Value::Object(map) = &mut patch {
            map.insert("updated_at".to_string(), Value::String(now_rfc3339()?));
        }
        match self.store.merge(collection, id, &patch).await? {
            Some(doc) => Ok(Some(
                serde_json::from_value(doc)
                    .with_context(|| format!("Malformed document {collection}/{id}"))?,
            )),
            None => Ok(None),
        }
    }

    async fn query<T: DeserializeOwned>(&self, collection: &str, query: &Query) -> Result<Vec<T>> {
        self.store
            .list(collection, query)
            .await?
            .into_iter()
            .map(|doc| {
                serde_json::from_value(doc)
                    .with_context(|| format!("Malformed document in {collection}"))
            })
            .collect()
    }

    pub async fn get_repo(&self, owner: &str, name: &str) -> Result<Option<Repo>> {
        self.load(REPOS, &repo_id(owner, name)).await
    }

    /// Create the repository, or refresh its default branch if it exists.
    pub async fn upsert_repo(&self, repo: &Repo) -> Result<Repo> {
        let (existing, created) = self.create(REPOS, &repo.id(), repo).await?;
        if created || existing.default_branch == repo.default_branch {
            return Ok(existing);
        }
        let patch =
            RepoPatch { default_branch: Some(repo.default_branch.clone()), ..Default::default() };
        self.update_repo(&repo.owner, &repo.name, &patch)
            .await?
            .with_context(|| format!("Repository {} vanished", repo.full_name()))
    }

    pub async fn update_repo(
        &self,
        owner: &str,
        name: &str,
        patch: &RepoPatch,
    ) -> Result<Option<Repo>> {
        self.patch(REPOS, &repo_id(owner, name), serde_json::to_value(patch)?, true).await
    }

    pub async fn list_repos(&self) -> Result<Vec<Repo>> { self.query(REPOS, &Query::new()).await }

    pub async fn get_commit(&self, id: &str) -> Result<Option<Commit>> {
        self.load(COMMITS, id).await
    }

    /// Store a commit, or update the ingestion-owned fields of an existing one.
    pub async fn upsert_commit(&self, commit: &Commit) -> Result<Commit> {
        let id = commit.id();
        let (existing, created) = self.create(COMMITS, &id, commit).await?;
        if created {
            return Ok(existing);
        }
        let Value::Object(fields) = serde_json::to_value(commit)? else {
            bail!("Commit {id} did not serialize to an object");
        };
        let patch = fields
            .into_iter()
            .filter(|(k, v)| INGESTED_COMMIT_FIELDS.contains(&k.as_str()) && !v.is_null())
            .collect::<serde_json::Map<_, _>>();
        self.patch(COMMITS, &id, Value::Object(patch), true)
            .await?
            .with_context(|| format!("Commit {id} vanished"))
    }

    pub async fn update_commit(&self, id: &str, patch: &CommitPatch) -> Result<Commit> {
        match self.patch(COMMITS, id, serde_json::to_value(patch)?, true).await? {
            Some(commit) => Ok(commit),
            None => bail!("Commit {id} not found"),
        }
    }

    pub async fn list_commits(&self, owner: &str, repo: &str, limit: usize) -> Result<Vec<Commit>> {
        let query = Query::new().eq("owner", owner).eq("repo", repo).limit(limit);
        self.query(COMMITS, &query).await
    }

    pub async fn get_video(&self, id: &str) -> Result<Option<Video>> {
        self.load(VIDEOS, id).await
    }

    pub async fn create_video_if_absent(&self, video: &Video) -> Result<(Video, bool)> {
        self.create(VIDEOS, &video.id, video).await
    }

    pub async fn update_video(&self, id: &str, patch: &VideoPatch) -> Result<Video> {
        match self.patch(VIDEOS, id, serde_json::to_value(patch)?, true).await? {
            Some(video) => Ok(video),
            None => bail!("Video {id} not found"),
        }
    }

    pub async fn list_videos(
        &self,
        owner: &str,
        repo: &str,
        status: Option<PipelineStatus>,
        limit: usize,
    ) -> Result<Vec<Video>> {
        let mut query = Query::new().eq("owner", owner).eq("repo", repo).limit(limit);
        if let Some(status) = status {
            query = query.eq("status", status.as_str());
        }
        self.query(VIDEOS, &query).await
    }

    /// Records that are queued or running, candidates for recovery.
    pub async fn list_active_videos(&self) -> Result<Vec<Video>> {
        let statuses = [PipelineStatus::Queued, PipelineStatus::Running];
        let query = Query::new().any_of("status", statuses.iter().map(|s| s.as_str().to_string()));
        self.query(VIDEOS, &query).await
    }

    /// Returns `false` if this delivery id was already recorded.
    pub async fn record_delivery(&self, delivery: &WebhookDelivery) -> Result<bool> {
        let (_, created) = self.create(WEBHOOK_DELIVERIES, &delivery.delivery_id, delivery).await?;
        Ok(created)
    }

    pub async fn get_delivery(&self, delivery_id: &str) -> Result<Option<WebhookDelivery>> {
        self.load(WEBHOOK_DELIVERIES, delivery_id).await
    }

    pub async fn update_delivery(&self, delivery_id: &str, patch: &DeliveryPatch) -> Result<()> {
        self.patch::<WebhookDelivery>(
            WEBHOOK_DELIVERIES,
            delivery_id,
            serde_json::to_value(patch)?,
            false,
        )
        .await?;
        Ok(())
    }
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).context("Failed to format timestamp")
}
