use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use diffcast_capabilities::Capabilities;
use diffcast_core::{
    config::PipelineConfig,
    models::{Commit, DemoOutcome, DemoStatus},
    util::{is_valid_language, normalize_languages},
    video::{
        LOCALIZED_STAGES, PipelineStatus, RunMarker, SHARED_STAGES, Stage, TrackStatus, Video,
    },
};
use diffcast_db::{CommitPatch, Records, VideoPatch};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::{
    sync::mpsc,
    task::JoinSet,
    time::{Instant, Interval, MissedTickBehavior},
};

use crate::{
    PipelineError, PipelineResult,
    executors::{self, StageContext, StageOutput},
    localize::LanguageWork,
    status::{self, StatusView},
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerRequest {
    pub commit_id: String,
    /// Requested language codes; the configured set is used when absent.
    #[serde(default)]
    pub languages: Option<Vec<String>>,
    #[serde(default)]
    pub force: bool,
    /// Replay from this stage onward. Implies `force`.
    #[serde(default)]
    pub from_stage: Option<Stage>,
}

impl TriggerRequest {
    pub fn new(commit_id: impl Into<String>) -> Self {
        Self { commit_id: commit_id.into(), ..Default::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Started,
    AlreadyInProgress,
    AlreadyCompleted,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::AlreadyInProgress => "already_in_progress",
            Self::AlreadyCompleted => "already_completed",
        }
    }
}

/// Result of a trigger. A `Started` ticket carries the run id the background
/// worker must present to [`Orchestrator::execute`].
#[derive(Debug, Clone)]
pub struct RunTicket {
    pub video_id: String,
    pub run_id: Option<String>,
    pub outcome: RunOutcome,
    pub video: Video,
}

fn new_run_id() -> String { format!("{:016x}", rand::random::<u64>()) }

/// Drives pipeline records through the stage sequence.
#[derive(Clone)]
pub struct Orchestrator {
    records: Records,
    caps: Capabilities,
    config: Arc<PipelineConfig>,
}

impl Orchestrator {
    pub fn new(records: Records, caps: Capabilities, config: PipelineConfig) -> Self {
        Self { records, caps, config: Arc::new(config) }
    }

    pub fn records(&self) -> &Records { &self.records }

    pub fn config(&self) -> &PipelineConfig { &self.config }

    /// Claim the record for a new run. Returns without doing any stage work;
    /// the caller hands a `Started` ticket to a worker.
    pub async fn trigger(&self, request: &TriggerRequest) -> PipelineResult<RunTicket> {
        let commit = self
            .records
            .get_commit(&request.commit_id)
            .await?
            .ok_or_else(|| PipelineError::CommitNotFound(request.commit_id.clone()))?;
        let languages = normalize_languages(
            request.languages.as_deref(),
            &self.config.languages,
            &self.config.default_language,
        )
        .map_err(PipelineError::InvalidRequest)?;
        let from = match request.from_stage {
            Some(stage) if !stage.is_executable() => {
                return Err(PipelineError::InvalidRequest(format!(
                    "stage '{stage}' cannot be replayed"
                )));
            }
            Some(stage) => stage,
            None => Stage::Goal,
        };
        let force = request.force || request.from_stage.is_some();

        let (video, created) = self
            .records
            .create_video_if_absent(&Video::new_for(&commit, languages.clone()))
            .await?;
        if !created {
            let now = OffsetDateTime::now_utc();
            let stale_after = self.config.stale_after();
            if video.is_running()
                && let Some(run) = &video.run
                && !run.is_stale(now, stale_after)
            {
                tracing::info!(video_id = %video.id, run_id = %run.id, "Run already in progress");
                return Ok(RunTicket {
                    video_id: video.id.clone(),
                    run_id: Some(run.id.clone()),
                    outcome: RunOutcome::AlreadyInProgress,
                    video,
                });
            }
            if !force
                && video.status == PipelineStatus::Completed
                && languages.iter().all(|l| video.has_completed_track(l))
            {
                tracing::info!(video_id = %video.id, "Pipeline already completed");
                return Ok(RunTicket {
                    video_id: video.id.clone(),
                    run_id: None,
                    outcome: RunOutcome::AlreadyCompleted,
                    video,
                });
            }
        }

        let run = RunMarker::new(new_run_id());
        let mut patch = VideoPatch {
            status: Some(PipelineStatus::Queued),
            stage: Some(Stage::Queued),
            error: Some(None),
            languages: Some(languages.clone()),
            run: Some(Some(run.clone())),
            completed_at: Some(None),
            ..Default::default()
        };
        if force {
            patch.merge(clear_from(from));
            for language in &languages {
                patch.set_track(language.clone(), None);
            }
        }
        let video = self.records.update_video(&video.id, &patch).await?;
        tracing::info!(
            video_id = %video.id,
            run_id = %run.id,
            force,
            from = %from,
            "Pipeline run queued for {} ({})",
            commit.key(),
            languages.join(", ")
        );
        Ok(RunTicket {
            video_id: video.id.clone(),
            run_id: Some(run.id),
            outcome: RunOutcome::Started,
            video,
        })
    }

    /// Advance a claimed record as far as it will go. Returns `None` when the
    /// run was superseded by a newer claim.
    pub async fn execute(&self, video_id: &str, run_id: &str) -> PipelineResult<Option<Video>> {
        let video = self
            .records
            .get_video(video_id)
            .await?
            .ok_or_else(|| PipelineError::VideoNotFound(video_id.to_string()))?;
        let Some(marker) = video.run.clone().filter(|r| r.id == run_id) else {
            tracing::info!(video_id, run_id, "Run superseded before start");
            return Ok(None);
        };
        let mut run = Run {
            records: &self.records,
            marker,
            video,
            heartbeat_every: self.config.heartbeat_interval(),
        };

        let Some(commit) = self.records.get_commit(video_id).await? else {
            run.fail(Stage::Error, format!("commit {video_id} not found")).await?;
            return Ok(Some(run.video));
        };
        let repo = self.records.get_repo(&commit.owner, &commit.repo).await?;
        run.write(VideoPatch { status: Some(PipelineStatus::Running), ..Default::default() })
            .await?;

        for stage in SHARED_STAGES {
            if run.video.has_artifact(stage) {
                tracing::info!(video_id, stage = %stage, "Artifact present, skipping");
                continue;
            }
            if !run.enter(stage).await? {
                return Ok(None);
            }
            if stage == Stage::Demo {
                self.set_demo(&commit, DemoStatus::Running, None, None).await?;
            }
            let video = run.video.clone();
            let ctx = StageContext {
                caps: &self.caps,
                config: &self.config,
                video: &video,
                commit: &commit,
                repo: repo.as_ref(),
            };
            let Some(result) = run.keep_alive(executors::run_shared(stage, &ctx)).await? else {
                return Ok(None);
            };
            // A run that lost its claim mid-stage must not persist the outcome.
            if !run.guard().await? {
                return Ok(None);
            }
            match result {
                Ok(output) => {
                    match &output {
                        StageOutput::Goal { goal } => {
                            let patch = CommitPatch {
                                demo_goal: Some(Some(goal.clone())),
                                ..Default::default()
                            };
                            self.records.update_commit(&commit.id(), &patch).await?;
                        }
                        StageOutput::Demo { recording } => {
                            let url = Some(recording.reference.clone());
                            self.set_demo(&commit, DemoStatus::Completed, url, None).await?;
                        }
                        _ => {}
                    }
                    run.write(output.into_patch()).await?;
                    tracing::info!(video_id, stage = %stage, "Stage completed");
                }
                Err(err) => {
                    if stage == Stage::Demo {
                        self.set_demo(&commit, DemoStatus::Failed, None, Some(err.to_string()))
                            .await?;
                    }
                    tracing::error!(
                        video_id,
                        stage = %stage,
                        kind = err.kind(),
                        "Stage failed: {}",
                        err
                    );
                    run.fail(stage, err.to_string()).await?;
                    return Ok(Some(run.video));
                }
            }
        }

        if !self.localize(&mut run).await? {
            return Ok(None);
        }
        if !run.guard().await? {
            return Ok(None);
        }

        let default_language = run
            .video
            .default_language()
            .unwrap_or(self.config.default_language.as_str())
            .to_string();
        let now = OffsetDateTime::now_utc();
        let mut patch =
            VideoPatch { run: Some(None), completed_at: Some(Some(now)), ..Default::default() };
        if run.video.has_completed_track(&default_language) {
            patch.status = Some(PipelineStatus::Completed);
            patch.stage = Some(Stage::Done);
            patch.error = Some(None);
        } else {
            let track = run.video.tracks.get(&default_language);
            let reason = track
                .and_then(|t| t.error.clone())
                .unwrap_or_else(|| "no track was produced".to_string());
            patch.status = Some(PipelineStatus::Failed);
            patch.stage = track.and_then(|t| t.failed_stage);
            patch.error = Some(Some(format!("default language track failed: {reason}")));
        }
        run.write(patch).await?;
        let failed = run
            .video
            .tracks
            .iter()
            .filter(|(_, t)| t.status == TrackStatus::Failed)
            .map(|(l, _)| l.as_str())
            .collect::<Vec<_>>();
        tracing::info!(
            video_id,
            status = %run.video.status,
            "Pipeline run finished (failed languages: {})",
            if failed.is_empty() { "none".to_string() } else { failed.join(", ") }
        );
        Ok(Some(run.video))
    }

    /// Run the localized sub-sequence for every language still lacking a
    /// completed track. Languages run as independent tasks; the record's
    /// stage follows the furthest one. Returns `false` if the run was
    /// superseded.
    async fn localize(&self, run: &mut Run<'_>) -> PipelineResult<bool> {
        let languages = run.video.pending_languages();
        if languages.is_empty() {
            return Ok(true);
        }
        if !run.enter(Stage::Voice).await? {
            return Ok(false);
        }
        let video = Arc::new(run.video.clone());
        let (progress, mut reached) = mpsc::unbounded_channel();
        let mut unfinished = BTreeMap::new();
        let mut tasks = JoinSet::new();
        for language in languages {
            unfinished.insert(language.clone(), Stage::Voice);
            let work = LanguageWork::new(language);
            tasks.spawn(work.complete(self.caps.clone(), video.clone(), progress.clone()));
        }
        drop(progress);

        let mut ticker = heartbeat_ticker(run.heartbeat_every);
        loop {
            tokio::select! {
                // Progress first: a task reports each stage before it can finish.
                biased;
                Some((language, stage)) = reached.recv() => {
                    unfinished.insert(language, stage);
                    if stage > run.video.stage && !run.enter(stage).await? {
                        return Ok(false);
                    }
                }
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((language, track)) => {
                            unfinished.remove(&language);
                            let mut patch = VideoPatch::default();
                            patch.set_track(language, Some(track));
                            if !run.write_claimed(patch).await? {
                                return Ok(false);
                            }
                        }
                        Err(err) => tracing::error!(
                            video_id = %run.video.id,
                            "Localization task died: {}",
                            err
                        ),
                    }
                }
                _ = ticker.tick() => {
                    if !run.heartbeat().await? {
                        return Ok(false);
                    }
                }
            }
        }

        for (language, stage) in unfinished {
            let track =
                LanguageWork::new(language.clone()).failed_track(stage, "localization task panicked");
            let mut patch = VideoPatch::default();
            patch.set_track(language, Some(track));
            if !run.write_claimed(patch).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Run one stage in isolation and return its output. Nothing is written.
    pub async fn test_stage(
        &self,
        commit_id: &str,
        stage: Stage,
        language: Option<&str>,
    ) -> PipelineResult<StageOutput> {
        if !stage.is_executable() {
            return Err(PipelineError::InvalidRequest(format!("stage '{stage}' cannot be run")));
        }
        let commit = self
            .records
            .get_commit(commit_id)
            .await?
            .ok_or_else(|| PipelineError::CommitNotFound(commit_id.to_string()))?;
        let video = match self.records.get_video(commit_id).await? {
            Some(video) => video,
            None => Video::new_for(&commit, vec![self.config.default_language.clone()]),
        };
        tracing::info!(video_id = %video.id, stage = %stage, "Testing stage");

        if stage.is_localized() {
            let language = match language {
                Some(code) => {
                    let code = code.trim().to_ascii_lowercase();
                    if !is_valid_language(&code) {
                        return Err(PipelineError::InvalidRequest(format!(
                            "invalid language code '{code}'"
                        )));
                    }
                    code
                }
                None => video
                    .default_language()
                    .unwrap_or(self.config.default_language.as_str())
                    .to_string(),
            };
            let mut work = LanguageWork::new(language);
            let mut output = None;
            for sub in LOCALIZED_STAGES.into_iter().filter(|s| *s <= stage) {
                let result = work
                    .run(sub, &self.caps, &video)
                    .await
                    .map_err(|source| PipelineError::Stage { stage: sub, source })?;
                output = Some(result);
            }
            return output.ok_or_else(|| {
                PipelineError::InvalidRequest(format!("stage '{stage}' produced no output"))
            });
        }

        let repo = self.records.get_repo(&commit.owner, &commit.repo).await?;
        let ctx = StageContext {
            caps: &self.caps,
            config: &self.config,
            video: &video,
            commit: &commit,
            repo: repo.as_ref(),
        };
        executors::run_shared(stage, &ctx)
            .await
            .map_err(|source| PipelineError::Stage { stage, source })
    }

    /// Give up the claim of a run that could not be handed to a worker, so
    /// the record stops reporting itself as in progress. A newer claim is
    /// left untouched.
    pub async fn release(&self, ticket: &RunTicket, reason: &str) -> PipelineResult<()> {
        let Some(run_id) = ticket.run_id.as_deref() else {
            return Ok(());
        };
        let Some(video) = self.records.get_video(&ticket.video_id).await? else {
            return Ok(());
        };
        if video.run.as_ref().is_none_or(|r| r.id != run_id) {
            return Ok(());
        }
        let patch = VideoPatch {
            status: Some(PipelineStatus::Failed),
            error: Some(Some(format!("run could not be queued: {reason}"))),
            run: Some(None),
            completed_at: Some(Some(OffsetDateTime::now_utc())),
            ..Default::default()
        };
        self.records.update_video(&video.id, &patch).await?;
        tracing::warn!(video_id = %video.id, run_id, "Released unqueued run: {}", reason);
        Ok(())
    }

    /// Re-claim queued or running records. With `include_fresh`, every active
    /// record is re-claimed (process start); otherwise only those whose run
    /// marker is missing or stale.
    pub async fn recover_runs(&self, include_fresh: bool) -> PipelineResult<Vec<RunTicket>> {
        let now = OffsetDateTime::now_utc();
        let stale_after = self.config.stale_after();
        let mut tickets = Vec::new();
        for video in self.records.list_active_videos().await? {
            let stale = video.run.as_ref().is_none_or(|r| r.is_stale(now, stale_after));
            if !include_fresh && !stale {
                continue;
            }
            let run = RunMarker::new(new_run_id());
            let patch = VideoPatch {
                status: Some(PipelineStatus::Queued),
                run: Some(Some(run.clone())),
                ..Default::default()
            };
            let video = self.records.update_video(&video.id, &patch).await?;
            tracing::warn!(
                video_id = %video.id,
                run_id = %run.id,
                stage = %video.stage,
                "Recovering interrupted pipeline run"
            );
            tickets.push(RunTicket {
                video_id: video.id.clone(),
                run_id: Some(run.id),
                outcome: RunOutcome::Started,
                video,
            });
        }
        Ok(tickets)
    }

    pub async fn status(&self, video_id: &str) -> PipelineResult<StatusView> {
        let video = self
            .records
            .get_video(video_id)
            .await?
            .ok_or_else(|| PipelineError::VideoNotFound(video_id.to_string()))?;
        let commit = self.records.get_commit(video_id).await?;
        Ok(status::project(&video, commit.as_ref()))
    }

    async fn set_demo(
        &self,
        commit: &Commit,
        status: DemoStatus,
        video_url: Option<String>,
        error: Option<String>,
    ) -> PipelineResult<()> {
        let patch = CommitPatch {
            demo: Some(Some(DemoOutcome { status, video_url, error })),
            ..Default::default()
        };
        self.records.update_commit(&commit.id(), &patch).await?;
        Ok(())
    }
}

/// Clears every shared artifact produced at or after `from`.
fn clear_from(from: Stage) -> VideoPatch {
    let mut patch = VideoPatch::default();
    for stage in SHARED_STAGES.into_iter().filter(|s| *s >= from) {
        match stage {
            Stage::Goal => patch.goal = Some(None),
            Stage::Demo => patch.demo = Some(None),
            Stage::Script => patch.script = Some(None),
            Stage::Snapshots => patch.frames = Some(None),
            Stage::Clipgen => patch.clips = Some(None),
            Stage::Stitch => patch.base_video = Some(None),
            _ => {}
        }
    }
    patch
}

/// Ticks every `period`, starting one period from now. Late ticks are not
/// bunched up after a slow heartbeat write.
fn heartbeat_ticker(period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// One run's in-memory view of its record. Every write goes to the store
/// first and is then applied locally, so control flow never depends on
/// reading back what was just written.
struct Run<'a> {
    records: &'a Records,
    marker: RunMarker,
    video: Video,
    heartbeat_every: Duration,
}

impl Run<'_> {
    async fn write(&mut self, patch: VideoPatch) -> PipelineResult<()> {
        if patch.is_empty() {
            return Ok(());
        }
        self.records.update_video(&self.video.id, &patch).await?;
        patch.apply_to(&mut self.video);
        Ok(())
    }

    /// Whether this run still holds the record's claim.
    async fn guard(&self) -> PipelineResult<bool> {
        let current = self.records.get_video(&self.video.id).await?;
        let held = current.and_then(|v| v.run).is_some_and(|r| r.id == self.marker.id);
        if !held {
            tracing::info!(
                video_id = %self.video.id,
                run_id = %self.marker.id,
                "Run superseded, stopping"
            );
        }
        Ok(held)
    }

    /// Write only while the claim is held. Returns `false` otherwise.
    async fn write_claimed(&mut self, patch: VideoPatch) -> PipelineResult<bool> {
        if !self.guard().await? {
            return Ok(false);
        }
        self.write(patch).await?;
        Ok(true)
    }

    /// Refresh the claim's heartbeat. Returns `false` if the claim was lost.
    async fn heartbeat(&mut self) -> PipelineResult<bool> {
        self.marker.heartbeat_at = OffsetDateTime::now_utc();
        let patch = VideoPatch { run: Some(Some(self.marker.clone())), ..Default::default() };
        let held = self.write_claimed(patch).await?;
        if held {
            tracing::debug!(video_id = %self.video.id, run_id = %self.marker.id, "Heartbeat");
        }
        Ok(held)
    }

    /// Drive `work` to completion, refreshing the heartbeat while it runs.
    /// Returns `None`, dropping `work`, once the claim is lost.
    async fn keep_alive<F: Future>(&mut self, work: F) -> PipelineResult<Option<F::Output>> {
        let mut ticker = heartbeat_ticker(self.heartbeat_every);
        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return Ok(Some(output)),
                _ = ticker.tick() => {
                    if !self.heartbeat().await? {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Check the claim, then record entry into `stage` with a fresh heartbeat.
    async fn enter(&mut self, stage: Stage) -> PipelineResult<bool> {
        if !self.guard().await? {
            return Ok(false);
        }
        self.marker.heartbeat_at = OffsetDateTime::now_utc();
        let patch = VideoPatch {
            stage: Some(stage),
            run: Some(Some(self.marker.clone())),
            ..Default::default()
        };
        self.write(patch).await?;
        tracing::info!(video_id = %self.video.id, stage = %stage, "Entering stage");
        Ok(true)
    }

    async fn fail(&mut self, stage: Stage, reason: String) -> PipelineResult<()> {
        let patch = VideoPatch {
            status: Some(PipelineStatus::Failed),
            stage: Some(stage),
            error: Some(Some(reason)),
            run: Some(None),
            completed_at: Some(Some(OffsetDateTime::now_utc())),
            ..Default::default()
        };
        self.write(patch).await
    }
}
