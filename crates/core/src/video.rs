use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::models::{Commit, CommitKey};

/// Named checkpoints of a pipeline run, in strict forward order.
///
/// `Error` sits outside the sequence and is only used when a failure cannot be
/// attributed to a single stage.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Queued,
    Goal,
    Demo,
    Script,
    Snapshots,
    Clipgen,
    Stitch,
    Voice,
    Captions,
    Finalize,
    Done,
    Error,
}

/// The full forward sequence, `queued` through `done`.
pub const PIPELINE_STAGES: [Stage; 11] = [
    Stage::Queued,
    Stage::Goal,
    Stage::Demo,
    Stage::Script,
    Stage::Snapshots,
    Stage::Clipgen,
    Stage::Stitch,
    Stage::Voice,
    Stage::Captions,
    Stage::Finalize,
    Stage::Done,
];

/// Language-independent stages producing shared artifacts.
pub const SHARED_STAGES: [Stage; 6] =
    [Stage::Goal, Stage::Demo, Stage::Script, Stage::Snapshots, Stage::Clipgen, Stage::Stitch];

/// Stages fanned out per requested language.
pub const LOCALIZED_STAGES: [Stage; 3] = [Stage::Voice, Stage::Captions, Stage::Finalize];

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Goal => "goal",
            Self::Demo => "demo",
            Self::Script => "script",
            Self::Snapshots => "snapshots",
            Self::Clipgen => "clipgen",
            Self::Stitch => "stitch",
            Self::Voice => "voice",
            Self::Captions => "captions",
            Self::Finalize => "finalize",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    /// Position within [`PIPELINE_STAGES`]. `Error` has none.
    pub fn index(&self) -> Option<usize> { PIPELINE_STAGES.iter().position(|s| s == self) }

    pub fn next(&self) -> Option<Stage> {
        self.index().and_then(|i| PIPELINE_STAGES.get(i + 1)).copied()
    }

    pub fn is_terminal(&self) -> bool { matches!(self, Self::Done | Self::Error) }

    pub fn is_localized(&self) -> bool { LOCALIZED_STAGES.contains(self) }

    /// Whether an executor exists for this stage.
    pub fn is_executable(&self) -> bool {
        SHARED_STAGES.contains(self) || LOCALIZED_STAGES.contains(self)
    }
}

impl FromStr for Stage {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "goal" => Ok(Self::Goal),
            "demo" => Ok(Self::Demo),
            "script" => Ok(Self::Script),
            "snapshots" => Ok(Self::Snapshots),
            "clipgen" => Ok(Self::Clipgen),
            "stitch" => Ok(Self::Stitch),
            "voice" => Ok(Self::Voice),
            "captions" => Ok(Self::Captions),
            "finalize" => Ok(Self::Finalize),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_active(&self) -> bool { matches!(self, Self::Queued | Self::Running) }
}

impl FromStr for PipelineStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackStatus {
    Completed,
    Failed,
}

/// Per-language localization result. Only written once the language's work
/// has finished, and replaced as a whole when re-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub status: TrackStatus,
    /// One narration line per scene.
    #[serde(default)]
    pub narration: Vec<String>,
    pub audio: Option<String>,
    pub captions: Option<String>,
    pub final_video: Option<String>,
    pub duration_sec: Option<f64>,
    /// Stage at which the language failed.
    pub failed_stage: Option<Stage>,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
}

impl Track {
    pub fn is_completed(&self) -> bool { self.status == TrackStatus::Completed }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub on_screen_text: String,
    pub narration_seed: String,
    pub duration_sec: f64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipRole {
    Opener,
    Closer,
}

impl ClipRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opener => "opener",
            Self::Closer => "closer",
        }
    }
}

impl FromStr for ClipRole {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opener" => Ok(Self::Opener),
            "closer" => Ok(Self::Closer),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipPrompt {
    pub role: ClipRole,
    pub prompt: String,
    pub duration_sec: f64,
}

/// Scene plan produced by the `script` stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub title: String,
    pub summary: String,
    pub scenes: Vec<Scene>,
    #[serde(default)]
    pub clip_prompts: Vec<ClipPrompt>,
    pub total_duration_sec: f64,
}

impl Script {
    pub fn narration_seeds(&self) -> Vec<String> {
        self.scenes.iter().map(|s| s.narration_seed.clone()).collect()
    }

    /// Scene durations stretched or squeezed to cover `target_sec`.
    pub fn scaled_durations(&self, target_sec: f64) -> Vec<f64> {
        let total: f64 = self.scenes.iter().map(|s| s.duration_sec).sum();
        if total <= 0.0 || target_sec <= 0.0 {
            return self.scenes.iter().map(|s| s.duration_sec).collect();
        }
        let factor = target_sec / total;
        self.scenes.iter().map(|s| s.duration_sec * factor).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoRecording {
    pub reference: String,
    pub duration_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedClip {
    pub role: ClipRole,
    pub reference: String,
    pub duration_sec: f64,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseVideo {
    pub reference: String,
    pub duration_sec: f64,
}

/// Advisory claim on a pipeline record held by the run currently advancing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMarker {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub claimed_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub heartbeat_at: OffsetDateTime,
}

impl RunMarker {
    pub fn new(id: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self { id: id.into(), claimed_at: now, heartbeat_at: now }
    }

    pub fn is_stale(&self, now: OffsetDateTime, stale_after: Duration) -> bool {
        let age = now - self.heartbeat_at;
        age.whole_milliseconds() >= stale_after.as_millis() as i128
    }
}

/// Pipeline record: one end-to-end generation run for a commit, keyed like the
/// commit it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Video {
    pub id: String,
    pub owner: String,
    pub repo: String,
    pub sha: String,
    pub status: PipelineStatus,
    pub stage: Stage,
    pub error: Option<String>,
    /// Requested language codes; the default language comes first.
    pub languages: Vec<String>,
    pub goal: Option<String>,
    pub demo: Option<DemoRecording>,
    pub script: Option<Script>,
    pub frames: Option<Vec<String>>,
    pub clips: Option<Vec<GeneratedClip>>,
    pub base_video: Option<BaseVideo>,
    #[serde(default)]
    pub tracks: BTreeMap<String, Track>,
    pub run: Option<RunMarker>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl Video {
    pub fn new_for(commit: &Commit, languages: Vec<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: commit.id(),
            owner: commit.owner.clone(),
            repo: commit.repo.clone(),
            sha: commit.sha.clone(),
            status: PipelineStatus::Queued,
            stage: Stage::Queued,
            error: None,
            languages,
            goal: None,
            demo: None,
            script: None,
            frames: None,
            clips: None,
            base_video: None,
            tracks: BTreeMap::new(),
            run: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn key(&self) -> CommitKey { CommitKey::new(&self.owner, &self.repo, &self.sha) }

    pub fn default_language(&self) -> Option<&str> { self.languages.first().map(String::as_str) }

    /// Whether the shared artifact written by `stage` is present.
    pub fn has_artifact(&self, stage: Stage) -> bool {
        match stage {
            Stage::Goal => self.goal.is_some(),
            Stage::Demo => self.demo.is_some(),
            Stage::Script => self.script.is_some(),
            Stage::Snapshots => self.frames.is_some(),
            Stage::Clipgen => self.clips.is_some(),
            Stage::Stitch => self.base_video.is_some(),
            Stage::Voice | Stage::Captions | Stage::Finalize => {
                self.languages.iter().all(|l| self.has_completed_track(l))
            }
            Stage::Queued | Stage::Done | Stage::Error => false,
        }
    }

    pub fn has_completed_track(&self, language: &str) -> bool {
        self.tracks.get(language).is_some_and(Track::is_completed)
    }

    /// Requested languages that still need localizing.
    pub fn pending_languages(&self) -> Vec<String> {
        self.languages.iter().filter(|l| !self.has_completed_track(l)).cloned().collect()
    }

    pub fn is_running(&self) -> bool { self.status.is_active() }
}
