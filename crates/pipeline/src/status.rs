use std::collections::BTreeMap;

use diffcast_core::{
    models::{Commit, DemoStatus},
    video::{PIPELINE_STAGES, PipelineStatus, Stage, TrackStatus, Video},
};
use serde::Serialize;
use time::OffsetDateTime;

/// Flattened, externally visible state of a pipeline record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub video_id: String,
    pub owner: String,
    pub repo: String,
    pub sha: String,
    pub status: PipelineStatus,
    pub stage: Stage,
    pub progress: f64,
    pub error: Option<String>,
    pub languages: Vec<String>,
    pub tracks: BTreeMap<String, TrackSummary>,
    pub demo: Option<DemoStatus>,
    pub title: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSummary {
    pub status: TrackStatus,
    pub final_video: Option<String>,
    pub duration_sec: Option<f64>,
    pub error: Option<String>,
    pub failed_stage: Option<Stage>,
}

/// Coarse completion fraction: the stage's position in the sequence, plus half
/// a step while a demo recording is in flight.
pub fn progress(video: &Video, commit: Option<&Commit>) -> f64 {
    if video.status == PipelineStatus::Completed {
        return 1.0;
    }
    let Some(index) = video.stage.index() else {
        return 0.0;
    };
    let steps = (PIPELINE_STAGES.len() - 1) as f64;
    let recording = video.stage == Stage::Demo && commit.is_some_and(Commit::demo_in_flight);
    let position = if recording { index as f64 + 0.5 } else { index as f64 };
    (position / steps).min(1.0)
}

/// Pure projection of a record (and optionally its commit) for pollers.
pub fn project(video: &Video, commit: Option<&Commit>) -> StatusView {
    let tracks = video
        .tracks
        .iter()
        .map(|(language, track)| {
            (language.clone(), TrackSummary {
                status: track.status,
                final_video: track.final_video.clone(),
                duration_sec: track.duration_sec,
                error: track.error.clone(),
                failed_stage: track.failed_stage,
            })
        })
        .collect();
    StatusView {
        video_id: video.id.clone(),
        owner: video.owner.clone(),
        repo: video.repo.clone(),
        sha: video.sha.clone(),
        status: video.status,
        stage: video.stage,
        progress: progress(video, commit),
        error: video.error.clone(),
        languages: video.languages.clone(),
        tracks,
        demo: commit.and_then(|c| c.demo.as_ref()).map(|d| d.status),
        title: video.script.as_ref().map(|s| s.title.clone()),
        updated_at: video.updated_at,
        completed_at: video.completed_at,
    }
}
