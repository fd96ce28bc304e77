//! Typed partial updates. Each serializes to a JSON merge patch: `None` leaves a
//! field alone, `Some(None)` clears it.

use std::collections::BTreeMap;

use diffcast_core::{
    models::DemoOutcome,
    video::{
        BaseVideo, DemoRecording, GeneratedClip, PipelineStatus, RunMarker, Script, Stage, Track,
        Video,
    },
};
use serde::{Serialize, Serializer};
use time::OffsetDateTime;

#[derive(Debug, Clone, Default, Serialize)]
pub struct VideoPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PipelineStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub languages: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub goal: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub demo: Option<Option<DemoRecording>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<Option<Script>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frames: Option<Option<Vec<String>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clips: Option<Option<Vec<GeneratedClip>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_video: Option<Option<BaseVideo>>,
    /// Per-language replacements; `None` removes the track.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracks: Option<BTreeMap<String, Option<Track>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<Option<RunMarker>>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "rfc3339_patch")]
    pub completed_at: Option<Option<OffsetDateTime>>,
}

impl VideoPatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.stage.is_none()
            && self.error.is_none()
            && self.languages.is_none()
            && self.goal.is_none()
            && self.demo.is_none()
            && self.script.is_none()
            && self.frames.is_none()
            && self.clips.is_none()
            && self.base_video.is_none()
            && self.tracks.is_none()
            && self.run.is_none()
            && self.completed_at.is_none()
    }

    /// Replace (or with `None`, remove) one language's track.
    pub fn set_track(&mut self, language: impl Into<String>, track: Option<Track>) {
        self.tracks.get_or_insert_with(BTreeMap::new).insert(language.into(), track);
    }

    /// Fold `other` into this patch; fields set in `other` win.
    pub fn merge(&mut self, other: VideoPatch) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            status,
            stage,
            error,
            languages,
            goal,
            demo,
            script,
            frames,
            clips,
            base_video,
            run,
            completed_at
        );
        if let Some(tracks) = other.tracks {
            self.tracks.get_or_insert_with(BTreeMap::new).extend(tracks);
        }
    }

    /// Apply the same change to an in-memory record that the store applies to
    /// the persisted document.
    pub fn apply_to(&self, video: &mut Video) {
        if let Some(status) = self.status {
            video.status = status;
        }
        if let Some(stage) = self.stage {
            video.stage = stage;
        }
        if let Some(error) = &self.error {
            video.error = error.clone();
        }
        if let Some(languages) = &self.languages {
            video.languages = languages.clone();
        }
        if let Some(goal) = &self.goal {
            video.goal = goal.clone();
        }
        if let Some(demo) = &self.demo {
            video.demo = demo.clone();
        }
        if let Some(script) = &self.script {
            video.script = script.clone();
        }
        if let Some(frames) = &self.frames {
            video.frames = frames.clone();
        }
        if let Some(clips) = &self.clips {
            video.clips = clips.clone();
        }
        if let Some(base_video) = &self.base_video {
            video.base_video = base_video.clone();
        }
        if let Some(tracks) = &self.tracks {
            for (language, track) in tracks {
                match track {
                    Some(track) => {
                        video.tracks.insert(language.clone(), track.clone());
                    }
                    None => {
                        video.tracks.remove(language);
                    }
                }
            }
        }
        if let Some(run) = &self.run {
            video.run = run.clone();
        }
        if let Some(completed_at) = self.completed_at {
            video.completed_at = completed_at;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CommitPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff_summary: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub demo_goal: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub demo: Option<Option<DemoOutcome>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepoPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website_url: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commits_stored: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Option<String>>,
}

fn rfc3339_patch<S: Serializer>(
    value: &Option<Option<OffsetDateTime>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(Some(datetime)) => time::serde::rfc3339::serialize(datetime, serializer),
        _ => serializer.serialize_none(),
    }
}
