//! Typed wrappers around the external AI and media services a pipeline run
//! depends on. Every call returns a typed result or a [`CapabilityError`];
//! retrying transient failures happens here, never in the orchestrator.

pub mod captions;
pub mod http;
pub mod media;
pub mod openai;
pub mod retry;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use diffcast_core::{
    config::Config,
    models::{Commit, FileChange},
    video::{BaseVideo, ClipRole, DemoRecording, GeneratedClip, Script},
};
use serde::{Deserialize, Serialize};

pub use crate::{
    captions::SrtCaptions,
    http::{HttpClipService, HttpRecorder},
    media::{Ffmpeg, MediaDir, snap_clip_duration},
    openai::OpenAi,
    retry::RetryPolicy,
};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapabilityError {
    /// Network trouble, rate limiting, 5xx. Retried with backoff.
    #[error("{0}")]
    Transient(String),
    /// The capability cannot satisfy this request. Never retried.
    #[error("{0}")]
    Permanent(String),
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

impl CapabilityError {
    pub fn transient(message: impl Into<String>) -> Self { Self::Transient(message.into()) }

    pub fn permanent(message: impl Into<String>) -> Self { Self::Permanent(message.into()) }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
            Self::Timeout(_) => "timeout",
        }
    }
}

pub type CapResult<T> = Result<T, CapabilityError>;

/// Unvalidated scene plan as returned by a script generator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptDraft {
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "feature_summary")]
    pub summary: String,
    #[serde(default)]
    pub scenes: Vec<SceneDraft>,
    #[serde(default)]
    pub clip_prompts: Vec<ClipPromptDraft>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneDraft {
    #[serde(default)]
    pub on_screen_text: String,
    #[serde(default)]
    pub narration_seed: String,
    pub duration_sec: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClipPromptDraft {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub prompt: String,
    pub duration_sec: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ScriptRequest<'a> {
    pub goal: &'a str,
    pub diff_summary: Option<&'a str>,
    pub commit_message: Option<&'a str>,
    pub demo_duration_sec: f64,
    pub max_clip_prompts: usize,
}

#[derive(Debug, Clone)]
pub struct ClipRequest<'a> {
    pub index: usize,
    pub role: ClipRole,
    pub prompt: &'a str,
    /// Media reference of a frame to ground the clip on.
    pub reference_image: Option<&'a str>,
    pub duration_sec: u32,
}

/// Per-scene lines for one language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalizedLines {
    pub voice_lines: Vec<String>,
    pub caption_lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceOutput {
    pub reference: String,
    pub duration_sec: f64,
}

#[async_trait]
pub trait DiffSummarizer: Send + Sync {
    async fn summarize(&self, commit: &Commit) -> CapResult<String>;
}

#[async_trait]
pub trait GoalExtractor: Send + Sync {
    async fn extract_goal(&self, diff_summary: &str, files: &[FileChange]) -> CapResult<String>;
}

#[async_trait]
pub trait Recorder: Send + Sync {
    /// Drive a browser toward `goal` on `url` and record it.
    async fn record(&self, video_id: &str, goal: &str, url: &str) -> CapResult<DemoRecording>;
}

#[async_trait]
pub trait ScriptGenerator: Send + Sync {
    async fn generate_script(&self, request: &ScriptRequest<'_>) -> CapResult<ScriptDraft>;
}

#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn extract_frames(
        &self,
        video_id: &str,
        recording: &DemoRecording,
        count: usize,
    ) -> CapResult<Vec<String>>;
}

#[async_trait]
pub trait ClipGenerator: Send + Sync {
    async fn generate_clip(
        &self,
        video_id: &str,
        request: &ClipRequest<'_>,
    ) -> CapResult<GeneratedClip>;
}

#[async_trait]
pub trait Stitcher: Send + Sync {
    async fn stitch(
        &self,
        video_id: &str,
        openers: &[GeneratedClip],
        demo: &DemoRecording,
        closers: &[GeneratedClip],
    ) -> CapResult<BaseVideo>;
}

#[async_trait]
pub trait NarrationTranslator: Send + Sync {
    async fn translate(&self, script: &Script, language: &str) -> CapResult<LocalizedLines>;
}

#[async_trait]
pub trait VoiceSynthesizer: Send + Sync {
    async fn synthesize(&self, video_id: &str, language: &str, text: &str)
    -> CapResult<VoiceOutput>;
}

#[async_trait]
pub trait CaptionGenerator: Send + Sync {
    /// Write a caption track with one cue per line, timed by `durations`.
    async fn captions(
        &self,
        video_id: &str,
        language: &str,
        lines: &[String],
        durations: &[f64],
    ) -> CapResult<String>;
}

#[async_trait]
pub trait Composer: Send + Sync {
    async fn compose(
        &self,
        video_id: &str,
        language: &str,
        base: &BaseVideo,
        audio: &str,
        captions: &str,
    ) -> CapResult<String>;
}

/// Everything a pipeline run may call out to.
#[derive(Clone)]
pub struct Capabilities {
    pub summarizer: Arc<dyn DiffSummarizer>,
    pub goal: Arc<dyn GoalExtractor>,
    pub recorder: Arc<dyn Recorder>,
    pub script: Arc<dyn ScriptGenerator>,
    pub frames: Arc<dyn FrameExtractor>,
    pub clips: Arc<dyn ClipGenerator>,
    pub stitcher: Arc<dyn Stitcher>,
    pub translator: Arc<dyn NarrationTranslator>,
    pub voice: Arc<dyn VoiceSynthesizer>,
    pub captions: Arc<dyn CaptionGenerator>,
    pub composer: Arc<dyn Composer>,
}

impl Capabilities {
    pub fn from_config(config: &Config) -> Result<Self> {
        let caps = &config.capabilities;
        let retry = RetryPolicy::from_config(&caps.retry);
        let media = MediaDir::new(&config.pipeline.media_dir);
        let ffmpeg = Arc::new(Ffmpeg::new(
            caps.ffmpeg.clone(),
            caps.ffprobe.clone(),
            media.clone(),
            Duration::from_secs(caps.timeouts.default_secs),
        ));
        let captions = Arc::new(SrtCaptions::new(media.clone()));

        let openai = config.openai.as_ref().map(|openai| {
            Arc::new(OpenAi::new(
                openai,
                config.pipeline.voices.clone(),
                media.clone(),
                ffmpeg.clone(),
                retry,
                caps.timeouts,
            ))
        });
        if openai.is_none() {
            tracing::warn!("OpenAI is not configured; language and voice stages will fail");
        }
        let missing = Arc::new(Unconfigured("openai"));
        let summarizer: Arc<dyn DiffSummarizer> = match &openai {
            Some(openai) => openai.clone(),
            None => missing.clone(),
        };
        let goal: Arc<dyn GoalExtractor> = match &openai {
            Some(openai) => openai.clone(),
            None => missing.clone(),
        };
        let script: Arc<dyn ScriptGenerator> = match &openai {
            Some(openai) => openai.clone(),
            None => missing.clone(),
        };
        let translator: Arc<dyn NarrationTranslator> = match &openai {
            Some(openai) => openai.clone(),
            None => missing.clone(),
        };
        let voice: Arc<dyn VoiceSynthesizer> = match openai {
            Some(openai) => openai,
            None => missing,
        };

        let recorder: Arc<dyn Recorder> = match &caps.recorder_url {
            Some(url) => Arc::new(HttpRecorder::new(
                url.clone(),
                media.clone(),
                ffmpeg.clone(),
                retry,
                Duration::from_secs(caps.timeouts.recorder_secs),
            )?),
            None => Arc::new(Unconfigured("recorder")),
        };
        let clips: Arc<dyn ClipGenerator> = match &caps.clip_service_url {
            Some(url) => Arc::new(HttpClipService::new(
                url.clone(),
                media.clone(),
                retry,
                Duration::from_secs(caps.timeouts.clip_secs),
            )?),
            None => Arc::new(Unconfigured("clip service")),
        };

        Ok(Self {
            summarizer,
            goal,
            recorder,
            script,
            frames: ffmpeg.clone(),
            clips,
            stitcher: ffmpeg.clone(),
            translator,
            voice,
            captions,
            composer: ffmpeg,
        })
    }
}

/// Stand-in for a capability whose service is not configured. Every call
/// fails permanently with a readable reason.
pub struct Unconfigured(pub &'static str);

impl Unconfigured {
    fn fail<T>(&self) -> CapResult<T> {
        Err(CapabilityError::permanent(format!("{} is not configured", self.0)))
    }
}

#[async_trait]
impl DiffSummarizer for Unconfigured {
    async fn summarize(&self, _commit: &Commit) -> CapResult<String> { self.fail() }
}

#[async_trait]
impl GoalExtractor for Unconfigured {
    async fn extract_goal(&self, _diff_summary: &str, _files: &[FileChange]) -> CapResult<String> {
        self.fail()
    }
}

#[async_trait]
impl Recorder for Unconfigured {
    async fn record(&self, _video_id: &str, _goal: &str, _url: &str) -> CapResult<DemoRecording> {
        self.fail()
    }
}

#[async_trait]
impl ScriptGenerator for Unconfigured {
    async fn generate_script(&self, _request: &ScriptRequest<'_>) -> CapResult<ScriptDraft> {
        self.fail()
    }
}

#[async_trait]
impl ClipGenerator for Unconfigured {
    async fn generate_clip(
        &self,
        _video_id: &str,
        _request: &ClipRequest<'_>,
    ) -> CapResult<GeneratedClip> {
        self.fail()
    }
}

#[async_trait]
impl NarrationTranslator for Unconfigured {
    async fn translate(&self, _script: &Script, _language: &str) -> CapResult<LocalizedLines> {
        self.fail()
    }
}

#[async_trait]
impl VoiceSynthesizer for Unconfigured {
    async fn synthesize(
        &self,
        _video_id: &str,
        _language: &str,
        _text: &str,
    ) -> CapResult<VoiceOutput> {
        self.fail()
    }
}
