#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Result, bail};
use async_trait::async_trait;
use diffcast_capabilities::{
    CapResult, Capabilities, CaptionGenerator, CapabilityError, ClipGenerator, ClipPromptDraft,
    ClipRequest, Composer, DiffSummarizer, FrameExtractor, GoalExtractor, LocalizedLines,
    NarrationTranslator, Recorder, SceneDraft, ScriptDraft, ScriptGenerator, ScriptRequest,
    Stitcher, VoiceOutput, VoiceSynthesizer,
};
use diffcast_core::{
    config::PipelineConfig,
    models::{ChangeKind, Commit, FileChange, Repo},
    video::{BaseVideo, DemoRecording, GeneratedClip, Script},
};
use diffcast_db::{DocumentStore, MemoryStore, Query, Records, store::VIDEOS};
use diffcast_pipeline::Orchestrator;
use serde_json::Value;
use time::OffsetDateTime;

pub const COMMIT_ID: &str = "octo_hello_abc1234";

/// Scripted capabilities. Every call is counted under a key such as `demo` or
/// `voice:fr`; a key registered with [`Fake::fail`] fails permanently and one
/// registered with [`Fake::delay`] takes that long to answer.
#[derive(Default)]
pub struct Fake {
    calls: Mutex<Vec<String>>,
    failures: Mutex<BTreeMap<String, String>>,
    delays: Mutex<BTreeMap<String, Duration>>,
}

impl Fake {
    pub fn delay(&self, key: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(key.to_string(), delay);
    }

    pub fn fail(&self, key: &str, message: &str) {
        self.failures.lock().unwrap().insert(key.to_string(), message.to_string());
    }

    pub fn heal(&self) { self.failures.lock().unwrap().clear(); }

    pub fn calls(&self, key: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|k| *k == key).count()
    }

    pub fn total_calls(&self) -> usize { self.calls.lock().unwrap().len() }

    pub fn reset_calls(&self) { self.calls.lock().unwrap().clear(); }

    async fn hit(&self, key: String) -> CapResult<()> {
        let failure = self.failures.lock().unwrap().get(&key).cloned();
        let delay = self.delays.lock().unwrap().get(&key).copied();
        self.calls.lock().unwrap().push(key);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(message) => Err(CapabilityError::Permanent(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DiffSummarizer for Fake {
    async fn summarize(&self, _commit: &Commit) -> CapResult<String> {
        self.hit("summarize".into()).await?;
        Ok("Adds a dark theme toggle to the settings page".into())
    }
}

#[async_trait]
impl GoalExtractor for Fake {
    async fn extract_goal(&self, _diff_summary: &str, _files: &[FileChange]) -> CapResult<String> {
        self.hit("goal".into()).await?;
        Ok("  Turn on dark mode from the settings page ".into())
    }
}

#[async_trait]
impl Recorder for Fake {
    async fn record(&self, video_id: &str, _goal: &str, _url: &str) -> CapResult<DemoRecording> {
        self.hit("demo".into()).await?;
        Ok(DemoRecording { reference: format!("videos/{video_id}/demo.mp4"), duration_sec: 20.0 })
    }
}

#[async_trait]
impl ScriptGenerator for Fake {
    async fn generate_script(&self, request: &ScriptRequest<'_>) -> CapResult<ScriptDraft> {
        self.hit("script".into()).await?;
        Ok(ScriptDraft {
            title: "Dark mode".into(),
            summary: "Switch to a darker look in one click.".into(),
            scenes: vec![
                SceneDraft {
                    on_screen_text: "Open settings".into(),
                    narration_seed: "Open the settings page.".into(),
                    duration_sec: Some(request.demo_duration_sec / 2.0),
                },
                SceneDraft {
                    on_screen_text: "Pick dark".into(),
                    narration_seed: "Choose the dark theme.".into(),
                    duration_sec: Some(request.demo_duration_sec / 2.0),
                },
            ],
            clip_prompts: vec![
                ClipPromptDraft {
                    role: "opener".into(),
                    prompt: "A city at dusk".into(),
                    duration_sec: Some(5.0),
                },
                ClipPromptDraft {
                    role: "closer".into(),
                    prompt: "Stars over the skyline".into(),
                    duration_sec: None,
                },
            ],
        })
    }
}

#[async_trait]
impl FrameExtractor for Fake {
    async fn extract_frames(
        &self,
        video_id: &str,
        _recording: &DemoRecording,
        count: usize,
    ) -> CapResult<Vec<String>> {
        self.hit("snapshots".into()).await?;
        Ok((0..count).map(|i| format!("videos/{video_id}/frames/frame_{i}.jpg")).collect())
    }
}

#[async_trait]
impl ClipGenerator for Fake {
    async fn generate_clip(
        &self,
        video_id: &str,
        request: &ClipRequest<'_>,
    ) -> CapResult<GeneratedClip> {
        self.hit("clipgen".into()).await?;
        Ok(GeneratedClip {
            role: request.role,
            reference: format!(
                "videos/{video_id}/clips/{}_{}.mp4",
                request.role.as_str(),
                request.index
            ),
            duration_sec: request.duration_sec as f64,
            prompt: request.prompt.to_string(),
        })
    }
}

#[async_trait]
impl Stitcher for Fake {
    async fn stitch(
        &self,
        video_id: &str,
        openers: &[GeneratedClip],
        demo: &DemoRecording,
        closers: &[GeneratedClip],
    ) -> CapResult<BaseVideo> {
        self.hit("stitch".into()).await?;
        let clips: f64 = openers.iter().chain(closers).map(|c| c.duration_sec).sum();
        Ok(BaseVideo {
            reference: format!("videos/{video_id}/base.mp4"),
            duration_sec: demo.duration_sec + clips,
        })
    }
}

#[async_trait]
impl NarrationTranslator for Fake {
    async fn translate(&self, script: &Script, language: &str) -> CapResult<LocalizedLines> {
        self.hit(format!("translate:{language}")).await?;
        let lines = script
            .scenes
            .iter()
            .map(|s| format!("[{language}] {}", s.narration_seed))
            .collect::<Vec<_>>();
        Ok(LocalizedLines { voice_lines: lines.clone(), caption_lines: lines })
    }
}

#[async_trait]
impl VoiceSynthesizer for Fake {
    async fn synthesize(
        &self,
        video_id: &str,
        language: &str,
        _text: &str,
    ) -> CapResult<VoiceOutput> {
        self.hit(format!("voice:{language}")).await?;
        Ok(VoiceOutput {
            reference: format!("videos/{video_id}/tracks/{language}/voice.mp3"),
            duration_sec: 9.5,
        })
    }
}

#[async_trait]
impl CaptionGenerator for Fake {
    async fn captions(
        &self,
        video_id: &str,
        language: &str,
        lines: &[String],
        durations: &[f64],
    ) -> CapResult<String> {
        self.hit(format!("captions:{language}")).await?;
        assert_eq!(lines.len(), durations.len());
        Ok(format!("videos/{video_id}/tracks/{language}/captions.srt"))
    }
}

#[async_trait]
impl Composer for Fake {
    async fn compose(
        &self,
        video_id: &str,
        language: &str,
        _base: &BaseVideo,
        _audio: &str,
        _captions: &str,
    ) -> CapResult<String> {
        self.hit(format!("finalize:{language}")).await?;
        Ok(format!("videos/{video_id}/tracks/{language}/final.mp4"))
    }
}

impl Fake {
    pub fn capabilities(self: &Arc<Self>) -> Capabilities {
        Capabilities {
            summarizer: self.clone(),
            goal: self.clone(),
            recorder: self.clone(),
            script: self.clone(),
            frames: self.clone(),
            clips: self.clone(),
            stitcher: self.clone(),
            translator: self.clone(),
            voice: self.clone(),
            captions: self.clone(),
            composer: self.clone(),
        }
    }
}

/// In-memory store that remembers every `stage` value written to a video.
/// After [`RecordingStore::fail_at`], a video write that sets that stage fails
/// as an outage would.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryStore,
    stages: Mutex<Vec<String>>,
    outage_at: Mutex<Option<String>>,
}

impl RecordingStore {
    pub fn stages(&self) -> Vec<String> { self.stages.lock().unwrap().clone() }

    pub fn reset_stages(&self) { self.stages.lock().unwrap().clear(); }

    pub fn fail_at(&self, stage: &str) {
        *self.outage_at.lock().unwrap() = Some(stage.to_string());
    }

    pub fn recover(&self) { *self.outage_at.lock().unwrap() = None; }
}

#[async_trait]
impl DocumentStore for RecordingStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        self.inner.get(collection, id).await
    }

    async fn create_if_absent(
        &self,
        collection: &str,
        id: &str,
        doc: Value,
    ) -> Result<(Value, bool)> {
        self.inner.create_if_absent(collection, id, doc).await
    }

    async fn merge(&self, collection: &str, id: &str, patch: &Value) -> Result<Option<Value>> {
        if collection == VIDEOS
            && let Some(stage) = patch.get("stage").and_then(Value::as_str)
        {
            if self.outage_at.lock().unwrap().as_deref() == Some(stage) {
                bail!("database is locked");
            }
            self.stages.lock().unwrap().push(stage.to_string());
        }
        self.inner.merge(collection, id, patch).await
    }

    async fn list(&self, collection: &str, query: &Query) -> Result<Vec<Value>> {
        self.inner.list(collection, query).await
    }
}

pub struct Harness {
    pub fake: Arc<Fake>,
    pub store: Arc<RecordingStore>,
    pub records: Records,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub async fn new(languages: &[&str]) -> Self {
        Self::with_website(languages, Some("https://hello.example.com")).await
    }

    pub async fn with_website(languages: &[&str], website_url: Option<&str>) -> Self {
        Self::build(languages, website_url, |_| {}).await
    }

    /// Harness with a tweaked pipeline config, e.g. a short stale window.
    pub async fn with_config(languages: &[&str], tweak: impl FnOnce(&mut PipelineConfig)) -> Self {
        Self::build(languages, Some("https://hello.example.com"), tweak).await
    }

    async fn build(
        languages: &[&str],
        website_url: Option<&str>,
        tweak: impl FnOnce(&mut PipelineConfig),
    ) -> Self {
        let fake = Arc::new(Fake::default());
        let store = Arc::new(RecordingStore::default());
        let records = Records::new(store.clone());
        let mut config = PipelineConfig {
            languages: languages.iter().map(|l| l.to_string()).collect(),
            snapshot_count: 3,
            max_clip_prompts: 2,
            ..Default::default()
        };
        tweak(&mut config);
        let orchestrator = Orchestrator::new(records.clone(), fake.capabilities(), config);
        let harness = Self { fake, store, records, orchestrator };
        harness.seed(website_url).await;
        harness
    }

    pub async fn seed(&self, website_url: Option<&str>) {
        let mut repo = Repo::new("octo", "hello");
        repo.website_url = website_url.map(str::to_string);
        self.records.upsert_repo(&repo).await.unwrap();
        let now = OffsetDateTime::now_utc();
        let commit = Commit {
            owner: "octo".into(),
            repo: "hello".into(),
            sha: "abc1234def5678".into(),
            branch: "main".into(),
            message: Some("Add dark mode".into()),
            author: None,
            timestamp: now,
            pull_request: None,
            files: vec![FileChange {
                path: "src/theme.css".into(),
                kind: ChangeKind::Modified,
                additions: 12,
                deletions: 3,
                patch: None,
            }],
            diff_summary: Some("Adds a dark theme toggle to the settings page".into()),
            demo_goal: None,
            demo: None,
            created_at: now,
            updated_at: now,
        };
        self.records.upsert_commit(&commit).await.unwrap();
    }
}
