use std::sync::OnceLock;

use diffcast_capabilities::{
    Capabilities, CapabilityError, ClipRequest, ScriptDraft, ScriptRequest, VoiceOutput,
    snap_clip_duration,
};
use diffcast_core::{
    config::PipelineConfig,
    models::{Commit, Repo},
    video::{
        BaseVideo, ClipPrompt, ClipRole, DemoRecording, GeneratedClip, Scene, Script, Stage,
        Track, Video,
    },
};
use diffcast_db::VideoPatch;
use regex::Regex;
use serde::Serialize;

const MAX_SCENES: usize = 8;
const MIN_SCENE_SEC: f64 = 2.0;
const MAX_SCENE_SEC: f64 = 20.0;
const MAX_TOTAL_SEC: f64 = 120.0;
const DEFAULT_CLIP_SEC: f64 = 6.0;

const TITLE_CHARS: usize = 120;
const SUMMARY_CHARS: usize = 260;
const ON_SCREEN_CHARS: usize = 240;
const NARRATION_CHARS: usize = 260;

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Something the operator has to fix, e.g. a missing website URL.
    #[error("{0}")]
    Configuration(String),
    /// An upstream artifact this stage depends on is absent.
    #[error("{0}")]
    MissingInput(String),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
}

impl StageError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::MissingInput(_) => "missing_input",
            Self::Capability(err) => err.kind(),
        }
    }
}

/// What a single stage produced. Shared stages turn into record updates via
/// [`StageOutput::into_patch`]; localized stages are folded into a [`Track`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "lowercase")]
pub enum StageOutput {
    Goal { goal: String },
    Demo { recording: DemoRecording },
    Script { script: Script },
    Snapshots { frames: Vec<String> },
    Clipgen { clips: Vec<GeneratedClip> },
    Stitch { base_video: BaseVideo },
    Voice {
        language: String,
        narration: Vec<String>,
        caption_lines: Vec<String>,
        audio: VoiceOutput,
    },
    Captions { language: String, captions: String },
    Finalize { language: String, track: Track },
}

impl StageOutput {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Goal { .. } => Stage::Goal,
            Self::Demo { .. } => Stage::Demo,
            Self::Script { .. } => Stage::Script,
            Self::Snapshots { .. } => Stage::Snapshots,
            Self::Clipgen { .. } => Stage::Clipgen,
            Self::Stitch { .. } => Stage::Stitch,
            Self::Voice { .. } => Stage::Voice,
            Self::Captions { .. } => Stage::Captions,
            Self::Finalize { .. } => Stage::Finalize,
        }
    }

    /// Record fields written by this output. Intermediate localized outputs
    /// write nothing; a finished language writes its track.
    pub fn into_patch(self) -> VideoPatch {
        let mut patch = VideoPatch::default();
        match self {
            Self::Goal { goal } => patch.goal = Some(Some(goal)),
            Self::Demo { recording } => patch.demo = Some(Some(recording)),
            Self::Script { script } => patch.script = Some(Some(script)),
            Self::Snapshots { frames } => patch.frames = Some(Some(frames)),
            Self::Clipgen { clips } => patch.clips = Some(Some(clips)),
            Self::Stitch { base_video } => patch.base_video = Some(Some(base_video)),
            Self::Finalize { language, track } => patch.set_track(language, Some(track)),
            Self::Voice { .. } | Self::Captions { .. } => {}
        }
        patch
    }
}

/// Inputs shared by every language-independent executor.
pub struct StageContext<'a> {
    pub caps: &'a Capabilities,
    pub config: &'a PipelineConfig,
    pub video: &'a Video,
    pub commit: &'a Commit,
    pub repo: Option<&'a Repo>,
}

/// Run one language-independent stage against a snapshot of the record.
pub async fn run_shared(stage: Stage, ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
    match stage {
        Stage::Goal => goal(ctx).await,
        Stage::Demo => demo(ctx).await,
        Stage::Script => script(ctx).await,
        Stage::Snapshots => snapshots(ctx).await,
        Stage::Clipgen => clipgen(ctx).await,
        Stage::Stitch => stitch(ctx).await,
        other => Err(StageError::Configuration(format!("{other} is not a shared stage"))),
    }
}

fn require<'a, T>(value: Option<&'a T>, what: &str) -> Result<&'a T, StageError> {
    value.ok_or_else(|| StageError::MissingInput(format!("no {what} available")))
}

async fn goal(ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
    let summary = ctx
        .commit
        .diff_summary
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| {
            StageError::MissingInput(format!("commit {} has no diff summary", ctx.commit.key()))
        })?;
    let goal = ctx.caps.goal.extract_goal(summary, &ctx.commit.files).await?;
    let goal = goal.trim().to_string();
    if goal.is_empty() {
        return Err(CapabilityError::permanent("goal extractor returned an empty goal").into());
    }
    Ok(StageOutput::Goal { goal })
}

async fn demo(ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
    let goal = require(ctx.video.goal.as_ref(), "goal")?;
    let url = ctx
        .repo
        .and_then(|r| r.website_url.as_deref())
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| {
            StageError::Configuration(format!(
                "no website URL configured for {}",
                ctx.commit.full_name()
            ))
        })?;
    let recording = ctx.caps.recorder.record(&ctx.video.id, goal, url).await?;
    Ok(StageOutput::Demo { recording })
}

async fn script(ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
    let goal = require(ctx.video.goal.as_ref(), "goal")?;
    let demo = require(ctx.video.demo.as_ref(), "demo recording")?;
    let request = ScriptRequest {
        goal,
        diff_summary: ctx.commit.diff_summary.as_deref(),
        commit_message: ctx.commit.message.as_deref(),
        demo_duration_sec: demo.duration_sec,
        max_clip_prompts: ctx.config.max_clip_prompts,
    };
    let draft = ctx.caps.script.generate_script(&request).await?;
    let script = validate_script(draft, ctx.config.max_clip_prompts)
        .map_err(|reason| CapabilityError::Permanent(format!("invalid script: {reason}")))?;
    Ok(StageOutput::Script { script })
}

async fn snapshots(ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
    let demo = require(ctx.video.demo.as_ref(), "demo recording")?;
    let count = ctx.config.snapshot_count;
    let frames = ctx.caps.frames.extract_frames(&ctx.video.id, demo, count).await?;
    if frames.is_empty() && count > 0 {
        return Err(CapabilityError::permanent("no frames could be extracted").into());
    }
    Ok(StageOutput::Snapshots { frames })
}

async fn clipgen(ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
    let script = require(ctx.video.script.as_ref(), "script")?;
    let frames = ctx.video.frames.as_deref().unwrap_or(&[]);
    let mut clips = Vec::with_capacity(script.clip_prompts.len());
    for (index, prompt) in script.clip_prompts.iter().enumerate() {
        let reference_image = match prompt.role {
            ClipRole::Opener => frames.first(),
            ClipRole::Closer => frames.last(),
        };
        let request = ClipRequest {
            index,
            role: prompt.role,
            prompt: &prompt.prompt,
            reference_image: reference_image.map(String::as_str),
            duration_sec: snap_clip_duration(prompt.duration_sec),
        };
        let clip = ctx.caps.clips.generate_clip(&ctx.video.id, &request).await.map_err(|err| {
            let message = format!("{} clip {}: {}", prompt.role.as_str(), index, err);
            match err {
                CapabilityError::Transient(_) => CapabilityError::Transient(message),
                _ => CapabilityError::Permanent(message),
            }
        })?;
        clips.push(clip);
    }
    Ok(StageOutput::Clipgen { clips })
}

async fn stitch(ctx: &StageContext<'_>) -> Result<StageOutput, StageError> {
    let demo = require(ctx.video.demo.as_ref(), "demo recording")?;
    let clips = require(ctx.video.clips.as_ref(), "generated clips")?;
    let (openers, closers): (Vec<GeneratedClip>, Vec<GeneratedClip>) =
        clips.iter().cloned().partition(|c| c.role == ClipRole::Opener);
    let base_video = ctx.caps.stitcher.stitch(&ctx.video.id, &openers, demo, &closers).await?;
    Ok(StageOutput::Stitch { base_video })
}

fn truncate(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head = text.chars().take(max_chars.saturating_sub(3)).collect::<String>();
    format!("{}...", head.trim_end())
}

/// First engineering term found in `text`, lower-cased.
fn find_jargon(text: &str) -> Option<String> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)\b(api|class|function|refactor|endpoint|backend|frontend|schema|regex|cli|sql",
            r"|database|cache|repository)\b",
        ))
        .unwrap()
    });
    regex.find(text).map(|m| m.as_str().to_ascii_lowercase())
}

/// Check and normalize a generated scene plan. The error is a human-readable
/// reason.
pub fn validate_script(draft: ScriptDraft, max_clip_prompts: usize) -> Result<Script, String> {
    let title = truncate(&draft.title, TITLE_CHARS);
    if title.is_empty() {
        return Err("missing title".to_string());
    }
    let summary = truncate(&draft.summary, SUMMARY_CHARS);
    if summary.is_empty() {
        return Err("missing summary".to_string());
    }
    if draft.scenes.is_empty() {
        return Err("no scenes".to_string());
    }
    if draft.scenes.len() > MAX_SCENES {
        return Err(format!("{} scenes, at most {} allowed", draft.scenes.len(), MAX_SCENES));
    }

    let mut scenes = Vec::with_capacity(draft.scenes.len());
    for (i, scene) in draft.scenes.iter().enumerate() {
        let number = i + 1;
        let on_screen_text = truncate(&scene.on_screen_text, ON_SCREEN_CHARS);
        if on_screen_text.is_empty() {
            return Err(format!("scene {number} has no on-screen text"));
        }
        let narration_seed = truncate(&scene.narration_seed, NARRATION_CHARS);
        if narration_seed.is_empty() {
            return Err(format!("scene {number} has no narration"));
        }
        let duration_sec =
            scene.duration_sec.ok_or_else(|| format!("scene {number} has no duration"))?;
        if !(MIN_SCENE_SEC..=MAX_SCENE_SEC).contains(&duration_sec) {
            return Err(format!(
                "scene {number} lasts {duration_sec}s, expected {MIN_SCENE_SEC}-{MAX_SCENE_SEC}s"
            ));
        }
        scenes.push(Scene { on_screen_text, narration_seed, duration_sec });
    }
    let total: f64 = scenes.iter().map(|s| s.duration_sec).sum();
    if total > MAX_TOTAL_SEC {
        return Err(format!("scenes last {total}s in total, at most {MAX_TOTAL_SEC}s allowed"));
    }

    let texts = [title.as_str(), summary.as_str()].into_iter().chain(
        scenes.iter().flat_map(|s| [s.on_screen_text.as_str(), s.narration_seed.as_str()]),
    );
    for text in texts {
        if let Some(word) = find_jargon(text) {
            return Err(format!("uses engineering jargon '{word}'"));
        }
    }

    let clip_prompts = draft
        .clip_prompts
        .into_iter()
        .filter(|p| !p.prompt.trim().is_empty())
        .take(max_clip_prompts)
        .enumerate()
        .map(|(i, p)| ClipPrompt {
            role: p.role.trim().to_ascii_lowercase().parse().unwrap_or(if i == 0 {
                ClipRole::Opener
            } else {
                ClipRole::Closer
            }),
            prompt: p.prompt.trim().to_string(),
            duration_sec: p.duration_sec.filter(|d| *d > 0.0).unwrap_or(DEFAULT_CLIP_SEC),
        })
        .collect();

    Ok(Script {
        title,
        summary,
        scenes,
        clip_prompts,
        total_duration_sec: (total * 100.0).round() / 100.0,
    })
}
