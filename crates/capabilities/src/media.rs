use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use diffcast_core::{
    util::join_normalized,
    video::{BaseVideo, DemoRecording, GeneratedClip},
};
use serde::Deserialize;
use tokio::process::Command;

use crate::{CapResult, CapabilityError, Composer, FrameExtractor, RetryPolicy, Stitcher};

/// Durations the clip generator accepts, in seconds.
pub const CLIP_DURATIONS: [u32; 3] = [4, 6, 8];

const FRAME_WIDTH: u32 = 1280;
const FRAME_HEIGHT: u32 = 720;

/// Snap a requested clip length to the nearest supported duration.
pub fn snap_clip_duration(requested_sec: f64) -> u32 {
    CLIP_DURATIONS
        .into_iter()
        .min_by(|a, b| {
            let da = (*a as f64 - requested_sec).abs();
            let db = (*b as f64 - requested_sec).abs();
            da.total_cmp(&db)
        })
        .unwrap_or(CLIP_DURATIONS[0])
}

/// Uniformly spaced sample points, excluding the very start and end.
pub fn frame_timestamps(duration_sec: f64, count: usize) -> Vec<f64> {
    (0..count).map(|i| duration_sec * (i + 1) as f64 / (count + 1) as f64).collect()
}

/// Root of every generated artifact. References handed around the pipeline
/// are paths relative to this directory.
#[derive(Debug, Clone)]
pub struct MediaDir {
    root: PathBuf,
}

impl MediaDir {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    pub fn root(&self) -> &Path { &self.root }

    pub fn video_ref(&self, video_id: &str, name: &str) -> String {
        format!("videos/{video_id}/{name}")
    }

    pub fn track_ref(&self, video_id: &str, language: &str, name: &str) -> String {
        format!("videos/{video_id}/tracks/{language}/{name}")
    }

    pub fn path(&self, reference: &str) -> PathBuf { join_normalized(&self.root, reference) }

    /// Resolve `reference` and make sure its directory exists.
    pub async fn prepare(&self, reference: &str) -> CapResult<PathBuf> {
        let path = self.path(reference);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CapabilityError::permanent(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        Ok(path)
    }

    /// Fail unless `reference` points at a non-empty file.
    pub async fn check_output(&self, reference: &str) -> CapResult<()> {
        match tokio::fs::metadata(self.path(reference)).await {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(CapabilityError::permanent(format!("{reference} is missing or empty"))),
        }
    }
}

/// Run an external tool to completion, returning its stdout.
///
/// A non-zero exit is a permanent failure carrying the tail of stderr. The
/// child is killed if the returned future is dropped, so a surrounding
/// timeout does not leak processes.
pub async fn run_tool(program: &str, args: &[String]) -> CapResult<String> {
    tracing::debug!("Running {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| CapabilityError::permanent(format!("Failed to run {program}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail = stderr.trim().lines().rev().take(5).collect::<Vec<_>>();
        let detail = tail.into_iter().rev().collect::<Vec<_>>().join("\n");
        return Err(CapabilityError::permanent(format!(
            "{program} exited with {}: {}",
            output.status,
            if detail.is_empty() { "no output" } else { detail.as_str() }
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `ffmpeg`/`ffprobe` backed media transforms.
pub struct Ffmpeg {
    ffmpeg: String,
    ffprobe: String,
    media: MediaDir,
    timeout: Duration,
    retry: RetryPolicy,
}

#[derive(Deserialize)]
struct FormatReport {
    format: Option<FormatSection>,
}

#[derive(Deserialize)]
struct FormatSection {
    duration: Option<String>,
}

impl Ffmpeg {
    pub fn new(ffmpeg: String, ffprobe: String, media: MediaDir, timeout: Duration) -> Self {
        // Local tools fail the same way twice; don't retry them.
        Self { ffmpeg, ffprobe, media, timeout, retry: RetryPolicy::none() }
    }

    pub fn media(&self) -> &MediaDir { &self.media }

    /// Container duration of a media reference, in seconds.
    pub async fn media_duration(&self, reference: &str) -> CapResult<f64> {
        let path = self.media.path(reference);
        let args = vec![
            "-v".to_string(),
            "error".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "json".to_string(),
            path.to_string_lossy().into_owned(),
        ];
        let stdout = self
            .retry
            .run("ffprobe", self.timeout, || run_tool(&self.ffprobe, &args))
            .await?;
        let report: FormatReport = serde_json::from_str(&stdout).map_err(|e| {
            CapabilityError::permanent(format!("ffprobe returned invalid JSON: {e}"))
        })?;
        let duration = report
            .format
            .and_then(|f| f.duration)
            .and_then(|d| d.parse::<f64>().ok())
            .unwrap_or(0.0);
        if duration <= 0.0 {
            return Err(CapabilityError::permanent(format!("{reference} has no valid duration")));
        }
        Ok(duration)
    }

    async fn run_ffmpeg(&self, operation: &str, args: Vec<String>) -> CapResult<()> {
        self.retry.run(operation, self.timeout, || run_tool(&self.ffmpeg, &args)).await?;
        Ok(())
    }
}

fn s(value: impl Into<String>) -> String { value.into() }

fn path_arg(path: &Path) -> String { path.to_string_lossy().into_owned() }

#[async_trait]
impl FrameExtractor for Ffmpeg {
    async fn extract_frames(
        &self,
        video_id: &str,
        recording: &DemoRecording,
        count: usize,
    ) -> CapResult<Vec<String>> {
        if count == 0 {
            return Err(CapabilityError::permanent("frame count must be at least 1"));
        }
        let input = self.media.path(&recording.reference);
        let mut frames = Vec::with_capacity(count);
        let timestamps = frame_timestamps(recording.duration_sec, count);
        for (i, timestamp) in timestamps.into_iter().enumerate() {
            let reference = self.media.video_ref(video_id, &format!("frames/frame_{i:02}.png"));
            let output = self.media.prepare(&reference).await?;
            let args = vec![
                s("-y"),
                s("-ss"),
                format!("{timestamp:.3}"),
                s("-i"),
                path_arg(&input),
                s("-vframes"),
                s("1"),
                s("-q:v"),
                s("2"),
                path_arg(&output),
            ];
            self.run_ffmpeg("ffmpeg frame", args).await?;
            self.media.check_output(&reference).await?;
            tracing::debug!("Extracted frame {} at {:.2}s for {}", i, timestamp, video_id);
            frames.push(reference);
        }
        Ok(frames)
    }
}

#[async_trait]
impl Stitcher for Ffmpeg {
    async fn stitch(
        &self,
        video_id: &str,
        openers: &[GeneratedClip],
        demo: &DemoRecording,
        closers: &[GeneratedClip],
    ) -> CapResult<BaseVideo> {
        let inputs = openers
            .iter()
            .map(|c| c.reference.as_str())
            .chain([demo.reference.as_str()])
            .chain(closers.iter().map(|c| c.reference.as_str()))
            .collect::<Vec<_>>();
        let reference = self.media.video_ref(video_id, "base.mp4");
        let output = self.media.prepare(&reference).await?;

        let mut args = vec![s("-y")];
        for input in &inputs {
            args.push(s("-i"));
            args.push(path_arg(&self.media.path(input)));
        }
        let mut filter = String::new();
        for i in 0..inputs.len() {
            filter.push_str(&format!(
                "[{i}:v]scale={FRAME_WIDTH}:{FRAME_HEIGHT}:force_original_aspect_ratio=decrease,\
                 pad={FRAME_WIDTH}:{FRAME_HEIGHT}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps=30[v{i}];"
            ));
        }
        for i in 0..inputs.len() {
            filter.push_str(&format!("[v{i}]"));
        }
        filter.push_str(&format!("concat=n={}:v=1:a=0[outv]", inputs.len()));
        args.extend([
            s("-filter_complex"),
            filter,
            s("-map"),
            s("[outv]"),
            s("-c:v"),
            s("libx264"),
            s("-preset"),
            s("veryfast"),
            s("-pix_fmt"),
            s("yuv420p"),
            path_arg(&output),
        ]);
        self.run_ffmpeg("ffmpeg stitch", args).await?;
        self.media.check_output(&reference).await?;
        let duration_sec = self.media_duration(&reference).await?;
        tracing::info!(
            "Stitched {} segments for {} ({:.1}s)",
            inputs.len(),
            video_id,
            duration_sec
        );
        Ok(BaseVideo { reference, duration_sec })
    }
}

#[async_trait]
impl Composer for Ffmpeg {
    async fn compose(
        &self,
        video_id: &str,
        language: &str,
        base: &BaseVideo,
        audio: &str,
        captions: &str,
    ) -> CapResult<String> {
        let reference = self.media.track_ref(video_id, language, "final.mp4");
        let output = self.media.prepare(&reference).await?;
        let args = vec![
            s("-y"),
            s("-i"),
            path_arg(&self.media.path(&base.reference)),
            s("-i"),
            path_arg(&self.media.path(audio)),
            s("-i"),
            path_arg(&self.media.path(captions)),
            s("-map"),
            s("0:v:0"),
            s("-map"),
            s("1:a:0"),
            s("-map"),
            s("2:0"),
            s("-c:v"),
            s("copy"),
            s("-c:a"),
            s("aac"),
            s("-b:a"),
            s("192k"),
            s("-c:s"),
            s("mov_text"),
            s("-metadata:s:s:0"),
            format!("language={}", subtitle_language(language)),
            s("-shortest"),
            path_arg(&output),
        ];
        self.run_ffmpeg("ffmpeg compose", args).await?;
        self.media.check_output(&reference).await?;
        Ok(reference)
    }
}

/// ISO 639-2 tag for the subtitle stream, `und` when unknown.
fn subtitle_language(language: &str) -> &'static str {
    match language.split('-').next().unwrap_or_default() {
        "en" => "eng",
        "es" => "spa",
        "fr" => "fra",
        "de" => "deu",
        "hi" => "hin",
        "it" => "ita",
        "ja" => "jpn",
        "ko" => "kor",
        "pt" => "por",
        _ => "und",
    }
}
