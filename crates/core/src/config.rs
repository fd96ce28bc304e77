use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub db: DbConfig,
    pub github: GitHubConfig,
    pub openai: Option<OpenAiConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub capabilities: CapabilitiesConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DbConfig {
    pub url: String,
    /// Separate SQLite database backing the background job queue.
    #[serde(default = "default_jobs_url")]
    pub jobs_url: String,
}

fn default_jobs_url() -> String { "sqlite://jobs.db".to_string() }

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    pub token: String,
    /// Shared webhook secret. Signature verification is skipped when unset.
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_speech_model")]
    pub speech_model: String,
    #[serde(default = "default_voice")]
    pub default_voice: String,
}

fn default_chat_model() -> String { "gpt-4o-mini".to_string() }

fn default_speech_model() -> String { "tts-1".to_string() }

fn default_voice() -> String { "alloy".to_string() }

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub default_language: String,
    /// Languages used when a trigger does not name any.
    pub languages: Vec<String>,
    pub media_dir: PathBuf,
    pub snapshot_count: usize,
    pub max_clip_prompts: usize,
    pub stale_after_secs: u64,
    /// Per-language voice overrides for speech synthesis.
    pub voices: BTreeMap<String, String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_language: "en".to_string(),
            languages: vec!["en".to_string()],
            media_dir: PathBuf::from("media"),
            snapshot_count: 3,
            max_clip_prompts: 2,
            stale_after_secs: 15 * 60,
            voices: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    pub fn stale_after(&self) -> Duration { Duration::from_secs(self.stale_after_secs) }

    /// How often a live run refreshes its claim while a stage is in flight.
    /// A quarter of the stale window, so several refreshes must be missed
    /// before a sweep may take the run over.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.stale_after() / 4).max(Duration::from_millis(100))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CapabilitiesConfig {
    /// Browser-automation recording service.
    pub recorder_url: Option<Url>,
    /// AI video clip generation service.
    pub clip_service_url: Option<Url>,
    pub ffmpeg: String,
    pub ffprobe: String,
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
}

impl Default for CapabilitiesConfig {
    fn default() -> Self {
        Self {
            recorder_url: None,
            clip_service_url: None,
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per adapter call, including the first.
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self { Self { attempts: 3, base_delay_ms: 500, max_delay_ms: 8000 } }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub default_secs: u64,
    pub recorder_secs: u64,
    pub clip_secs: u64,
    pub voice_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { default_secs: 120, recorder_secs: 300, clip_secs: 600, voice_secs: 180 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub pipeline_concurrency: usize,
    /// Job-level retries, for runs that stopped on a store error.
    pub retry_attempts: usize,
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { pipeline_concurrency: 2, retry_attempts: 3, shutdown_timeout_secs: 30 }
    }
}
