use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
        CreateSpeechRequestArgs, ResponseFormat, SpeechModel, SpeechResponseFormat, Voice,
    },
};
use async_trait::async_trait;
use diffcast_core::{
    config::{OpenAiConfig, TimeoutConfig},
    models::{Commit, FileChange},
    video::Script,
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;

use crate::{
    CapResult, CapabilityError, DiffSummarizer, Ffmpeg, GoalExtractor, LocalizedLines, MediaDir,
    NarrationTranslator, RetryPolicy, ScriptDraft, ScriptGenerator, ScriptRequest,
    VoiceOutput, VoiceSynthesizer,
};

const MAX_DIFF_CHARS: usize = 18_000;
const MAX_LISTED_FILES: usize = 30;

/// Language and speech capabilities backed by an OpenAI-compatible API.
pub struct OpenAi {
    client: Client<OpenAIConfig>,
    chat_model: String,
    speech_model: String,
    default_voice: String,
    voices: BTreeMap<String, String>,
    media: MediaDir,
    ffmpeg: Arc<Ffmpeg>,
    retry: RetryPolicy,
    timeouts: TimeoutConfig,
}

impl OpenAi {
    pub fn new(
        config: &OpenAiConfig,
        voices: BTreeMap<String, String>,
        media: MediaDir,
        ffmpeg: Arc<Ffmpeg>,
        retry: RetryPolicy,
        timeouts: TimeoutConfig,
    ) -> Self {
        let mut client_config = OpenAIConfig::new().with_api_key(&config.api_key);
        if let Some(base_url) = &config.base_url {
            client_config = client_config.with_api_base(base_url);
        }
        Self {
            client: Client::with_config(client_config),
            chat_model: config.chat_model.clone(),
            speech_model: config.speech_model.clone(),
            default_voice: config.default_voice.clone(),
            voices,
            media,
            ffmpeg,
            retry,
            timeouts,
        }
    }

    async fn complete(&self, system: &str, user: &str, json_mode: bool) -> CapResult<String> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system)
                .build()
                .map_err(classify)?
                .into(),
            ChatCompletionRequestUserMessageArgs::default()
                .content(user)
                .build()
                .map_err(classify)?
                .into(),
        ];
        let mut request = CreateChatCompletionRequestArgs::default();
        request.model(&self.chat_model).messages(messages).temperature(0.2);
        if json_mode {
            request.response_format(ResponseFormat::JsonObject);
        }
        let request = request.build().map_err(classify)?;
        let response = self.client.chat().create(request).await.map_err(classify)?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| CapabilityError::transient("model returned an empty response"))
    }

    async fn chat_text(&self, operation: &str, system: &str, user: &str) -> CapResult<String> {
        let timeout = Duration::from_secs(self.timeouts.default_secs);
        self.retry.run(operation, timeout, || self.complete(system, user, false)).await
    }

    async fn chat_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        system: &str,
        user: &str,
    ) -> CapResult<T> {
        let timeout = Duration::from_secs(self.timeouts.default_secs);
        self.retry
            .run(operation, timeout, move || async move {
                let content = self.complete(system, user, true).await?;
                serde_json::from_str::<T>(&content).map_err(|e| {
                    CapabilityError::transient(format!("model returned malformed JSON: {e}"))
                })
            })
            .await
    }

    fn voice_for(&self, language: &str) -> Voice {
        let base = language.split('-').next().unwrap_or(language);
        let name = self
            .voices
            .get(language)
            .or_else(|| self.voices.get(base))
            .unwrap_or(&self.default_voice);
        match name.to_ascii_lowercase().as_str() {
            "alloy" => Voice::Alloy,
            "echo" => Voice::Echo,
            "fable" => Voice::Fable,
            "onyx" => Voice::Onyx,
            "nova" => Voice::Nova,
            "shimmer" => Voice::Shimmer,
            other => {
                tracing::warn!("Unknown voice '{}' for {}, using alloy", other, language);
                Voice::Alloy
            }
        }
    }

    fn speech_model(&self) -> SpeechModel {
        match self.speech_model.as_str() {
            "tts-1" => SpeechModel::Tts1,
            "tts-1-hd" => SpeechModel::Tts1Hd,
            other => SpeechModel::Other(other.to_string()),
        }
    }

    async fn speak(&self, reference: &str, language: &str, text: &str) -> CapResult<()> {
        let request = CreateSpeechRequestArgs::default()
            .input(text)
            .voice(self.voice_for(language))
            .model(self.speech_model())
            .response_format(SpeechResponseFormat::Mp3)
            .build()
            .map_err(classify)?;
        let response = self.client.audio().speech(request).await.map_err(classify)?;
        if response.bytes.is_empty() {
            return Err(CapabilityError::permanent(format!(
                "speech synthesis produced no audio for {language}"
            )));
        }
        let path = self.media.prepare(reference).await?;
        tokio::fs::write(&path, &response.bytes).await.map_err(|e| {
            CapabilityError::permanent(format!("Failed to write {}: {}", path.display(), e))
        })
    }
}

/// Map API failures onto retry classes.
fn classify(err: OpenAIError) -> CapabilityError {
    match err {
        OpenAIError::Reqwest(e) => CapabilityError::transient(e.to_string()),
        OpenAIError::ApiError(api) => {
            let kind = api.r#type.clone().unwrap_or_default();
            let message = api.message.to_lowercase();
            let retryable = kind == "server_error"
                || message.contains("rate limit")
                || message.contains("overloaded");
            if retryable {
                CapabilityError::Transient(api.message)
            } else {
                CapabilityError::Permanent(api.message)
            }
        }
        OpenAIError::JSONDeserialize(e) => CapabilityError::transient(e.to_string()),
        other => CapabilityError::permanent(other.to_string()),
    }
}

/// Concatenate per-file patches into one prompt payload, bounded in size.
pub fn diff_payload(files: &[FileChange], max_chars: usize) -> String {
    let mut out = String::new();
    for file in files {
        let Some(patch) = file.patch.as_deref().filter(|p| !p.is_empty()) else {
            continue;
        };
        let remaining = max_chars.saturating_sub(out.len());
        if remaining == 0 {
            break;
        }
        let body =
            format!("FILE: {}\nSTATUS: {}\nPATCH:\n{}\n\n", file.path, file.kind.as_str(), patch);
        if body.len() > remaining {
            let cut = (0..=remaining).rev().find(|i| body.is_char_boundary(*i)).unwrap_or(0);
            out.push_str(&body[..cut]);
            out.push_str("\n...TRUNCATED...");
            break;
        }
        out.push_str(&body);
    }
    out
}

fn file_list(files: &[FileChange]) -> String {
    files
        .iter()
        .take(MAX_LISTED_FILES)
        .map(|f| format!("- {} ({}, +{} -{})", f.path, f.kind.as_str(), f.additions, f.deletions))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl DiffSummarizer for OpenAi {
    async fn summarize(&self, commit: &Commit) -> CapResult<String> {
        let diff = diff_payload(&commit.files, MAX_DIFF_CHARS);
        if diff.trim().is_empty() {
            return Err(CapabilityError::permanent("commit has no patch content to summarize"));
        }
        let system = "You describe code changes to product people. Write two to four plain \
                      sentences about what changed for users. No code, no file names.";
        let user = format!(
            "Repository: {}\nCommit message: {}\nChanged files:\n{}\n\nUnified diff:\n{}",
            commit.full_name(),
            commit.message.as_deref().unwrap_or_default(),
            file_list(&commit.files),
            diff
        );
        self.chat_text("summarize", system, &user).await
    }
}

#[derive(Deserialize)]
struct GoalResponse {
    #[serde(default)]
    goal: String,
}

#[async_trait]
impl GoalExtractor for OpenAi {
    async fn extract_goal(&self, diff_summary: &str, files: &[FileChange]) -> CapResult<String> {
        let system = "You plan short product demos. Given a change summary, describe in at most \
                      70 words the steps a person takes in the browser to show the new feature \
                      and what they should see. Respond with JSON: {\"goal\": \"...\"}.";
        let user =
            format!("Change summary:\n{}\n\nChanged files:\n{}", diff_summary, file_list(files));
        let response: GoalResponse = self.chat_json("goal", system, &user).await?;
        let goal = response.goal.trim().to_string();
        if goal.is_empty() {
            return Err(CapabilityError::permanent("model returned an empty goal"));
        }
        Ok(goal)
    }
}

#[async_trait]
impl ScriptGenerator for OpenAi {
    async fn generate_script(&self, request: &ScriptRequest<'_>) -> CapResult<ScriptDraft> {
        let system = "You write short, upbeat product update videos for non-technical viewers. \
                      Never use engineering words such as API, endpoint, refactor, schema, \
                      backend or database.";
        let shape = json!({
            "title": "string",
            "summary": "string",
            "scenes": [{ "on_screen_text": "string", "narration_seed": "string", "duration_sec": 5 }],
            "clip_prompts": [{ "role": "opener | closer", "prompt": "string", "duration_sec": 6 }],
        });
        let user = format!(
            "Return JSON only, shaped like:\n{}\n\nRules:\n\
             - 3 to 6 scenes, each 3 to 12 seconds; together they should last about {:.0} seconds.\n\
             - on_screen_text at most 140 characters, narration_seed at most 180.\n\
             - At most {} clip_prompts describing short cinematic clips; role is opener or closer.\n\n\
             Demo goal:\n{}\n\nChange summary:\n{}\n\nCommit message: {}",
            shape,
            request.demo_duration_sec,
            request.max_clip_prompts,
            request.goal,
            request.diff_summary.unwrap_or("(none)"),
            request.commit_message.unwrap_or("(none)"),
        );
        self.chat_json("script", system, &user).await
    }
}

#[async_trait]
impl NarrationTranslator for OpenAi {
    async fn translate(&self, script: &Script, language: &str) -> CapResult<LocalizedLines> {
        let system = "You write narration and caption lines for short product videos in simple, \
                      non-technical language.";
        let source = json!({
            "language": language,
            "title": script.title,
            "summary": script.summary,
            "scene_narration_seed": script.narration_seeds(),
            "scene_on_screen_text":
                script.scenes.iter().map(|s| s.on_screen_text.as_str()).collect::<Vec<_>>(),
        });
        let user = format!(
            "Return JSON only: {{\"voice_lines\": [string], \"caption_lines\": [string]}}.\n\
             - Exactly one line of each per scene ({} scenes).\n\
             - No numbering or extra metadata.\n\
             - Output language: {}\n\nSource:\n{}",
            script.scenes.len(),
            language,
            source
        );
        self.chat_json("translate", system, &user).await
    }
}

#[async_trait]
impl VoiceSynthesizer for OpenAi {
    async fn synthesize(
        &self,
        video_id: &str,
        language: &str,
        text: &str,
    ) -> CapResult<VoiceOutput> {
        let reference = self.media.track_ref(video_id, language, "voice.mp3");
        let timeout = Duration::from_secs(self.timeouts.voice_secs);
        self.retry.run("voice", timeout, || self.speak(&reference, language, text)).await?;
        let duration_sec = self.ffmpeg.media_duration(&reference).await?;
        tracing::info!(video_id, language, "Synthesized voiceover ({:.1}s)", duration_sec);
        Ok(VoiceOutput { reference, duration_sec })
    }
}
