//! The per-language sub-sequence: narration and voice, captions, then the
//! final composition. Each language carries its own [`LanguageWork`] so that
//! branches can run as independent tasks.

use std::sync::Arc;

use diffcast_capabilities::{Capabilities, CapabilityError, VoiceOutput};
use diffcast_core::video::{LOCALIZED_STAGES, Stage, Track, TrackStatus, Video};
use time::OffsetDateTime;
use tokio::sync::mpsc::UnboundedSender;

use crate::executors::{StageError, StageOutput};

/// Intermediate results for one language, filled in stage by stage.
#[derive(Debug, Clone, Default)]
pub struct LanguageWork {
    pub language: String,
    pub narration: Vec<String>,
    pub caption_lines: Vec<String>,
    pub audio: Option<VoiceOutput>,
    pub captions: Option<String>,
}

impl LanguageWork {
    pub fn new(language: impl Into<String>) -> Self {
        Self { language: language.into(), ..Default::default() }
    }

    /// Run every localized stage in order, announcing each on `progress`
    /// before it starts. Always yields a track for the language: completed,
    /// or failed at the stage that broke.
    pub async fn complete(
        mut self,
        caps: Capabilities,
        video: Arc<Video>,
        progress: UnboundedSender<(String, Stage)>,
    ) -> (String, Track) {
        for stage in LOCALIZED_STAGES {
            // The receiver only goes away once the run is abandoned.
            let _ = progress.send((self.language.clone(), stage));
            match self.run(stage, &caps, &video).await {
                Ok(StageOutput::Finalize { track, .. }) => {
                    tracing::info!(
                        video_id = %video.id,
                        language = %self.language,
                        "Track completed"
                    );
                    return (self.language, track);
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(
                        video_id = %video.id,
                        language = %self.language,
                        stage = %stage,
                        kind = err.kind(),
                        "Language failed: {}",
                        err
                    );
                    let track = self.failed_track(stage, err.to_string());
                    return (self.language, track);
                }
            }
        }
        let track = self.failed_track(Stage::Finalize, "no track was produced");
        (self.language, track)
    }

    /// Run one localized stage. `Finalize` yields the finished track.
    pub async fn run(
        &mut self,
        stage: Stage,
        caps: &Capabilities,
        video: &Video,
    ) -> Result<StageOutput, StageError> {
        match stage {
            Stage::Voice => self.voice(caps, video).await,
            Stage::Captions => self.captions(caps, video).await,
            Stage::Finalize => self.finalize(caps, video).await,
            other => Err(StageError::Configuration(format!("{other} is not a localized stage"))),
        }
    }

    async fn voice(
        &mut self,
        caps: &Capabilities,
        video: &Video,
    ) -> Result<StageOutput, StageError> {
        let script = video
            .script
            .as_ref()
            .ok_or_else(|| StageError::MissingInput("no script available".to_string()))?;
        if video.default_language() == Some(self.language.as_str()) {
            self.narration = script.narration_seeds();
            self.caption_lines = self.narration.clone();
        } else {
            let lines = caps.translator.translate(script, &self.language).await?;
            let scenes = script.scenes.len();
            if lines.voice_lines.len() != scenes || lines.caption_lines.len() != scenes {
                return Err(CapabilityError::Permanent(format!(
                    "translation returned {} voice and {} caption lines for {} scenes",
                    lines.voice_lines.len(),
                    lines.caption_lines.len(),
                    scenes
                ))
                .into());
            }
            if lines.voice_lines.iter().chain(&lines.caption_lines).any(|l| l.trim().is_empty()) {
                return Err(CapabilityError::permanent("translation returned an empty line").into());
            }
            self.narration = lines.voice_lines.iter().map(|l| l.trim().to_string()).collect();
            self.caption_lines = lines.caption_lines.iter().map(|l| l.trim().to_string()).collect();
        }
        let text = self.narration.join(" ");
        let audio = caps.voice.synthesize(&video.id, &self.language, &text).await?;
        tracing::info!(
            video_id = %video.id,
            language = %self.language,
            "Voiceover ready ({:.1}s)",
            audio.duration_sec
        );
        self.audio = Some(audio.clone());
        Ok(StageOutput::Voice {
            language: self.language.clone(),
            narration: self.narration.clone(),
            caption_lines: self.caption_lines.clone(),
            audio,
        })
    }

    async fn captions(
        &mut self,
        caps: &Capabilities,
        video: &Video,
    ) -> Result<StageOutput, StageError> {
        let (Some(script), Some(base)) = (&video.script, &video.base_video) else {
            return Err(StageError::MissingInput("no script or base video available".to_string()));
        };
        if self.caption_lines.is_empty() {
            return Err(StageError::MissingInput(format!("no narration for {}", self.language)));
        }
        let durations = script.scaled_durations(base.duration_sec);
        let captions = caps
            .captions
            .captions(&video.id, &self.language, &self.caption_lines, &durations)
            .await?;
        self.captions = Some(captions.clone());
        Ok(StageOutput::Captions { language: self.language.clone(), captions })
    }

    async fn finalize(
        &self,
        caps: &Capabilities,
        video: &Video,
    ) -> Result<StageOutput, StageError> {
        let base = video
            .base_video
            .as_ref()
            .ok_or_else(|| StageError::MissingInput("no base video available".to_string()))?;
        let (Some(audio), Some(captions)) = (&self.audio, &self.captions) else {
            return Err(StageError::MissingInput(format!(
                "voice or captions missing for {}",
                self.language
            )));
        };
        let final_video = caps
            .composer
            .compose(&video.id, &self.language, base, &audio.reference, captions)
            .await?;
        let track = Track {
            status: TrackStatus::Completed,
            narration: self.narration.clone(),
            audio: Some(audio.reference.clone()),
            captions: Some(captions.clone()),
            final_video: Some(final_video),
            duration_sec: Some(audio.duration_sec),
            failed_stage: None,
            error: None,
            finished_at: OffsetDateTime::now_utc(),
        };
        Ok(StageOutput::Finalize { language: self.language.clone(), track })
    }

    /// Track recording a failure at `stage`, keeping whatever was produced
    /// before it.
    pub fn failed_track(&self, stage: Stage, error: impl Into<String>) -> Track {
        Track {
            status: TrackStatus::Failed,
            narration: self.narration.clone(),
            audio: self.audio.as_ref().map(|a| a.reference.clone()),
            captions: self.captions.clone(),
            final_video: None,
            duration_sec: self.audio.as_ref().map(|a| a.duration_sec),
            failed_stage: Some(stage),
            error: Some(error.into()),
            finished_at: OffsetDateTime::now_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_track_keeps_partial_output() {
        let mut work = LanguageWork::new("fr");
        work.narration = vec!["Bonjour".into()];
        work.audio = Some(VoiceOutput {
            reference: "videos/v/tracks/fr/voice.mp3".into(),
            duration_sec: 3.5,
        });
        let track = work.failed_track(Stage::Captions, "caption service down");
        assert_eq!(track.status, TrackStatus::Failed);
        assert_eq!(track.failed_stage, Some(Stage::Captions));
        assert_eq!(track.audio.as_deref(), Some("videos/v/tracks/fr/voice.mp3"));
        assert_eq!(track.duration_sec, Some(3.5));
        assert!(track.final_video.is_none());
        assert_eq!(track.error.as_deref(), Some("caption service down"));
    }
}
