use async_trait::async_trait;

use crate::{CapResult, CapabilityError, CaptionGenerator, MediaDir};

const LINE_WIDTH: usize = 42;
const MAX_LINES: usize = 2;

/// Writes SubRip caption tracks into the media directory.
pub struct SrtCaptions {
    media: MediaDir,
}

impl SrtCaptions {
    pub fn new(media: MediaDir) -> Self { Self { media } }
}

#[async_trait]
impl CaptionGenerator for SrtCaptions {
    async fn captions(
        &self,
        video_id: &str,
        language: &str,
        lines: &[String],
        durations: &[f64],
    ) -> CapResult<String> {
        let srt = build_srt(lines, durations)?;
        let reference = self.media.track_ref(video_id, language, "captions.srt");
        let path = self.media.prepare(&reference).await?;
        tokio::fs::write(&path, srt).await.map_err(|e| {
            CapabilityError::permanent(format!("Failed to write {}: {}", path.display(), e))
        })?;
        Ok(reference)
    }
}

/// `HH:MM:SS,mmm`
pub fn format_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;
    format!("{hours:02}:{minutes:02}:{secs:02},{millis:03}")
}

/// Greedy word wrap. Words longer than `width` are split.
fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let mut word = word.to_string();
        while word.chars().count() > width {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            let head = word.chars().take(width).collect::<String>();
            word = word.chars().skip(width).collect();
            lines.push(head);
        }
        if current.is_empty() {
            current = word;
        } else if current.chars().count() + 1 + word.chars().count() <= width {
            current.push(' ');
            current.push_str(&word);
        } else {
            lines.push(std::mem::replace(&mut current, word));
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Fit a caption into at most two lines of 42 characters.
pub fn limit_caption(text: &str) -> String {
    let wrapped = wrap(text.trim(), LINE_WIDTH);
    if wrapped.len() <= MAX_LINES {
        return wrapped.join("\n");
    }
    let rest = wrapped[1..].join(" ").chars().take(LINE_WIDTH).collect::<String>();
    format!("{}\n{}", wrapped[0], rest.trim_end())
}

/// One cue per line, back to back, each lasting its scene's duration.
pub fn build_srt(lines: &[String], durations: &[f64]) -> CapResult<String> {
    if lines.len() != durations.len() {
        return Err(CapabilityError::permanent(format!(
            "{} caption lines for {} scenes",
            lines.len(),
            durations.len()
        )));
    }
    let mut cues = Vec::with_capacity(lines.len());
    let mut current = 0.0;
    for (index, (line, duration)) in lines.iter().zip(durations).enumerate() {
        let start = format_timestamp(current);
        let end = format_timestamp(current + duration);
        cues.push(format!("{}\n{} --> {}\n{}", index + 1, start, end, limit_caption(line)));
        current += duration;
    }
    Ok(format!("{}\n", cues.join("\n\n").trim()))
}
