//! Adapters for the browser-automation recorder and the AI clip service, both
//! reached over plain JSON HTTP.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use diffcast_core::video::{ClipRole, DemoRecording, GeneratedClip};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    CapResult, CapabilityError, ClipGenerator, ClipRequest, Ffmpeg, MediaDir, Recorder,
    RetryPolicy,
};

const POLL_INTERVAL: Duration = Duration::from_secs(5);

fn http_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("diffcast/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")
}

fn endpoint(base: &Url, path: &str) -> CapResult<Url> {
    let joined = format!("{}/{}", base.as_str().trim_end_matches('/'), path);
    Url::parse(&joined)
        .map_err(|e| CapabilityError::permanent(format!("Invalid URL {joined}: {e}")))
}

fn request_error(err: reqwest::Error) -> CapabilityError {
    if let Some(status) = err.status() {
        return status_error(status, &err.to_string());
    }
    if err.is_decode() {
        return CapabilityError::permanent(format!("Malformed response: {err}"));
    }
    CapabilityError::transient(err.to_string())
}

fn status_error(status: StatusCode, detail: &str) -> CapabilityError {
    let message = format!("HTTP {status}: {}", detail.trim());
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        CapabilityError::Transient(message)
    } else {
        CapabilityError::Permanent(message)
    }
}

async fn post_json<B: Serialize, R: for<'de> Deserialize<'de>>(
    client: &Client,
    url: Url,
    body: &B,
) -> CapResult<R> {
    let response = client.post(url).json(body).send().await.map_err(request_error)?;
    read_json(response).await
}

async fn read_json<R: for<'de> Deserialize<'de>>(response: reqwest::Response) -> CapResult<R> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(status_error(status, &body));
    }
    response.json::<R>().await.map_err(request_error)
}

/// Fetch `url` into the media directory under `reference`.
async fn download(client: &Client, media: &MediaDir, url: Url, reference: &str) -> CapResult<()> {
    let response = client.get(url.clone()).send().await.map_err(request_error)?;
    let status = response.status();
    if !status.is_success() {
        return Err(status_error(status, &format!("downloading {url}")));
    }
    let bytes = response.bytes().await.map_err(request_error)?;
    if bytes.is_empty() {
        return Err(CapabilityError::permanent(format!("{url} returned an empty body")));
    }
    let path = media.prepare(reference).await?;
    tokio::fs::write(&path, &bytes).await.map_err(|e| {
        CapabilityError::permanent(format!("Failed to write {}: {}", path.display(), e))
    })?;
    tracing::debug!("Downloaded {} ({} bytes) to {}", url, bytes.len(), reference);
    Ok(())
}

fn resolve_url(base: &Url, location: &str) -> CapResult<Url> {
    base.join(location)
        .map_err(|e| CapabilityError::permanent(format!("Invalid media URL {location}: {e}")))
}

#[derive(Serialize)]
struct RecordRequest<'a> {
    goal: &'a str,
    url: &'a str,
}

#[derive(Deserialize)]
struct RecordResponse {
    status: String,
    video_url: Option<String>,
    duration_sec: Option<f64>,
    error: Option<String>,
}

/// Browser-automation service that walks a site toward a goal and returns a
/// screen recording.
pub struct HttpRecorder {
    client: Client,
    base: Url,
    media: MediaDir,
    ffmpeg: Arc<Ffmpeg>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl HttpRecorder {
    pub fn new(
        base: Url,
        media: MediaDir,
        ffmpeg: Arc<Ffmpeg>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self { client: http_client()?, base, media, ffmpeg, retry, timeout })
    }

    async fn record_once(&self, video_id: &str, goal: &str, url: &str) -> CapResult<DemoRecording> {
        let response: RecordResponse =
            post_json(&self.client, endpoint(&self.base, "record")?, &RecordRequest { goal, url })
                .await?;
        if response.status != "completed" {
            return Err(CapabilityError::Permanent(response.error.unwrap_or_else(|| {
                "recorder could not complete the goal on the page".to_string()
            })));
        }
        let location = response
            .video_url
            .ok_or_else(|| CapabilityError::permanent("recorder returned no video"))?;
        let reference = self.media.video_ref(video_id, "demo.mp4");
        download(&self.client, &self.media, resolve_url(&self.base, &location)?, &reference)
            .await?;
        let duration_sec = match response.duration_sec {
            Some(duration) if duration > 0.0 => duration,
            _ => self.ffmpeg.media_duration(&reference).await?,
        };
        Ok(DemoRecording { reference, duration_sec })
    }
}

#[async_trait]
impl Recorder for HttpRecorder {
    async fn record(&self, video_id: &str, goal: &str, url: &str) -> CapResult<DemoRecording> {
        tracing::info!("Recording demo for {} against {}", video_id, url);
        self.retry.run("recorder", self.timeout, || self.record_once(video_id, goal, url)).await
    }
}

#[derive(Serialize)]
struct ClipJobRequest<'a> {
    prompt: &'a str,
    duration_sec: u32,
    aspect_ratio: &'static str,
    /// Absolute path of a grounding frame on the shared media volume.
    reference_image: Option<String>,
}

#[derive(Deserialize)]
struct ClipJob {
    id: String,
    #[serde(default)]
    status: String,
    video_url: Option<String>,
    error: Option<String>,
}

/// AI video clip service. Jobs are submitted and then polled until done.
pub struct HttpClipService {
    client: Client,
    base: Url,
    media: MediaDir,
    retry: RetryPolicy,
    timeout: Duration,
}

impl HttpClipService {
    pub fn new(base: Url, media: MediaDir, retry: RetryPolicy, timeout: Duration) -> Result<Self> {
        Ok(Self { client: http_client()?, base, media, retry, timeout })
    }

    async fn generate_once(
        &self,
        video_id: &str,
        request: &ClipRequest<'_>,
    ) -> CapResult<GeneratedClip> {
        let body = ClipJobRequest {
            prompt: request.prompt,
            duration_sec: request.duration_sec,
            aspect_ratio: "16:9",
            reference_image: request
                .reference_image
                .map(|r| self.media.path(r).to_string_lossy().into_owned()),
        };
        let mut job: ClipJob =
            post_json(&self.client, endpoint(&self.base, "clips")?, &body).await?;
        loop {
            match job.status.as_str() {
                "completed" => break,
                "failed" => {
                    return Err(CapabilityError::Permanent(
                        job.error.unwrap_or_else(|| "clip generation failed".to_string()),
                    ));
                }
                _ => {}
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            let url = endpoint(&self.base, &format!("clips/{}", job.id))?;
            let response = self.client.get(url).send().await.map_err(request_error)?;
            job = read_json(response).await?;
        }
        let location =
            job.video_url.ok_or_else(|| CapabilityError::permanent("clip job returned no video"))?;
        let reference = self
            .media
            .video_ref(video_id, &format!("clips/{}_{}.mp4", request.role.as_str(), request.index));
        download(&self.client, &self.media, resolve_url(&self.base, &location)?, &reference)
            .await?;
        Ok(GeneratedClip {
            role: request.role,
            reference,
            duration_sec: request.duration_sec as f64,
            prompt: request.prompt.to_string(),
        })
    }
}

#[async_trait]
impl ClipGenerator for HttpClipService {
    async fn generate_clip(
        &self,
        video_id: &str,
        request: &ClipRequest<'_>,
    ) -> CapResult<GeneratedClip> {
        tracing::info!(
            "Generating {} clip {} for {} ({}s)",
            request.role.as_str(),
            request.index,
            video_id,
            request.duration_sec
        );
        self.retry.run("clip", self.timeout, || self.generate_once(video_id, request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, ""),
            CapabilityError::Transient(_)
        ));
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS, ""),
            CapabilityError::Transient(_)
        ));
        assert!(matches!(
            status_error(StatusCode::UNPROCESSABLE_ENTITY, "goal not reachable"),
            CapabilityError::Permanent(_)
        ));
    }

    #[test]
    fn test_endpoint_join() {
        let base = Url::parse("http://recorder:9000/api/").unwrap();
        assert_eq!(endpoint(&base, "record").unwrap().as_str(), "http://recorder:9000/api/record");
        let base = Url::parse("http://recorder:9000").unwrap();
        assert_eq!(endpoint(&base, "clips/42").unwrap().as_str(), "http://recorder:9000/clips/42");
        assert_eq!(
            resolve_url(&base, "/files/demo.mp4").unwrap().as_str(),
            "http://recorder:9000/files/demo.mp4"
        );
    }

    #[test]
    fn test_role_in_clip_reference() {
        let media = MediaDir::new("media");
        let reference = media.video_ref("v", &format!("clips/{}_{}.mp4", ClipRole::Closer.as_str(), 1));
        assert_eq!(reference, "videos/v/clips/closer_1.mp4");
    }
}
