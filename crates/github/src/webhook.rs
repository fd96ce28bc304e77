use std::{fmt::Display, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{FromRef, FromRequest, Request},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use diffcast_core::config::Config;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

/// Verified GitHub webhook delivery. The body is parsed lazily with
/// [`GitHubEvent::payload`].
#[derive(Clone)]
#[must_use]
pub struct GitHubEvent {
    pub kind: String,
    pub delivery_id: String,
    pub body: Bytes,
}

impl<S> FromRequest<S> for GitHubEvent
where
    Arc<Config>: FromRef<S>,
    S: Send + Sync + Clone,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        fn err(code: StatusCode, m: impl Display) -> Response {
            tracing::error!("{m}");
            (code, m.to_string()).into_response()
        }
        let kind = header(req.headers(), "X-GitHub-Event")
            .ok_or_else(|| err(StatusCode::BAD_REQUEST, "X-GitHub-Event header missing"))?;
        let delivery_id = header(req.headers(), "X-GitHub-Delivery")
            .ok_or_else(|| err(StatusCode::BAD_REQUEST, "X-GitHub-Delivery header missing"))?;
        let signature = header(req.headers(), "X-Hub-Signature-256");
        let config = <Arc<Config>>::from_ref(state);
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|_| err(StatusCode::BAD_REQUEST, "error reading body"))?;
        if let Some(secret) = &config.github.webhook_secret {
            verify_signature(secret, signature.as_deref(), &body)
                .map_err(|m| err(StatusCode::UNAUTHORIZED, m))?;
        }
        Ok(GitHubEvent { kind, delivery_id, body })
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

/// Check an `X-Hub-Signature-256` header against the body.
pub fn verify_signature(
    secret: &str,
    header: Option<&str>,
    body: &[u8],
) -> Result<(), &'static str> {
    let signature = header
        .ok_or("X-Hub-Signature-256 missing")?
        .strip_prefix("sha256=")
        .ok_or("X-Hub-Signature-256 sha256= prefix missing")?;
    let signature = hex::decode(signature).map_err(|_| "X-Hub-Signature-256 malformed")?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| "invalid webhook secret")?;
    mac.update(body);
    mac.verify_slice(&signature).map_err(|_| "signature mismatch")
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookRepository {
    pub name: String,
    pub full_name: String,
    pub default_branch: Option<String>,
}

impl WebhookRepository {
    pub fn owner(&self) -> &str {
        self.full_name.split_once('/').map(|(owner, _)| owner).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushCommit {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub before: String,
    pub after: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub commits: Vec<PushCommit>,
    pub repository: WebhookRepository,
}

impl PushEvent {
    /// Branch name, or `None` for tag pushes.
    pub fn branch(&self) -> Option<&str> { self.git_ref.strip_prefix("refs/heads/") }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitRef {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub sha: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPullRequest {
    pub number: u64,
    pub title: Option<String>,
    pub html_url: Option<String>,
    #[serde(default)]
    pub merged: bool,
    pub base: GitRef,
    pub head: GitRef,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub pull_request: WebhookPullRequest,
    pub repository: WebhookRepository,
}

#[derive(Debug, Clone)]
pub enum WebhookPayload {
    Ping,
    Push(PushEvent),
    PullRequest(PullRequestEvent),
    Other(String),
}

impl WebhookPayload {
    pub fn action(&self) -> Option<&str> {
        match self {
            Self::PullRequest(e) => Some(&e.action),
            _ => None,
        }
    }

    pub fn repository(&self) -> Option<&WebhookRepository> {
        match self {
            Self::Push(e) => Some(&e.repository),
            Self::PullRequest(e) => Some(&e.repository),
            _ => None,
        }
    }
}

impl GitHubEvent {
    pub fn payload(&self) -> Result<WebhookPayload> {
        Ok(match self.kind.as_str() {
            "ping" => WebhookPayload::Ping,
            "push" => WebhookPayload::Push(
                serde_json::from_slice(&self.body).context("Failed to parse push event")?,
            ),
            "pull_request" => WebhookPayload::PullRequest(
                serde_json::from_slice(&self.body).context("Failed to parse pull_request event")?,
            ),
            other => WebhookPayload::Other(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_verify_signature() {
        let body = br#"{"zen":"Keep it logically awesome."}"#;
        let good = sign("s3cret", body);
        assert_eq!(verify_signature("s3cret", Some(&good), body), Ok(()));
        assert_eq!(verify_signature("other", Some(&good), body), Err("signature mismatch"));
        assert_eq!(verify_signature("s3cret", None, body), Err("X-Hub-Signature-256 missing"));
        assert_eq!(
            verify_signature("s3cret", Some(good.trim_start_matches("sha256=")), body),
            Err("X-Hub-Signature-256 sha256= prefix missing")
        );
        assert_eq!(
            verify_signature("s3cret", Some("sha256=zz"), body),
            Err("X-Hub-Signature-256 malformed")
        );
    }

    #[test]
    fn test_parse_push_payload() {
        let event = GitHubEvent {
            kind: "push".into(),
            delivery_id: "d1".into(),
            body: Bytes::from_static(
                br#"{
                    "ref": "refs/heads/main",
                    "before": "0000000",
                    "after": "abc1234def",
                    "commits": [{ "id": "abc1234def", "message": "x" }],
                    "repository": { "name": "hello", "full_name": "octo/hello" }
                }"#,
            ),
        };
        let WebhookPayload::Push(push) = event.payload().unwrap() else { panic!("not a push") };
        assert_eq!(push.branch(), Some("main"));
        assert_eq!(push.repository.owner(), "octo");
        assert_eq!(push.commits.len(), 1);
        assert!(!push.deleted);
    }

    fn require_send<T: Send>(value: T) -> T { value }

    #[tokio::test]
    async fn test_extractor_reads_headers_and_checks_signature() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "server": { "port": 0 },
            "db": { "url": ":memory:" },
            "github": { "token": "t", "webhook_secret": "s3cret" },
        }))
        .unwrap();
        let state = Arc::new(config);
        let body = br#"{"zen":"Half measures are as bad as nothing at all."}"#;
        let request = |signature: String| {
            http::Request::builder()
                .header("X-GitHub-Event", "ping")
                .header("X-GitHub-Delivery", "d-42")
                .header("X-Hub-Signature-256", signature)
                .body(axum::body::Body::from(&body[..]))
                .unwrap()
        };

        let signed = request(sign("s3cret", body));
        let extracted = require_send(GitHubEvent::from_request(signed, &state))
            .await
            .unwrap_or_else(|_| panic!("valid delivery rejected"));
        assert_eq!(extracted.kind, "ping");
        assert_eq!(extracted.delivery_id, "d-42");
        assert_eq!(&extracted.body[..], &body[..]);

        let Err(rejection) = GitHubEvent::from_request(request(sign("other", body)), &state).await
        else {
            panic!("forged delivery accepted");
        };
        assert_eq!(rejection.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_unknown_event_kind() {
        let event =
            GitHubEvent { kind: "star".into(), delivery_id: "d".into(), body: Bytes::new() };
        assert!(matches!(event.payload().unwrap(), WebhookPayload::Other(k) if k == "star"));
    }
}
