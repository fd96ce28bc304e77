pub mod config;
pub mod models;
pub mod util;
pub mod video;

use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

pub enum AppError {
    Status(StatusCode),
    /// A user-visible failure with a human-readable reason.
    Message(StatusCode, String),
    /// A dependency (usually the record store) is temporarily unavailable.
    Unavailable(anyhow::Error),
    Internal(anyhow::Error),
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::Message(StatusCode::BAD_REQUEST, message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::Message(StatusCode::NOT_FOUND, message.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            Self::Status(status) if status == StatusCode::NOT_FOUND => {
                (status, Json(json!({ "error": "Not found" }))).into_response()
            }
            Self::Status(status) => status.into_response(),
            Self::Message(status, message) => {
                (status, Json(json!({ "error": message }))).into_response()
            }
            Self::Unavailable(err) => {
                tracing::warn!("Service unavailable: {:?}", err);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    [(header::RETRY_AFTER, "5")],
                    Json(json!({ "error": format!("Temporarily unavailable: {}", err) })),
                )
                    .into_response()
            }
            Self::Internal(err) => {
                tracing::error!("{:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": format!("Something went wrong: {}", err) })),
                )
                    .into_response()
            }
        }
    }
}

impl<E: Into<anyhow::Error>> From<E> for AppError {
    fn from(err: E) -> Self { Self::Internal(err.into()) }
}
