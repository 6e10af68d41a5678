use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::capture::CameraMode;

/// Camera-side failures, split by how a caller should react.
///
/// `DeviceUnavailable` means "degrade to synthetic output"; everything else
/// is a real failure that propagates.
#[derive(Debug, Error)]
pub enum CameraError {
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("failed to switch camera to {mode}: {reason}")]
    ModeTransitionFailed { mode: CameraMode, reason: String },

    #[error("encoder failure: {0}")]
    EncoderFailure(String),

    #[error("no camera profile for {0}")]
    UnknownProfile(String),
}

impl CameraError {
    pub fn is_degraded(&self) -> bool {
        matches!(self, CameraError::DeviceUnavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum LightingError {
    #[error("PWM controller unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("PWM driver rejected channel {channel}: {reason}")]
    Driver { channel: u32, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures surfaced to HTTP clients
#[derive(Debug, Error)]
pub enum ApiError {
    /// Unparsable request parameters
    #[error("{0}")]
    InvalidInput(String),

    #[error("Failed to capture image")]
    Capture(#[source] CameraError),

    /// Request names something the capability table doesn't have
    #[error("{0}")]
    Configuration(CameraError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::InvalidInput(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "message": message }))).into_response()
            }
            ApiError::Capture(e) => {
                error!("Capture failed: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to capture image").into_response()
            }
            ApiError::Configuration(e) => {
                error!("Configuration error: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        }
    }
}
