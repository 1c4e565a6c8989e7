//! Voice session control endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};

use super::ApiState;
use crate::Error;
use crate::settings::AudioSettings;
use crate::voice::{OutputDevice, Snapshot};

/// Build voice router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/session/start", post(start_session))
        .route("/session/stop", post(stop_session))
        .route("/hands-free", put(set_hands_free))
        .route("/settings", get(get_settings).put(update_settings))
        .route("/devices", get(devices))
        .with_state(state)
}

/// Current voice core state
async fn status(State(state): State<Arc<ApiState>>) -> Result<Json<Snapshot>, VoiceError> {
    Ok(Json(state.voice.snapshot().await?))
}

/// Start a live session
async fn start_session(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Snapshot>, VoiceError> {
    state.voice.start_session().await?;
    Ok(Json(state.voice.snapshot().await?))
}

/// Stop the live session
async fn stop_session(State(state): State<Arc<ApiState>>) -> Result<Json<Snapshot>, VoiceError> {
    state.voice.stop_session().await?;
    Ok(Json(state.voice.snapshot().await?))
}

/// Hands-free toggle request
#[derive(Debug, Deserialize)]
pub struct HandsFreeRequest {
    pub enabled: bool,
}

/// Toggle hands-free mode
async fn set_hands_free(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<HandsFreeRequest>,
) -> Result<Json<Snapshot>, VoiceError> {
    state.voice.set_hands_free(request.enabled).await?;
    Ok(Json(state.voice.snapshot().await?))
}

/// Current audio settings
async fn get_settings(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<AudioSettings>, VoiceError> {
    Ok(Json(state.voice.settings().await?))
}

/// Replace audio settings (idle only)
async fn update_settings(
    State(state): State<Arc<ApiState>>,
    Json(settings): Json<AudioSettings>,
) -> Result<Json<AudioSettings>, VoiceError> {
    Ok(Json(state.voice.update_settings(settings).await?))
}

/// Output devices response
#[derive(Debug, Serialize)]
pub struct DevicesResponse {
    pub devices: Vec<OutputDevice>,
}

/// Selectable output devices
async fn devices(State(state): State<Arc<ApiState>>) -> Result<Json<DevicesResponse>, VoiceError> {
    let devices = state.voice.list_output_devices().await?;
    Ok(Json(DevicesResponse { devices }))
}

/// Voice API errors
#[derive(Debug)]
pub enum VoiceError {
    Busy(String),
    BadRequest(String),
    PermissionDenied(String),
    ConnectFailed(String),
    Unavailable(String),
    Internal(String),
}

impl From<Error> for VoiceError {
    fn from(e: Error) -> Self {
        let message = e.to_string();
        match e {
            Error::SessionBusy => Self::Busy(message),
            Error::InvalidSettings(_) => Self::BadRequest(message),
            Error::Permission(_) => Self::PermissionDenied(message),
            Error::Connect(_) => Self::ConnectFailed(message),
            Error::RuntimeStopped => Self::Unavailable(message),
            _ => Self::Internal(message),
        }
    }
}

impl IntoResponse for VoiceError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: ErrorBody,
        }

        #[derive(Serialize)]
        struct ErrorBody {
            code: &'static str,
            message: String,
        }

        let (status, code, message) = match self {
            Self::Busy(msg) => (StatusCode::CONFLICT, "session_busy", msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::PermissionDenied(msg) => (StatusCode::FORBIDDEN, "permission_denied", msg),
            Self::ConnectFailed(msg) => (StatusCode::BAD_GATEWAY, "connect_failed", msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };

        if status.is_server_error() {
            tracing::error!(code, %message, "voice API error");
        }

        (status, Json(ErrorResponse { error: ErrorBody { code, message } })).into_response()
    }
}
