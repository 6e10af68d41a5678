use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{Html, IntoResponse, Response};
use axum::Json;
use base64::prelude::*;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::{mjpeg, pages, AppState};
use crate::capture::synthetic::render_placeholder;
use crate::capture::{CameraMode, QualityTier};
use crate::error::{ApiError, CameraError};
use crate::lights::{ColorUpdate, LightColor, LightingState};

pub async fn index() -> Html<&'static str> {
    Html(pages::INDEX)
}

#[derive(Debug, Deserialize)]
pub struct LightQuery {
    red: Option<i64>,
    green: Option<i64>,
    blue: Option<i64>,
}

pub async fn lights_set(
    State(app): State<AppState>,
    query: Result<Query<LightQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(q) = query.map_err(|e| ApiError::InvalidInput(e.body_text()))?;
    // Absent channels default to 0
    let update = ColorUpdate::all(
        q.red.unwrap_or(0),
        q.green.unwrap_or(0),
        q.blue.unwrap_or(0),
    );

    let color = with_lights(&app, move |lights| lights.set(update)).await;
    info!("Lights set to {color}");
    Ok(Json(json!({ "message": "Lighting values set successfully!" })))
}

pub async fn lights_off(State(app): State<AppState>) -> Json<Value> {
    let color = with_lights(&app, LightingState::clear).await;
    info!("Lights cleared ({color})");
    Json(json!({ "message": "Lighting values cleared successfully!" }))
}

pub async fn lights_on(State(app): State<AppState>) -> Json<Value> {
    let color = with_lights(&app, LightingState::full).await;
    info!("Lights full ({color})");
    Json(json!({ "message": "Lighting values set to full!" }))
}

pub async fn lights_current(State(app): State<AppState>) -> Json<LightColor> {
    Json(app.lights.current())
}

/// PWM writes block on the daemon socket, keep them off the runtime
async fn with_lights<F>(app: &AppState, f: F) -> LightColor
where
    F: FnOnce(&LightingState) -> LightColor + Send + 'static,
{
    let lights = app.lights.clone();
    match tokio::task::spawn_blocking(move || f(&lights)).await {
        Ok(color) => color,
        Err(e) => {
            error!("Lighting task failed: {e}");
            app.lights.current()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    page: Option<String>,
}

pub async fn stream(State(app): State<AppState>, Query(q): Query<StreamQuery>) -> Response {
    if q.page.as_deref() == Some("true") {
        return Html(pages::stream_page()).into_response();
    }
    open_stream(app).await
}

/// Bare multipart endpoint, no page flag
pub async fn video(State(app): State<AppState>) -> Response {
    open_stream(app).await
}

async fn open_stream(app: AppState) -> Response {
    let viewer = app.viewers.attach_guard().await;
    info!(viewer = ?viewer.id(), "Stream viewer connected");

    mjpeg::response(
        app.relay.clone(),
        viewer,
        app.timing,
        app.placeholder.clone(),
        app.shutdown.subscribe(),
    )
}

#[derive(Debug, Deserialize)]
pub struct CameraQuery {
    res: Option<String>,
    page: Option<String>,
}

pub async fn camera(
    State(app): State<AppState>,
    Query(q): Query<CameraQuery>,
) -> Result<Response, ApiError> {
    let tier: QualityTier = q
        .res
        .as_deref()
        .unwrap_or("low")
        .parse()
        .map_err(ApiError::Configuration)?;

    let jpeg = match app.camera.capture_once(tier).await {
        Ok(jpeg) => jpeg,
        Err(e) if e.is_degraded() => {
            warn!("{e}, serving placeholder image");
            placeholder_still(&app, tier).await?
        }
        Err(e) => return Err(ApiError::Capture(e)),
    };

    if jpeg.is_empty() {
        return Err(ApiError::Capture(CameraError::EncoderFailure(
            "camera returned an empty image".into(),
        )));
    }

    if q.page.as_deref() == Some("false") {
        return Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response());
    }

    let data_url = format!("data:image/jpeg;base64,{}", BASE64_STANDARD.encode(&jpeg));
    Ok(Html(pages::still_page(&data_url)).into_response())
}

async fn placeholder_still(app: &AppState, tier: QualityTier) -> Result<Bytes, ApiError> {
    let (width, height) = app
        .camera
        .profiles()
        .get(tier.mode())
        .map(|p| (p.width, p.height))
        .ok_or_else(|| ApiError::Configuration(CameraError::UnknownProfile(tier.mode().to_string())))?;
    let quality = app.jpeg_quality;

    tokio::task::spawn_blocking(move || render_placeholder(width, height, 0, quality))
        .await
        .map_err(|e| ApiError::Capture(CameraError::EncoderFailure(e.to_string())))?
        .map_err(ApiError::Capture)
}

pub async fn status(State(app): State<AppState>) -> Json<Value> {
    let (published, delivered, timeouts) = app.relay.stats();
    Json(json!({
        "camera": {
            "mode": app.camera.mode(),
            "degraded": app.camera.is_degraded(),
            "in_transition": app.camera.in_transition(),
            "policy": app.camera.policy(),
            "video_profile": app.camera.profiles().get(CameraMode::Video),
        },
        "stream": {
            "state": app.viewers.state(),
            "viewers": app.viewers.viewer_count(),
            "frames_published": published,
            "frames_delivered": delivered,
            "reader_timeouts": timeouts,
            "latest_frame_age_ms": app.relay.latest().map(|f| f.age().as_millis() as u64),
            "grace_period_ms": app.viewers.grace_period().as_millis() as u64,
        },
        "lights": app.lights.current(),
        "pwm": app.lights.has_driver(),
    }))
}
