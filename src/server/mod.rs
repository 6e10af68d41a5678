//! HTTP surface: lights, one-shot captures and the MJPEG stream

pub mod mjpeg;
pub mod pages;
mod routes;

use std::future::Future;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::capture::synthetic::render_placeholder;
use crate::capture::{CameraMode, CameraModeController};
use crate::context::DeviceContext;
use crate::error::CameraError;
use crate::lights::{ChannelMap, LightingState};
use crate::pipeline::{FrameRelay, ViewerLifecycle};
use crate::{Config, ServerConfig};

use mjpeg::StreamTiming;

/// Everything the handlers share. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub lights: Arc<LightingState>,
    pub camera: Arc<CameraModeController>,
    pub viewers: Arc<ViewerLifecycle>,
    pub relay: Arc<FrameRelay>,
    timing: StreamTiming,
    jpeg_quality: u8,
    /// Sent to viewers before the first real frame
    placeholder: Bytes,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    /// Wire the components around the opened hardware. Must run inside the
    /// Tokio runtime.
    pub fn new(config: &Config, devices: DeviceContext) -> Result<Self, CameraError> {
        let relay = Arc::new(FrameRelay::new());
        let camera = Arc::new(CameraModeController::new(
            devices.camera,
            relay.clone(),
            &config.camera,
        )?);
        let viewers = ViewerLifecycle::new(
            camera.clone(),
            config.stream.grace_period(),
            config.camera.idle_mode,
        );
        let lights = Arc::new(LightingState::new(
            devices.pwm,
            ChannelMap::from(&config.lights),
        ));

        let placeholder = match camera.profiles().get(CameraMode::Video) {
            Some(p) => render_placeholder(p.width, p.height, 0, config.camera.jpeg_quality)?,
            None => render_placeholder(640, 480, 0, config.camera.jpeg_quality)?,
        };

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            lights,
            camera,
            viewers,
            relay,
            timing: StreamTiming {
                keepalive: config.stream.keepalive(),
                frame_timeout: config.stream.frame_timeout(),
            },
            jpeg_quality: config.camera.jpeg_quality,
            placeholder,
            shutdown: Arc::new(shutdown),
        })
    }

    /// Ends every open stream body
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::index))
        .route("/lights", get(routes::lights_current))
        .route("/lights/set", get(routes::lights_set))
        .route("/lights/off", get(routes::lights_off))
        .route("/lights/on", get(routes::lights_on))
        .route("/stream", get(routes::stream))
        .route("/video", get(routes::video))
        .route("/camera", get(routes::camera))
        .route("/status", get(routes::status))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then close open streams and drain
pub async fn serve(
    config: &ServerConfig,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);
    info!("Stream: http://{}/stream", listener.local_addr()?);

    let app = router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutting down, closing streams");
            state.begin_shutdown();
        })
        .await
}
