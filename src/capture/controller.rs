//! Serialized camera mode state machine (Idle / Preview / Still / Video)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, instrument, warn};

use crate::capture::device::{share, with_device, CameraDevice, SharedDevice};
use crate::capture::encoder::{EncoderHandle, FrameSink, JpegEncoder};
use crate::capture::frame::{CameraMode, ProfileTable, QualityTier};
use crate::capture::synthetic::SyntheticCamera;
use crate::error::CameraError;
use crate::pipeline::FrameRelay;
use crate::CameraConfig;

/// What a one-shot capture does when it interrupted a running video stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapturePolicy {
    /// Switch back to Video and restart the encoder after the capture
    Resume,
    /// Stay in Preview/Still until something asks for Video again
    Leave,
}

struct ControllerState {
    mode: CameraMode,
    encoder: Option<EncoderHandle>,
}

/// Owns the camera handle. Every reconfiguration goes through one async
/// mutex, so transitions and captures run strictly one at a time and queue
/// in arrival order.
pub struct CameraModeController {
    /// `None` when the camera is absent (degraded mode)
    device: Option<SharedDevice>,
    /// Synthetic source used for Video in degraded mode
    fallback: SharedDevice,
    relay: Arc<FrameRelay>,
    profiles: ProfileTable,
    policy: CapturePolicy,
    state: Mutex<ControllerState>,
    mode_tx: watch::Sender<CameraMode>,
    in_transition: AtomicBool,
}

impl CameraModeController {
    pub fn new(
        device: Option<Box<dyn CameraDevice>>,
        relay: Arc<FrameRelay>,
        config: &CameraConfig,
    ) -> Result<Self, CameraError> {
        let profiles = ProfileTable::from_config(config)?;

        match &device {
            Some(dev) => info!("Camera controller using {}", dev.name()),
            None => warn!("No camera attached, serving synthetic frames"),
        }

        let (mode_tx, _) = watch::channel(CameraMode::Idle);

        Ok(Self {
            device: device.map(share),
            fallback: share(Box::new(SyntheticCamera::new(config.jpeg_quality))),
            relay,
            profiles,
            policy: config.after_capture,
            state: Mutex::new(ControllerState {
                mode: CameraMode::Idle,
                encoder: None,
            }),
            mode_tx,
            in_transition: AtomicBool::new(false),
        })
    }

    pub fn is_degraded(&self) -> bool {
        self.device.is_none()
    }

    /// Last committed mode. Never reflects a half-applied transition.
    pub fn mode(&self) -> CameraMode {
        *self.mode_tx.borrow()
    }

    pub fn in_transition(&self) -> bool {
        self.in_transition.load(Ordering::Acquire)
    }

    pub fn policy(&self) -> CapturePolicy {
        self.policy
    }

    pub fn profiles(&self) -> &ProfileTable {
        &self.profiles
    }

    /// Reconfigure for `mode`, starting or stopping the encoder as needed.
    /// Waits behind any transition or capture already in flight.
    #[instrument(skip(self))]
    pub async fn switch_to(&self, mode: CameraMode) -> Result<(), CameraError> {
        let mut state = self.state.lock().await;
        self.transition(&mut state, mode).await
    }

    /// Switch to Preview (low) or Still (high), grab one JPEG and, if that
    /// interrupted Video, apply the configured [`CapturePolicy`].
    #[instrument(skip(self))]
    pub async fn capture_once(&self, tier: QualityTier) -> Result<Bytes, CameraError> {
        let Some(device) = self.device.clone() else {
            return Err(CameraError::DeviceUnavailable("no camera attached".into()));
        };

        let mut state = self.state.lock().await;
        let previous = state.mode;
        self.transition(&mut state, tier.mode()).await?;

        let result = run_blocking(device, |dev| dev.capture_jpeg()).await;
        if let Ok(jpeg) = &result {
            info!("Captured {} byte {} image", jpeg.len(), tier.mode());
        }

        if previous == CameraMode::Video && self.policy == CapturePolicy::Resume {
            if let Err(e) = self.transition(&mut state, CameraMode::Video).await {
                warn!("Could not resume video after capture: {e}");
            }
        }

        result
    }

    /// Stop the encoder and release the sensor
    pub async fn shutdown(&self) -> Result<(), CameraError> {
        self.switch_to(CameraMode::Idle).await
    }

    async fn transition(
        &self,
        state: &mut ControllerState,
        target: CameraMode,
    ) -> Result<(), CameraError> {
        if state.mode == target {
            // A producer that died mid-stream gets restarted on the next request
            let encoder_alive = state.encoder.as_ref().is_some_and(|e| e.is_running());
            if target == CameraMode::Video && !encoder_alive {
                warn!("Encoder not running in video mode, restarting");
                if let Some(dead) = state.encoder.take() {
                    stop_encoder(dead).await;
                }
                state.encoder = Some(self.start_encoder()?);
            }
            return Ok(());
        }

        let _flag = TransitionFlag::raise(&self.in_transition);
        let previous = state.mode;
        info!("Camera mode {previous} -> {target}");

        if let Some(encoder) = state.encoder.take() {
            stop_encoder(encoder).await;
            self.relay.reset();
        }

        if let Err(e) = self.apply(target).await {
            error!("Camera rejected {target}: {e}");
            self.restore(state, previous).await;
            return Err(as_transition_error(target, e));
        }

        if target == CameraMode::Video {
            match self.start_encoder() {
                Ok(encoder) => state.encoder = Some(encoder),
                Err(e) => {
                    self.restore(state, previous).await;
                    return Err(e);
                }
            }
        }

        state.mode = target;
        self.mode_tx.send_replace(target);
        metrics::counter!("camera_mode_transitions").increment(1);
        Ok(())
    }

    /// Put the device back into `previous` after a failed transition
    async fn restore(&self, state: &mut ControllerState, previous: CameraMode) {
        if let Err(e) = self.apply(previous).await {
            error!("Failed to restore camera to {previous}: {e}");
            return;
        }
        if previous == CameraMode::Video {
            match self.start_encoder() {
                Ok(encoder) => state.encoder = Some(encoder),
                Err(e) => error!("Failed to restart encoder: {e}"),
            }
        }
    }

    async fn apply(&self, mode: CameraMode) -> Result<(), CameraError> {
        let profile = self.profiles.get(mode).cloned();
        run_blocking(self.active_device(), move |dev| match &profile {
            Some(profile) => dev.configure(profile),
            None => dev.release(),
        })
        .await
    }

    fn start_encoder(&self) -> Result<EncoderHandle, CameraError> {
        let profile = self
            .profiles
            .get(CameraMode::Video)
            .ok_or_else(|| CameraError::UnknownProfile("video".into()))?;
        let sink: Arc<dyn FrameSink> = self.relay.clone();
        JpegEncoder::start(self.active_device(), profile, sink)
    }

    fn active_device(&self) -> SharedDevice {
        self.device.clone().unwrap_or_else(|| self.fallback.clone())
    }
}

fn as_transition_error(mode: CameraMode, e: CameraError) -> CameraError {
    match e {
        CameraError::ModeTransitionFailed { .. } | CameraError::DeviceUnavailable(_) => e,
        other => CameraError::ModeTransitionFailed {
            mode,
            reason: other.to_string(),
        },
    }
}

async fn run_blocking<T, F>(device: SharedDevice, f: F) -> Result<T, CameraError>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn CameraDevice) -> Result<T, CameraError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || with_device(&device, f))
        .await
        .map_err(|e| CameraError::DeviceUnavailable(format!("device task failed: {e}")))?
}

async fn stop_encoder(encoder: EncoderHandle) {
    if let Err(e) = tokio::task::spawn_blocking(move || encoder.stop()).await {
        error!("Encoder shutdown task failed: {e}");
    }
}

/// Raised for the duration of one transition
struct TransitionFlag<'a>(&'a AtomicBool);

impl<'a> TransitionFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        let overlapping = flag.swap(true, Ordering::AcqRel);
        debug_assert!(!overlapping, "camera transitions overlapped");
        Self(flag)
    }
}

impl Drop for TransitionFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
