//! Viewer-driven stream lifecycle.
//!
//! The first viewer starts Video, the last one leaving arms a grace timer;
//! the stream is torn down only if nobody attaches before it fires.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::capture::{CameraMode, CameraModeController};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Stopped,
    Starting,
    Streaming,
    Stopping,
}

/// Proof of attachment. Not `Clone`, so a viewer can only detach once.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct ViewerToken(u64);

impl ViewerToken {
    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Default)]
struct ViewerSet {
    active: HashSet<u64>,
    next_id: u64,
    generation: u64,
    /// Cancels the armed grace timer
    pending_stop: Option<(u64, oneshot::Sender<()>)>,
}

pub struct ViewerLifecycle {
    camera: Arc<CameraModeController>,
    grace: Duration,
    idle_mode: CameraMode,
    viewers: Mutex<ViewerSet>,
    /// At most one Starting/Stopping sequence in flight
    transition: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<StreamState>,
    events: broadcast::Sender<StreamState>,
    runtime: Handle,
}

impl ViewerLifecycle {
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime; grace timers are spawned on it.
    pub fn new(camera: Arc<CameraModeController>, grace: Duration, idle_mode: CameraMode) -> Arc<Self> {
        let (state_tx, _) = watch::channel(StreamState::Stopped);
        let (events, _) = broadcast::channel(16);

        Arc::new(Self {
            camera,
            grace,
            idle_mode,
            viewers: Mutex::new(ViewerSet::default()),
            transition: tokio::sync::Mutex::new(()),
            state_tx,
            events,
            runtime: Handle::current(),
        })
    }

    pub fn state(&self) -> StreamState {
        *self.state_tx.borrow()
    }

    pub fn viewer_count(&self) -> usize {
        self.lock_viewers().active.len()
    }

    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    /// Every state change, in order
    pub fn subscribe(&self) -> broadcast::Receiver<StreamState> {
        self.events.subscribe()
    }

    /// Register a viewer. Returns once the stream is running (or has failed
    /// to start, in which case readers simply time out).
    pub async fn attach(self: &Arc<Self>) -> ViewerToken {
        let token = {
            let mut set = self.lock_viewers();
            if let Some((_, cancel)) = set.pending_stop.take() {
                let _ = cancel.send(());
                info!("Viewer returned within grace period, keeping stream");
            }
            set.next_id += 1;
            let id = set.next_id;
            set.active.insert(id);

            metrics::gauge!("stream_viewers").set(set.active.len() as f64);
            debug!(viewer = id, count = set.active.len(), "Viewer attached");
            ViewerToken(id)
        };

        self.reconcile(false).await;
        token
    }

    /// Same as [`attach`](Self::attach) but detaches on drop
    pub async fn attach_guard(self: &Arc<Self>) -> ViewerGuard {
        let token = self.attach().await;
        ViewerGuard {
            lifecycle: Arc::clone(self),
            token: Some(token),
        }
    }

    /// Unregister a viewer. Non-blocking, safe to call from `Drop`.
    pub fn detach(self: &Arc<Self>, token: ViewerToken) {
        let mut set = self.lock_viewers();
        if !set.active.remove(&token.0) {
            warn!(viewer = token.0, "Detach for unknown viewer");
            return;
        }

        metrics::gauge!("stream_viewers").set(set.active.len() as f64);
        debug!(viewer = token.0, count = set.active.len(), "Viewer detached");

        if !set.active.is_empty() {
            return;
        }

        set.generation += 1;
        let generation = set.generation;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        if let Some((_, previous)) = set.pending_stop.replace((generation, cancel_tx)) {
            let _ = previous.send(());
        }
        drop(set);

        info!("Last viewer left, stopping stream in {:?}", self.grace);
        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(this.grace) => this.grace_expired(generation).await,
                _ = cancel_rx => debug!("Pending stream stop cancelled"),
            }
        });
    }

    async fn grace_expired(&self, generation: u64) {
        {
            let mut set = self.lock_viewers();
            let armed = set.pending_stop.as_ref().map(|(armed, _)| *armed);
            // Cancelled or superseded by a newer timer
            if armed != Some(generation) {
                return;
            }
            set.pending_stop = None;
        }
        self.reconcile(true).await;
    }

    /// Drive the camera toward what the viewer count wants
    async fn reconcile(&self, allow_stop: bool) {
        let _transition = self.transition.lock().await;
        let wanted = self.viewer_count() > 0;

        match (wanted, self.state()) {
            (true, StreamState::Stopped) => {
                self.set_state(StreamState::Starting);
                match self.camera.switch_to(CameraMode::Video).await {
                    Ok(()) => self.set_state(StreamState::Streaming),
                    Err(e) => {
                        error!("Stream failed to start: {e}");
                        self.set_state(StreamState::Stopped);
                    }
                }
            }
            // A capture may have left Video, or the producer may have died
            (true, StreamState::Streaming) => {
                if let Err(e) = self.camera.switch_to(CameraMode::Video).await {
                    warn!("Could not re-enter video for viewer: {e}");
                }
            }
            (false, StreamState::Streaming) if allow_stop => {
                self.set_state(StreamState::Stopping);
                if let Err(e) = self.camera.switch_to(self.idle_mode).await {
                    warn!("Camera did not leave video cleanly: {e}");
                }
                self.set_state(StreamState::Stopped);
            }
            _ => {}
        }
    }

    fn set_state(&self, state: StreamState) {
        let previous = self.state_tx.send_replace(state);
        let _ = self.events.send(state);
        info!("Stream {:?} -> {:?}", previous, state);
    }

    fn lock_viewers(&self) -> MutexGuard<'_, ViewerSet> {
        self.viewers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Attached viewer that detaches itself when dropped, e.g. when the HTTP
/// body is dropped after a failed write.
pub struct ViewerGuard {
    lifecycle: Arc<ViewerLifecycle>,
    token: Option<ViewerToken>,
}

impl ViewerGuard {
    pub fn id(&self) -> Option<u64> {
        self.token.as_ref().map(ViewerToken::id)
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.lifecycle.detach(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::ModeProfile;
    use crate::capture::{CameraDevice, CapturePolicy, QualityTier};
    use crate::error::CameraError;
    use crate::pipeline::FrameRelay;
    use crate::CameraConfig;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::broadcast::error::TryRecvError;

    const GRACE: Duration = Duration::from_millis(150);

    fn lifecycle() -> (Arc<ViewerLifecycle>, Arc<CameraModeController>) {
        let camera = Arc::new(
            CameraModeController::new(None, Arc::new(FrameRelay::new()), &CameraConfig::default())
                .unwrap(),
        );
        (ViewerLifecycle::new(camera.clone(), GRACE, CameraMode::Idle), camera)
    }

    fn drain(rx: &mut broadcast::Receiver<StreamState>) -> Vec<StreamState> {
        let mut seen = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(state) => seen.push(state),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return seen,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn first_viewer_starts_video() {
        let (viewers, camera) = lifecycle();
        let mut events = viewers.subscribe();

        let token = viewers.attach().await;
        assert_eq!(viewers.state(), StreamState::Streaming);
        assert_eq!(camera.mode(), CameraMode::Video);
        assert_eq!(
            drain(&mut events),
            vec![StreamState::Starting, StreamState::Streaming]
        );

        viewers.detach(token);
        camera.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reattach_within_grace_keeps_stream() {
        let (viewers, camera) = lifecycle();
        let token = viewers.attach().await;
        let mut events = viewers.subscribe();

        viewers.detach(token);
        tokio::time::sleep(GRACE / 3).await;
        let token = viewers.attach().await;
        tokio::time::sleep(GRACE * 2).await;

        assert_eq!(viewers.state(), StreamState::Streaming);
        assert!(drain(&mut events).is_empty());
        assert_eq!(camera.mode(), CameraMode::Video);

        viewers.detach(token);
        camera.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn last_viewer_leaving_stops_after_grace() {
        let (viewers, camera) = lifecycle();
        let token = viewers.attach().await;
        let mut events = viewers.subscribe();

        viewers.detach(token);
        assert_eq!(viewers.viewer_count(), 0);
        assert_eq!(viewers.state(), StreamState::Streaming);

        tokio::time::sleep(GRACE * 3).await;
        assert_eq!(viewers.state(), StreamState::Stopped);
        assert_eq!(camera.mode(), CameraMode::Idle);
        assert_eq!(
            drain(&mut events),
            vec![StreamState::Stopping, StreamState::Stopped]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remaining_viewer_keeps_stream_alive() {
        let (viewers, camera) = lifecycle();
        let first = viewers.attach_guard().await;
        let second = viewers.attach_guard().await;
        assert_eq!(viewers.viewer_count(), 2);
        assert_ne!(first.id(), second.id());

        drop(first);
        tokio::time::sleep(GRACE * 2).await;
        assert_eq!(viewers.state(), StreamState::Streaming);

        drop(second);
        tokio::time::sleep(GRACE * 3).await;
        assert_eq!(viewers.state(), StreamState::Stopped);
        assert_eq!(camera.mode(), CameraMode::Idle);
    }

    /// Camera whose captures can be made to fail on demand
    struct FlakyCamera {
        failing: Arc<AtomicBool>,
        current: Option<CameraMode>,
    }

    impl CameraDevice for FlakyCamera {
        fn name(&self) -> &str {
            "flaky"
        }

        fn configure(&mut self, profile: &ModeProfile) -> Result<(), CameraError> {
            self.current = Some(profile.mode);
            Ok(())
        }

        fn release(&mut self) -> Result<(), CameraError> {
            self.current = None;
            Ok(())
        }

        fn capture_jpeg(&mut self) -> Result<Bytes, CameraError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(CameraError::EncoderFailure("sensor timeout".into()));
            }
            match self.current {
                Some(mode) => Ok(Bytes::from(format!("jpeg:{mode}"))),
                None => Err(CameraError::EncoderFailure("idle".into())),
            }
        }
    }

    struct Rig {
        viewers: Arc<ViewerLifecycle>,
        camera: Arc<CameraModeController>,
        relay: Arc<FrameRelay>,
        failing: Arc<AtomicBool>,
    }

    fn rig(policy: CapturePolicy) -> Rig {
        let failing = Arc::new(AtomicBool::new(false));
        let relay = Arc::new(FrameRelay::new());
        let config = CameraConfig {
            after_capture: policy,
            ..CameraConfig::default()
        };
        let device = FlakyCamera {
            failing: failing.clone(),
            current: None,
        };
        let camera = Arc::new(
            CameraModeController::new(Some(Box::new(device)), relay.clone(), &config).unwrap(),
        );
        Rig {
            viewers: ViewerLifecycle::new(camera.clone(), GRACE, CameraMode::Idle),
            camera,
            relay,
            failing,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn new_viewer_resumes_video_after_capture_left_it() {
        let rig = rig(CapturePolicy::Leave);
        let _first = rig.viewers.attach_guard().await;
        assert_eq!(rig.camera.mode(), CameraMode::Video);

        rig.camera.capture_once(QualityTier::Low).await.unwrap();
        assert_eq!(rig.camera.mode(), CameraMode::Preview);
        assert_eq!(rig.viewers.state(), StreamState::Streaming);

        let _second = rig.viewers.attach_guard().await;
        assert_eq!(rig.camera.mode(), CameraMode::Video);

        let frame = rig.relay.next(0, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(&frame.data[..], b"jpeg:video");

        rig.camera.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn new_viewer_restarts_dead_producer() {
        let rig = rig(CapturePolicy::Resume);
        let _first = rig.viewers.attach_guard().await;
        rig.relay.next(0, Some(Duration::from_secs(5))).await.unwrap();

        // Ten failed captures at the video frame rate and the producer exits
        rig.failing.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(800)).await;
        let last_seen = rig.relay.latest().map_or(0, |f| f.sequence);
        assert!(rig
            .relay
            .next(last_seen, Some(Duration::from_millis(200)))
            .await
            .is_none());

        rig.failing.store(false, Ordering::SeqCst);
        let _second = rig.viewers.attach_guard().await;
        let frame = rig
            .relay
            .next(last_seen, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(&frame.data[..], b"jpeg:video");
        assert_eq!(rig.viewers.state(), StreamState::Streaming);

        rig.camera.shutdown().await.unwrap();
    }
}
