//! Video producer: pulls JPEGs from the device at the profile's frame rate
//! and hands them to a sink.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::capture::device::{with_device, SharedDevice};
use crate::capture::frame::ModeProfile;
use crate::error::CameraError;

/// Consecutive capture failures tolerated before the producer gives up
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Destination for encoded frames
pub trait FrameSink: Send + Sync {
    /// Returns the sequence number assigned to the frame
    fn publish(&self, data: Bytes) -> u64;
}

/// Starts producer threads
pub struct JpegEncoder;

impl JpegEncoder {
    /// Spawn the producer. The device must already be configured for Video.
    pub fn start(
        device: SharedDevice,
        profile: &ModeProfile,
        sink: Arc<dyn FrameSink>,
    ) -> Result<EncoderHandle, CameraError> {
        let interval = Duration::from_secs_f64(1.0 / profile.fps.max(1.0));
        let (stop_tx, stop_rx) = flume::bounded(1);

        let thread = std::thread::Builder::new()
            .name("jpeg-encoder".into())
            .spawn(move || run(device, interval, sink, stop_rx))
            .map_err(|e| CameraError::EncoderFailure(format!("spawn encoder: {e}")))?;

        info!(
            "Encoder started at {:.2} fps ({}x{})",
            profile.fps, profile.width, profile.height
        );

        Ok(EncoderHandle {
            stop_tx,
            thread: Some(thread),
        })
    }
}

fn run(device: SharedDevice, interval: Duration, sink: Arc<dyn FrameSink>, stop_rx: Receiver<()>) {
    let mut failures = 0u32;

    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        match with_device(&device, |dev| dev.capture_jpeg()) {
            Ok(data) => {
                failures = 0;
                sink.publish(data);
            }
            Err(e) => {
                failures += 1;
                metrics::counter!("encoder_capture_failures").increment(1);
                warn!("Capture failed ({failures}/{MAX_CONSECUTIVE_FAILURES}): {e}");
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    error!("Encoder giving up, stream readers will time out");
                    return;
                }
            }
        }
    }

    debug!("Encoder stopped");
}

/// Owns a running producer thread
pub struct EncoderHandle {
    stop_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl EncoderHandle {
    /// False once the producer has exited on its own (encoder failure)
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the producer and wait for it to exit. Blocking.
    pub fn stop(mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Encoder thread panicked");
            }
        }
    }
}

impl Drop for EncoderHandle {
    fn drop(&mut self) {
        // Detached drop: signal only, never block
        let _ = self.stop_tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::device::share;
    use crate::capture::synthetic::SyntheticCamera;
    use crate::capture::CameraMode;
    use crate::capture::CameraDevice;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct CollectingSink {
        frames: Mutex<Vec<Bytes>>,
    }

    impl FrameSink for CollectingSink {
        fn publish(&self, data: Bytes) -> u64 {
            let mut frames = self.frames.lock().unwrap();
            frames.push(data);
            frames.len() as u64
        }
    }

    struct BrokenCamera;

    impl CameraDevice for BrokenCamera {
        fn name(&self) -> &str {
            "broken"
        }
        fn configure(&mut self, _: &ModeProfile) -> Result<(), CameraError> {
            Ok(())
        }
        fn release(&mut self) -> Result<(), CameraError> {
            Ok(())
        }
        fn capture_jpeg(&mut self) -> Result<Bytes, CameraError> {
            Err(CameraError::EncoderFailure("sensor timeout".into()))
        }
    }

    fn profile() -> ModeProfile {
        ModeProfile {
            mode: CameraMode::Video,
            width: 32,
            height: 24,
            fps: 200.0,
            format: "MJPG".into(),
            sensor: None,
        }
    }

    #[test]
    fn produces_frames_until_stopped() {
        let mut cam = SyntheticCamera::new(70);
        cam.configure(&profile()).unwrap();
        let sink = Arc::new(CollectingSink::default());

        let handle = JpegEncoder::start(share(Box::new(cam)), &profile(), sink.clone()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.frames.lock().unwrap().len() < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(handle.is_running());
        handle.stop();

        let produced = sink.frames.lock().unwrap().len();
        assert!(produced >= 3);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(sink.frames.lock().unwrap().len(), produced);
    }

    #[test]
    fn gives_up_after_repeated_failures() {
        let sink = Arc::new(CollectingSink::default());
        let handle = JpegEncoder::start(share(Box::new(BrokenCamera)), &profile(), sink.clone()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!handle.is_running());
        assert!(sink.frames.lock().unwrap().is_empty());
        handle.stop();
    }
}
