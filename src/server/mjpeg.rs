//! `multipart/x-mixed-replace` body fed from the frame relay.
//!
//! Browsers render it natively with `<img src="/stream">`, replacing the
//! image on every part.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::pipeline::{FrameRelay, ViewerGuard};

pub const BOUNDARY: &str = "frame";

/// One multipart segment: `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`
pub fn part(jpeg: &[u8]) -> Bytes {
    const HEAD: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

    let mut buf = BytesMut::with_capacity(HEAD.len() + jpeg.len() + 2);
    buf.put_slice(HEAD);
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Timing knobs for one stream body
#[derive(Debug, Clone, Copy)]
pub struct StreamTiming {
    /// Re-send interval when no new frame arrives; a failed write detaches the viewer
    pub keepalive: Duration,
    /// End the body after this long without a new frame
    pub frame_timeout: Duration,
}

/// Stream frames to one viewer until the client goes away, the producer
/// stalls past `frame_timeout`, or the server shuts down.
pub fn response(
    relay: Arc<FrameRelay>,
    viewer: ViewerGuard,
    timing: StreamTiming,
    placeholder: Bytes,
    mut shutdown: watch::Receiver<bool>,
) -> Response {
    let stream = async_stream::stream! {
        // Dropped with the body, which detaches the viewer
        let viewer = viewer;
        let mut last_seen = 0u64;
        let mut last: Option<Bytes> = None;
        let mut idle = Duration::ZERO;

        loop {
            let next = tokio::select! {
                frame = relay.next(last_seen, Some(timing.keepalive)) => frame,
                _ = shutdown.wait_for(|stopping| *stopping) => break,
            };

            match next {
                Some(frame) => {
                    idle = Duration::ZERO;
                    last_seen = frame.sequence;
                    last = Some(frame.data.clone());
                    yield Ok::<_, Infallible>(part(&frame.data));
                }
                None => {
                    idle += timing.keepalive;
                    if idle >= timing.frame_timeout {
                        if last.is_none() {
                            yield Ok(part(&placeholder));
                        }
                        info!(viewer = ?viewer.id(), "No frames for {:?}, ending stream", idle);
                        break;
                    }

                    // Probe write; hyper drops the body if the client is gone
                    debug!(viewer = ?viewer.id(), "Stream idle, re-sending last frame");
                    let probe = last.clone().unwrap_or_else(|| placeholder.clone());
                    yield Ok(part(&probe));
                }
            }
        }
    };

    (
        StatusCode::OK,
        [
            (
                header::CONTENT_TYPE,
                format!("multipart/x-mixed-replace; boundary={BOUNDARY}"),
            ),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate".to_string(),
            ),
            (header::PRAGMA, "no-cache".to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}
