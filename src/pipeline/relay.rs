//! Single-slot, latest-wins frame hand-off between the encoder and stream readers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use crossbeam::utils::CachePadded;
use tokio::sync::Notify;

use crate::capture::encoder::FrameSink;
use crate::capture::Frame;

/// One producer, any number of readers.
///
/// There is no queue: every publish replaces the slot and wakes all waiting
/// readers. A slow reader skips frames instead of holding the producer back.
pub struct FrameRelay {
    slot: ArcSwapOption<Frame>,
    sequence: AtomicU64,
    notify: Notify,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_published: AtomicU64,
    frames_delivered: AtomicU64,
    reader_timeouts: AtomicU64,
}

impl FrameRelay {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            sequence: AtomicU64::new(0),
            notify: Notify::new(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Producer: replace the current frame and wake every reader. Never blocks.
    pub fn publish(&self, data: Bytes) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::AcqRel) + 1;
        self.slot.store(Some(Arc::new(Frame {
            data,
            sequence,
            timestamp: Instant::now(),
        })));
        self.notify.notify_waiters();

        self.stats.frames_published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("relay_frames_published").increment(1);
        sequence
    }

    /// Consumer: wait for a frame newer than `last_seen` (0 = nothing seen yet).
    ///
    /// Returns immediately if the current frame is already newer. Returns
    /// `None` when `timeout` elapses first; readers treat that as end of
    /// stream, not an error.
    pub async fn next(&self, last_seen: u64, timeout: Option<Duration>) -> Option<Arc<Frame>> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            // Register before checking the slot so a publish in between is not lost
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(frame) = self.newer_than(last_seen) {
                self.stats.frames_delivered.fetch_add(1, Ordering::Relaxed);
                metrics::histogram!("relay_frame_age_seconds").record(frame.age().as_secs_f64());
                return Some(frame);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        self.stats.reader_timeouts.fetch_add(1, Ordering::Relaxed);
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Most recently published frame, if any
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.slot.load_full()
    }

    /// Drop the current frame so a restarted stream doesn't serve a stale one.
    /// Sequence numbers keep increasing.
    pub fn reset(&self) {
        self.slot.store(None);
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.frames_published.load(Ordering::Relaxed),
            self.stats.frames_delivered.load(Ordering::Relaxed),
            self.stats.reader_timeouts.load(Ordering::Relaxed),
        )
    }

    fn newer_than(&self, last_seen: u64) -> Option<Arc<Frame>> {
        self.slot
            .load_full()
            .filter(|frame| frame.sequence > last_seen)
    }
}

impl Default for FrameRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSink for FrameRelay {
    fn publish(&self, data: Bytes) -> u64 {
        FrameRelay::publish(self, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn newer_frame_is_returned_without_waiting() {
        let relay = FrameRelay::new();
        let seq = relay.publish(Bytes::from_static(b"jpeg-1"));

        let frame = relay
            .next(seq - 1, Some(Duration::from_millis(1)))
            .await
            .unwrap();
        assert_eq!(frame.sequence, seq);
        assert_eq!(&frame.data[..], b"jpeg-1");
    }

    #[tokio::test]
    async fn delivered_frame_carries_its_publish_time() {
        let relay = FrameRelay::new();
        relay.publish(Bytes::from_static(b"a"));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let frame = relay.next(0, Some(Duration::from_millis(1))).await.unwrap();
        assert!(frame.age() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn late_reader_gets_current_frame() {
        let relay = FrameRelay::new();
        relay.publish(Bytes::from_static(b"a"));
        relay.publish(Bytes::from_static(b"b"));

        let frame = relay.next(0, Some(Duration::from_millis(1))).await.unwrap();
        assert_eq!(&frame.data[..], b"b");
        assert_eq!(frame.sequence, 2);
    }

    #[tokio::test]
    async fn times_out_without_producer() {
        let relay = FrameRelay::new();
        assert!(relay.next(0, Some(Duration::from_millis(20))).await.is_none());

        let seq = relay.publish(Bytes::from_static(b"x"));
        assert!(relay.next(seq, Some(Duration::from_millis(20))).await.is_none());
        assert_eq!(relay.stats().2, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_readers_see_the_same_frame() {
        let relay = Arc::new(FrameRelay::new());
        let first = relay.publish(Bytes::from_static(b"old"));

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let relay = relay.clone();
                tokio::spawn(async move { relay.next(first, Some(Duration::from_secs(5))).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let seq = relay.publish(Bytes::from_static(b"new"));

        for reader in readers {
            let frame = reader.await.unwrap().unwrap();
            assert_eq!(frame.sequence, seq);
            assert_eq!(&frame.data[..], b"new");
        }
    }

    #[tokio::test]
    async fn reset_clears_slot_but_not_sequence() {
        let relay = FrameRelay::new();
        relay.publish(Bytes::from_static(b"a"));
        relay.reset();
        assert!(relay.latest().is_none());
        assert!(relay.next(0, Some(Duration::from_millis(5))).await.is_none());

        assert_eq!(relay.publish(Bytes::from_static(b"b")), 2);
    }
}
