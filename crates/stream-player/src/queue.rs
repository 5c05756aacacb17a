//! Bounded queue of decoded interleaved samples between the CPAL worker and the
//! output callback.
//!
//! - worker thread → [`SampleQueue::push_interleaved_timeout`] (waits for space, bounded)
//! - CPAL callback → [`SampleQueue::pop_into`] (never waits)
//!
//! [`SampleQueue::clear`] drops everything queued so a device reset takes effect
//! without waiting for the callback to drain stale audio.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Thread-safe bounded queue for interleaved `f32` samples.
///
/// ## Design
/// - **Bounded** by `max_buffered_samples` to cap memory and latency.
/// - A single [`Condvar`] signals "space freed" and "state changed".
/// - The `closed` flag lives under the same mutex as the samples.
///
/// The channel count is fixed for the lifetime of the queue.
pub struct SampleQueue {
    channels: usize,
    inner: Mutex<QueueInner>,
    cv: Condvar,
    max_buffered_samples: usize,
    low_watermark_ms: AtomicU64,
}

struct QueueInner {
    samples: VecDeque<f32>,
    closed: bool,
}

/// Queue capacity in **samples** for `buffer_seconds` of audio.
///
/// Non-finite or non-positive durations fall back to two seconds.
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };

    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels)
}

impl SampleQueue {
    pub fn new(channels: usize, max_buffered_samples: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            inner: Mutex::new(QueueInner {
                samples: VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
            max_buffered_samples: max_buffered_samples.max(channels),
            low_watermark_ms: AtomicU64::new(0),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Capacity in frames.
    pub fn max_frames(&self) -> usize {
        self.max_buffered_samples / self.channels
    }

    /// Buffered frames (best-effort snapshot).
    pub fn len_frames(&self) -> usize {
        self.lock().samples.len() / self.channels
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Refuse further pushes and wake waiters. Idempotent.
    pub fn close(&self) {
        self.lock().closed = true;
        self.cv.notify_all();
    }

    /// Drop all queued samples. Returns the number of frames dropped.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut g = self.lock();
            let n = g.samples.len();
            g.samples.clear();
            n
        };
        self.cv.notify_all();
        dropped / self.channels
    }

    /// Push as many of `samples` as fit before `timeout` elapses.
    ///
    /// Returns the number of samples accepted; a short count means the queue stayed
    /// full or was closed, and the caller should retry with the remainder.
    pub fn push_interleaved_timeout(&self, samples: &[f32], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut offset = 0;
        let mut g = self.lock();

        while offset < samples.len() && !g.closed {
            let space = self.max_buffered_samples.saturating_sub(g.samples.len());
            if space == 0 {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (ng, _timeout) = self
                    .cv
                    .wait_timeout(g, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                g = ng;
                continue;
            }
            let take = space.min(samples.len() - offset);
            g.samples.extend(&samples[offset..offset + take]);
            offset += take;
        }

        drop(g);
        if offset > 0 {
            self.cv.notify_all();
        }
        offset
    }

    /// Move up to `max_frames` whole frames into `out` without waiting.
    ///
    /// `out` is cleared first. Returns the number of frames moved.
    pub fn pop_into(&self, out: &mut Vec<f32>, max_frames: usize) -> usize {
        out.clear();
        let take_frames = {
            let mut g = self.lock();
            let take_frames = (g.samples.len() / self.channels).min(max_frames);
            out.extend(g.samples.drain(..take_frames * self.channels));
            take_frames
        };

        if take_frames > 0 {
            self.cv.notify_all();
            self.log_low_watermark();
        }
        take_frames
    }

    fn log_low_watermark(&self) {
        let threshold = (self.max_buffered_samples / 8).max(self.channels * 16);
        let queued = self.lock().samples.len();
        if queued > 0 && queued < threshold {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_else(|_| Duration::from_millis(0))
                .as_millis() as u64;
            let last = self.low_watermark_ms.load(Ordering::Relaxed);
            if now.saturating_sub(last) > 1000 {
                self.low_watermark_ms.store(now, Ordering::Relaxed);
                tracing::info!(
                    queued_samples = queued,
                    threshold_samples = threshold,
                    "decoded sample queue low watermark"
                );
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
