use crate::error::RingBufferError;
use crate::frame::Frame;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{debug, trace};

/// Rolling frame store bounded by a retention window.
///
/// Capacity is time-based: every push evicts frames older than
/// `latest.captured_at - retention`, eagerly, so the window invariant holds
/// after each insert rather than at some later cleanup. An optional frame
/// count cap bounds memory when the source frame rate spikes.
///
/// One writer (the ingestion loop) appends; any number of readers take
/// consistent snapshots. The lock is held only for the copy itself.
pub struct RingBuffer {
    inner: RwLock<Inner>,
    stats: RingBufferStats,
}

struct Inner {
    frames: VecDeque<Frame>,
    retention: Duration,
    max_frames: Option<usize>,
}

/// Counters for buffer activity, readable without taking the frame lock
#[derive(Debug, Default)]
pub struct RingBufferStats {
    pub frames_pushed: AtomicU64,
    pub frames_evicted: AtomicU64,
    pub frames_rejected: AtomicU64,
}

/// Point-in-time view of the buffer counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingBufferStatsSnapshot {
    pub frames_pushed: u64,
    pub frames_evicted: u64,
    pub frames_rejected: u64,
}

impl RingBufferStats {
    fn snapshot(&self) -> RingBufferStatsSnapshot {
        RingBufferStatsSnapshot {
            frames_pushed: self.frames_pushed.load(Ordering::Relaxed),
            frames_evicted: self.frames_evicted.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
        }
    }
}

impl RingBuffer {
    /// Create a buffer retaining `retention` worth of frames, optionally
    /// capped at `max_frames` entries.
    pub fn new(retention: Duration, max_frames: Option<usize>) -> Self {
        debug!(
            "Created ring buffer with retention {:?}, max_frames {:?}",
            retention, max_frames
        );
        Self {
            inner: RwLock::new(Inner {
                frames: VecDeque::new(),
                retention,
                max_frames: max_frames.filter(|&n| n > 0),
            }),
            stats: RingBufferStats::default(),
        }
    }

    /// Append a frame, then evict everything that fell out of the window.
    ///
    /// Frames must arrive with non-decreasing `captured_at`; an older frame
    /// is rejected and reported as a caller error.
    pub fn push(&self, frame: Frame) -> Result<(), RingBufferError> {
        let mut inner = self.inner.write();

        if let Some(tail) = inner.frames.back() {
            if frame.captured_at < tail.captured_at {
                drop(inner);
                self.stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(RingBufferError::OutOfOrder {
                    sequence: frame.sequence,
                });
            }
        }

        trace!("Pushing frame {} into buffer", frame.sequence);
        let latest = frame.captured_at;
        inner.frames.push_back(frame);

        let mut evicted = 0u64;
        if let Some(cutoff) = latest.checked_sub(inner.retention) {
            while inner
                .frames
                .front()
                .map_or(false, |f| f.captured_at < cutoff)
            {
                inner.frames.pop_front();
                evicted += 1;
            }
        }
        if let Some(cap) = inner.max_frames {
            while inner.frames.len() > cap {
                inner.frames.pop_front();
                evicted += 1;
            }
        }
        drop(inner);

        self.stats.frames_pushed.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.stats
                .frames_evicted
                .fetch_add(evicted, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Ordered copy of the buffer contents at call time.
    pub fn snapshot(&self) -> Vec<Frame> {
        let inner = self.inner.read();
        inner.frames.iter().cloned().collect()
    }

    /// Ordered copy of all frames with `captured_at >= since`.
    pub fn snapshot_since(&self, since: SystemTime) -> Vec<Frame> {
        let inner = self.inner.read();
        inner
            .frames
            .iter()
            .skip_while(|f| f.captured_at < since)
            .cloned()
            .collect()
    }

    /// Most recently pushed frame, if any.
    pub fn latest(&self) -> Option<Frame> {
        self.inner.read().frames.back().cloned()
    }

    /// Number of frames currently retained.
    pub fn len(&self) -> usize {
        self.inner.read().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().frames.is_empty()
    }

    /// Currently configured retention window.
    pub fn retention(&self) -> Duration {
        self.inner.read().retention
    }

    /// Update the retention window. A shrink takes effect on the next push.
    pub fn set_retention(&self, retention: Duration) {
        let mut inner = self.inner.write();
        debug!(
            "Ring buffer retention changed {:?} -> {:?}",
            inner.retention, retention
        );
        inner.retention = retention;
    }

    /// Time span between the oldest and newest retained frames.
    pub fn window(&self) -> Duration {
        let inner = self.inner.read();
        match (inner.frames.front(), inner.frames.back()) {
            (Some(first), Some(last)) => last
                .captured_at
                .duration_since(first.captured_at)
                .unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }

    pub fn stats(&self) -> RingBufferStatsSnapshot {
        self.stats.snapshot()
    }

    /// Drop all retained frames. Counters are preserved.
    pub fn clear(&self) {
        self.inner.write().frames.clear();
        debug!("Ring buffer cleared");
    }
}
