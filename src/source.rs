use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::frame::{Frame, PixelFormat};

use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, info};

/// Produces timestamped frames for the ingestion loop.
///
/// Implementations must yield non-decreasing `captured_at` values while
/// running. `next_frame` suspends until the next frame is due; end-of-stream
/// and device failures are signalled through `SourceError` and handled by the
/// coordinator's retry policy.
#[async_trait]
pub trait FrameSource: Send {
    async fn start(&mut self) -> Result<(), SourceError>;

    async fn stop(&mut self);

    async fn next_frame(&mut self) -> Result<Frame, SourceError>;

    /// Source name for status reporting
    fn name(&self) -> &'static str;
}

/// Synthetic frame generator used when no physical camera is present.
///
/// Emits paced RGB frames with a slowly cycling background so downstream
/// consumers see changing-but-quiet data. An optional presence window paints
/// a bright block over a frame range, standing in for a person for demos.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    interval: Duration,
    running: bool,
    sequence: u64,
    next_due: Option<Instant>,
    presence_window: Option<(u64, u64)>,
}

impl SyntheticSource {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            interval: Duration::from_secs_f64(1.0 / config.fps.max(1) as f64),
            running: false,
            sequence: 0,
            next_due: None,
            presence_window: None,
        }
    }

    /// Paint a simulated person over frames `[from, to]` (inclusive)
    pub fn with_presence_window(mut self, from: u64, to: u64) -> Self {
        self.presence_window = Some((from, to));
        self
    }

    fn generate_payload(&self) -> Vec<u8> {
        let phase = (self.sequence % 360) as f32 * std::f32::consts::PI / 180.0;
        let r = (127.0 + 16.0 * phase.sin()) as u8;
        let g = (127.0 + 16.0 * (phase + 2.0).sin()) as u8;
        let b = (127.0 + 16.0 * (phase + 4.0).sin()) as u8;

        let mut payload = Vec::with_capacity((self.width * self.height * 3) as usize);
        for _ in 0..(self.width * self.height) {
            payload.extend_from_slice(&[r, g, b]);
        }

        if let Some((from, to)) = self.presence_window {
            if (from..=to).contains(&self.sequence) {
                let (x0, x1) = (self.width / 4, self.width * 3 / 4);
                let (y0, y1) = (self.height / 4, self.height * 3 / 4);
                for y in y0..y1 {
                    for x in x0..x1 {
                        let base = ((y * self.width + x) * 3) as usize;
                        payload[base] = 235;
                        payload[base + 1] = 235;
                        payload[base + 2] = 235;
                    }
                }
            }
        }

        payload
    }
}

#[async_trait]
impl FrameSource for SyntheticSource {
    async fn start(&mut self) -> Result<(), SourceError> {
        if self.running {
            return Ok(());
        }
        info!(
            "Synthetic source started ({}x{} @ {:?}/frame)",
            self.width, self.height, self.interval
        );
        self.running = true;
        self.next_due = Some(Instant::now());
        Ok(())
    }

    async fn stop(&mut self) {
        if self.running {
            self.running = false;
            self.next_due = None;
            debug!("Synthetic source stopped after {} frames", self.sequence);
        }
    }

    async fn next_frame(&mut self) -> Result<Frame, SourceError> {
        if !self.running {
            return Err(SourceError::NotRunning);
        }

        let due = self.next_due.unwrap_or_else(Instant::now);
        tokio::time::sleep_until(due).await;
        // Pace from the previous deadline so the rate stays stable even when
        // the consumer is briefly late.
        self.next_due = Some(due + self.interval);

        let frame = Frame::new(
            self.sequence,
            SystemTime::now(),
            self.generate_payload(),
            self.width,
            self.height,
            PixelFormat::Rgb24,
        );
        self.sequence += 1;
        Ok(frame)
    }

    fn name(&self) -> &'static str {
        "synthetic"
    }
}

/// Frame source that replays a prepared list of frames, then signals
/// end-of-stream. Test double for the ingestion loop.
pub struct ScriptedSource {
    frames: VecDeque<Frame>,
    delay: Duration,
    running: bool,
}

impl ScriptedSource {
    pub fn new(frames: Vec<Frame>) -> Self {
        Self {
            frames: frames.into(),
            delay: Duration::from_millis(1),
            running: false,
        }
    }

    /// Delay between yielded frames (default 1ms)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn start(&mut self) -> Result<(), SourceError> {
        self.running = true;
        Ok(())
    }

    async fn stop(&mut self) {
        self.running = false;
    }

    async fn next_frame(&mut self) -> Result<Frame, SourceError> {
        if !self.running {
            return Err(SourceError::NotRunning);
        }
        tokio::time::sleep(self.delay).await;
        self.frames.pop_front().ok_or(SourceError::EndOfStream)
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
