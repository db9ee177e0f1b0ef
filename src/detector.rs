use crate::config::DetectorConfig;
use crate::error::DetectorError;
use crate::frame::{Frame, PixelFormat};

use image::GrayImage;
use imageproc::filter::gaussian_blur_f32;
use std::time::SystemTime;
use tracing::{debug, trace};

/// Outcome of evaluating one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionKind {
    /// Nothing changed
    None,
    /// The detector's belief flipped to "someone is in frame"
    PresenceConfirmed,
    /// The detector's belief flipped to "the frame is empty again"
    AbsenceConfirmed,
}

/// Produced once per evaluated frame, consumed immediately by the trigger
/// state machine and not retained.
#[derive(Debug, Clone, Copy)]
pub struct DetectionEvent {
    pub kind: DetectionKind,
    pub observed_at: SystemTime,
}

impl DetectionEvent {
    pub fn none(observed_at: SystemTime) -> Self {
        Self {
            kind: DetectionKind::None,
            observed_at,
        }
    }
}

/// Presence classifier capability.
///
/// One entry point: `observe` consumes a frame and reports whether the
/// detector's belief changed. Variants carry their own internal state; the
/// coordinator only swaps instances and forwards configuration updates.
pub trait Detector: Send {
    fn observe(&mut self, frame: &Frame) -> Result<DetectionEvent, DetectorError>;

    /// Apply updated tuning without recreating the instance. Default: no-op.
    fn configure(&mut self, _cfg: &DetectorConfig) {}

    /// Clear per-variant state. Default: no-op.
    fn reset(&mut self) {}

    /// Variant name for status reporting
    fn name(&self) -> &'static str;
}

/// Detector that never reports anything. Default/disabled classifier and a
/// convenient test double.
#[derive(Debug, Default)]
pub struct NoopDetector;

impl Detector for NoopDetector {
    fn observe(&mut self, frame: &Frame) -> Result<DetectionEvent, DetectorError> {
        Ok(DetectionEvent::none(frame.captured_at))
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Background-subtraction presence detector.
///
/// Maintains a running-average background model; each observed frame is
/// blurred, differenced against the model, and the count of pixels exceeding
/// `delta_threshold` is compared to `motion_threshold`. Transitions are
/// debounced: presence is confirmed on the first qualifying frame, absence
/// only after `frames_threshold` consecutive empty frames.
pub struct PresenceDetector {
    motion_threshold: u32,
    delta_threshold: u8,
    frames_threshold: u32,
    warmup_frames: u32,

    background: Option<GrayImage>,
    frames_seen: u64,
    presence_observed: bool,
    consecutive_absent: u32,
    last_trigger_at: Option<SystemTime>,
}

const BACKGROUND_LEARNING_RATE: f32 = 0.05;
const BLUR_SIGMA: f32 = 1.5;

impl PresenceDetector {
    pub fn new(cfg: &DetectorConfig) -> Self {
        Self {
            motion_threshold: cfg.motion_threshold,
            delta_threshold: cfg.delta_threshold.min(255) as u8,
            frames_threshold: cfg.frames_threshold,
            warmup_frames: cfg.warmup_frames,
            background: None,
            frames_seen: 0,
            presence_observed: false,
            consecutive_absent: 0,
            last_trigger_at: None,
        }
    }

    pub fn last_trigger_at(&self) -> Option<SystemTime> {
        self.last_trigger_at
    }

    /// Decode a frame payload into a grayscale image
    fn frame_to_gray(&self, frame: &Frame) -> Result<GrayImage, DetectorError> {
        if !frame.validate_len() {
            return Err(DetectorError::InvalidFrame {
                sequence: frame.sequence,
                details: format!(
                    "payload length {} does not match {}x{} {:?}",
                    frame.payload.len(),
                    frame.width,
                    frame.height,
                    frame.format
                ),
            });
        }

        match frame.format {
            PixelFormat::Gray8 => GrayImage::from_raw(
                frame.width,
                frame.height,
                frame.payload.as_ref().clone(),
            )
            .ok_or_else(|| DetectorError::InvalidFrame {
                sequence: frame.sequence,
                details: "failed to build grayscale image from raw data".to_string(),
            }),
            PixelFormat::Rgb24 => {
                let rgb = image::RgbImage::from_raw(
                    frame.width,
                    frame.height,
                    frame.payload.as_ref().clone(),
                )
                .ok_or_else(|| DetectorError::InvalidFrame {
                    sequence: frame.sequence,
                    details: "failed to build RGB image from raw data".to_string(),
                })?;
                Ok(image::DynamicImage::ImageRgb8(rgb).to_luma8())
            }
            PixelFormat::Mjpeg => image::load_from_memory(&frame.payload)
                .map(|img| img.to_luma8())
                .map_err(|e| DetectorError::InvalidFrame {
                    sequence: frame.sequence,
                    details: format!("JPEG decode failed: {}", e),
                }),
        }
    }

    /// Count pixels differing from the background by more than the delta
    /// threshold.
    fn foreground_count(&self, background: &GrayImage, current: &GrayImage) -> u32 {
        background
            .pixels()
            .zip(current.pixels())
            .filter(|(bg, cur)| bg[0].abs_diff(cur[0]) > self.delta_threshold)
            .count() as u32
    }

    /// Fold the current frame into the running-average background model
    fn update_background(&mut self, current: &GrayImage) {
        if let Some(background) = self.background.as_mut() {
            for (bg, cur) in background.pixels_mut().zip(current.pixels()) {
                let blended = bg[0] as f32 * (1.0 - BACKGROUND_LEARNING_RATE)
                    + cur[0] as f32 * BACKGROUND_LEARNING_RATE;
                bg[0] = blended as u8;
            }
        }
    }
}

impl Detector for PresenceDetector {
    fn observe(&mut self, frame: &Frame) -> Result<DetectionEvent, DetectorError> {
        let gray = self.frame_to_gray(frame)?;
        let blurred = gaussian_blur_f32(&gray, BLUR_SIGMA);

        // A resolution change invalidates the model; reseed and re-warm.
        if self
            .background
            .as_ref()
            .map_or(false, |bg| bg.dimensions() != blurred.dimensions())
        {
            debug!(
                "Frame dimensions changed to {}x{}, reseeding background model",
                frame.width, frame.height
            );
            self.background = None;
            self.frames_seen = 0;
            self.presence_observed = false;
            self.consecutive_absent = 0;
        }

        self.frames_seen += 1;

        if self.background.is_none() {
            self.background = Some(blurred);
            return Ok(DetectionEvent::none(frame.captured_at));
        }

        if self.frames_seen <= self.warmup_frames as u64 {
            self.update_background(&blurred);
            trace!(
                "Warmup frame {}/{}",
                self.frames_seen,
                self.warmup_frames
            );
            return Ok(DetectionEvent::none(frame.captured_at));
        }

        let foreground = {
            let background = self.background.as_ref().expect("model seeded above");
            self.foreground_count(background, &blurred)
        };
        // The model only learns empty scenes; a person lingering in frame is
        // never absorbed into the background.
        if foreground < self.motion_threshold {
            self.update_background(&blurred);
        }

        trace!(
            "Frame {}: {} foreground pixels (threshold {})",
            frame.sequence,
            foreground,
            self.motion_threshold
        );

        let kind = if foreground >= self.motion_threshold {
            self.consecutive_absent = 0;
            if !self.presence_observed {
                self.presence_observed = true;
                debug!(
                    "Presence confirmed at frame {} ({} foreground pixels)",
                    frame.sequence, foreground
                );
                DetectionKind::PresenceConfirmed
            } else {
                DetectionKind::None
            }
        } else {
            self.consecutive_absent += 1;
            if self.presence_observed && self.consecutive_absent >= self.frames_threshold {
                self.presence_observed = false;
                self.consecutive_absent = 0;
                self.last_trigger_at = Some(frame.captured_at);
                debug!(
                    "Absence confirmed at frame {} after {} empty frames",
                    frame.sequence, self.frames_threshold
                );
                DetectionKind::AbsenceConfirmed
            } else {
                DetectionKind::None
            }
        };

        Ok(DetectionEvent {
            kind,
            observed_at: frame.captured_at,
        })
    }

    fn configure(&mut self, cfg: &DetectorConfig) {
        self.motion_threshold = cfg.motion_threshold;
        self.delta_threshold = cfg.delta_threshold.min(255) as u8;
        self.frames_threshold = cfg.frames_threshold;
        self.warmup_frames = cfg.warmup_frames;
    }

    fn reset(&mut self) {
        self.background = None;
        self.frames_seen = 0;
        self.presence_observed = false;
        self.consecutive_absent = 0;
    }

    fn name(&self) -> &'static str {
        "presence"
    }
}
