use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::MonitorError;

/// Runtime configuration for the monitor.
///
/// The coordinator shares this as `Arc<MonitorConfig>` and replaces the whole
/// record on update, so readers always observe a consistent snapshot.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MonitorConfig {
    pub source: SourceConfig,
    pub buffer: BufferConfig,
    pub detector: DetectorConfig,
    pub recording: RecordingConfig,
    pub storage: StorageConfig,
    pub system: SystemConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SourceConfig {
    /// Frame width in pixels
    #[serde(default = "default_frame_width")]
    pub width: u32,

    /// Frame height in pixels
    #[serde(default = "default_frame_height")]
    pub height: u32,

    /// Frames per second produced by the source
    #[serde(default = "default_source_fps")]
    pub fps: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BufferConfig {
    /// Rolling window duration in seconds
    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: f64,

    /// Optional hard cap on buffered frame count
    pub max_frames: Option<usize>,
}

/// Active detector variant
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    /// No classification; nothing ever triggers
    Noop,
    /// Background-subtraction presence classifier
    Presence,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Which detector variant to run
    #[serde(default = "default_detector_kind")]
    pub kind: DetectorKind,

    /// Minimum interval between detector evaluations, in seconds
    #[serde(default = "default_detection_interval_seconds")]
    pub detection_interval_seconds: f64,

    /// Foreground pixel count at which a frame counts as presence
    #[serde(default = "default_motion_threshold")]
    pub motion_threshold: u32,

    /// Per-pixel difference threshold for the foreground mask
    #[serde(default = "default_delta_threshold")]
    pub delta_threshold: u32,

    /// Consecutive absent frames required to confirm absence
    #[serde(default = "default_frames_threshold")]
    pub frames_threshold: u32,

    /// Frames fed to the background model before any event is emitted
    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: u32,

    /// Quiet period after a trigger, in seconds
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RecordingConfig {
    /// Seconds of buffered history included before the trigger
    #[serde(default = "default_pre_event_seconds")]
    pub pre_event_seconds: f64,

    /// Seconds of live frames collected after the trigger
    #[serde(default = "default_post_event_seconds")]
    pub post_event_seconds: f64,

    /// Directory where clips are persisted
    #[serde(default = "default_clip_dir")]
    pub clip_dir: String,

    /// Nominal playback rate recorded in clip metadata
    #[serde(default = "default_clip_fps")]
    pub clip_fps: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StorageConfig {
    /// Maximum number of clips to retain (0 = unlimited)
    #[serde(default = "default_max_clips")]
    pub max_clips: usize,

    /// Maximum clip age in days (0 = unlimited)
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SystemConfig {
    /// Whether detection starts enabled
    #[serde(default = "default_monitoring_enabled")]
    pub monitoring_enabled: bool,

    /// Bounded wait for in-flight recordings on stop, in seconds
    #[serde(default = "default_stop_timeout_seconds")]
    pub stop_timeout_seconds: f64,

    /// Event bus channel capacity
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

impl MonitorConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("edgemon.toml")
    }

    /// Load configuration from a specific file path, with `EDGEMON_`
    /// environment variable overrides on top.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("source.width", default_frame_width())?
            .set_default("source.height", default_frame_height())?
            .set_default("source.fps", default_source_fps())?
            .set_default("buffer.retention_seconds", default_retention_seconds())?
            .set_default("detector.kind", "presence")?
            .set_default(
                "detector.detection_interval_seconds",
                default_detection_interval_seconds(),
            )?
            .set_default("detector.motion_threshold", default_motion_threshold())?
            .set_default("detector.delta_threshold", default_delta_threshold())?
            .set_default("detector.frames_threshold", default_frames_threshold())?
            .set_default("detector.warmup_frames", default_warmup_frames())?
            .set_default("detector.cooldown_seconds", default_cooldown_seconds())?
            .set_default("recording.pre_event_seconds", default_pre_event_seconds())?
            .set_default("recording.post_event_seconds", default_post_event_seconds())?
            .set_default("recording.clip_dir", default_clip_dir())?
            .set_default("recording.clip_fps", default_clip_fps())?
            .set_default("storage.max_clips", default_max_clips() as i64)?
            .set_default("storage.max_age_days", default_max_age_days())?
            .set_default("system.monitoring_enabled", default_monitoring_enabled())?
            .set_default(
                "system.stop_timeout_seconds",
                default_stop_timeout_seconds(),
            )?
            .set_default(
                "system.event_bus_capacity",
                default_event_bus_capacity() as i64,
            )?
            .add_source(File::with_name(&path_str).required(false))
            .add_source(Environment::with_prefix("EDGEMON").separator("_"))
            .build()?;

        let config: MonitorConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.width == 0 || self.source.height == 0 {
            return Err(ConfigError::Message(
                "Source resolution must be greater than 0".to_string(),
            ));
        }
        if self.source.fps == 0 {
            return Err(ConfigError::Message(
                "Source fps must be greater than 0".to_string(),
            ));
        }
        if !(self.buffer.retention_seconds > 0.0) {
            return Err(ConfigError::Message(
                "Buffer retention_seconds must be greater than 0".to_string(),
            ));
        }
        if !(self.detector.detection_interval_seconds > 0.0) {
            return Err(ConfigError::Message(
                "Detector detection_interval_seconds must be greater than 0".to_string(),
            ));
        }
        if self.detector.motion_threshold == 0 {
            return Err(ConfigError::Message(
                "Detector motion_threshold must be greater than 0".to_string(),
            ));
        }
        if self.detector.frames_threshold == 0 {
            return Err(ConfigError::Message(
                "Detector frames_threshold must be greater than 0".to_string(),
            ));
        }
        if !(self.detector.cooldown_seconds >= 0.0) {
            return Err(ConfigError::Message(
                "Detector cooldown_seconds must not be negative".to_string(),
            ));
        }
        if !(self.recording.pre_event_seconds >= 0.0) {
            return Err(ConfigError::Message(
                "Recording pre_event_seconds must not be negative".to_string(),
            ));
        }
        if !(self.recording.post_event_seconds >= 0.0) {
            return Err(ConfigError::Message(
                "Recording post_event_seconds must not be negative".to_string(),
            ));
        }
        if self.recording.clip_fps == 0 {
            return Err(ConfigError::Message(
                "Recording clip_fps must be greater than 0".to_string(),
            ));
        }
        if !(self.system.stop_timeout_seconds > 0.0) {
            return Err(ConfigError::Message(
                "System stop_timeout_seconds must be greater than 0".to_string(),
            ));
        }
        if self.system.event_bus_capacity == 0 {
            return Err(ConfigError::Message(
                "Event bus capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Build a new configuration with the patch applied, rejecting the whole
    /// update if any supplied value is out of range. The current record is
    /// never touched.
    pub fn with_patch(&self, patch: &ConfigPatch) -> Result<MonitorConfig, MonitorError> {
        let mut next = self.clone();

        if let Some(v) = patch.retention_seconds {
            if !(v > 0.0) {
                return Err(MonitorError::invalid_config(
                    "retention_seconds must be greater than 0",
                ));
            }
            next.buffer.retention_seconds = v;
        }
        if let Some(v) = patch.pre_event_seconds {
            if v < 0.0 {
                return Err(MonitorError::invalid_config(
                    "pre_event_seconds must not be negative",
                ));
            }
            next.recording.pre_event_seconds = v;
        }
        if let Some(v) = patch.post_event_seconds {
            if v < 0.0 {
                return Err(MonitorError::invalid_config(
                    "post_event_seconds must not be negative",
                ));
            }
            next.recording.post_event_seconds = v;
        }
        if let Some(v) = patch.detection_interval_seconds {
            if !(v > 0.0) {
                return Err(MonitorError::invalid_config(
                    "detection_interval_seconds must be greater than 0",
                ));
            }
            next.detector.detection_interval_seconds = v;
        }
        if let Some(v) = patch.presence_frames_threshold {
            if v == 0 {
                return Err(MonitorError::invalid_config(
                    "presence_frames_threshold must be greater than 0",
                ));
            }
            next.detector.frames_threshold = v;
        }
        if let Some(v) = patch.presence_cooldown_seconds {
            if v < 0.0 {
                return Err(MonitorError::invalid_config(
                    "presence_cooldown_seconds must not be negative",
                ));
            }
            next.detector.cooldown_seconds = v;
        }
        if let Some(v) = patch.motion_threshold {
            if v == 0 {
                return Err(MonitorError::invalid_config(
                    "motion_threshold must be greater than 0",
                ));
            }
            next.detector.motion_threshold = v;
        }
        if let Some(v) = patch.monitoring_enabled {
            next.system.monitoring_enabled = v;
        }

        Ok(next)
    }
}

impl BufferConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs_f64(self.retention_seconds)
    }
}

impl DetectorConfig {
    pub fn detection_interval(&self) -> Duration {
        Duration::from_secs_f64(self.detection_interval_seconds)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_seconds)
    }
}

impl RecordingConfig {
    pub fn pre_event(&self) -> Duration {
        Duration::from_secs_f64(self.pre_event_seconds)
    }

    pub fn post_event(&self) -> Duration {
        Duration::from_secs_f64(self.post_event_seconds)
    }
}

impl SystemConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stop_timeout_seconds)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            source: SourceConfig {
                width: default_frame_width(),
                height: default_frame_height(),
                fps: default_source_fps(),
            },
            buffer: BufferConfig {
                retention_seconds: default_retention_seconds(),
                max_frames: None,
            },
            detector: DetectorConfig {
                kind: default_detector_kind(),
                detection_interval_seconds: default_detection_interval_seconds(),
                motion_threshold: default_motion_threshold(),
                delta_threshold: default_delta_threshold(),
                frames_threshold: default_frames_threshold(),
                warmup_frames: default_warmup_frames(),
                cooldown_seconds: default_cooldown_seconds(),
            },
            recording: RecordingConfig {
                pre_event_seconds: default_pre_event_seconds(),
                post_event_seconds: default_post_event_seconds(),
                clip_dir: default_clip_dir(),
                clip_fps: default_clip_fps(),
            },
            storage: StorageConfig {
                max_clips: default_max_clips(),
                max_age_days: default_max_age_days(),
            },
            system: SystemConfig {
                monitoring_enabled: default_monitoring_enabled(),
                stop_timeout_seconds: default_stop_timeout_seconds(),
                event_bus_capacity: default_event_bus_capacity(),
            },
        }
    }
}

/// Partial configuration update accepted at runtime.
///
/// Every field is optional; supplied fields are validated and then applied
/// together as a single whole-record swap.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ConfigPatch {
    pub retention_seconds: Option<f64>,
    pub pre_event_seconds: Option<f64>,
    pub post_event_seconds: Option<f64>,
    pub detection_interval_seconds: Option<f64>,
    pub presence_frames_threshold: Option<u32>,
    pub presence_cooldown_seconds: Option<f64>,
    pub motion_threshold: Option<u32>,
    pub monitoring_enabled: Option<bool>,
}

// Default value functions
fn default_frame_width() -> u32 {
    640
}
fn default_frame_height() -> u32 {
    480
}
fn default_source_fps() -> u32 {
    30
}

fn default_retention_seconds() -> f64 {
    10.0
}

fn default_detector_kind() -> DetectorKind {
    DetectorKind::Presence
}
fn default_detection_interval_seconds() -> f64 {
    1.0
}
fn default_motion_threshold() -> u32 {
    500
}
fn default_delta_threshold() -> u32 {
    25
}
fn default_frames_threshold() -> u32 {
    3
}
fn default_warmup_frames() -> u32 {
    15
}
fn default_cooldown_seconds() -> f64 {
    10.0
}

fn default_pre_event_seconds() -> f64 {
    5.0
}
fn default_post_event_seconds() -> f64 {
    5.0
}
fn default_clip_dir() -> String {
    "./clips".to_string()
}
fn default_clip_fps() -> u32 {
    30
}

fn default_max_clips() -> usize {
    50
}
fn default_max_age_days() -> u32 {
    7
}

fn default_monitoring_enabled() -> bool {
    true
}
fn default_stop_timeout_seconds() -> f64 {
    10.0
}
fn default_event_bus_capacity() -> usize {
    100
}
