pub mod clip;
pub mod config;
pub mod coordinator;
pub mod detector;
pub mod error;
pub mod events;
pub mod frame;
pub mod ring_buffer;
pub mod source;

pub use clip::{ClipMetadata, ClipWriter, DiskClipWriter, MemoryClipWriter, TriggerReason};
pub use config::{ConfigPatch, DetectorKind, MonitorConfig};
pub use coordinator::{MonitorCoordinator, MonitorStatus, TriggerState};
pub use detector::{DetectionEvent, DetectionKind, Detector, NoopDetector, PresenceDetector};
pub use error::{
    ClipError, DetectorError, MonitorError, Result, RingBufferError, SourceError,
};
pub use events::{EventBus, EventBusError, MonitorEvent};
pub use frame::{Frame, PixelFormat};
pub use ring_buffer::{RingBuffer, RingBufferStatsSnapshot};
pub use source::{FrameSource, ScriptedSource, SyntheticSource};
