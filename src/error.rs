use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    RingBuffer(#[from] RingBufferError),

    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Clip(#[from] ClipError),

    #[error("Invalid configuration update: {reason}")]
    InvalidConfigUpdate { reason: String },

    #[error("Fatal invariant violation: {message}")]
    Fatal { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl MonitorError {
    pub fn fatal<S: Into<String>>(message: S) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn invalid_config<S: Into<String>>(reason: S) -> Self {
        Self::InvalidConfigUpdate {
            reason: reason.into(),
        }
    }
}

/// Errors from the rolling frame buffer.
#[derive(Error, Debug)]
pub enum RingBufferError {
    /// The pushed frame is older than the current tail. Arrival must be
    /// monotonically non-decreasing; this is a caller error, not a fault
    /// of the buffer.
    #[error("out-of-order frame: sequence {sequence} is older than the buffer tail")]
    OutOfOrder { sequence: u64 },
}

/// Errors from a detector variant evaluating a single frame.
#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("invalid frame {sequence}: {details}")]
    InvalidFrame { sequence: u64, details: String },

    #[error("classifier error: {details}")]
    Classifier { details: String },
}

/// Errors from a frame source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("end of stream")]
    EndOfStream,

    #[error("source device error: {details}")]
    Device { details: String },

    #[error("source is not running")]
    NotRunning,
}

/// Errors from persisting a clip.
#[derive(Error, Debug)]
pub enum ClipError {
    #[error("clip has no frames")]
    Empty,

    #[error("failed to create clip directory {path}: {source}")]
    DirectoryCreation {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to encode frame {sequence}: {details}")]
    Encoding { sequence: u64, details: String },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, MonitorError>;
