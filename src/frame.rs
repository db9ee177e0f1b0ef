use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

/// Pixel format of a frame payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// RGB24 - uncompressed, 3 bytes per pixel
    Rgb24,
    /// Single-channel grayscale, 1 byte per pixel
    Gray8,
    /// Motion JPEG - compressed, variable size
    Mjpeg,
}

impl PixelFormat {
    /// Bytes per pixel, 0 for compressed formats
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Gray8 => 1,
            PixelFormat::Mjpeg => 0,
        }
    }

    /// Check if the format is compressed
    pub fn is_compressed(&self) -> bool {
        matches!(self, PixelFormat::Mjpeg)
    }
}

/// An immutable timestamped image sample produced by a frame source.
///
/// The payload is shared via `Arc` so a frame can sit in the ring buffer,
/// a detector and a recording job at the same time without copies. Frames
/// are never mutated after creation.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonically increasing sequence number
    pub sequence: u64,
    /// Capture timestamp
    pub captured_at: SystemTime,
    /// Raw image data (shared ownership)
    pub payload: Arc<Vec<u8>>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Payload pixel format
    pub format: PixelFormat,
}

impl Frame {
    pub fn new(
        sequence: u64,
        captured_at: SystemTime,
        payload: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Self {
        Self {
            sequence,
            captured_at,
            payload: Arc::new(payload),
            width,
            height,
            format,
        }
    }

    /// Expected payload length for uncompressed formats
    pub fn expected_len(&self) -> Option<usize> {
        if self.format.is_compressed() {
            None
        } else {
            Some(self.width as usize * self.height as usize * self.format.bytes_per_pixel())
        }
    }

    /// Validate payload length against the declared dimensions
    pub fn validate_len(&self) -> bool {
        match self.expected_len() {
            Some(expected) => self.payload.len() == expected,
            None => !self.payload.is_empty(),
        }
    }

    /// Frame age relative to now
    pub fn age(&self) -> std::time::Duration {
        SystemTime::now()
            .duration_since(self.captured_at)
            .unwrap_or_default()
    }
}
