use crate::error::ClipError;
use crate::frame::{Frame, PixelFormat};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, info, warn};

/// Why a clip was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerReason {
    /// Presence-then-absence confirmed by the detector
    Detected,
    /// Operator-requested recording
    Manual,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::Detected => "detected",
            TriggerReason::Manual => "manual",
        }
    }
}

/// Metadata persisted alongside a clip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipMetadata {
    pub job_id: String,
    pub triggered_at: SystemTime,
    pub reason: TriggerReason,
    pub pre_frame_count: usize,
    pub post_frame_count: usize,
    pub clip_fps: u32,
}

impl ClipMetadata {
    pub fn total_frames(&self) -> usize {
        self.pre_frame_count + self.post_frame_count
    }
}

/// Persists an ordered frame sequence as a playable clip.
///
/// Failures are reported to the caller and never retried here; retention of
/// old clips is the writer's own concern and invisible to the coordinator.
#[async_trait]
pub trait ClipWriter: Send + Sync {
    async fn write(&self, frames: Vec<Frame>, metadata: ClipMetadata)
        -> Result<PathBuf, ClipError>;
}

/// Disk-backed clip writer.
///
/// Each clip becomes a directory named
/// `clip_<YYYYmmdd_HHMMSS_mmm>_<reason>_<id>` holding the frame sequence as
/// JPEGs plus a `metadata.json` sidecar. After every write the retention
/// policy prunes the oldest clips beyond `max_clips` and anything older than
/// `max_age_days`.
pub struct DiskClipWriter {
    base_dir: PathBuf,
    max_clips: usize,
    max_age_days: u32,
}

impl DiskClipWriter {
    pub fn new<P: Into<PathBuf>>(base_dir: P, max_clips: usize, max_age_days: u32) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_clips,
            max_age_days,
        }
    }

    fn clip_dir_name(metadata: &ClipMetadata) -> String {
        let timestamp = DateTime::<Utc>::from(metadata.triggered_at);
        let short_id: String = metadata.job_id.chars().take(8).collect();
        format!(
            "clip_{}_{}_{}",
            timestamp.format("%Y%m%d_%H%M%S_%3f"),
            metadata.reason.as_str(),
            short_id
        )
    }

    /// Parse the trigger timestamp back out of a clip directory name
    fn parse_clip_timestamp(name: &str) -> Option<DateTime<Utc>> {
        let parts: Vec<&str> = name.split('_').collect();
        if parts.len() < 4 || parts[0] != "clip" {
            return None;
        }
        let naive =
            NaiveDateTime::parse_from_str(&format!("{}{}", parts[1], parts[2]), "%Y%m%d%H%M%S")
                .ok()?;
        let millis: i64 = parts[3].parse().ok()?;
        Some(naive.and_utc() + chrono::Duration::milliseconds(millis))
    }

    fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>, ClipError> {
        match frame.format {
            PixelFormat::Mjpeg => Ok(frame.payload.as_ref().clone()),
            PixelFormat::Rgb24 | PixelFormat::Gray8 => {
                let color = match frame.format {
                    PixelFormat::Rgb24 => image::ColorType::Rgb8,
                    _ => image::ColorType::L8,
                };
                let mut buf = Vec::new();
                let mut encoder = JpegEncoder::new_with_quality(&mut buf, 90);
                encoder
                    .encode(&frame.payload, frame.width, frame.height, color)
                    .map_err(|e| ClipError::Encoding {
                        sequence: frame.sequence,
                        details: e.to_string(),
                    })?;
                Ok(buf)
            }
        }
    }

    /// Delete the oldest clips beyond the count cap and anything past the
    /// age cap.
    async fn apply_retention(&self) {
        let mut clips = match self.list_clip_dirs().await {
            Ok(clips) => clips,
            Err(e) => {
                warn!("Retention scan failed: {}", e);
                return;
            }
        };
        // Names embed the trigger timestamp, so lexicographic order is
        // chronological.
        clips.sort();

        let mut to_delete: Vec<PathBuf> = Vec::new();

        if self.max_clips > 0 && clips.len() > self.max_clips {
            let excess = clips.len() - self.max_clips;
            to_delete.extend(clips[..excess].iter().cloned());
        }

        if self.max_age_days > 0 {
            let cutoff = Utc::now() - chrono::Duration::days(self.max_age_days as i64);
            for dir in &clips {
                if let Some(name) = dir.file_name().and_then(|n| n.to_str()) {
                    if let Some(timestamp) = Self::parse_clip_timestamp(name) {
                        if timestamp < cutoff && !to_delete.contains(dir) {
                            to_delete.push(dir.clone());
                        }
                    }
                }
            }
        }

        for dir in to_delete {
            match fs::remove_dir_all(&dir).await {
                Ok(()) => info!("Deleted old clip: {}", dir.display()),
                Err(e) => warn!("Failed to delete old clip {}: {}", dir.display(), e),
            }
        }
    }

    async fn list_clip_dirs(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut clips = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_clip = path.is_dir()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with("clip_"));
            if is_clip {
                clips.push(path);
            }
        }
        Ok(clips)
    }
}

#[async_trait]
impl ClipWriter for DiskClipWriter {
    async fn write(
        &self,
        frames: Vec<Frame>,
        metadata: ClipMetadata,
    ) -> Result<PathBuf, ClipError> {
        if frames.is_empty() {
            return Err(ClipError::Empty);
        }

        let clip_dir = self.base_dir.join(Self::clip_dir_name(&metadata));
        fs::create_dir_all(&clip_dir)
            .await
            .map_err(|e| ClipError::DirectoryCreation {
                path: clip_dir.display().to_string(),
                source: e,
            })?;

        let mut written = 0usize;
        let mut skipped = 0usize;
        for (index, frame) in frames.iter().enumerate() {
            if !frame.validate_len() {
                warn!(
                    "Skipping frame {} with invalid payload length",
                    frame.sequence
                );
                skipped += 1;
                continue;
            }
            let jpeg = Self::encode_jpeg(frame)?;
            let file_path = clip_dir.join(format!("frame_{:06}.jpg", index));
            fs::write(&file_path, &jpeg)
                .await
                .map_err(|e| ClipError::Write {
                    path: file_path.display().to_string(),
                    source: e,
                })?;
            written += 1;
        }

        if written == 0 {
            // Nothing usable; remove the empty directory and report
            let _ = fs::remove_dir_all(&clip_dir).await;
            return Err(ClipError::Empty);
        }
        if skipped > 0 {
            warn!("Skipped {} invalid frame(s) while writing clip", skipped);
        }

        let metadata_json = serde_json::to_string_pretty(&metadata).map_err(|e| {
            ClipError::Encoding {
                sequence: 0,
                details: format!("metadata serialization failed: {}", e),
            }
        })?;
        let metadata_path = clip_dir.join("metadata.json");
        fs::write(&metadata_path, metadata_json)
            .await
            .map_err(|e| ClipError::Write {
                path: metadata_path.display().to_string(),
                source: e,
            })?;

        info!(
            "Clip {} written: {} frames at {}",
            metadata.job_id,
            written,
            clip_dir.display()
        );

        self.apply_retention().await;

        Ok(clip_dir)
    }
}

/// In-memory clip writer capturing jobs for inspection. Test double.
#[derive(Default)]
pub struct MemoryClipWriter {
    jobs: parking_lot::Mutex<Vec<(Vec<Frame>, ClipMetadata)>>,
    fail: std::sync::atomic::AtomicBool,
}

impl MemoryClipWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail, to exercise the abandon path
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn jobs(&self) -> Vec<(Vec<Frame>, ClipMetadata)> {
        self.jobs.lock().clone()
    }
}

#[async_trait]
impl ClipWriter for MemoryClipWriter {
    async fn write(
        &self,
        frames: Vec<Frame>,
        metadata: ClipMetadata,
    ) -> Result<PathBuf, ClipError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ClipError::Write {
                path: "memory".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "simulated write failure"),
            });
        }
        if frames.is_empty() {
            return Err(ClipError::Empty);
        }
        let path = PathBuf::from(format!("memory://{}", metadata.job_id));
        debug!(
            "Memory writer captured job {} ({} frames)",
            metadata.job_id,
            frames.len()
        );
        self.jobs.lock().push((frames, metadata));
        Ok(path)
    }
}

/// Make sure a base directory exists before the first write
pub async fn ensure_clip_dir(base_dir: &Path) -> std::io::Result<()> {
    if !base_dir.exists() {
        fs::create_dir_all(base_dir).await?;
        info!("Created clip directory: {}", base_dir.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn test_frame(sequence: u64) -> Frame {
        Frame::new(
            sequence,
            SystemTime::UNIX_EPOCH + Duration::from_millis(sequence * 33),
            vec![100u8; 16 * 12],
            16,
            12,
            PixelFormat::Gray8,
        )
    }

    fn test_metadata(triggered_at: SystemTime, reason: TriggerReason) -> ClipMetadata {
        ClipMetadata {
            job_id: Uuid::new_v4().to_string(),
            triggered_at,
            reason,
            pre_frame_count: 2,
            post_frame_count: 1,
            clip_fps: 30,
        }
    }

    #[tokio::test]
    async fn test_write_creates_frames_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiskClipWriter::new(dir.path(), 0, 0);

        let frames = vec![test_frame(1), test_frame(2), test_frame(3)];
        let metadata = test_metadata(SystemTime::now(), TriggerReason::Detected);
        let clip_dir = writer.write(frames, metadata).await.unwrap();

        let name = clip_dir.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("clip_"));
        assert!(name.contains("_detected_"));

        let mut jpeg_count = 0;
        let mut has_metadata = false;
        for entry in std::fs::read_dir(&clip_dir).unwrap() {
            let entry = entry.unwrap();
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.ends_with(".jpg") {
                jpeg_count += 1;
            } else if file_name == "metadata.json" {
                has_metadata = true;
            }
        }
        assert_eq!(jpeg_count, 3);
        assert!(has_metadata);
    }

    #[tokio::test]
    async fn test_manual_reason_is_encoded_in_name() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiskClipWriter::new(dir.path(), 0, 0);

        let clip_dir = writer
            .write(
                vec![test_frame(1)],
                test_metadata(SystemTime::now(), TriggerReason::Manual),
            )
            .await
            .unwrap();
        let name = clip_dir.file_name().unwrap().to_str().unwrap();
        assert!(name.contains("_manual_"));
    }

    #[tokio::test]
    async fn test_empty_clip_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiskClipWriter::new(dir.path(), 0, 0);

        let result = writer
            .write(vec![], test_metadata(SystemTime::now(), TriggerReason::Manual))
            .await;
        assert!(matches!(result, Err(ClipError::Empty)));
    }

    #[tokio::test]
    async fn test_retention_prunes_oldest_beyond_cap() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiskClipWriter::new(dir.path(), 2, 0);

        let base = SystemTime::now();
        for i in 0..3u64 {
            writer
                .write(
                    vec![test_frame(i)],
                    test_metadata(base + Duration::from_secs(i), TriggerReason::Detected),
                )
                .await
                .unwrap();
        }

        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);

        // The survivors are the two newest
        let newest = DateTime::<Utc>::from(base + Duration::from_secs(2))
            .format("%Y%m%d_%H%M%S")
            .to_string();
        assert!(names[1].contains(&newest));
    }

    #[tokio::test]
    async fn test_invalid_frames_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DiskClipWriter::new(dir.path(), 0, 0);

        let bad = Frame::new(9, SystemTime::now(), vec![0u8; 3], 16, 12, PixelFormat::Gray8);
        let clip_dir = writer
            .write(
                vec![test_frame(1), bad],
                test_metadata(SystemTime::now(), TriggerReason::Detected),
            )
            .await
            .unwrap();

        let jpeg_count = std::fs::read_dir(&clip_dir)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".jpg")
            })
            .count();
        assert_eq!(jpeg_count, 1);
    }

    #[test]
    fn test_clip_timestamp_roundtrip() {
        let triggered_at = SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_123_456);
        let metadata = ClipMetadata {
            job_id: "abcdef12-3456".to_string(),
            triggered_at,
            reason: TriggerReason::Detected,
            pre_frame_count: 0,
            post_frame_count: 0,
            clip_fps: 30,
        };
        let name = DiskClipWriter::clip_dir_name(&metadata);
        let parsed = DiskClipWriter::parse_clip_timestamp(&name).unwrap();
        assert_eq!(
            parsed.timestamp_millis(),
            DateTime::<Utc>::from(triggered_at).timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_memory_writer_failure_mode() {
        let writer = MemoryClipWriter::new();
        writer
            .write(
                vec![test_frame(1)],
                test_metadata(SystemTime::now(), TriggerReason::Manual),
            )
            .await
            .unwrap();
        assert_eq!(writer.job_count(), 1);

        writer.set_fail(true);
        let result = writer
            .write(
                vec![test_frame(2)],
                test_metadata(SystemTime::now(), TriggerReason::Manual),
            )
            .await;
        assert!(matches!(result, Err(ClipError::Write { .. })));
        assert_eq!(writer.job_count(), 1);
    }
}
