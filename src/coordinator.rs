use crate::clip::{ClipMetadata, ClipWriter, TriggerReason};
use crate::config::{ConfigPatch, DetectorKind, MonitorConfig};
use crate::detector::{DetectionEvent, DetectionKind, Detector, NoopDetector, PresenceDetector};
use crate::error::{MonitorError, Result, RingBufferError};
use crate::events::{EventBus, MonitorEvent};
use crate::frame::Frame;
use crate::ring_buffer::RingBuffer;
use crate::source::FrameSource;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the live frame tap feeding detection and recording tasks
const FRAME_TAP_CAPACITY: usize = 256;

/// Ceiling for the source retry backoff
const SOURCE_BACKOFF_MAX: Duration = Duration::from_secs(30);
const SOURCE_BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Trigger state machine driving when an absence event starts a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TriggerState {
    /// No confirmed presence, no recording pending
    Idle,
    /// Presence confirmed, waiting for absence
    ArmedPresent,
    /// A recording was just produced; new triggers suppressed
    Cooldown,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Idle => "idle",
            TriggerState::ArmedPresent => "armed_present",
            TriggerState::Cooldown => "cooldown",
        }
    }
}

/// Read-only runtime snapshot returned by `status()`
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub monitoring_enabled: bool,
    pub trigger_state: TriggerState,
    pub last_recording_at: Option<SystemTime>,
    pub last_error: Option<String>,
    pub fatal_error: Option<String>,
    pub retention_seconds: f64,
    pub buffer_window_seconds: f64,
    pub buffered_frames: usize,
    pub frames_ingested: u64,
    pub frames_rejected: u64,
    pub detector_errors: u64,
    pub source_retries: u64,
    pub recordings_completed: u64,
    pub recordings_failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_ingested: AtomicU64,
    detector_errors: AtomicU64,
    source_retries: AtomicU64,
    recordings_completed: AtomicU64,
    recordings_failed: AtomicU64,
}

struct TriggerControl {
    state: TriggerState,
    cooldown_until: Option<Instant>,
    last_recording_at: Option<SystemTime>,
}

impl TriggerControl {
    fn new() -> Self {
        Self {
            state: TriggerState::Idle,
            cooldown_until: None,
            last_recording_at: None,
        }
    }

    /// Lazily complete the Cooldown -> Idle transition once the quiet
    /// period has elapsed.
    fn resolve_cooldown(&mut self) {
        if self.state == TriggerState::Cooldown {
            let expired = self
                .cooldown_until
                .map_or(true, |until| Instant::now() >= until);
            if expired {
                self.state = TriggerState::Idle;
                self.cooldown_until = None;
                debug!("Cooldown elapsed, trigger back to idle");
            }
        }
    }
}

/// State shared between the coordinator handle and its tasks
struct Shared {
    ring_buffer: Arc<RingBuffer>,
    config: RwLock<Arc<MonitorConfig>>,
    config_generation: AtomicU64,
    event_bus: EventBus,
    clip_writer: Arc<dyn ClipWriter>,
    frame_tap: broadcast::Sender<Frame>,
    monitoring_enabled: AtomicBool,
    trigger: Mutex<TriggerControl>,
    last_error: Mutex<Option<String>>,
    fatal: Mutex<Option<String>>,
    counters: Counters,
    recording_tasks: Mutex<Vec<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
    running: AtomicBool,
}

impl Shared {
    fn config_snapshot(&self) -> Arc<MonitorConfig> {
        Arc::clone(&self.config.read())
    }

    fn record_error(&self, message: String) {
        *self.last_error.lock() = Some(message);
    }

    /// Mark an unrecoverable invariant violation and stop everything.
    fn set_fatal(self: &Arc<Self>, message: String) {
        error!("Fatal invariant violation: {}", message);
        *self.fatal.lock() = Some(message.clone());
        self.event_bus.publish_lossy(MonitorEvent::ShutdownRequested {
            timestamp: SystemTime::now(),
            reason: message,
        });
        self.cancel.lock().cancel();
        self.running.store(false, Ordering::SeqCst);
    }

    /// Feed one detection event through the trigger state machine.
    fn handle_detection(self: &Arc<Self>, event: DetectionEvent) {
        match event.kind {
            DetectionKind::None => {
                self.trigger.lock().resolve_cooldown();
            }
            DetectionKind::PresenceConfirmed => {
                let mut trigger = self.trigger.lock();
                trigger.resolve_cooldown();
                match trigger.state {
                    TriggerState::Idle => {
                        trigger.state = TriggerState::ArmedPresent;
                        drop(trigger);
                        self.event_bus.publish_lossy(MonitorEvent::PresenceConfirmed {
                            observed_at: event.observed_at,
                        });
                    }
                    // Already armed, or suppressed by cooldown
                    TriggerState::ArmedPresent | TriggerState::Cooldown => {
                        debug!(
                            "Presence confirmed while {}, ignoring",
                            trigger.state.as_str()
                        );
                    }
                }
            }
            DetectionKind::AbsenceConfirmed => {
                let mut trigger = self.trigger.lock();
                trigger.resolve_cooldown();
                if trigger.state != TriggerState::ArmedPresent {
                    debug!(
                        "Absence confirmed while {}, ignoring",
                        trigger.state.as_str()
                    );
                    return;
                }

                let config = self.config_snapshot();
                trigger.state = TriggerState::Cooldown;
                trigger.cooldown_until = Some(Instant::now() + config.detector.cooldown());
                trigger.last_recording_at = Some(event.observed_at);
                drop(trigger);

                self.event_bus.publish_lossy(MonitorEvent::AbsenceConfirmed {
                    observed_at: event.observed_at,
                });
                self.spawn_recording(TriggerReason::Detected, event.observed_at);
            }
        }
    }

    /// Assemble a recording job and run it in its own task: pre-window from
    /// the buffer, post-window appended live from the frame tap, then the
    /// whole clip handed to the writer. Returns the job id.
    fn spawn_recording(self: &Arc<Self>, reason: TriggerReason, triggered_at: SystemTime) -> String {
        let job_id = Uuid::new_v4().to_string();
        let config = self.config_snapshot();

        // Subscribe before snapshotting so no frame falls between the
        // pre-window copy and the live stream; overlap is removed below.
        let mut tap = self.frame_tap.subscribe();
        let pre_start = triggered_at
            .checked_sub(config.recording.pre_event())
            .unwrap_or(UNIX_EPOCH);
        let pre_window = self.ring_buffer.snapshot_since(pre_start);

        if !pre_window
            .windows(2)
            .all(|pair| pair[0].captured_at <= pair[1].captured_at)
        {
            self.set_fatal("ring buffer returned an out-of-order pre-window".to_string());
            return job_id;
        }

        let last_pre_sequence = pre_window.last().map(|f| f.sequence);
        let post_duration = config.recording.post_event();
        let clip_fps = config.recording.clip_fps;
        let cancel = self.cancel.lock().clone();
        let shared = Arc::clone(self);

        self.event_bus.publish_lossy(MonitorEvent::RecordingStarted {
            job_id: job_id.clone(),
            reason,
            triggered_at,
        });

        let task_job_id = job_id.clone();
        let handle = tokio::spawn(async move {
            let mut post_window: Vec<Frame> = Vec::new();
            let deadline = tokio::time::Instant::now() + post_duration;

            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    // On shutdown the post-window is cut short but the clip
                    // is still written with what was collected.
                    _ = cancel.cancelled() => break,
                    received = tap.recv() => match received {
                        Ok(frame) => {
                            if last_pre_sequence.map_or(true, |seq| frame.sequence > seq) {
                                post_window.push(frame);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Recording {} lagged {} frames behind the tap", task_job_id, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }

            let metadata = ClipMetadata {
                job_id: task_job_id.clone(),
                triggered_at,
                reason,
                pre_frame_count: pre_window.len(),
                post_frame_count: post_window.len(),
                clip_fps,
            };
            let mut frames = pre_window;
            frames.extend(post_window);
            let frame_count = frames.len();

            match shared.clip_writer.write(frames, metadata).await {
                Ok(path) => {
                    shared.trigger.lock().last_recording_at = Some(triggered_at);
                    shared
                        .counters
                        .recordings_completed
                        .fetch_add(1, Ordering::Relaxed);
                    shared.event_bus.publish_lossy(MonitorEvent::RecordingCompleted {
                        job_id: task_job_id,
                        path: path.display().to_string(),
                        frame_count,
                    });
                }
                Err(e) => {
                    // The job is abandoned, never retried; Cooldown stays in
                    // place so a failing writer cannot cause a trigger storm.
                    shared
                        .counters
                        .recordings_failed
                        .fetch_add(1, Ordering::Relaxed);
                    shared.record_error(format!("recording {} failed: {}", task_job_id, e));
                    shared.event_bus.publish_lossy(MonitorEvent::RecordingFailed {
                        job_id: task_job_id,
                        error: e.to_string(),
                    });
                }
            }
        });

        let mut tasks = self.recording_tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);

        job_id
    }
}

/// Coordinates ingestion, detection, buffering and recording into one
/// runtime with safe start/stop semantics.
///
/// The camera always feeds the ring buffer while running; detection and the
/// trigger state machine only act while monitoring is enabled, and each
/// qualifying event records at most one clip per cooldown period.
pub struct MonitorCoordinator {
    shared: Arc<Shared>,
    source: Arc<tokio::sync::Mutex<Box<dyn FrameSource>>>,
    detector_override: Mutex<Option<Box<dyn Detector>>>,
    core_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MonitorCoordinator {
    pub fn new(
        config: MonitorConfig,
        source: Box<dyn FrameSource>,
        clip_writer: Arc<dyn ClipWriter>,
    ) -> Self {
        let ring_buffer = Arc::new(RingBuffer::new(
            config.buffer.retention(),
            config.buffer.max_frames,
        ));
        let event_bus = EventBus::new(config.system.event_bus_capacity);
        let (frame_tap, _) = broadcast::channel(FRAME_TAP_CAPACITY);
        let monitoring_enabled = config.system.monitoring_enabled;

        Self {
            shared: Arc::new(Shared {
                ring_buffer,
                config: RwLock::new(Arc::new(config)),
                config_generation: AtomicU64::new(0),
                event_bus,
                clip_writer,
                frame_tap,
                monitoring_enabled: AtomicBool::new(monitoring_enabled),
                trigger: Mutex::new(TriggerControl::new()),
                last_error: Mutex::new(None),
                fatal: Mutex::new(None),
                counters: Counters::default(),
                recording_tasks: Mutex::new(Vec::new()),
                cancel: Mutex::new(CancellationToken::new()),
                running: AtomicBool::new(false),
            }),
            source: Arc::new(tokio::sync::Mutex::new(source)),
            detector_override: Mutex::new(None),
            core_tasks: Mutex::new(Vec::new()),
        }
    }

    /// Replace the detector instance used at the next `start()`. Without an
    /// override the detector is built from the configuration.
    pub fn with_detector(self, detector: Box<dyn Detector>) -> Self {
        *self.detector_override.lock() = Some(detector);
        self
    }

    /// Subscribe to runtime notifications
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.shared.event_bus.subscribe()
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<MonitorConfig> {
        self.shared.config_snapshot()
    }

    fn build_detector(config: &MonitorConfig) -> Box<dyn Detector> {
        match config.detector.kind {
            DetectorKind::Noop => Box::new(NoopDetector),
            DetectorKind::Presence => Box::new(PresenceDetector::new(&config.detector)),
        }
    }

    /// Launch the ingestion and detection loops. Idempotent; a second call
    /// while running is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            debug!("Coordinator already running");
            return Ok(());
        }
        if let Some(message) = self.shared.fatal.lock().clone() {
            self.shared.running.store(false, Ordering::SeqCst);
            return Err(MonitorError::fatal(message));
        }

        info!("Starting monitor coordinator");

        let cancel = CancellationToken::new();
        *self.shared.cancel.lock() = cancel.clone();

        {
            let mut source = self.source.lock().await;
            source.start().await.map_err(|e| {
                self.shared.running.store(false, Ordering::SeqCst);
                MonitorError::from(e)
            })?;
        }

        let config = self.shared.config_snapshot();
        let detector = self
            .detector_override
            .lock()
            .take()
            .unwrap_or_else(|| Self::build_detector(&config));

        let ingestion = tokio::spawn(Self::ingestion_loop(
            Arc::clone(&self.shared),
            Arc::clone(&self.source),
            cancel.clone(),
        ));
        let detection = tokio::spawn(Self::detection_loop(
            Arc::clone(&self.shared),
            detector,
            cancel,
        ));

        let mut tasks = self.core_tasks.lock();
        tasks.push(ingestion);
        tasks.push(detection);

        info!("Monitor coordinator started");
        Ok(())
    }

    /// Halt the loops and wait for in-flight recording jobs, bounded by the
    /// configured stop timeout. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            debug!("Coordinator already stopped");
            return Ok(());
        }

        info!("Stopping monitor coordinator");
        self.shared.cancel.lock().cancel();

        let core_tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.core_tasks.lock());
        for task in core_tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Core task ended abnormally: {}", e);
                }
            }
        }

        let recording_tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.shared.recording_tasks.lock());
        let stop_timeout = self.shared.config_snapshot().system.stop_timeout();
        let deadline = tokio::time::Instant::now() + stop_timeout;

        for task in recording_tasks {
            if task.is_finished() {
                continue;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Recording task ended abnormally: {}", e),
                Err(_) => {
                    warn!(
                        "Recording did not finish within {:?}; clip may be incomplete",
                        stop_timeout
                    );
                    self.shared
                        .record_error("stop timed out waiting for a recording".to_string());
                    break;
                }
            }
        }

        info!("Monitor coordinator stopped");
        Ok(())
    }

    /// Turn detection on. Ingestion is unaffected; idempotent.
    pub fn enable_monitoring(&self) {
        if self.shared.monitoring_enabled.swap(true, Ordering::SeqCst) {
            debug!("Monitoring already enabled");
            return;
        }
        info!("Monitoring enabled");
    }

    /// Turn detection off and force the trigger back to idle. Frames keep
    /// flowing into the buffer so history is preserved; in-flight recording
    /// jobs still complete. Idempotent.
    pub fn disable_monitoring(&self) {
        if !self.shared.monitoring_enabled.swap(false, Ordering::SeqCst) {
            debug!("Monitoring already disabled");
            return;
        }
        let mut trigger = self.shared.trigger.lock();
        trigger.state = TriggerState::Idle;
        trigger.cooldown_until = None;
        info!("Monitoring disabled, trigger forced to idle");
    }

    /// Record a clip right now from the buffered history plus live frames,
    /// bypassing the detector and the trigger state machine entirely.
    pub fn trigger_manual_recording(&self) -> Result<String> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(MonitorError::component(
                "coordinator",
                "cannot record while stopped",
            ));
        }
        info!("Manual recording triggered");
        Ok(self
            .shared
            .spawn_recording(TriggerReason::Manual, SystemTime::now()))
    }

    /// Apply a partial configuration update as one atomic whole-record swap.
    /// An out-of-range value rejects the entire patch, leaving the previous
    /// configuration intact.
    pub fn update_config(&self, patch: &ConfigPatch) -> Result<()> {
        let current = self.shared.config_snapshot();
        let next = current.with_patch(patch)?;

        let retention = next.buffer.retention();
        *self.shared.config.write() = Arc::new(next);
        self.shared
            .config_generation
            .fetch_add(1, Ordering::SeqCst);
        self.shared.ring_buffer.set_retention(retention);

        if let Some(enabled) = patch.monitoring_enabled {
            if enabled {
                self.enable_monitoring();
            } else {
                self.disable_monitoring();
            }
        }

        self.shared.event_bus.publish_lossy(MonitorEvent::ConfigUpdated {
            timestamp: SystemTime::now(),
        });
        Ok(())
    }

    /// Non-blocking runtime snapshot
    pub fn status(&self) -> MonitorStatus {
        let config = self.shared.config_snapshot();
        let (trigger_state, last_recording_at) = {
            let mut trigger = self.shared.trigger.lock();
            trigger.resolve_cooldown();
            (trigger.state, trigger.last_recording_at)
        };
        let buffer_stats = self.shared.ring_buffer.stats();

        MonitorStatus {
            running: self.shared.running.load(Ordering::SeqCst),
            monitoring_enabled: self.shared.monitoring_enabled.load(Ordering::SeqCst),
            trigger_state,
            last_recording_at,
            last_error: self.shared.last_error.lock().clone(),
            fatal_error: self.shared.fatal.lock().clone(),
            retention_seconds: config.buffer.retention_seconds,
            buffer_window_seconds: self.shared.ring_buffer.window().as_secs_f64(),
            buffered_frames: self.shared.ring_buffer.len(),
            frames_ingested: self.shared.counters.frames_ingested.load(Ordering::Relaxed),
            frames_rejected: buffer_stats.frames_rejected,
            detector_errors: self.shared.counters.detector_errors.load(Ordering::Relaxed),
            source_retries: self.shared.counters.source_retries.load(Ordering::Relaxed),
            recordings_completed: self
                .shared
                .counters
                .recordings_completed
                .load(Ordering::Relaxed),
            recordings_failed: self
                .shared
                .counters
                .recordings_failed
                .load(Ordering::Relaxed),
        }
    }

    /// Pull frames from the source into the ring buffer and the live tap.
    /// Source faults pause ingestion and retry with exponential backoff;
    /// they never terminate the loop.
    async fn ingestion_loop(
        shared: Arc<Shared>,
        source: Arc<tokio::sync::Mutex<Box<dyn FrameSource>>>,
        cancel: CancellationToken,
    ) {
        info!("Ingestion loop started");
        let mut source = source.lock().await;
        let mut backoff = SOURCE_BACKOFF_BASE;
        let mut connected = false;

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                result = source.next_frame() => result,
            };

            match frame {
                Ok(frame) => {
                    if !connected {
                        connected = true;
                        backoff = SOURCE_BACKOFF_BASE;
                        shared.event_bus.publish_lossy(MonitorEvent::SourceStatusChanged {
                            connected: true,
                            timestamp: SystemTime::now(),
                        });
                    }
                    match shared.ring_buffer.push(frame.clone()) {
                        Ok(()) => {
                            shared
                                .counters
                                .frames_ingested
                                .fetch_add(1, Ordering::Relaxed);
                            // No subscribers is fine; detection may be off
                            let _ = shared.frame_tap.send(frame);
                        }
                        Err(RingBufferError::OutOfOrder { sequence }) => {
                            warn!("Dropping out-of-order frame {}", sequence);
                        }
                    }
                }
                Err(e) => {
                    if connected {
                        connected = false;
                        shared.event_bus.publish_lossy(MonitorEvent::SourceStatusChanged {
                            connected: false,
                            timestamp: SystemTime::now(),
                        });
                    }
                    shared
                        .counters
                        .source_retries
                        .fetch_add(1, Ordering::Relaxed);
                    shared.record_error(format!("frame source: {}", e));
                    debug!("Source fault ({}), retrying in {:?}", e, backoff);

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(SOURCE_BACKOFF_MAX);
                    if let Err(e) = source.start().await {
                        debug!("Source restart failed: {}", e);
                    }
                }
            }
        }

        source.stop().await;
        info!("Ingestion loop stopped");
    }

    /// Evaluate tapped frames through the active detector at the configured
    /// cadence and feed the outcomes to the trigger state machine.
    async fn detection_loop(
        shared: Arc<Shared>,
        mut detector: Box<dyn Detector>,
        cancel: CancellationToken,
    ) {
        info!("Detection loop started ({} detector)", detector.name());
        let mut tap = shared.frame_tap.subscribe();
        let mut last_evaluated: Option<Instant> = None;
        let mut config_seen = shared.config_generation.load(Ordering::SeqCst);

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = tap.recv() => received,
            };

            let frame = match received {
                Ok(frame) => frame,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Detection lagged {} frames behind ingestion", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            if !shared.monitoring_enabled.load(Ordering::SeqCst) {
                continue;
            }

            let generation = shared.config_generation.load(Ordering::SeqCst);
            if generation != config_seen {
                config_seen = generation;
                detector.configure(&shared.config_snapshot().detector);
                debug!("Detector reconfigured");
            }

            // Throttle applied here, by the caller, not inside the detector
            let interval = shared.config_snapshot().detector.detection_interval();
            if last_evaluated.map_or(false, |at| at.elapsed() < interval) {
                continue;
            }
            last_evaluated = Some(Instant::now());

            match detector.observe(&frame) {
                Ok(event) => shared.handle_detection(event),
                Err(e) => {
                    // A bad frame is skipped, never fatal, and causes no
                    // state transition
                    shared
                        .counters
                        .detector_errors
                        .fetch_add(1, Ordering::Relaxed);
                    warn!("Detector error on frame {}: {}", frame.sequence, e);
                }
            }
        }

        info!("Detection loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::MemoryClipWriter;
    use crate::config::MonitorConfig;
    use crate::detector::DetectionEvent;
    use crate::error::DetectorError;
    use crate::frame::PixelFormat;
    use crate::source::ScriptedSource;
    use std::collections::VecDeque;

    fn test_config() -> MonitorConfig {
        let mut config = MonitorConfig::default();
        config.buffer.retention_seconds = 10.0;
        config.detector.detection_interval_seconds = 0.001;
        config.detector.cooldown_seconds = 60.0;
        config.recording.pre_event_seconds = 5.0;
        config.recording.post_event_seconds = 0.05;
        config.system.stop_timeout_seconds = 2.0;
        config
    }

    fn test_frame(sequence: u64) -> Frame {
        Frame::new(
            sequence,
            SystemTime::now(),
            vec![0u8; 16],
            4,
            4,
            PixelFormat::Gray8,
        )
    }

    fn scripted_frames(count: u64) -> Vec<Frame> {
        (0..count).map(test_frame).collect()
    }

    /// Detector emitting a prepared sequence of detection kinds
    struct ScriptedDetector {
        kinds: VecDeque<DetectionKind>,
    }

    impl ScriptedDetector {
        fn new(kinds: Vec<DetectionKind>) -> Self {
            Self {
                kinds: kinds.into(),
            }
        }
    }

    impl Detector for ScriptedDetector {
        fn observe(&mut self, frame: &Frame) -> std::result::Result<DetectionEvent, DetectorError> {
            let kind = self.kinds.pop_front().unwrap_or(DetectionKind::None);
            Ok(DetectionEvent {
                kind,
                observed_at: frame.captured_at,
            })
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    /// Detector that fails on every frame
    struct FailingDetector;

    impl Detector for FailingDetector {
        fn observe(&mut self, frame: &Frame) -> std::result::Result<DetectionEvent, DetectorError> {
            Err(DetectorError::InvalidFrame {
                sequence: frame.sequence,
                details: "scripted failure".to_string(),
            })
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }

    fn build_coordinator(
        config: MonitorConfig,
        frames: Vec<Frame>,
    ) -> (MonitorCoordinator, Arc<MemoryClipWriter>) {
        let writer = Arc::new(MemoryClipWriter::new());
        let source = Box::new(ScriptedSource::new(frames));
        let coordinator = MonitorCoordinator::new(config, source, writer.clone());
        (coordinator, writer)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_presence_then_absence_records_exactly_once() {
        let (coordinator, writer) = build_coordinator(test_config(), scripted_frames(60));
        let coordinator = coordinator.with_detector(Box::new(ScriptedDetector::new(vec![
            DetectionKind::None,
            DetectionKind::PresenceConfirmed,
            DetectionKind::None,
            DetectionKind::AbsenceConfirmed,
        ])));

        coordinator.start().await.unwrap();
        assert!(wait_for(|| writer.job_count() == 1, Duration::from_secs(3)).await);

        let status = coordinator.status();
        assert_eq!(status.trigger_state, TriggerState::Cooldown);
        assert!(status.last_recording_at.is_some());
        assert_eq!(status.recordings_completed, 1);

        let jobs = writer.jobs();
        let (frames, metadata) = &jobs[0];
        assert_eq!(metadata.reason, TriggerReason::Detected);
        assert!(!frames.is_empty());
        // Clip frames are ordered with no duplicates
        for pair in frames.windows(2) {
            assert!(pair[0].sequence < pair[1].sequence);
        }

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cooldown_suppresses_second_trigger() {
        // Two full presence/absence pairs while the first trigger's
        // cooldown is still active: only one job may be created.
        let (coordinator, writer) = build_coordinator(test_config(), scripted_frames(80));
        let coordinator = coordinator.with_detector(Box::new(ScriptedDetector::new(vec![
            DetectionKind::PresenceConfirmed,
            DetectionKind::AbsenceConfirmed,
            DetectionKind::PresenceConfirmed,
            DetectionKind::AbsenceConfirmed,
            DetectionKind::PresenceConfirmed,
            DetectionKind::AbsenceConfirmed,
        ])));

        coordinator.start().await.unwrap();
        assert!(wait_for(|| writer.job_count() >= 1, Duration::from_secs(3)).await);

        // Let the remaining scripted events play out
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(writer.job_count(), 1);
        assert_eq!(coordinator.status().recordings_completed, 1);

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cooldown_expires_back_to_idle() {
        let mut config = test_config();
        config.detector.cooldown_seconds = 0.05;
        let (coordinator, writer) = build_coordinator(config, scripted_frames(60));
        let coordinator = coordinator.with_detector(Box::new(ScriptedDetector::new(vec![
            DetectionKind::PresenceConfirmed,
            DetectionKind::AbsenceConfirmed,
        ])));

        coordinator.start().await.unwrap();
        assert!(wait_for(|| writer.job_count() == 1, Duration::from_secs(3)).await);
        assert!(
            wait_for(
                || coordinator.status().trigger_state == TriggerState::Idle,
                Duration::from_secs(1)
            )
            .await
        );

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_trigger_ignores_trigger_state() {
        let (coordinator, writer) = build_coordinator(test_config(), scripted_frames(100));

        coordinator.start().await.unwrap();
        assert!(
            wait_for(
                || coordinator.status().frames_ingested > 5,
                Duration::from_secs(2)
            )
            .await
        );

        assert_eq!(coordinator.status().trigger_state, TriggerState::Idle);
        let job_id = coordinator.trigger_manual_recording().unwrap();
        assert!(!job_id.is_empty());

        assert!(wait_for(|| writer.job_count() == 1, Duration::from_secs(3)).await);
        // The state machine is untouched by the manual path
        assert_eq!(coordinator.status().trigger_state, TriggerState::Idle);
        let jobs = writer.jobs();
        assert_eq!(jobs[0].1.reason, TriggerReason::Manual);

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_trigger_while_stopped_is_an_error() {
        let (coordinator, _writer) = build_coordinator(test_config(), scripted_frames(10));
        assert!(coordinator.trigger_manual_recording().is_err());
    }

    #[tokio::test]
    async fn test_manual_trigger_during_cooldown_still_records() {
        let (coordinator, writer) = build_coordinator(test_config(), scripted_frames(100));
        let coordinator = coordinator.with_detector(Box::new(ScriptedDetector::new(vec![
            DetectionKind::PresenceConfirmed,
            DetectionKind::AbsenceConfirmed,
        ])));

        coordinator.start().await.unwrap();
        assert!(wait_for(|| writer.job_count() == 1, Duration::from_secs(3)).await);
        assert_eq!(coordinator.status().trigger_state, TriggerState::Cooldown);

        // Manual trigger bypasses cooldown without resetting it
        coordinator.trigger_manual_recording().unwrap();
        assert!(wait_for(|| writer.job_count() == 2, Duration::from_secs(3)).await);
        assert_eq!(coordinator.status().trigger_state, TriggerState::Cooldown);

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_enable_disable_are_idempotent() {
        let (coordinator, _writer) = build_coordinator(test_config(), scripted_frames(50));
        coordinator.start().await.unwrap();

        coordinator.disable_monitoring();
        let once = coordinator.status();
        coordinator.disable_monitoring();
        let twice = coordinator.status();
        assert!(!once.monitoring_enabled);
        assert_eq!(once.monitoring_enabled, twice.monitoring_enabled);
        assert_eq!(once.trigger_state, twice.trigger_state);

        coordinator.enable_monitoring();
        let once = coordinator.status();
        coordinator.enable_monitoring();
        let twice = coordinator.status();
        assert!(once.monitoring_enabled);
        assert_eq!(once.trigger_state, twice.trigger_state);

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_disable_forces_armed_state_to_idle() {
        let (coordinator, _writer) = build_coordinator(test_config(), scripted_frames(60));
        let coordinator = coordinator
            .with_detector(Box::new(ScriptedDetector::new(vec![
                DetectionKind::PresenceConfirmed,
            ])));

        coordinator.start().await.unwrap();
        assert!(
            wait_for(
                || coordinator.status().trigger_state == TriggerState::ArmedPresent,
                Duration::from_secs(2)
            )
            .await
        );

        coordinator.disable_monitoring();
        assert_eq!(coordinator.status().trigger_state, TriggerState::Idle);

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_disable_does_not_cancel_inflight_recording() {
        let (coordinator, writer) = build_coordinator(test_config(), scripted_frames(200));
        let coordinator = coordinator.with_detector(Box::new(ScriptedDetector::new(vec![
            DetectionKind::PresenceConfirmed,
            DetectionKind::AbsenceConfirmed,
        ])));

        coordinator.start().await.unwrap();
        // Disable immediately after the trigger fires, while the job is
        // still collecting its post-window
        assert!(
            wait_for(
                || coordinator.status().trigger_state == TriggerState::Cooldown,
                Duration::from_secs(2)
            )
            .await
        );
        coordinator.disable_monitoring();

        assert!(wait_for(|| writer.job_count() == 1, Duration::from_secs(3)).await);
        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_waits_for_inflight_recording() {
        let mut config = test_config();
        config.recording.post_event_seconds = 0.2;
        let (coordinator, writer) = build_coordinator(config, scripted_frames(500));
        let coordinator = coordinator.with_detector(Box::new(ScriptedDetector::new(vec![
            DetectionKind::PresenceConfirmed,
            DetectionKind::AbsenceConfirmed,
        ])));

        coordinator.start().await.unwrap();
        assert!(
            wait_for(
                || coordinator.status().trigger_state == TriggerState::Cooldown,
                Duration::from_secs(2)
            )
            .await
        );

        // Stop while the post-window is still collecting; the clip must be
        // written before stop returns
        coordinator.stop().await.unwrap();
        assert_eq!(writer.job_count(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_is_surfaced_not_fatal() {
        let (coordinator, writer) = build_coordinator(test_config(), scripted_frames(100));
        let coordinator = coordinator.with_detector(Box::new(ScriptedDetector::new(vec![
            DetectionKind::PresenceConfirmed,
            DetectionKind::AbsenceConfirmed,
        ])));
        writer.set_fail(true);

        coordinator.start().await.unwrap();
        assert!(
            wait_for(
                || coordinator.status().recordings_failed == 1,
                Duration::from_secs(3)
            )
            .await
        );

        let status = coordinator.status();
        assert!(status.running);
        assert!(status.last_error.is_some());
        assert!(status.fatal_error.is_none());
        // Cooldown still holds so a failing writer cannot cause a storm
        assert_eq!(status.trigger_state, TriggerState::Cooldown);

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_detector_errors_skip_frames() {
        let (coordinator, writer) = build_coordinator(test_config(), scripted_frames(30));
        let coordinator = coordinator.with_detector(Box::new(FailingDetector));

        coordinator.start().await.unwrap();
        assert!(
            wait_for(
                || coordinator.status().detector_errors > 3,
                Duration::from_secs(2)
            )
            .await
        );

        let status = coordinator.status();
        assert_eq!(status.trigger_state, TriggerState::Idle);
        assert_eq!(writer.job_count(), 0);
        assert!(status.running);

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_source_exhaustion_retries_with_backoff() {
        let (coordinator, _writer) = build_coordinator(test_config(), scripted_frames(5));

        coordinator.start().await.unwrap();
        assert!(
            wait_for(
                || coordinator.status().source_retries >= 1,
                Duration::from_secs(2)
            )
            .await
        );

        let status = coordinator.status();
        assert!(status.running);
        assert_eq!(status.frames_ingested, 5);

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_ingestion_continues_while_monitoring_disabled() {
        let mut config = test_config();
        config.system.monitoring_enabled = false;
        let (coordinator, writer) = build_coordinator(config, scripted_frames(50));
        let coordinator = coordinator.with_detector(Box::new(ScriptedDetector::new(vec![
            DetectionKind::PresenceConfirmed,
            DetectionKind::AbsenceConfirmed,
        ])));

        coordinator.start().await.unwrap();
        assert!(
            wait_for(
                || coordinator.status().frames_ingested > 10,
                Duration::from_secs(2)
            )
            .await
        );

        // History accumulates but the detector never saw a frame
        assert!(coordinator.status().buffered_frames > 0);
        assert_eq!(writer.job_count(), 0);

        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_config_swaps_whole_record() {
        let (coordinator, _writer) = build_coordinator(test_config(), scripted_frames(20));

        let patch = ConfigPatch {
            retention_seconds: Some(20.0),
            presence_cooldown_seconds: Some(1.0),
            ..Default::default()
        };
        coordinator.update_config(&patch).unwrap();

        let config = coordinator.config();
        assert_eq!(config.buffer.retention_seconds, 20.0);
        assert_eq!(config.detector.cooldown_seconds, 1.0);
        assert_eq!(coordinator.status().retention_seconds, 20.0);
    }

    #[tokio::test]
    async fn test_invalid_config_update_is_rejected_atomically() {
        let (coordinator, _writer) = build_coordinator(test_config(), scripted_frames(20));
        let before = coordinator.config();

        let patch = ConfigPatch {
            pre_event_seconds: Some(-1.0),
            retention_seconds: Some(99.0),
            ..Default::default()
        };
        let result = coordinator.update_config(&patch);
        assert!(matches!(
            result,
            Err(MonitorError::InvalidConfigUpdate { .. })
        ));

        // Nothing from the patch was applied
        let after = coordinator.config();
        assert_eq!(*before, *after);
    }

    #[tokio::test]
    async fn test_start_stop_are_idempotent() {
        let (coordinator, _writer) = build_coordinator(test_config(), scripted_frames(50));

        coordinator.start().await.unwrap();
        coordinator.start().await.unwrap();
        assert!(coordinator.status().running);

        coordinator.stop().await.unwrap();
        coordinator.stop().await.unwrap();
        assert!(!coordinator.status().running);
    }

    #[tokio::test]
    async fn test_state_machine_transitions_directly() {
        let (coordinator, _writer) = build_coordinator(test_config(), vec![]);
        let shared = &coordinator.shared;
        let now = SystemTime::now();

        let event = |kind| DetectionEvent {
            kind,
            observed_at: now,
        };

        // Absence while idle is a no-op
        shared.handle_detection(event(DetectionKind::AbsenceConfirmed));
        assert_eq!(shared.trigger.lock().state, TriggerState::Idle);

        // Idle -> ArmedPresent
        shared.handle_detection(event(DetectionKind::PresenceConfirmed));
        assert_eq!(shared.trigger.lock().state, TriggerState::ArmedPresent);

        // Presence while armed stays armed
        shared.handle_detection(event(DetectionKind::PresenceConfirmed));
        assert_eq!(shared.trigger.lock().state, TriggerState::ArmedPresent);

        // ArmedPresent -> Cooldown on absence
        shared.handle_detection(event(DetectionKind::AbsenceConfirmed));
        assert_eq!(shared.trigger.lock().state, TriggerState::Cooldown);

        // Presence while cooling down is suppressed
        shared.handle_detection(event(DetectionKind::PresenceConfirmed));
        assert_eq!(shared.trigger.lock().state, TriggerState::Cooldown);
    }
}
