use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::clip::TriggerReason;

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("failed to publish event: {details}")]
    PublishFailed { details: String },
}

/// Notifications emitted by the monitor runtime.
///
/// These are observations, not commands: components publish what happened
/// and interested parties (control surface adapters, tests, logs) subscribe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MonitorEvent {
    /// The detector's belief flipped to "someone is in frame"
    PresenceConfirmed { observed_at: SystemTime },
    /// The detector's belief flipped back to "frame is empty"
    AbsenceConfirmed { observed_at: SystemTime },
    /// A recording job started collecting its post-event window
    RecordingStarted {
        job_id: String,
        reason: TriggerReason,
        triggered_at: SystemTime,
    },
    /// A recording job was persisted
    RecordingCompleted {
        job_id: String,
        path: String,
        frame_count: usize,
    },
    /// A recording job was abandoned
    RecordingFailed { job_id: String, error: String },
    /// The frame source connected or dropped
    SourceStatusChanged {
        connected: bool,
        timestamp: SystemTime,
    },
    /// The runtime configuration was replaced
    ConfigUpdated { timestamp: SystemTime },
    /// Coordinator shutdown was requested
    ShutdownRequested {
        timestamp: SystemTime,
        reason: String,
    },
}

impl MonitorEvent {
    /// Event type as a string for filtering and metrics
    pub fn event_type(&self) -> &'static str {
        match self {
            MonitorEvent::PresenceConfirmed { .. } => "presence_confirmed",
            MonitorEvent::AbsenceConfirmed { .. } => "absence_confirmed",
            MonitorEvent::RecordingStarted { .. } => "recording_started",
            MonitorEvent::RecordingCompleted { .. } => "recording_completed",
            MonitorEvent::RecordingFailed { .. } => "recording_failed",
            MonitorEvent::SourceStatusChanged { .. } => "source_status_changed",
            MonitorEvent::ConfigUpdated { .. } => "config_updated",
            MonitorEvent::ShutdownRequested { .. } => "shutdown_requested",
        }
    }

    /// Human-readable description for logs
    pub fn description(&self) -> String {
        match self {
            MonitorEvent::PresenceConfirmed { .. } => "Presence confirmed".to_string(),
            MonitorEvent::AbsenceConfirmed { .. } => "Absence confirmed".to_string(),
            MonitorEvent::RecordingStarted { job_id, reason, .. } => {
                format!("Recording {} started ({})", job_id, reason.as_str())
            }
            MonitorEvent::RecordingCompleted {
                job_id,
                path,
                frame_count,
            } => {
                format!(
                    "Recording {} completed: {} frames at {}",
                    job_id, frame_count, path
                )
            }
            MonitorEvent::RecordingFailed { job_id, error } => {
                format!("Recording {} failed: {}", job_id, error)
            }
            MonitorEvent::SourceStatusChanged { connected, .. } => {
                format!(
                    "Frame source {}",
                    if *connected { "connected" } else { "disconnected" }
                )
            }
            MonitorEvent::ConfigUpdated { .. } => "Configuration updated".to_string(),
            MonitorEvent::ShutdownRequested { reason, .. } => {
                format!("Shutdown requested: {}", reason)
            }
        }
    }
}

/// Async event bus over a broadcast channel.
///
/// Publishing never blocks; slow subscribers lag and are told so by the
/// channel, they never hold up the publisher.
pub struct EventBus {
    sender: broadcast::Sender<MonitorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers, logging it at a level matching
    /// its weight. Returns the number of receivers.
    pub fn publish(&self, event: MonitorEvent) -> Result<usize, EventBusError> {
        match &event {
            MonitorEvent::PresenceConfirmed { .. } | MonitorEvent::AbsenceConfirmed { .. } => {
                info!("{}", event.description());
            }
            MonitorEvent::RecordingStarted { .. } | MonitorEvent::RecordingCompleted { .. } => {
                info!("{}", event.description());
            }
            MonitorEvent::RecordingFailed { .. } => {
                error!("{}", event.description());
            }
            MonitorEvent::SourceStatusChanged { connected, .. } => {
                if *connected {
                    info!("Frame source connected");
                } else {
                    warn!("Frame source disconnected");
                }
            }
            MonitorEvent::ConfigUpdated { .. } | MonitorEvent::ShutdownRequested { .. } => {
                info!("{}", event.description());
            }
        }

        self.sender
            .send(event)
            .map_err(|e| EventBusError::PublishFailed {
                details: e.to_string(),
            })
    }

    /// Publish, ignoring the no-subscribers case.
    pub fn publish_lossy(&self, event: MonitorEvent) {
        if let Err(e) = self.publish(event) {
            debug!("Event dropped: {}", e);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new(10);
        let mut receiver = bus.subscribe();

        let count = bus
            .publish(MonitorEvent::PresenceConfirmed {
                observed_at: SystemTime::now(),
            })
            .unwrap();
        assert_eq!(count, 1);

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type(), "presence_confirmed");
    }

    #[tokio::test]
    async fn test_multiple_subscribers_all_receive() {
        let bus = EventBus::new(10);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(MonitorEvent::ConfigUpdated {
            timestamp: SystemTime::now(),
        })
        .unwrap();

        for rx in [&mut rx1, &mut rx2] {
            let event = timeout(Duration::from_millis(100), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.event_type(), "config_updated");
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_fails_quietly() {
        let bus = EventBus::new(10);
        assert!(!bus.has_subscribers());
        assert!(bus
            .publish(MonitorEvent::AbsenceConfirmed {
                observed_at: SystemTime::now(),
            })
            .is_err());
        // publish_lossy swallows the same condition
        bus.publish_lossy(MonitorEvent::AbsenceConfirmed {
            observed_at: SystemTime::now(),
        });
    }

    #[test]
    fn test_event_descriptions() {
        let event = MonitorEvent::RecordingFailed {
            job_id: "abc".to_string(),
            error: "disk full".to_string(),
        };
        assert_eq!(event.event_type(), "recording_failed");
        assert!(event.description().contains("disk full"));
    }
}
