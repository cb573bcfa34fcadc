//! Outbound notifications: alert and status messages.
//!
//! Topics are derived from the device id:
//! - `<device>/alerts/ppe`: one message per accepted violation
//! - `<device>/status/ppe`: periodic status snapshot
//! - `<device>/availability`: retained `online` / `offline` (MQTT only)
//!
//! Publishing failures are returned to the caller, which logs them and carries on.

pub mod mqtt;

use anyhow::Result;
use serde::Serialize;

use crate::alert::AcceptedAlert;
use crate::detect::Detection;
use crate::Timestamp;

pub use mqtt::{MqttNotifier, MqttSettings};

pub const EVENT_TYPE_VIOLATION: &str = "PPE_VIOLATION";
pub const SEVERITY_HIGH: &str = "HIGH";

/// Topic names for one device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topics {
    pub alerts: String,
    pub status: String,
    pub availability: String,
}

impl Topics {
    pub fn for_device(device_id: &str) -> Self {
        Self {
            alerts: format!("{}/alerts/ppe", device_id),
            status: format!("{}/status/ppe", device_id),
            availability: format!("{}/availability", device_id),
        }
    }
}

/// Message transport.
pub trait Notifier: Send {
    /// Transport identifier used in logs.
    fn name(&self) -> &'static str;

    /// Publish one JSON message. No retries happen here.
    fn publish(&mut self, topic: &str, message: &serde_json::Value) -> Result<()>;

    /// Flush and disconnect. Called once at shutdown.
    fn close(&mut self) {}
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AlertStats {
    pub total_violations: u64,
    pub frames_processed: u64,
}

/// Payload published on the alerts topic.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AlertMessage {
    pub device_id: String,
    pub timestamp: Timestamp,
    pub event_type: &'static str,
    pub severity: &'static str,
    pub violation: Detection,
    /// Evidence location, `null` when no evidence was stored.
    pub image_url: Option<String>,
    pub message: String,
    pub stats: AlertStats,
}

impl AlertMessage {
    pub fn new(
        device_id: &str,
        alert: &AcceptedAlert,
        image_url: Option<String>,
        frames_processed: u64,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            timestamp: alert.timestamp,
            event_type: EVENT_TYPE_VIOLATION,
            severity: SEVERITY_HIGH,
            violation: alert.detection.clone(),
            image_url,
            message: format!(
                "PPE violation detected: {}",
                alert.detection.class_name
            ),
            stats: AlertStats {
                total_violations: alert.total_violations,
                frames_processed,
            },
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Stopped,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct StatusStats {
    pub frames_processed: u64,
    pub detections_total: u64,
    pub violations_total: u64,
    pub last_violation: Option<Timestamp>,
    pub inference_time_ms: f64,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct StatusConfig {
    pub simulation_mode: bool,
    pub camera_resolution: (u32, u32),
}

/// Payload published on the status topic.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct StatusSnapshot {
    pub device_id: String,
    pub timestamp: Timestamp,
    pub status: RunState,
    pub uptime_seconds: u64,
    pub stats: StatusStats,
    pub config: StatusConfig,
}

/// Notifier that only writes messages to the log. Used when no broker is configured.
#[derive(Debug, Default)]
pub struct LogNotifier {
    published: u64,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> u64 {
        self.published
    }
}

impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    fn publish(&mut self, topic: &str, message: &serde_json::Value) -> Result<()> {
        self.published += 1;
        log::info!("[{}] {}", topic, message);
        Ok(())
    }
}

/// Serialize and publish, logging any failure. Returns whether the publish succeeded.
pub fn publish_json<T: Serialize>(notifier: &mut dyn Notifier, topic: &str, message: &T) -> bool {
    let value = match serde_json::to_value(message) {
        Ok(value) => value,
        Err(e) => {
            log::warn!("failed to serialize message for {}: {}", topic, e);
            return false;
        }
    };
    match notifier.publish(topic, &value) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("{} publish to {} failed: {:#}", notifier.name(), topic, e);
            false
        }
    }
}
