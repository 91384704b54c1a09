// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Downstream bus seam
//!
//! The gateway produces three logical event families and leaves the wire
//! format to the bus client behind [`EventPublisher`]. All events derive
//! `Serialize` so a client can pick JSON, Avro or anything else.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionEventKind {
    LoggedIn,
    Disconnected,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSessionEvent {
    pub imei: String,
    pub event_kind: SessionEventKind,
    pub timestamp: DateTime<Utc>,
}

impl DeviceSessionEvent {
    pub fn new(imei: impl Into<String>, event_kind: SessionEventKind) -> DeviceSessionEvent {
        DeviceSessionEvent {
            imei: imei.into(),
            event_kind,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetryEvent {
    pub imei: String,
    pub timestamp: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed: Option<u8>,
    pub course: Option<u16>,
    pub satellites: Option<u8>,
    pub gps_valid: Option<bool>,
    pub battery_percent: Option<u8>,
    pub ignition: Option<bool>,
    pub gsm_signal: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandOutcome {
    Sent,
    Acknowledged,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandEvent {
    pub imei: String,
    pub command_id: String,
    pub outcome: CommandOutcome,
    pub detail: Option<String>,
}

/// The gateway's only outbound dependency. Implementations must be cheap;
/// the caller invokes them from connection tasks.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_session(&self, event: DeviceSessionEvent);
    async fn publish_telemetry(&self, event: TelemetryEvent);
    async fn publish_command(&self, event: CommandEvent);
}

/// Publisher that writes events to the log. Used when the gateway runs
/// without a bus client attached.
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish_session(&self, event: DeviceSessionEvent) {
        info!(imei = %event.imei, kind = ?event.event_kind, "session event");
    }

    async fn publish_telemetry(&self, event: TelemetryEvent) {
        info!(
            imei = %event.imei,
            latitude = ?event.latitude,
            longitude = ?event.longitude,
            speed = ?event.speed,
            "telemetry event"
        );
    }

    async fn publish_command(&self, event: CommandEvent) {
        info!(
            imei = %event.imei,
            command_id = %event.command_id,
            outcome = ?event.outcome,
            "command event"
        );
    }
}

/// Publisher that buffers events in memory. Intended for tests and for
/// embedders that drain events themselves.
#[derive(Default)]
pub struct MemoryPublisher {
    sessions: parking_lot::Mutex<Vec<DeviceSessionEvent>>,
    telemetry: parking_lot::Mutex<Vec<TelemetryEvent>>,
    commands: parking_lot::Mutex<Vec<CommandEvent>>,
}

impl MemoryPublisher {
    pub fn new() -> MemoryPublisher {
        MemoryPublisher::default()
    }

    pub fn session_events(&self) -> Vec<DeviceSessionEvent> {
        self.sessions.lock().clone()
    }

    pub fn telemetry_events(&self) -> Vec<TelemetryEvent> {
        self.telemetry.lock().clone()
    }

    pub fn command_events(&self) -> Vec<CommandEvent> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish_session(&self, event: DeviceSessionEvent) {
        self.sessions.lock().push(event);
    }

    async fn publish_telemetry(&self, event: TelemetryEvent) {
        self.telemetry.lock().push(event);
    }

    async fn publish_command(&self, event: CommandEvent) {
        self.commands.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_to_json() {
        let event = DeviceSessionEvent::new("351011123456789", SessionEventKind::LoggedIn);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["imei"], "351011123456789");
        assert_eq!(json["event_kind"], "LoggedIn");

        let telemetry = TelemetryEvent {
            imei: "351011123456789".to_string(),
            latitude: Some(100.19315),
            ..TelemetryEvent::default()
        };
        let json = serde_json::to_value(&telemetry).unwrap();
        assert_eq!(json["latitude"], 100.19315);
        assert!(json["longitude"].is_null());
    }
}
