// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Per-connection protocol state machine
//!
//! `Connected -> Authenticated -> Active -> Closed`. Login is the only
//! transition out of `Connected`; everything else before login is
//! acknowledged and dropped. Transient decode errors never close a
//! connection, only I/O errors and capacity rejection do.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec::{encode_ack, encode_login_ack, Frame};
use crate::command::CommandDispatcher;
use crate::error::Error;
use crate::message::{self, DeviceFamily, Imei, Location, Message, Status};
use crate::publish::{
    DeviceSessionEvent, EventPublisher, SessionEventKind, TelemetryEvent,
};
use crate::session::{ConnectionHandle, SessionRegistry, StatusUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Authenticated,
    Active,
    Closed,
}

/// What the connection task should do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerAction {
    Continue,
    Close,
}

/// Mutable per-connection state. Owned by the connection task, never
/// shared.
pub struct ConnectionContext {
    pub handle: ConnectionHandle,
    pub remote: SocketAddr,
    pub state: ConnectionState,
    pub session_id: Option<String>,
    pub imei: Option<Imei>,
    pub family: DeviceFamily,
    pub decode_errors: u64,
}

impl ConnectionContext {
    pub fn new(handle: ConnectionHandle, remote: SocketAddr) -> ConnectionContext {
        ConnectionContext {
            handle,
            remote,
            state: ConnectionState::Connected,
            session_id: None,
            imei: None,
            family: DeviceFamily::Unknown,
            decode_errors: 0,
        }
    }

    fn authenticated(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Authenticated | ConnectionState::Active
        )
    }
}

/// Dispatches decoded messages to the registry, the command pipeline and
/// the bus publisher. Shared by all connection tasks.
pub struct MessageHandler {
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    publisher: Arc<dyn EventPublisher>,
}

impl MessageHandler {
    pub fn new(
        registry: Arc<SessionRegistry>,
        dispatcher: Arc<CommandDispatcher>,
        publisher: Arc<dyn EventPublisher>,
    ) -> MessageHandler {
        MessageHandler {
            registry,
            dispatcher,
            publisher,
        }
    }

    pub async fn handle_frame(
        &self,
        ctx: &mut ConnectionContext,
        frame: Frame,
        out: &mpsc::Sender<Bytes>,
    ) -> HandlerAction {
        if frame.protocol == crate::constant::MSG_LOGIN {
            return self.handle_login(ctx, &frame, out).await;
        }

        if !ctx.authenticated() {
            warn!(
                handle = ctx.handle,
                remote = %ctx.remote,
                protocol = format_args!("{:#04x}", frame.protocol),
                "message before login, dropping payload"
            );
            return self.ack(ctx, &frame, out).await;
        }

        let message = match message::decode(&frame, ctx.family) {
            Ok(message) => message,
            Err(e) => {
                ctx.decode_errors += 1;
                warn!(
                    handle = ctx.handle,
                    protocol = format_args!("{:#04x}", frame.protocol),
                    error = %e,
                    "payload decode failed"
                );
                // decode errors are transient, the device still expects its ack
                return self.ack(ctx, &frame, out).await;
            }
        };

        let imei = match ctx.imei.clone() {
            Some(imei) => imei,
            None => return HandlerAction::Close,
        };

        match message {
            Message::Login(_) => unreachable!("login handled above"),
            Message::Location(location) => {
                self.on_location(&imei, &location).await;
                ctx.state = ConnectionState::Active;
            }
            Message::Status(status) | Message::Heartbeat(status) => {
                self.on_status(&imei, &status).await;
                ctx.state = ConnectionState::Active;
            }
            Message::Alarm(alarm) => {
                if let Some(status) = &alarm.status {
                    self.on_status(&imei, status).await;
                }
                if let Some(location) = &alarm.location {
                    self.on_location(&imei, location).await;
                }
                if alarm.status.is_none() && alarm.location.is_none() {
                    self.registry.touch(imei.as_str());
                }
                info!(imei = %imei, kind = ?alarm.kind, "alarm");
                ctx.state = ConnectionState::Active;
            }
            Message::CommandResponse(response) => {
                self.registry.touch(imei.as_str());
                self.dispatcher
                    .match_response(imei.as_str(), &response.content)
                    .await;
            }
            Message::LbsCell(_)
            | Message::Wifi(_)
            | Message::AddressRequest(_)
            | Message::AddressResponse(_)
            | Message::Info(_) => {
                self.registry.touch(imei.as_str());
            }
            Message::Unknown { protocol, payload } => {
                debug!(
                    imei = %imei,
                    protocol = format_args!("{:#04x}", protocol),
                    payload = %hex(&payload),
                    "unknown protocol"
                );
                self.registry.touch(imei.as_str());
            }
        }

        self.ack(ctx, &frame, out).await
    }

    async fn handle_login(
        &self,
        ctx: &mut ConnectionContext,
        frame: &Frame,
        out: &mpsc::Sender<Bytes>,
    ) -> HandlerAction {
        let login = match message::decode(frame, ctx.family) {
            Ok(Message::Login(login)) => login,
            Ok(_) | Err(_) => {
                warn!(
                    handle = ctx.handle,
                    remote = %ctx.remote,
                    "malformed login, closing"
                );
                return HandlerAction::Close;
            }
        };

        let session = match self.registry.create_or_rebind(
            login.imei.as_str(),
            ctx.handle,
            ctx.remote,
        ) {
            Ok(session) => session,
            Err(Error::Capacity(limit)) => {
                warn!(
                    imei = %login.imei,
                    limit,
                    "session capacity exceeded, refusing login"
                );
                return HandlerAction::Close;
            }
            Err(e) => {
                warn!(imei = %login.imei, error = %e, "login failed");
                return HandlerAction::Close;
            }
        };

        if let Some(device_type) = login.device_type {
            let variant = format!("GT06-{:04X}", device_type);
            self.registry
                .set_device_variant(login.imei.as_str(), &variant);
            ctx.family = DeviceFamily::from_variant_tag(&variant);
        }

        ctx.state = ConnectionState::Authenticated;
        ctx.session_id = Some(session.session_id.clone());
        ctx.imei = Some(login.imei.clone());

        info!(
            imei = %login.imei,
            session_id = %session.session_id,
            remote = %ctx.remote,
            "device logged in"
        );

        if out.send(encode_login_ack(frame.serial)).await.is_err() {
            return HandlerAction::Close;
        }
        self.publisher
            .publish_session(DeviceSessionEvent::new(
                login.imei.as_str(),
                SessionEventKind::LoggedIn,
            ))
            .await;
        HandlerAction::Continue
    }

    async fn on_location(&self, imei: &Imei, location: &Location) {
        if location.gps_valid {
            self.registry.update_position(
                imei.as_str(),
                location.latitude,
                location.longitude,
                location.timestamp,
            );
        } else {
            self.registry.touch(imei.as_str());
        }
        if let Some(ignition) = location.ignition {
            self.registry.update_status(
                imei.as_str(),
                StatusUpdate {
                    ignition: Some(ignition),
                    ..StatusUpdate::default()
                },
            );
        }
        self.publisher
            .publish_telemetry(TelemetryEvent {
                imei: imei.as_str().to_string(),
                timestamp: location.timestamp,
                latitude: location.gps_valid.then(|| location.latitude),
                longitude: location.gps_valid.then(|| location.longitude),
                speed: Some(location.speed),
                course: Some(location.course),
                satellites: Some(location.satellites),
                gps_valid: Some(location.gps_valid),
                battery_percent: None,
                ignition: location.ignition,
                gsm_signal: None,
            })
            .await;
    }

    async fn on_status(&self, imei: &Imei, status: &Status) {
        self.registry.update_status(
            imei.as_str(),
            StatusUpdate {
                battery_percent: Some(status.battery_percent),
                charging: Some(status.charging),
                ignition: Some(status.ignition),
                gsm_signal: Some(status.gsm_level),
            },
        );
        self.publisher
            .publish_telemetry(TelemetryEvent {
                imei: imei.as_str().to_string(),
                timestamp: Utc::now(),
                latitude: None,
                longitude: None,
                speed: None,
                course: None,
                satellites: None,
                gps_valid: None,
                battery_percent: Some(status.battery_percent),
                ignition: Some(status.ignition),
                gsm_signal: Some(status.gsm_level),
            })
            .await;
    }

    async fn ack(
        &self,
        ctx: &ConnectionContext,
        frame: &Frame,
        out: &mpsc::Sender<Bytes>,
    ) -> HandlerAction {
        if out
            .send(encode_ack(frame.protocol, frame.serial))
            .await
            .is_err()
        {
            debug!(handle = ctx.handle, "write queue closed");
            return HandlerAction::Close;
        }
        HandlerAction::Continue
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
