// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Outbound command pipeline
//!
//! Commands are tracked as [`PendingCommand`] records moving one way
//! through `Created -> Pending -> Sent -> Acknowledged | Failed |
//! Cancelled`. Responses are matched by IMEI plus an expected ASCII prefix,
//! oldest sent command first. Terminal records linger for an hour so the
//! admin surface can read their outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec;
use crate::error::{Error, Result};
use crate::publish::{CommandEvent, CommandOutcome, EventPublisher};
use crate::server::ConnectionTable;
use crate::session::SessionRegistry;

/// Terminal records are kept around this long for status queries.
const TERMINAL_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandStatus {
    Created,
    Pending,
    Sent,
    Acknowledged,
    Failed,
    Cancelled,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Acknowledged | CommandStatus::Failed | CommandStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CommandType {
    EngineCutOff,
    EngineRestore,
    Locate,
    Reset,
    StatusQuery,
    TimerConfig {
        acc_on_interval: u32,
        acc_off_interval: u32,
    },
    ServerConfig {
        host: String,
        port: u16,
    },
}

impl CommandType {
    /// ASCII wire form understood by the tracker firmware.
    pub fn wire_form(&self, password: Option<&str>) -> String {
        let pw = |p: Option<&str>| p.map(|p| format!(",{}", p)).unwrap_or_default();
        match self {
            CommandType::EngineCutOff => format!("DYD{}#", pw(password)),
            CommandType::EngineRestore => format!("HFYD{}#", pw(password)),
            CommandType::Locate => format!("DWXX{}#", pw(password)),
            CommandType::Reset => format!("RESET{}#", pw(password)),
            CommandType::StatusQuery => "STATUS#".to_string(),
            CommandType::TimerConfig {
                acc_on_interval,
                acc_off_interval,
            } => format!(
                "TIMER,{},{}{}#",
                acc_on_interval,
                acc_off_interval,
                pw(password)
            ),
            CommandType::ServerConfig { host, port } => {
                format!("SERVER,0,{},{},0{}#", host, port, pw(password))
            }
        }
    }

    /// Default response prefix used when the request does not override it.
    /// The status query reply is free-form, so it matches anything.
    pub fn response_prefix(&self) -> &'static str {
        match self {
            CommandType::EngineCutOff => "DYD",
            CommandType::EngineRestore => "HFYD",
            CommandType::Locate => "DWXX",
            CommandType::Reset => "RESET",
            CommandType::StatusQuery => "",
            CommandType::TimerConfig { .. } => "TIMER",
            CommandType::ServerConfig { .. } => "SERVER",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub imei: String,
    pub command_type: CommandType,
    pub password: Option<String>,
    pub server_flag: u32,
    pub english: bool,
    /// Overrides the command type's default response prefix.
    pub expected_response_prefix: Option<String>,
}

impl CommandRequest {
    pub fn new(imei: impl Into<String>, command_type: CommandType) -> CommandRequest {
        CommandRequest {
            imei: imei.into(),
            command_type,
            password: None,
            server_flag: 1,
            english: true,
            expected_response_prefix: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> CommandRequest {
        self.password = Some(password.into());
        self
    }

    pub fn with_server_flag(mut self, server_flag: u32) -> CommandRequest {
        self.server_flag = server_flag;
        self
    }

    pub fn in_chinese(mut self) -> CommandRequest {
        self.english = false;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingCommand {
    pub command_id: String,
    pub imei: String,
    pub command_type: CommandType,
    pub wire_form: String,
    pub expected_response_prefix: String,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub error_details: Option<String>,
    pub response: Option<String>,
}

/// Handle returned by [`CommandDispatcher::send`]. The receiver resolves
/// when the command reaches a terminal state.
pub struct CommandTicket {
    pub command_id: String,
    pub completion: oneshot::Receiver<PendingCommand>,
}

struct Entry {
    command: PendingCommand,
    seq: u64,
    completion: Option<oneshot::Sender<PendingCommand>>,
    terminal_at: Option<Instant>,
}

impl Entry {
    fn finish(&mut self, status: CommandStatus) {
        self.command.status = status;
        self.terminal_at = Some(Instant::now());
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(self.command.clone());
        }
    }
}

pub struct CommandDispatcher {
    registry: Arc<SessionRegistry>,
    connections: Arc<ConnectionTable>,
    publisher: Arc<dyn EventPublisher>,
    pending: DashMap<String, Entry>,
    by_imei: DashMap<String, Vec<String>>,
    seq: AtomicU64,
}

impl CommandDispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        connections: Arc<ConnectionTable>,
        publisher: Arc<dyn EventPublisher>,
    ) -> CommandDispatcher {
        CommandDispatcher {
            registry,
            connections,
            publisher,
            pending: DashMap::new(),
            by_imei: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Encodes and routes one command to the device's live connection.
    /// The returned ticket resolves once the device acknowledges, the
    /// channel dies, or the command is cancelled. A device without a live
    /// authenticated session fails the command immediately.
    pub async fn send(&self, request: CommandRequest) -> Result<CommandTicket> {
        let wire_form = request.command_type.wire_form(request.password.as_deref());
        let expected_response_prefix = request
            .expected_response_prefix
            .clone()
            .unwrap_or_else(|| request.command_type.response_prefix().to_string());

        let mut command = PendingCommand {
            command_id: Uuid::new_v4().to_string(),
            imei: request.imei.clone(),
            command_type: request.command_type.clone(),
            wire_form: wire_form.clone(),
            expected_response_prefix,
            status: CommandStatus::Created,
            created_at: Utc::now(),
            sent_at: None,
            acknowledged_at: None,
            cancelled_at: None,
            retry_count: 0,
            error_details: None,
            response: None,
        };

        let session = self.registry.by_imei(&request.imei);
        let sender = session
            .as_ref()
            .filter(|s| s.authenticated)
            .and_then(|s| self.connections.sender(s.connection));

        let sender = match sender {
            Some(sender) => sender,
            None => {
                command.error_details =
                    Some(Error::DeviceNotConnected(request.imei.clone()).to_string());
                return Ok(self.finish_immediately(command, CommandStatus::Failed).await);
            }
        };

        let bytes = codec::encode_command(
            &wire_form,
            request.server_flag,
            request.english,
            codec::next_serial(),
        )?;

        command.status = CommandStatus::Pending;
        if sender.send(bytes).await.is_err() {
            command.error_details = Some(Error::ChannelClosed.to_string());
            return Ok(self.finish_immediately(command, CommandStatus::Failed).await);
        }

        command.status = CommandStatus::Sent;
        command.sent_at = Some(Utc::now());
        debug!(imei = %command.imei, command_id = %command.command_id, wire = %wire_form, "command sent");
        self.publisher
            .publish_command(CommandEvent {
                imei: command.imei.clone(),
                command_id: command.command_id.clone(),
                outcome: CommandOutcome::Sent,
                detail: None,
            })
            .await;

        Ok(self.insert(command, None))
    }

    /// Stores a command that failed before reaching the wire and resolves
    /// its ticket right away.
    async fn finish_immediately(
        &self,
        command: PendingCommand,
        status: CommandStatus,
    ) -> CommandTicket {
        warn!(
            imei = %command.imei,
            command_id = %command.command_id,
            detail = ?command.error_details,
            "command failed before send"
        );
        self.publisher
            .publish_command(CommandEvent {
                imei: command.imei.clone(),
                command_id: command.command_id.clone(),
                outcome: CommandOutcome::Failed,
                detail: command.error_details.clone(),
            })
            .await;
        self.insert(command, Some(status))
    }

    fn insert(&self, command: PendingCommand, finish: Option<CommandStatus>) -> CommandTicket {
        let (tx, rx) = oneshot::channel();
        let command_id = command.command_id.clone();
        let imei = command.imei.clone();
        let mut entry = Entry {
            command,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            completion: Some(tx),
            terminal_at: None,
        };
        if let Some(status) = finish {
            entry.finish(status);
        }
        self.by_imei
            .entry(imei)
            .or_default()
            .push(command_id.clone());
        self.pending.insert(command_id.clone(), entry);
        CommandTicket {
            command_id,
            completion: rx,
        }
    }

    pub fn status(&self, command_id: &str) -> Option<PendingCommand> {
        self.pending.get(command_id).map(|e| e.command.clone())
    }

    /// Cancels a command that has not yet been written to the device.
    pub async fn cancel(&self, command_id: &str) -> Result<PendingCommand> {
        let cancelled = {
            let mut entry = self
                .pending
                .get_mut(command_id)
                .ok_or_else(|| Error::CannotCancel(command_id.to_string()))?;
            if !matches!(
                entry.command.status,
                CommandStatus::Created | CommandStatus::Pending
            ) {
                return Err(Error::CannotCancel(command_id.to_string()));
            }
            entry.command.cancelled_at = Some(Utc::now());
            // cancellation drops the completion future instead of firing it
            entry.completion = None;
            entry.finish(CommandStatus::Cancelled);
            entry.command.clone()
        };
        self.publisher
            .publish_command(CommandEvent {
                imei: cancelled.imei.clone(),
                command_id: cancelled.command_id.clone(),
                outcome: CommandOutcome::Cancelled,
                detail: None,
            })
            .await;
        Ok(cancelled)
    }

    /// Matches an inbound ASCII response against the oldest sent command
    /// for the device whose expected prefix starts the text.
    pub async fn match_response(&self, imei: &str, content: &str) -> Option<PendingCommand> {
        let candidate = {
            let ids = self.by_imei.get(imei)?;
            ids.iter()
                .filter_map(|id| self.pending.get(id))
                .filter(|e| e.command.status == CommandStatus::Sent)
                .filter(|e| content.starts_with(&e.command.expected_response_prefix))
                .min_by_key(|e| e.seq)
                .map(|e| e.command.command_id.clone())
        };
        let command_id = candidate?;

        let acknowledged = {
            let mut entry = self.pending.get_mut(&command_id)?;
            entry.command.response = Some(content.to_string());
            entry.command.acknowledged_at = Some(Utc::now());
            entry.finish(CommandStatus::Acknowledged);
            entry.command.clone()
        };
        debug!(imei, command_id = %acknowledged.command_id, "command acknowledged");
        self.publisher
            .publish_command(CommandEvent {
                imei: imei.to_string(),
                command_id: acknowledged.command_id.clone(),
                outcome: CommandOutcome::Acknowledged,
                detail: Some(content.to_string()),
            })
            .await;
        Some(acknowledged)
    }

    /// Fails every in-flight command for a device whose connection died.
    pub async fn fail_for_device(&self, imei: &str) {
        let failed: Vec<PendingCommand> = {
            let ids = match self.by_imei.get(imei) {
                Some(ids) => ids.clone(),
                None => return,
            };
            ids.iter()
                .filter_map(|id| {
                    let mut entry = self.pending.get_mut(id)?;
                    if entry.command.status.is_terminal() {
                        return None;
                    }
                    entry.command.error_details = Some(Error::ChannelClosed.to_string());
                    entry.finish(CommandStatus::Failed);
                    Some(entry.command.clone())
                })
                .collect()
        };
        for command in failed {
            self.publisher
                .publish_command(CommandEvent {
                    imei: imei.to_string(),
                    command_id: command.command_id,
                    outcome: CommandOutcome::Failed,
                    detail: Some(Error::ChannelClosed.to_string()),
                })
                .await;
        }
    }

    /// Drops terminal records past their retention window.
    pub fn cleanup(&self) {
        let expired: Vec<(String, String)> = self
            .pending
            .iter()
            .filter(|e| {
                e.terminal_at
                    .map(|at| at.elapsed() > TERMINAL_RETENTION)
                    .unwrap_or(false)
            })
            .map(|e| (e.command.command_id.clone(), e.command.imei.clone()))
            .collect();
        for (command_id, imei) in expired {
            self.pending.remove(&command_id);
            if let Some(mut ids) = self.by_imei.get_mut(&imei) {
                ids.retain(|id| id != &command_id);
            }
        }
        self.by_imei.retain(|_, ids| !ids.is_empty());
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::LogPublisher;
    use crate::session::SessionRegistry;
    use bytes::Bytes;
    use std::net::SocketAddr;
    use tokio::sync::mpsc;
    use tokio::time::advance;
    use tokio_util::sync::CancellationToken;

    const IMEI: &str = "351011123456789";

    fn addr() -> SocketAddr {
        "127.0.0.1:5023".parse().unwrap()
    }

    struct Fixture {
        dispatcher: CommandDispatcher,
        registry: Arc<SessionRegistry>,
        connections: Arc<ConnectionTable>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SessionRegistry::new(100, Duration::from_secs(1800)));
        let connections = Arc::new(ConnectionTable::new());
        let dispatcher = CommandDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&connections),
            Arc::new(LogPublisher),
        );
        Fixture {
            dispatcher,
            registry,
            connections,
        }
    }

    fn connect(fixture: &Fixture, handle: u64) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(16);
        fixture
            .connections
            .register(handle, tx, CancellationToken::new());
        fixture
            .registry
            .create_or_rebind(IMEI, handle, addr())
            .unwrap();
        rx
    }

    #[test]
    fn wire_forms() {
        assert_eq!(CommandType::EngineCutOff.wire_form(None), "DYD#");
        assert_eq!(
            CommandType::EngineCutOff.wire_form(Some("123456")),
            "DYD,123456#"
        );
        assert_eq!(CommandType::EngineRestore.wire_form(None), "HFYD#");
        assert_eq!(CommandType::Locate.wire_form(None), "DWXX#");
        assert_eq!(CommandType::Reset.wire_form(Some("0000")), "RESET,0000#");
        assert_eq!(CommandType::StatusQuery.wire_form(Some("ignored")), "STATUS#");
        assert_eq!(
            CommandType::TimerConfig {
                acc_on_interval: 30,
                acc_off_interval: 300
            }
            .wire_form(None),
            "TIMER,30,300#"
        );
        assert_eq!(
            CommandType::ServerConfig {
                host: "10.0.0.5".to_string(),
                port: 5023
            }
            .wire_form(Some("pw")),
            "SERVER,0,10.0.0.5,5023,0,pw#"
        );
    }

    #[tokio::test]
    async fn engine_cut_off_reaches_the_wire() {
        let fixture = fixture();
        let mut rx = connect(&fixture, 1);

        let ticket = fixture
            .dispatcher
            .send(CommandRequest::new(IMEI, CommandType::EngineCutOff))
            .await
            .unwrap();

        let status = fixture.dispatcher.status(&ticket.command_id).unwrap();
        assert_eq!(status.status, CommandStatus::Sent);
        assert!(status.sent_at.is_some());
        assert_eq!(status.wire_form, "DYD#");

        let bytes = rx.recv().await.expect("encoded frame");
        let ascii_at = 9;
        assert_eq!(&bytes[ascii_at..ascii_at + 4], b"DYD#");
        assert_eq!(&bytes[ascii_at + 4..ascii_at + 6], &[0x00, 0x02]); // english
    }

    #[tokio::test]
    async fn unknown_device_fails_immediately() {
        let fixture = fixture();
        let ticket = fixture
            .dispatcher
            .send(CommandRequest::new(IMEI, CommandType::Locate))
            .await
            .unwrap();
        let command = ticket.completion.await.unwrap();
        assert_eq!(command.status, CommandStatus::Failed);
        assert!(command.error_details.unwrap().contains("not connected"));
        assert_eq!(
            fixture.dispatcher.status(&ticket.command_id).unwrap().status,
            CommandStatus::Failed
        );
    }

    #[tokio::test]
    async fn closed_channel_fails_command() {
        let fixture = fixture();
        let rx = connect(&fixture, 1);
        drop(rx); // peer gone, queue receiver dropped

        let ticket = fixture
            .dispatcher
            .send(CommandRequest::new(IMEI, CommandType::EngineCutOff))
            .await
            .unwrap();
        let command = ticket.completion.await.unwrap();
        assert_eq!(command.status, CommandStatus::Failed);
        assert!(command.error_details.unwrap().contains("channel closed"));
    }

    #[tokio::test]
    async fn acknowledgment_matches_oldest_sent() {
        let fixture = fixture();
        let mut rx = connect(&fixture, 1);

        let first = fixture
            .dispatcher
            .send(CommandRequest::new(IMEI, CommandType::EngineCutOff))
            .await
            .unwrap();
        let second = fixture
            .dispatcher
            .send(CommandRequest::new(IMEI, CommandType::EngineCutOff))
            .await
            .unwrap();
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        let matched = fixture
            .dispatcher
            .match_response(IMEI, "DYD=Success!")
            .await
            .expect("match");
        assert_eq!(matched.command_id, first.command_id);
        assert_eq!(matched.response.as_deref(), Some("DYD=Success!"));

        let resolved = first.completion.await.unwrap();
        assert_eq!(resolved.status, CommandStatus::Acknowledged);
        assert!(resolved.acknowledged_at.is_some());

        // second command is still waiting
        assert_eq!(
            fixture.dispatcher.status(&second.command_id).unwrap().status,
            CommandStatus::Sent
        );
    }

    #[tokio::test]
    async fn response_with_wrong_prefix_is_ignored() {
        let fixture = fixture();
        let mut rx = connect(&fixture, 1);
        fixture
            .dispatcher
            .send(CommandRequest::new(IMEI, CommandType::EngineCutOff))
            .await
            .unwrap();
        rx.recv().await.unwrap();
        assert!(fixture
            .dispatcher
            .match_response(IMEI, "HFYD=Success!")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn cancel_only_before_send() {
        let fixture = fixture();
        let mut rx = connect(&fixture, 1);
        let ticket = fixture
            .dispatcher
            .send(CommandRequest::new(IMEI, CommandType::Reset))
            .await
            .unwrap();
        rx.recv().await.unwrap();
        match fixture.dispatcher.cancel(&ticket.command_id).await {
            Err(Error::CannotCancel(_)) => {}
            other => panic!("expected CannotCancel, got {:?}", other),
        }
        assert!(fixture.dispatcher.cancel("no-such-id").await.is_err());
    }

    #[tokio::test]
    async fn teardown_fails_in_flight_commands() {
        let fixture = fixture();
        let mut rx = connect(&fixture, 1);
        let ticket = fixture
            .dispatcher
            .send(CommandRequest::new(IMEI, CommandType::Locate))
            .await
            .unwrap();
        rx.recv().await.unwrap();

        fixture.dispatcher.fail_for_device(IMEI).await;
        let command = ticket.completion.await.unwrap();
        assert_eq!(command.status, CommandStatus::Failed);

        // already-terminal commands are left alone
        fixture.dispatcher.fail_for_device(IMEI).await;
        assert_eq!(
            fixture.dispatcher.status(&ticket.command_id).unwrap().status,
            CommandStatus::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_records_expire_after_retention() {
        let fixture = fixture();
        let ticket = fixture
            .dispatcher
            .send(CommandRequest::new(IMEI, CommandType::Locate))
            .await
            .unwrap();
        ticket.completion.await.unwrap(); // failed, device not connected
        assert_eq!(fixture.dispatcher.pending_count(), 1);

        fixture.dispatcher.cleanup();
        assert_eq!(fixture.dispatcher.pending_count(), 1);

        advance(Duration::from_secs(3601)).await;
        fixture.dispatcher.cleanup();
        assert_eq!(fixture.dispatcher.pending_count(), 0);
    }
}
