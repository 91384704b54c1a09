// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! TCP listener and connection manager
//!
//! One accept task, one task per connection, one periodic sweep task.
//! A connection task exclusively owns its socket, codec state and context;
//! outbound frames from other tasks travel through the per-connection
//! write queue and are serialized onto the socket by the owning task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{interval, sleep_until, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{CodecStats, Gt06Codec};
use crate::command::CommandDispatcher;
use crate::config::Config;
use crate::error::Result;
use crate::handler::{ConnectionContext, HandlerAction, MessageHandler};
use crate::publish::{DeviceSessionEvent, EventPublisher, SessionEventKind};
use crate::session::{ConnectionHandle, SessionRegistry};

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_QUEUE_DEPTH: usize = 64;
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

struct ConnectionEntry {
    sender: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

/// Live connections, keyed by the opaque handle stored in sessions.
/// The command dispatcher resolves write queues through this table.
#[derive(Default)]
pub struct ConnectionTable {
    entries: DashMap<ConnectionHandle, ConnectionEntry>,
}

impl ConnectionTable {
    pub fn new() -> ConnectionTable {
        ConnectionTable::default()
    }

    pub fn register(
        &self,
        handle: ConnectionHandle,
        sender: mpsc::Sender<Bytes>,
        cancel: CancellationToken,
    ) {
        self.entries.insert(handle, ConnectionEntry { sender, cancel });
    }

    pub fn unregister(&self, handle: ConnectionHandle) {
        self.entries.remove(&handle);
    }

    pub fn sender(&self, handle: ConnectionHandle) -> Option<mpsc::Sender<Bytes>> {
        self.entries.get(&handle).map(|e| e.sender.clone())
    }

    /// Signals the owning task to shut the connection down.
    pub fn close(&self, handle: ConnectionHandle) {
        if let Some(entry) = self.entries.get(&handle) {
            entry.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct GatewayServer {
    config: Config,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    connections: Arc<ConnectionTable>,
    handler: MessageHandler,
    publisher: Arc<dyn EventPublisher>,
    shutdown: CancellationToken,
    next_handle: AtomicU64,
}

impl GatewayServer {
    pub fn new(config: Config, publisher: Arc<dyn EventPublisher>) -> Arc<GatewayServer> {
        let registry = Arc::new(SessionRegistry::new(
            config.max_sessions,
            config.session_idle_timeout(),
        ));
        let connections = Arc::new(ConnectionTable::new());
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&connections),
            Arc::clone(&publisher),
        ));
        let handler = MessageHandler::new(
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            Arc::clone(&publisher),
        );
        Arc::new(GatewayServer {
            config,
            registry,
            dispatcher,
            connections,
            handler,
            publisher,
            shutdown: CancellationToken::new(),
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn connections(&self) -> &Arc<ConnectionTable> {
        &self.connections
    }

    /// Stops accepting, closes connections and lets `serve` return.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Binds the accept socket. A failure here maps to exit code 2.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.listen_port)).await?;
        info!(
            port = self.config.listen_port,
            protocol = %self.config.default_protocol,
            "gateway listening"
        );
        Ok(listener)
    }

    /// Accept loop. Returns after [`GatewayServer::shutdown`].
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let sweeper = Arc::clone(&self).spawn_sweeper();
        // the configured backlog bounds concurrent connections
        let limiter = Arc::new(Semaphore::new(self.config.backlog));

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let permit = match Arc::clone(&limiter).try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(%peer, "connection limit reached, refusing");
                            drop(stream);
                            continue;
                        }
                    };
                    let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.run_connection(handle, stream, peer).await;
                        drop(permit);
                    });
                }
            }
        }

        info!("listener stopped, draining connections");
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while !self.connections.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        sweeper.abort();
        info!("gateway stopped");
        Ok(())
    }

    fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let server = self;
        tokio::spawn(async move {
            let mut ticker = interval(SWEEP_INTERVAL);
            ticker.tick().await; // the immediate first tick
            loop {
                tokio::select! {
                    _ = server.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        evict_idle_sessions(
                            &server.registry,
                            &server.connections,
                            &server.dispatcher,
                            server.publisher.as_ref(),
                        )
                        .await;
                        server.dispatcher.cleanup();
                    }
                }
            }
        })
    }

    async fn run_connection(
        &self,
        handle: ConnectionHandle,
        stream: TcpStream,
        peer: std::net::SocketAddr,
    ) {
        if let Err(e) = configure_socket(&stream) {
            debug!(handle, error = %e, "socket options not applied");
        }
        let mut framed = Framed::new(stream, Gt06Codec::new());
        let (tx, mut rx) = mpsc::channel::<Bytes>(WRITE_QUEUE_DEPTH);
        let cancel = self.shutdown.child_token();
        self.connections.register(handle, tx.clone(), cancel.clone());

        let mut ctx = ConnectionContext::new(handle, peer);
        let idle = self.config.idle_timeout();
        let mut deadline = Instant::now() + idle;
        debug!(handle, %peer, "connection accepted");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_until(deadline) => {
                    info!(handle, %peer, "idle timeout");
                    break;
                }
                outbound = rx.recv() => {
                    let bytes = match outbound {
                        Some(bytes) => bytes,
                        None => break,
                    };
                    deadline = Instant::now() + idle;
                    if let Err(e) = framed.send(bytes).await {
                        warn!(handle, error = %e, "write failed");
                        break;
                    }
                }
                inbound = framed.next() => {
                    match inbound {
                        Some(Ok(frame)) => {
                            deadline = Instant::now() + idle;
                            match self.handler.handle_frame(&mut ctx, frame, &tx).await {
                                HandlerAction::Continue => {}
                                HandlerAction::Close => break,
                            }
                        }
                        Some(Err(e)) => {
                            warn!(handle, error = %e, "read failed");
                            break;
                        }
                        None => {
                            debug!(handle, "peer closed");
                            break;
                        }
                    }
                }
            }
        }

        // flush whatever the queue still holds, bounded
        rx.close();
        let drain_deadline = Instant::now() + DRAIN_TIMEOUT;
        while let Ok(bytes) = rx.try_recv() {
            if Instant::now() >= drain_deadline {
                break;
            }
            if tokio::time::timeout_at(drain_deadline, framed.send(bytes))
                .await
                .is_err()
            {
                break;
            }
        }

        let stats = framed.codec().stats();
        self.teardown(handle, stats).await;
    }

    async fn teardown(&self, handle: ConnectionHandle, stats: CodecStats) {
        self.connections.unregister(handle);
        if let Some(session) = self.registry.remove_by_connection(handle) {
            self.dispatcher.fail_for_device(&session.imei).await;
            self.publisher
                .publish_session(DeviceSessionEvent::new(
                    session.imei.as_str(),
                    SessionEventKind::Disconnected,
                ))
                .await;
            info!(imei = %session.imei, handle, "device disconnected");
        }
        debug!(
            handle,
            frames = stats.frames,
            resyncs = stats.resyncs,
            crc_failures = stats.crc_failures,
            "connection closed"
        );
    }
}

/// One eviction pass: removes idle sessions, closes their connections,
/// fails their in-flight commands and publishes the disconnects.
pub async fn evict_idle_sessions(
    registry: &SessionRegistry,
    connections: &ConnectionTable,
    dispatcher: &CommandDispatcher,
    publisher: &dyn EventPublisher,
) -> usize {
    let removed = registry.evict_idle();
    let count = removed.len();
    for session in removed {
        connections.close(session.connection);
        dispatcher.fail_for_device(&session.imei).await;
        publisher
            .publish_session(DeviceSessionEvent::new(
                session.imei.as_str(),
                SessionEventKind::Disconnected,
            ))
            .await;
        info!(
            imei = %session.imei,
            idle_for = ?session.idle_for(),
            "session evicted"
        );
    }
    count
}

fn configure_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let socket = SockRef::from(stream);
    socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_TIME))?;
    Ok(())
}
