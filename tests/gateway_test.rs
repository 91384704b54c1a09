use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use gt06::command::{CommandRequest, CommandStatus, CommandType};
use gt06::config::Config;
use gt06::crc;
use gt06::message::Imei;
use gt06::publish::{
    CommandOutcome, EventPublisher, MemoryPublisher, SessionEventKind,
};
use gt06::server::{evict_idle_sessions, ConnectionTable, GatewayServer};
use gt06::session::SessionRegistry;

const IMEI: &str = "351011123456789";

fn build_frame(protocol: u8, payload: &[u8], serial: u16) -> Vec<u8> {
    let declared = 1 + payload.len() + 2 + 2;
    let mut body = Vec::with_capacity(declared + 1);
    body.push(declared as u8);
    body.push(protocol);
    body.extend_from_slice(payload);
    body.extend_from_slice(&serial.to_be_bytes());
    let checksum = crc::checksum(&body);

    let mut frame = vec![0x78, 0x78];
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&checksum.to_be_bytes());
    frame.extend_from_slice(&[0x0D, 0x0A]);
    frame
}

fn location_payload() -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&[24, 10, 15, 8, 30, 45]); // 2024-10-15 08:30:45
    p.push(0x0C); // 12 satellites
    p.extend_from_slice(&0x0AC5_B320u32.to_be_bytes());
    p.extend_from_slice(&0x12C6_1080u32.to_be_bytes());
    p.push(0x30); // 48 km/h
    p.extend_from_slice(&0x1800u16.to_be_bytes()); // fixed, north-east, course 0
    p
}

async fn start(
    config: Config,
) -> (Arc<GatewayServer>, Arc<MemoryPublisher>, std::net::SocketAddr) {
    let publisher = Arc::new(MemoryPublisher::new());
    let server = GatewayServer::new(config, Arc::clone(&publisher) as Arc<dyn EventPublisher>);
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Arc::clone(&server).serve(listener));
    (server, publisher, addr)
}

async fn login(addr: std::net::SocketAddr, imei: &str, serial: u16) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let imei = Imei::parse(imei).unwrap();
    stream
        .write_all(&build_frame(0x01, &imei.to_bcd(), serial))
        .await
        .unwrap();
    let mut ack = [0u8; 10];
    stream.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack[2..4], [0x05, 0x01]);
    stream
}

#[tokio::test]
async fn login_creates_session_and_acks_bit_exact() {
    let (server, publisher, addr) = start(Config::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let imei = Imei::parse(IMEI).unwrap();
    stream
        .write_all(&build_frame(0x01, &imei.to_bcd(), 1))
        .await
        .unwrap();

    let mut ack = [0u8; 10];
    stream.read_exact(&mut ack).await.unwrap();
    assert_eq!(
        ack,
        [0x78, 0x78, 0x05, 0x01, 0x00, 0x01, 0xD9, 0xDC, 0x0D, 0x0A]
    );

    let session = server.registry().by_imei(IMEI).expect("session");
    assert_eq!(session.imei, IMEI);
    assert!(session.authenticated);

    let events = publisher.session_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_kind, SessionEventKind::LoggedIn);
    assert_eq!(events[0].imei, IMEI);

    server.shutdown();
}

#[tokio::test]
async fn location_publishes_telemetry_and_acks() {
    let (server, publisher, addr) = start(Config::default()).await;
    let mut stream = login(addr, IMEI, 1).await;

    stream
        .write_all(&build_frame(0x12, &location_payload(), 0x0002))
        .await
        .unwrap();

    let mut ack = [0u8; 10];
    stream.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack[3], 0x12); // echoed protocol
    assert_eq!(ack[4..6], [0x00, 0x02]); // echoed serial

    let telemetry = publisher.telemetry_events();
    assert_eq!(telemetry.len(), 1);
    let event = &telemetry[0];
    assert_eq!(event.imei, IMEI);
    assert!((event.latitude.unwrap() - 100.19315).abs() < 1e-4);
    assert!((event.longitude.unwrap() - 175.05628).abs() < 1e-4);
    assert_eq!(event.speed, Some(48));
    assert_eq!(event.course, Some(0));
    assert_eq!(event.satellites, Some(12));
    assert_eq!(event.gps_valid, Some(true));

    let session = server.registry().by_imei(IMEI).unwrap();
    assert!((session.last_latitude.unwrap() - 100.19315).abs() < 1e-4);

    server.shutdown();
}

#[tokio::test(start_paused = true)]
async fn idle_session_is_evicted_and_disconnect_published() {
    let registry = SessionRegistry::new(100, Duration::from_secs(1800));
    let connections = ConnectionTable::new();
    let publisher = MemoryPublisher::new();
    let dispatcher = gt06::command::CommandDispatcher::new(
        Arc::new(SessionRegistry::new(100, Duration::from_secs(1800))),
        Arc::new(ConnectionTable::new()),
        Arc::new(MemoryPublisher::new()),
    );

    registry
        .create_or_rebind(IMEI, 1, "127.0.0.1:9000".parse().unwrap())
        .unwrap();

    tokio::time::advance(Duration::from_secs(1801)).await;
    let evicted = evict_idle_sessions(&registry, &connections, &dispatcher, &publisher).await;
    assert_eq!(evicted, 1);
    assert!(registry.by_imei(IMEI).is_none());

    let events = publisher.session_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_kind, SessionEventKind::Disconnected);
}

#[tokio::test]
async fn engine_cut_off_round_trip() {
    let (server, publisher, addr) = start(Config::default()).await;
    let mut stream = login(addr, IMEI, 1).await;

    let ticket = server
        .dispatcher()
        .send(CommandRequest::new(IMEI, CommandType::EngineCutOff))
        .await
        .unwrap();

    // scenario 4: the device sees DYD#, english, per the 0x80 layout
    let mut wire = [0u8; 21];
    stream.read_exact(&mut wire).await.unwrap();
    assert_eq!(wire[..2], [0x78, 0x78]);
    assert_eq!(wire[3], 0x80);
    assert_eq!(&wire[9..13], b"DYD#");
    assert_eq!(wire[13..15], [0x00, 0x02]);

    let status = server.dispatcher().status(&ticket.command_id).unwrap();
    assert_eq!(status.status, CommandStatus::Sent);
    assert_eq!(status.wire_form, "DYD#");

    // scenario 5: the device acknowledges over protocol 0x21
    let mut payload = vec![0x00, 0x00, 0x00, 0x01];
    payload.extend_from_slice(b"DYD=Success!");
    payload.extend_from_slice(&[0x00, 0x02]);
    stream
        .write_all(&build_frame(0x21, &payload, 3))
        .await
        .unwrap();

    let resolved = tokio::time::timeout(Duration::from_secs(5), ticket.completion)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resolved.status, CommandStatus::Acknowledged);
    assert_eq!(resolved.response.as_deref(), Some("DYD=Success!"));

    let outcomes: Vec<CommandOutcome> = publisher
        .command_events()
        .iter()
        .map(|e| e.outcome)
        .collect();
    assert_eq!(
        outcomes,
        vec![CommandOutcome::Sent, CommandOutcome::Acknowledged]
    );

    server.shutdown();
}

#[tokio::test]
async fn command_to_unknown_device_fails() {
    let (server, _publisher, _addr) = start(Config::default()).await;

    let ticket = server
        .dispatcher()
        .send(CommandRequest::new(IMEI, CommandType::Locate))
        .await
        .unwrap();
    let resolved = ticket.completion.await.unwrap();
    assert_eq!(resolved.status, CommandStatus::Failed);

    server.shutdown();
}

#[tokio::test]
async fn third_login_is_refused_at_capacity() {
    let mut config = Config::default();
    config.max_sessions = 2;
    let (server, publisher, addr) = start(config).await;

    let _first = login(addr, "351011123456780", 1).await;
    let _second = login(addr, "351011123456781", 1).await;

    // scenario 6: the third distinct device is refused without an ack
    let mut third = TcpStream::connect(addr).await.unwrap();
    let imei = Imei::parse(IMEI).unwrap();
    third
        .write_all(&build_frame(0x01, &imei.to_bcd(), 1))
        .await
        .unwrap();

    let mut buf = [0u8; 10];
    let read = tokio::time::timeout(Duration::from_secs(5), third.read(&mut buf))
        .await
        .expect("connection should close, not hang")
        .unwrap();
    assert_eq!(read, 0, "refused login must close without an ack");

    assert!(server.registry().by_imei(IMEI).is_none());
    assert_eq!(server.registry().count(), 2);
    let session_events = publisher.session_events();
    let logged_in: Vec<&str> = session_events
        .iter()
        .filter(|e| e.event_kind == SessionEventKind::LoggedIn)
        .map(|e| e.imei.as_str())
        .collect();
    assert!(!logged_in.contains(&IMEI));

    server.shutdown();
}

#[tokio::test]
async fn reconnect_rebinds_the_session() {
    let (server, _publisher, addr) = start(Config::default()).await;

    let first = login(addr, IMEI, 1).await;
    let session_before = server.registry().by_imei(IMEI).unwrap();

    let _second = login(addr, IMEI, 2).await;
    let session_after = server.registry().by_imei(IMEI).unwrap();
    assert_eq!(session_before.session_id, session_after.session_id);
    assert_ne!(session_before.connection, session_after.connection);

    // the stale connection's teardown must not remove the rebound session
    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.registry().by_imei(IMEI).is_some());
    assert_eq!(server.registry().count(), 1);

    server.shutdown();
}

#[tokio::test]
async fn junk_bytes_then_valid_frame_still_logs_in() {
    let (server, _publisher, addr) = start(Config::default()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let imei = Imei::parse(IMEI).unwrap();
    let mut bytes = vec![0x00, 0xFF, 0x13, 0x78, 0x42];
    bytes.extend_from_slice(&build_frame(0x01, &imei.to_bcd(), 1));
    stream.write_all(&bytes).await.unwrap();

    let mut ack = [0u8; 10];
    stream.read_exact(&mut ack).await.unwrap();
    assert_eq!(ack[3], 0x01);
    assert!(server.registry().by_imei(IMEI).is_some());

    server.shutdown();
}
