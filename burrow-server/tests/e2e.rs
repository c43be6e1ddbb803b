//! End-to-end tests: a real server, a poll-driven client, and raw sockets.

use burrow_client::{ClientConfig, ClientError, ConnectionState, NetClient, RecordingClient, SystemClient};
use burrow_protocol::tunnel::request_head;
use burrow_protocol::{Id, SequentialIdGenerator, WireBuffer};
use burrow_server::{EchoSystem, Server, ServerConfig, System, SystemRegistry};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;

const ECHO_PAYLOAD: [u8; 12] = [1, 0, 0, 0, 0, 0, 0, 0, 3, 4, 5, 6];

async fn start_server(echo: Arc<EchoSystem>) -> (Arc<Server>, SocketAddr) {
    let registry = SystemRegistry::new([echo as Arc<dyn System>]).unwrap();
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap())
        .with_id_generator(Arc::new(SequentialIdGenerator::new(42)));
    let server = Arc::new(Server::new(config, registry));
    let listener = server.bind().unwrap();
    let addr = listener.local_addr().unwrap();

    let running = server.clone();
    tokio::spawn(async move { running.serve(listener).await });
    (server, addr)
}

fn client_for(addr: SocketAddr, system_number: u32) -> (NetClient, Arc<RecordingClient>) {
    let recording = Arc::new(RecordingClient::new(system_number));
    let config = ClientConfig::new(addr)
        .with_session_id(Id::new(7, 7))
        .with_caller_id(Id::new(8, 8));
    let client = NetClient::new(
        config,
        [recording.clone() as Arc<dyn SystemClient>],
        Handle::current(),
    )
    .unwrap();
    (client, recording)
}

#[tokio::test]
async fn test_echo_round_trip() {
    let echo = Arc::new(EchoSystem::default());
    let (server, addr) = start_server(echo.clone()).await;
    let (mut client, recording) = client_for(addr, 1);

    client.schedule_send(
        1,
        1,
        Box::new(|buf: &mut WireBuffer| buf.write_bytes(&ECHO_PAYLOAD)),
    );
    client
        .pump_until_response(Duration::from_millis(2), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(recording.accepted(), vec![(1, Id::new(42, 1))]);
    assert_eq!(recording.last_update().unwrap().as_ref(), &ECHO_PAYLOAD[..]);
    assert_eq!(echo.commands_processed(), 1);
    assert_eq!(echo.last_command_instance_id(), Id::new(42, 1));

    // A second batch on the same connection.
    client.schedule_send(1, 2, Box::new(|buf: &mut WireBuffer| buf.write_u32(99)));
    client
        .pump_until_response(Duration::from_millis(2), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(client.stats().connects, 1);
    assert_eq!(recording.accepted().len(), 2);
    assert_eq!(
        recording.last_update().unwrap().as_ref(),
        &99u32.to_le_bytes()[..]
    );
    assert_eq!(server.stats().requests_total.load(Ordering::Relaxed), 2);

    server.shutdown();
}

#[tokio::test]
async fn test_empty_batch_fetches_state() {
    let echo = Arc::new(EchoSystem::default());
    let (server, addr) = start_server(echo.clone()).await;

    let (mut writer, _) = client_for(addr, 1);
    writer.schedule_send(1, 1, Box::new(|buf: &mut WireBuffer| buf.write_u32(5)));
    writer
        .pump_until_response(Duration::from_millis(2), Duration::from_secs(5))
        .await
        .unwrap();

    let (mut reader, recording) = client_for(addr, 1);
    reader.request_state();
    reader
        .pump_until_response(Duration::from_millis(2), Duration::from_secs(5))
        .await
        .unwrap();

    assert!(recording.accepted().is_empty());
    assert_eq!(
        recording.last_update().unwrap().as_ref(),
        &5u32.to_le_bytes()[..]
    );
    assert_eq!(echo.commands_processed(), 1);

    server.shutdown();
}

#[tokio::test]
async fn test_unknown_system_rejected() {
    let echo = Arc::new(EchoSystem::default());
    let (server, addr) = start_server(echo.clone()).await;
    let (mut client, recording) = client_for(addr, 7);

    client.schedule_send(7, 1, Box::new(|buf: &mut WireBuffer| buf.write_u32(1)));

    let mut rejected = false;
    for _ in 0..2500 {
        match client.pump() {
            Ok(()) => {}
            Err(ClientError::BadRequest) => {
                rejected = true;
                break;
            }
            Err(e) => panic!("unexpected error: {}", e),
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    assert!(rejected);
    assert_eq!(client.connection_state(), ConnectionState::Unconnected);
    assert!(recording.accepted().is_empty());
    assert_eq!(echo.commands_processed(), 0);
    assert_eq!(server.stats().requests_rejected.load(Ordering::Relaxed), 1);

    server.shutdown();
}

#[tokio::test]
async fn test_short_content_closes_silently() {
    let echo = Arc::new(EchoSystem::default());
    let (server, addr) = start_server(echo.clone()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let body = [0u8; 10];
    let mut request = request_head("localhost", body.len()).into_bytes();
    request.extend_from_slice(&body);
    stream.write_all(&request).await.unwrap();

    // The server may close before reading the body, which surfaces as a reset.
    let mut out = Vec::new();
    let result = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .unwrap();
    match result {
        Ok(_) => assert!(out.is_empty()),
        Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
    }
    assert_eq!(echo.commands_processed(), 0);

    server.shutdown();
}

#[tokio::test]
async fn test_shutdown_closes_open_connections() {
    let echo = Arc::new(EchoSystem::default());
    let (server, addr) = start_server(echo).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    server.shutdown();

    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
        .await
        .unwrap()
        .unwrap();
    assert!(out.is_empty());
}
