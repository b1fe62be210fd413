//! Integration tests for the control channel.
//!
//! A real server and client talk over a Unix socket in a temporary
//! directory.

use std::sync::Arc;
use std::time::Duration;

use keyrecorder_core::ipc::{
    IpcClient, IpcMessage, IpcServer, MessageType, RecentRequest, StatusResponse,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// =============================================================================
// Test Helpers
// =============================================================================

const TIMEOUT: Duration = Duration::from_secs(2);

fn start_server(dir: &TempDir) -> (Arc<IpcServer>, mpsc::Receiver<IpcMessage>) {
    let (tx, rx) = mpsc::channel(16);
    let server = Arc::new(IpcServer::new(dir.path().join("control.sock"), tx));
    server.start().unwrap();
    (server, rx)
}

/// Answers every `GetStatus` with a fixed status and forwards everything
/// else to the returned channel.
fn spawn_status_responder(
    server: Arc<IpcServer>,
    mut inbound: mpsc::Receiver<IpcMessage>,
) -> (JoinHandle<()>, mpsc::UnboundedReceiver<IpcMessage>) {
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            if message.message_type == MessageType::GetStatus {
                let status = StatusResponse {
                    is_recording: true,
                    total_event_count: 7,
                    last_sync_time: None,
                    last_snapshot_time: None,
                };
                let response =
                    IpcMessage::with_payload(MessageType::GetStatusResponse, &status).unwrap();
                server.send_response(&response).await;
            } else {
                let _ = seen_tx.send(message);
            }
        }
    });
    (handle, seen_rx)
}

async fn connected_client(dir: &TempDir) -> IpcClient {
    let mut client = IpcClient::new(dir.path().join("control.sock"));
    assert!(client.connect(TIMEOUT).await);
    client
}

// =============================================================================
// Round Trips
// =============================================================================

#[tokio::test]
async fn test_status_request_round_trip() {
    let dir = TempDir::new().unwrap();
    let (server, inbound) = start_server(&dir);
    let (_responder, _seen) = spawn_status_responder(Arc::clone(&server), inbound);
    let mut client = connected_client(&dir).await;

    let response = client
        .request(&IpcMessage::new(MessageType::GetStatus), TIMEOUT)
        .await
        .unwrap()
        .expect("status response");

    assert_eq!(response.message_type, MessageType::GetStatusResponse);
    let status: StatusResponse = response.payload_as().unwrap().unwrap();
    assert!(status.is_recording);
    assert_eq!(status.total_event_count, 7);

    client.disconnect();
    server.stop().await;
}

#[tokio::test]
async fn test_fire_and_forget_messages_are_delivered_in_order() {
    let dir = TempDir::new().unwrap();
    let (server, mut inbound) = start_server(&dir);
    let mut client = connected_client(&dir).await;

    client
        .send(&IpcMessage::new(MessageType::PauseRecording))
        .await
        .unwrap();
    client
        .send(
            &IpcMessage::with_payload(MessageType::GetRecentKeystrokes, &RecentRequest { limit: 3 })
                .unwrap(),
        )
        .await
        .unwrap();

    let first = tokio::time::timeout(TIMEOUT, inbound.recv()).await.unwrap().unwrap();
    let second = tokio::time::timeout(TIMEOUT, inbound.recv()).await.unwrap().unwrap();

    assert_eq!(first.message_type, MessageType::PauseRecording);
    assert_eq!(second.message_type, MessageType::GetRecentKeystrokes);
    assert_eq!(
        second.payload_as::<RecentRequest>().unwrap(),
        Some(RecentRequest { limit: 3 })
    );

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_message_type_is_forwarded_as_unknown() {
    let dir = TempDir::new().unwrap();
    let (server, mut inbound) = start_server(&dir);
    let mut stream = UnixStream::connect(dir.path().join("control.sock"))
        .await
        .unwrap();

    stream
        .write_all(b"{\"type\":\"SelfDestruct\",\"payload\":null}\n")
        .await
        .unwrap();

    let message = tokio::time::timeout(TIMEOUT, inbound.recv()).await.unwrap().unwrap();
    assert_eq!(message.message_type, MessageType::Unknown);

    server.stop().await;
}

#[tokio::test]
async fn test_request_times_out_without_response() {
    let dir = TempDir::new().unwrap();
    let (server, _inbound) = start_server(&dir);
    let mut client = connected_client(&dir).await;

    let response = client
        .request(
            &IpcMessage::new(MessageType::GetStatus),
            Duration::from_millis(200),
        )
        .await
        .unwrap();

    assert!(response.is_none());
    server.stop().await;
}

// =============================================================================
// Connection Handling
// =============================================================================

#[tokio::test]
async fn test_malformed_line_closes_connection_and_server_keeps_accepting() {
    let dir = TempDir::new().unwrap();
    let (server, inbound) = start_server(&dir);
    let (_responder, _seen) = spawn_status_responder(Arc::clone(&server), inbound);

    let mut bad = UnixStream::connect(dir.path().join("control.sock"))
        .await
        .unwrap();
    bad.write_all(b"this is not json\n").await.unwrap();
    let mut buf = Vec::new();
    let read = tokio::time::timeout(TIMEOUT, bad.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read, 0, "server should close the malformed connection");

    let mut client = connected_client(&dir).await;
    let response = client
        .request(&IpcMessage::new(MessageType::GetStatus), TIMEOUT)
        .await
        .unwrap();
    assert!(response.is_some());

    server.stop().await;
}

#[tokio::test]
async fn test_client_detects_server_stop() {
    let dir = TempDir::new().unwrap();
    let (server, _inbound) = start_server(&dir);
    let mut client = connected_client(&dir).await;

    server.stop().await;

    let response = client
        .request(&IpcMessage::new(MessageType::GetStatus), TIMEOUT)
        .await;
    assert!(matches!(response, Ok(None) | Err(_)));
    assert!(!dir.path().join("control.sock").exists());
}
