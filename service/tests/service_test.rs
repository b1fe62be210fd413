//! Integration tests for the recorder service.
//!
//! These tests run a full service (stores, control channel, maintenance
//! schedule) against a temporary directory and drive it through control
//! messages, both directly and over the socket.

use std::sync::Arc;
use std::time::Duration;

use keyrecorder_core::ipc::{IpcClient, IpcMessage, MessageType, RecentRequest, StatusResponse};
use keyrecorder_core::store::{MainStore, Store};
use keyrecorder_core::types::{CapturedEvent, EventRecord, KeyAction, Modifiers};
use keyrecorder_service::{Config, RecorderService};
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

const TIMEOUT: Duration = Duration::from_secs(2);

fn test_config(dir: &TempDir) -> Config {
    Config {
        database_path: dir.path().join("data"),
        socket_path: dir.path().join("keyrecorder.sock"),
        debounce: Duration::from_secs(600),
        ..Config::default()
    }
}

async fn started_service(config: Config) -> Arc<RecorderService> {
    let service = Arc::new(RecorderService::new(config));
    service.start(None).await.unwrap();
    service
}

fn notification(key: &str) -> IpcMessage {
    let event = CapturedEvent::now(KeyAction {
        virtual_key_code: 0x41,
        key_name: key.to_string(),
        is_key_down: true,
        modifiers: Modifiers {
            ctrl: true,
            ..Modifiers::default()
        },
    });
    IpcMessage::with_payload(MessageType::KeystrokeNotification, &event).unwrap()
}

async fn status_of(service: &RecorderService) -> StatusResponse {
    let response = service
        .handle_message(IpcMessage::new(MessageType::GetStatus))
        .await
        .expect("status response");
    assert_eq!(response.message_type, MessageType::GetStatusResponse);
    response.payload_as().unwrap().unwrap()
}

// =============================================================================
// Message Handling
// =============================================================================

#[tokio::test]
async fn test_status_defaults() {
    let dir = TempDir::new().unwrap();
    let service = started_service(test_config(&dir)).await;

    let status = status_of(&service).await;

    assert!(status.is_recording);
    assert_eq!(status.total_event_count, 0);
    assert!(status.last_sync_time.is_none());
    assert!(status.last_snapshot_time.is_none());

    assert_eq!(service.stop().await, 0);
}

#[tokio::test]
async fn test_pause_and_resume() {
    let dir = TempDir::new().unwrap();
    let service = started_service(test_config(&dir)).await;

    assert!(service
        .handle_message(IpcMessage::new(MessageType::PauseRecording))
        .await
        .is_none());
    assert!(!status_of(&service).await.is_recording);

    service
        .handle_message(IpcMessage::new(MessageType::ResumeRecording))
        .await;
    assert!(status_of(&service).await.is_recording);

    service.stop().await;
}

#[tokio::test]
async fn test_starts_paused_when_configured() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        recording_paused: true,
        ..test_config(&dir)
    };
    let service = started_service(config).await;

    assert!(!status_of(&service).await.is_recording);

    service.stop().await;
}

#[tokio::test]
async fn test_notification_is_recorded_and_listed() {
    let dir = TempDir::new().unwrap();
    let service = started_service(test_config(&dir)).await;

    service.handle_message(notification("Q")).await;
    assert_eq!(service.coordinator().pending(), 1);
    service.coordinator().flush().await.unwrap();

    let request =
        IpcMessage::with_payload(MessageType::GetRecentKeystrokes, &RecentRequest { limit: 10 })
            .unwrap();
    let response = service.handle_message(request).await.unwrap();

    assert_eq!(response.message_type, MessageType::GetRecentKeystrokesResponse);
    let records: Vec<EventRecord> = response.payload_as().unwrap().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action.key_name, "Q");
    assert!(records[0].action.modifiers.ctrl);
    assert_eq!(status_of(&service).await.total_event_count, 1);

    service.stop().await;
}

#[tokio::test]
async fn test_recent_without_payload_uses_default_limit() {
    let dir = TempDir::new().unwrap();
    let service = started_service(test_config(&dir)).await;
    for i in 0..3 {
        service.handle_message(notification(&format!("K{i}"))).await;
    }
    service.coordinator().flush().await.unwrap();

    let response = service
        .handle_message(IpcMessage::new(MessageType::GetRecentKeystrokes))
        .await
        .unwrap();

    let records: Vec<EventRecord> = response.payload_as().unwrap().unwrap();
    assert_eq!(records.len(), 3);

    service.stop().await;
}

#[tokio::test]
async fn test_notification_ignored_while_paused() {
    let dir = TempDir::new().unwrap();
    let service = started_service(test_config(&dir)).await;
    service
        .handle_message(IpcMessage::new(MessageType::PauseRecording))
        .await;

    service.handle_message(notification("Q")).await;

    assert_eq!(service.coordinator().pending(), 0);
    service.stop().await;
}

#[tokio::test]
async fn test_malformed_notification_is_ignored() {
    let dir = TempDir::new().unwrap();
    let service = started_service(test_config(&dir)).await;

    let message = IpcMessage {
        message_type: MessageType::KeystrokeNotification,
        payload: Some("{\"not\":\"an event\"}".to_string()),
    };

    assert!(service.handle_message(message).await.is_none());
    assert_eq!(service.coordinator().pending(), 0);
    service.stop().await;
}

#[tokio::test]
async fn test_unknown_and_response_types_are_ignored() {
    let dir = TempDir::new().unwrap();
    let service = started_service(test_config(&dir)).await;

    for message_type in [
        MessageType::Unknown,
        MessageType::GetStatusResponse,
        MessageType::GetRecentKeystrokesResponse,
    ] {
        assert!(service
            .handle_message(IpcMessage::new(message_type))
            .await
            .is_none());
    }

    service.stop().await;
}

#[tokio::test]
async fn test_shutdown_message_requests_shutdown() {
    let dir = TempDir::new().unwrap();
    let service = started_service(test_config(&dir)).await;
    assert!(!service.is_shutdown_requested());

    service
        .handle_message(IpcMessage::new(MessageType::Shutdown))
        .await;

    assert!(service.is_shutdown_requested());
    tokio::time::timeout(TIMEOUT, service.wait_for_shutdown_request())
        .await
        .expect("shutdown request should resolve");
    service.stop().await;
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_stop_flushes_and_syncs_buffered_events() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let database_path = config.database_path.clone();
    let service = started_service(config).await;
    for key in ["A", "B"] {
        service.handle_message(notification(key)).await;
    }

    assert_eq!(service.stop().await, 0);

    let main = MainStore::new(&database_path);
    main.initialize().unwrap();
    assert_eq!(main.count().unwrap(), 2);
}

#[tokio::test]
async fn test_start_fails_on_unusable_database_path() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("occupied");
    std::fs::write(&blocker, b"file").unwrap();
    let config = Config {
        database_path: blocker,
        ..test_config(&dir)
    };

    let service = Arc::new(RecorderService::new(config));

    assert!(service.start(None).await.is_err());
}

// =============================================================================
// Control Channel
// =============================================================================

#[tokio::test]
async fn test_control_channel_round_trip() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let socket = config.socket_path.clone();
    let service = started_service(config).await;

    let mut client = IpcClient::new(&socket);
    assert!(client.connect(TIMEOUT).await);

    client
        .send(&IpcMessage::new(MessageType::PauseRecording))
        .await
        .unwrap();
    let response = client
        .request(&IpcMessage::new(MessageType::GetStatus), TIMEOUT)
        .await
        .unwrap()
        .expect("status response");

    let status: StatusResponse = response.payload_as().unwrap().unwrap();
    assert!(!status.is_recording);

    client.disconnect();
    service.stop().await;
}

#[tokio::test]
async fn test_shutdown_over_control_channel() {
    let dir = TempDir::new().unwrap();
    let config = test_config(&dir);
    let socket = config.socket_path.clone();
    let service = started_service(config).await;

    let mut client = IpcClient::new(&socket);
    assert!(client.connect(TIMEOUT).await);
    client
        .send(&IpcMessage::new(MessageType::Shutdown))
        .await
        .unwrap();

    tokio::time::timeout(TIMEOUT, service.wait_for_shutdown_request())
        .await
        .expect("shutdown request should arrive over the socket");
    assert_eq!(service.stop().await, 0);
    assert!(!socket.exists());
}
