//! Control channel message types.
//!
//! Every message is one line of JSON with a string `type` and an optional
//! `payload`. The payload is itself a JSON document encoded as a string,
//! which keeps the envelope stable while payload shapes evolve.
//!
//! # Wire Format
//!
//! ```json
//! {"type":"GetStatusResponse","payload":"{\"isRecording\":true,\"totalEventCount\":42,\"lastSyncTime\":null,\"lastSnapshotTime\":null}"}
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Kind of control channel message.
///
/// Unrecognized type names deserialize to [`MessageType::Unknown`] so that
/// newer peers never break the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "&'static str")]
pub enum MessageType {
    KeystrokeNotification,
    GetRecentKeystrokes,
    GetRecentKeystrokesResponse,
    PauseRecording,
    ResumeRecording,
    GetStatus,
    GetStatusResponse,
    Shutdown,
    Unknown,
}

impl MessageType {
    /// Wire name of this message type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeystrokeNotification => "KeystrokeNotification",
            Self::GetRecentKeystrokes => "GetRecentKeystrokes",
            Self::GetRecentKeystrokesResponse => "GetRecentKeystrokesResponse",
            Self::PauseRecording => "PauseRecording",
            Self::ResumeRecording => "ResumeRecording",
            Self::GetStatus => "GetStatus",
            Self::GetStatusResponse => "GetStatusResponse",
            Self::Shutdown => "Shutdown",
            Self::Unknown => "Unknown",
        }
    }

    /// The response type a request of this type expects, if any.
    #[must_use]
    pub fn response_type(self) -> Option<Self> {
        match self {
            Self::GetRecentKeystrokes => Some(Self::GetRecentKeystrokesResponse),
            Self::GetStatus => Some(Self::GetStatusResponse),
            _ => None,
        }
    }
}

impl From<&str> for MessageType {
    fn from(name: &str) -> Self {
        match name {
            "KeystrokeNotification" => Self::KeystrokeNotification,
            "GetRecentKeystrokes" => Self::GetRecentKeystrokes,
            "GetRecentKeystrokesResponse" => Self::GetRecentKeystrokesResponse,
            "PauseRecording" => Self::PauseRecording,
            "ResumeRecording" => Self::ResumeRecording,
            "GetStatus" => Self::GetStatus,
            "GetStatusResponse" => Self::GetStatusResponse,
            "Shutdown" => Self::Shutdown,
            _ => Self::Unknown,
        }
    }
}

impl From<String> for MessageType {
    fn from(name: String) -> Self {
        Self::from(name.as_str())
    }
}

impl From<MessageType> for &'static str {
    fn from(message_type: MessageType) -> Self {
        message_type.as_str()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One control channel message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpcMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,

    /// JSON-encoded payload, if the message type carries one.
    #[serde(default)]
    pub payload: Option<String>,
}

impl IpcMessage {
    /// A message without a payload.
    #[must_use]
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            payload: None,
        }
    }

    /// A message whose payload is `payload` encoded as JSON.
    pub fn with_payload<T: Serialize>(
        message_type: MessageType,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_type,
            payload: Some(serde_json::to_string(payload)?),
        })
    }

    /// Decodes the payload, returning `Ok(None)` when there is none.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.payload
            .as_deref()
            .filter(|raw| !raw.trim().is_empty())
            .map(serde_json::from_str)
            .transpose()
    }

    /// Encodes the message as a single newline-terminated line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decodes one line (with or without its trailing newline).
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}

/// Payload of [`MessageType::GetStatusResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub is_recording: bool,
    pub total_event_count: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_snapshot_time: Option<DateTime<Utc>>,
}

/// Optional payload of [`MessageType::GetRecentKeystrokes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentRequest {
    pub limit: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_uses_type_field() {
        let message = IpcMessage::new(MessageType::GetStatus);

        let json = serde_json::to_value(&message).unwrap();

        assert_eq!(json["type"], "GetStatus");
        assert!(json["payload"].is_null());
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let message = IpcMessage::from_line(r#"{"type":"Reboot","payload":null}"#).unwrap();
        assert_eq!(message.message_type, MessageType::Unknown);
    }

    #[test]
    fn test_missing_payload_defaults_to_none() {
        let message = IpcMessage::from_line("{\"type\":\"PauseRecording\"}\n").unwrap();
        assert_eq!(message.message_type, MessageType::PauseRecording);
        assert!(message.payload.is_none());
    }

    #[test]
    fn test_malformed_line_is_error() {
        assert!(IpcMessage::from_line("not json").is_err());
        assert!(IpcMessage::from_line(r#"{"payload":"x"}"#).is_err());
    }

    #[test]
    fn test_status_payload_is_camel_case_string() {
        let status = StatusResponse {
            is_recording: true,
            total_event_count: 42,
            last_sync_time: None,
            last_snapshot_time: None,
        };

        let message = IpcMessage::with_payload(MessageType::GetStatusResponse, &status).unwrap();
        let raw = message.payload.as_deref().unwrap();

        assert!(raw.contains("\"isRecording\":true"));
        assert!(raw.contains("\"totalEventCount\":42"));
        assert_eq!(message.payload_as::<StatusResponse>().unwrap(), Some(status));
    }

    #[test]
    fn test_to_line_is_single_line() {
        let message =
            IpcMessage::with_payload(MessageType::GetRecentKeystrokes, &RecentRequest { limit: 5 })
                .unwrap();

        let line = message.to_line().unwrap();

        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert_eq!(IpcMessage::from_line(&line).unwrap(), message);
    }

    #[test]
    fn test_empty_payload_decodes_as_none() {
        let message = IpcMessage {
            message_type: MessageType::GetRecentKeystrokes,
            payload: Some(String::new()),
        };
        assert_eq!(message.payload_as::<RecentRequest>().unwrap(), None);
    }

    #[test]
    fn test_response_types() {
        assert_eq!(
            MessageType::GetStatus.response_type(),
            Some(MessageType::GetStatusResponse)
        );
        assert_eq!(MessageType::Shutdown.response_type(), None);
    }
}
