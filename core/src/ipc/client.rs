//! Control channel client used by companion processes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::message::IpcMessage;
use super::IpcError;

/// Client side of the control channel.
pub struct IpcClient {
    socket_path: PathBuf,
    reader: Option<Lines<BufReader<OwnedReadHalf>>>,
    writer: Option<OwnedWriteHalf>,
}

impl IpcClient {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            reader: None,
            writer: None,
        }
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.writer.is_some()
    }

    /// Connects to the server. Returns `false` on failure or timeout.
    pub async fn connect(&mut self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, UnixStream::connect(&self.socket_path)).await {
            Ok(Ok(stream)) => {
                let (read_half, write_half) = stream.into_split();
                self.reader = Some(BufReader::new(read_half).lines());
                self.writer = Some(write_half);
                info!(socket = %self.socket_path.display(), "Connected to control channel");
                true
            }
            Ok(Err(e)) => {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to connect to control channel"
                );
                false
            }
            Err(_) => {
                warn!(
                    socket = %self.socket_path.display(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out connecting to control channel"
                );
                false
            }
        }
    }

    /// Sends one message without waiting for a reply.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::NotConnected`] before [`connect`](Self::connect),
    /// or [`IpcError::Io`] if the write fails (the client then disconnects).
    pub async fn send(&mut self, message: &IpcMessage) -> Result<(), IpcError> {
        let line = message.to_line()?;
        let writer = self.writer.as_mut().ok_or(IpcError::NotConnected)?;

        if let Err(e) = writer.write_all(line.as_bytes()).await {
            self.disconnect();
            return Err(e.into());
        }

        debug!(message_type = %message.message_type, "Sent control message");
        Ok(())
    }

    /// Sends a message and waits up to `timeout` for its response.
    ///
    /// Messages that do not match the expected response type are skipped.
    /// Returns `Ok(None)` on timeout or if the server closes the connection.
    pub async fn request(
        &mut self,
        message: &IpcMessage,
        timeout: Duration,
    ) -> Result<Option<IpcMessage>, IpcError> {
        if self.reader.is_none() {
            return Err(IpcError::NotConnected);
        }
        self.send(message).await?;

        let expected = message.message_type.response_type();
        let deadline = Instant::now() + timeout;
        let reader = self.reader.as_mut().ok_or(IpcError::NotConnected)?;

        loop {
            let line = match tokio::time::timeout_at(deadline, reader.next_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    debug!("Control channel closed by server");
                    return Ok(None);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    warn!(message_type = %message.message_type, "Timed out waiting for response");
                    return Ok(None);
                }
            };

            if line.trim().is_empty() {
                continue;
            }
            let response = IpcMessage::from_line(&line)?;
            match expected {
                Some(expected) if response.message_type != expected => {
                    debug!(
                        received = %response.message_type,
                        expected = %expected,
                        "Skipping uncorrelated message"
                    );
                }
                _ => return Ok(Some(response)),
            }
        }
    }

    /// Closes the connection, if any.
    pub fn disconnect(&mut self) {
        if self.writer.take().is_some() {
            debug!(socket = %self.socket_path.display(), "Disconnected from control channel");
        }
        self.reader = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::message::MessageType;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let mut client = IpcClient::new("/nonexistent/keyrecorder.sock");

        let err = client
            .send(&IpcMessage::new(MessageType::GetStatus))
            .await
            .unwrap_err();

        assert!(matches!(err, IpcError::NotConnected));
    }

    #[tokio::test]
    async fn test_request_before_connect_fails() {
        let mut client = IpcClient::new("/nonexistent/keyrecorder.sock");

        let err = client
            .request(&IpcMessage::new(MessageType::GetStatus), Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(matches!(err, IpcError::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket_returns_false() {
        let dir = TempDir::new().unwrap();
        let mut client = IpcClient::new(dir.path().join("absent.sock"));

        assert!(!client.connect(Duration::from_millis(200)).await);
        assert!(!client.is_connected());
    }
}
