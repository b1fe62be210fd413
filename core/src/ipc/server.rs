//! Control channel server.
//!
//! The server owns the socket and forwards every decoded message to an
//! mpsc channel. Clients are handled one at a time; a client that sends an
//! empty or malformed line is disconnected and the server goes back to
//! accepting. Responses are written to whichever client is currently
//! connected.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::message::IpcMessage;
use super::IpcError;

/// Delay before accepting again after an accept error.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How long [`IpcServer::stop`] waits for the accept loop to finish.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

type SharedWriter = Arc<AsyncMutex<Option<OwnedWriteHalf>>>;

/// Single-client control channel server on a Unix domain socket.
pub struct IpcServer {
    socket_path: PathBuf,
    inbound: mpsc::Sender<IpcMessage>,
    writer: SharedWriter,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IpcServer {
    /// Creates a server that will listen on `socket_path` and deliver
    /// decoded messages to `inbound`.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>, inbound: mpsc::Sender<IpcMessage>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            socket_path: socket_path.into(),
            inbound,
            writer: Arc::new(AsyncMutex::new(None)),
            shutdown,
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Binds the socket and spawns the accept loop.
    ///
    /// A stale socket file from an earlier run is removed first. Only the
    /// first call has any effect; later calls log a warning.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Io`] if the socket cannot be bound.
    pub fn start(&self) -> Result<(), IpcError> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(socket = %self.socket_path.display(), "IPC server already started");
            return Ok(());
        }

        let listener = match bind(&self.socket_path) {
            Ok(listener) => listener,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let handle = tokio::spawn(run_accept_loop(
            listener,
            self.inbound.clone(),
            Arc::clone(&self.writer),
            self.shutdown.subscribe(),
        ));
        *self.task.lock() = Some(handle);

        info!(socket = %self.socket_path.display(), "IPC server listening");
        Ok(())
    }

    /// Returns `true` while a client is connected.
    pub async fn has_client(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Writes `message` to the connected client.
    ///
    /// Best effort: returns `false` without error if no client is connected
    /// or the write fails.
    pub async fn send_response(&self, message: &IpcMessage) -> bool {
        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                error!(
                    error = %e,
                    message_type = %message.message_type,
                    "Failed to encode response"
                );
                return false;
            }
        };

        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            debug!(
                message_type = %message.message_type,
                "No IPC client connected, dropping response"
            );
            return false;
        };

        match stream.write_all(line.as_bytes()).await {
            Ok(()) => {
                debug!(message_type = %message.message_type, "Sent IPC response");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to write IPC response");
                false
            }
        }
    }

    /// Signals the accept loop to stop and waits for it, up to five seconds.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(STOP_TIMEOUT, handle).await {
                Ok(_) => info!("IPC server stopped"),
                Err(_) => warn!(
                    timeout_secs = STOP_TIMEOUT.as_secs(),
                    "IPC server did not stop in time"
                ),
            }
        }

        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(
                socket = %self.socket_path.display(),
                error = %e,
                "Failed to remove socket file"
            ),
        }
    }
}

fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!(socket = %path.display(), "Removed stale socket file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

async fn run_accept_loop(
    listener: UnixListener,
    inbound: mpsc::Sender<IpcMessage>,
    writer: SharedWriter,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let stream = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    error!(error = %e, "Failed to accept IPC connection");
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => continue,
                    }
                }
            },
        };

        info!("IPC client connected");
        let keep_going = handle_client(stream, &inbound, &writer, &mut shutdown).await;
        info!("IPC client disconnected");

        if !keep_going || *shutdown.borrow() {
            break;
        }
    }

    debug!("IPC accept loop finished");
}

/// Reads messages from one client until it disconnects.
///
/// Returns `false` if the server should stop accepting.
async fn handle_client(
    stream: UnixStream,
    inbound: &mpsc::Sender<IpcMessage>,
    writer: &SharedWriter,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let (read_half, write_half) = stream.into_split();
    *writer.lock().await = Some(write_half);

    let mut lines = BufReader::new(read_half).lines();
    let mut keep_going = true;

    loop {
        let line = tokio::select! {
            _ = shutdown.changed() => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) if !line.trim().is_empty() => line,
            Ok(_) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read from IPC client");
                break;
            }
        };

        match IpcMessage::from_line(&line) {
            Ok(message) => {
                debug!(message_type = %message.message_type, "Received IPC message");
                if inbound.send(message).await.is_err() {
                    warn!("IPC message handler is gone");
                    keep_going = false;
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Malformed IPC message, closing connection");
                break;
            }
        }
    }

    if let Some(mut write_half) = writer.lock().await.take() {
        let _ = write_half.shutdown().await;
    }
    keep_going
}
