//! The recorder service: coordinator, control channel and maintenance jobs
//! under one lifecycle.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use keyrecorder_service::{Config, RecorderService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = Arc::new(RecorderService::new(Config::from_env()));
//!     service.start(None).await?;
//!     service.wait_for_shutdown_request().await;
//!     let unflushed = service.stop().await;
//!     assert_eq!(unflushed, 0);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use keyrecorder_core::coordinator::{Coordinator, CoordinatorError};
use keyrecorder_core::ipc::{
    IpcError, IpcMessage, IpcServer, MessageType, RecentRequest, StatusResponse,
};
use keyrecorder_core::types::{CapturedEvent, EventRecord};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::maintenance::spawn_maintenance;

/// Records returned for `GetRecentKeystrokes` when no limit is given.
pub const DEFAULT_RECENT_LIMIT: usize = 100;

/// Capacity of the channel between the control channel and the dispatcher.
const MESSAGE_QUEUE_CAPACITY: usize = 64;

/// Bound on the final coordinator flush.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long background tasks get to notice shutdown before being aborted.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can occur while starting the service.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The coordinator could not be opened or started.
    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    /// The control channel could not be started.
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),
}

/// Hosts the coordinator, the control channel and the maintenance jobs.
pub struct RecorderService {
    config: Config,
    coordinator: Coordinator,
    ipc: Arc<IpcServer>,
    inbound: Mutex<Option<mpsc::Receiver<IpcMessage>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RecorderService {
    /// Builds the service. Nothing is opened until [`start`](Self::start).
    #[must_use]
    pub fn new(config: Config) -> Self {
        let coordinator = Coordinator::with_debounce(&config.database_path, config.debounce);
        coordinator.set_recording(!config.recording_paused);

        let (tx, rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
        let ipc = Arc::new(IpcServer::new(&config.socket_path, tx));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            coordinator,
            ipc,
            inbound: Mutex::new(Some(rx)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Opens the stores, starts the control channel and the maintenance
    /// jobs, and attaches the optional capture channel.
    pub async fn start(
        self: &Arc<Self>,
        capture: Option<mpsc::Receiver<CapturedEvent>>,
    ) -> Result<(), ServiceError> {
        self.coordinator.initialize().await?;
        self.coordinator.start()?;
        self.ipc.start()?;

        let mut tasks = Vec::new();
        if let Some(inbound) = self.inbound.lock().take() {
            tasks.push(self.spawn_dispatcher(inbound));
        }
        tasks.extend(spawn_maintenance(
            &self.coordinator,
            &self.config,
            &self.shutdown.subscribe(),
        ));
        if let Some(capture) = capture {
            tasks.push(self.coordinator.spawn_consumer(capture));
        }
        self.tasks.lock().extend(tasks);

        info!(
            database_path = %self.config.database_path.display(),
            socket_path = %self.config.socket_path.display(),
            recording = self.coordinator.is_recording(),
            "Recorder service started"
        );
        Ok(())
    }

    /// Asks the service to shut down. [`wait_for_shutdown_request`] returns.
    ///
    /// [`wait_for_shutdown_request`]: Self::wait_for_shutdown_request
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait_for_shutdown_request(&self) {
        let mut requested = self.shutdown.subscribe();
        // The sender lives in `self`, so this only errors if `self` is gone.
        let _ = requested.wait_for(|requested| *requested).await;
    }

    /// Stops the jobs and the control channel, then flushes, syncs and
    /// closes the stores.
    ///
    /// Returns the number of buffered events that could not be written.
    pub async fn stop(&self) -> usize {
        info!("Stopping recorder service");
        self.request_shutdown();

        self.ipc.stop().await;

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut task).await.is_err() {
                debug!("Background task still running, aborting");
                task.abort();
            }
        }

        match self.coordinator.flush().await {
            Ok(written) if written > 0 => info!(written, "Flushed buffered events"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Final flush failed"),
        }
        if let Err(e) = self.coordinator.sync().await {
            warn!(error = %e, "Final sync failed, events remain in the hot store");
        }

        let unflushed = self.coordinator.shutdown(SHUTDOWN_TIMEOUT).await;
        if unflushed > 0 {
            error!(unflushed_events = unflushed, "Events lost during shutdown");
        }
        info!("Recorder service stopped");
        unflushed
    }

    /// Current status as reported on the control channel.
    pub async fn status(&self) -> StatusResponse {
        let total_event_count = match self.coordinator.count().await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Failed to count stored events");
                0
            }
        };

        StatusResponse {
            is_recording: self.coordinator.is_recording(),
            total_event_count,
            last_sync_time: self.coordinator.last_sync_time(),
            last_snapshot_time: self.coordinator.last_snapshot_time(),
        }
    }

    /// Applies one control message and returns the response to send, if any.
    pub async fn handle_message(&self, message: IpcMessage) -> Option<IpcMessage> {
        match message.message_type {
            MessageType::KeystrokeNotification => {
                self.record_notification(&message);
                None
            }
            MessageType::GetRecentKeystrokes => {
                let limit = match message.payload_as::<RecentRequest>() {
                    Ok(Some(request)) => request.limit,
                    Ok(None) => DEFAULT_RECENT_LIMIT,
                    Err(e) => {
                        debug!(error = %e, "Invalid recent request payload, using default limit");
                        DEFAULT_RECENT_LIMIT
                    }
                };
                let records: Vec<EventRecord> = match self.coordinator.recent(limit).await {
                    Ok(records) => records,
                    Err(e) => {
                        warn!(error = %e, "Failed to read recent events");
                        Vec::new()
                    }
                };
                respond(MessageType::GetRecentKeystrokesResponse, &records)
            }
            MessageType::PauseRecording => {
                self.coordinator.set_recording(false);
                None
            }
            MessageType::ResumeRecording => {
                self.coordinator.set_recording(true);
                None
            }
            MessageType::GetStatus => {
                let status = self.status().await;
                respond(MessageType::GetStatusResponse, &status)
            }
            MessageType::Shutdown => {
                info!("Shutdown requested over control channel");
                self.request_shutdown();
                None
            }
            MessageType::GetRecentKeystrokesResponse
            | MessageType::GetStatusResponse
            | MessageType::Unknown => {
                debug!(message_type = %message.message_type, "Ignoring control message");
                None
            }
        }
    }

    fn record_notification(&self, message: &IpcMessage) {
        if !self.coordinator.is_recording() {
            debug!("Recording paused, ignoring notification");
            return;
        }
        match message.payload_as::<CapturedEvent>() {
            Ok(Some(event)) => {
                if let Err(e) = self.coordinator.record(event) {
                    warn!(error = %e, "Failed to record notified event");
                }
            }
            Ok(None) => warn!("Keystroke notification without payload"),
            Err(e) => warn!(error = %e, "Invalid keystroke notification payload"),
        }
    }

    fn spawn_dispatcher(
        self: &Arc<Self>,
        mut inbound: mpsc::Receiver<IpcMessage>,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.changed() => break,
                    message = inbound.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                if let Some(response) = service.handle_message(message).await {
                    service.ipc.send_response(&response).await;
                }
            }
            debug!("Control message dispatcher stopped");
        })
    }
}

fn respond<T: Serialize>(message_type: MessageType, payload: &T) -> Option<IpcMessage> {
    match IpcMessage::with_payload(message_type, payload) {
        Ok(message) => Some(message),
        Err(e) => {
            error!(error = %e, message_type = %message_type, "Failed to encode response");
            None
        }
    }
}
