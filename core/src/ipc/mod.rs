//! Local control channel between the recorder and companion processes.
//!
//! The channel is a Unix domain socket carrying newline-delimited JSON
//! [`IpcMessage`]s. The server accepts one client at a time; the client
//! sends requests and optionally waits for a correlated response.

use std::time::Duration;

use thiserror::Error;

pub mod client;
pub mod message;
pub mod server;

pub use client::IpcClient;
pub use message::{IpcMessage, MessageType, RecentRequest, StatusResponse};
pub use server::IpcServer;

/// Default socket file name inside the data directory.
pub const DEFAULT_SOCKET_NAME: &str = "keyrecorder.sock";

/// Default timeout for client connects and request round trips.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Errors that can occur on the control channel.
#[derive(Error, Debug)]
pub enum IpcError {
    /// The client has no open connection.
    #[error("not connected to the control channel")]
    NotConnected,

    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
