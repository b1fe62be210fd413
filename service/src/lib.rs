//! KeyRecorder service - hosts the tiered store behind a local control channel.
//!
//! This crate turns the `keyrecorder-core` engine into a long-running
//! recorder: it loads configuration, runs the maintenance schedule, serves
//! control messages from companion processes and shuts everything down
//! without losing buffered events.
//!
//! # Modules
//!
//! - [`config`]: Configuration from environment variables
//! - [`service`]: Service lifecycle and control message handling
//! - [`maintenance`]: Periodic sync, integrity, retention and snapshot jobs
//! - [`capture`]: Newline-delimited JSON capture source

pub mod capture;
pub mod config;
pub mod maintenance;
pub mod service;

pub use config::Config;
pub use service::{RecorderService, ServiceError, DEFAULT_RECENT_LIMIT};
