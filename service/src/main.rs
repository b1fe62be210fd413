//! KeyRecorder - background recorder and companion CLI.
//!
//! # Commands
//!
//! - `keyrecorder run`: Start the recorder service
//! - `keyrecorder status`: Show recorder status
//! - `keyrecorder pause` / `keyrecorder resume`: Toggle recording
//! - `keyrecorder recent`: Print the most recent events
//! - `keyrecorder stop`: Ask the running service to shut down
//!
//! # Environment Variables
//!
//! See the [`config`](keyrecorder_service::config) module for available
//! configuration options.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use keyrecorder_core::ipc::{
    IpcClient, IpcMessage, MessageType, RecentRequest, StatusResponse, DEFAULT_CLIENT_TIMEOUT,
};
use keyrecorder_core::types::EventRecord;
use keyrecorder_service::capture::spawn_stdin_capture;
use keyrecorder_service::{Config, RecorderService};

/// Capacity of the capture channel between stdin and the coordinator.
const CAPTURE_CHANNEL_CAPACITY: usize = 1024;

/// Environment variable selecting the log output format.
const LOG_FORMAT_ENV: &str = "KEYRECORDER_LOG_FORMAT";

/// KeyRecorder - tiered, crash-safe event recorder.
#[derive(Parser, Debug)]
#[command(name = "keyrecorder")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    KEYRECORDER_DATABASE_PATH      Store directory (default: platform data dir)
    KEYRECORDER_SOCKET_PATH        Control socket (default: <store dir>/keyrecorder.sock)
    KEYRECORDER_SYNC_INTERVAL_MINUTES            (default: 5)
    KEYRECORDER_INTEGRITY_CHECK_INTERVAL_MINUTES (default: 60)
    KEYRECORDER_SNAPSHOT_INTERVAL_MINUTES        (default: 60)
    KEYRECORDER_MAX_SNAPSHOTS      Snapshots to keep (default: 24)
    KEYRECORDER_RETENTION_DAYS     Event age limit, 0 disables (default: 7)
    KEYRECORDER_MAX_EVENTS         Event count limit (default: none)
    KEYRECORDER_MAX_STORAGE_BYTES  Reserved, not enforced
    KEYRECORDER_RECORDING_PAUSED   Start paused (default: false)
    KEYRECORDER_DEBOUNCE_MS        Write quiet period (default: 2000)
    KEYRECORDER_LOG_FORMAT         'json' for structured logs
    RUST_LOG                       Log filter (default: info)

EXAMPLES:
    # Start the recorder, reading events from a producer on stdin
    producer | keyrecorder run --capture-stdin

    # Inspect and control a running recorder
    keyrecorder status
    keyrecorder recent --limit 20
    keyrecorder pause
")]
struct Cli {
    /// Control socket path (overrides KEYRECORDER_SOCKET_PATH).
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Timeout in milliseconds for control channel requests.
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Start the recorder service.
    ///
    /// Runs until interrupted or until a `stop` command is received.
    Run {
        /// Read newline-delimited JSON events from standard input.
        #[arg(long)]
        capture_stdin: bool,
    },

    /// Show whether the recorder is recording and how many events it holds.
    Status,

    /// Pause recording.
    Pause,

    /// Resume recording.
    Resume,

    /// Print the most recent events, newest first.
    Recent {
        /// Number of events to print.
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Ask the running recorder to shut down gracefully.
    Stop,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Command::Run { .. } => "info",
        _ => "warn",
    };
    init_logging(default_level);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    match cli.command {
        Command::Run { capture_stdin } => {
            let mut config = Config::from_env();
            if let Some(socket) = cli.socket {
                config.socket_path = socket;
            }
            runtime.block_on(run_service(config, capture_stdin))
        }
        command => {
            let socket = cli
                .socket
                .unwrap_or_else(|| Config::from_env().socket_path);
            let timeout = cli
                .timeout_ms
                .map_or(DEFAULT_CLIENT_TIMEOUT, Duration::from_millis);
            runtime.block_on(run_client(command, socket, timeout))
        }
    }
}

/// Runs the recorder until a signal or a `Shutdown` control message.
async fn run_service(config: Config, capture_stdin: bool) -> Result<()> {
    info!(
        database_path = %config.database_path.display(),
        socket_path = %config.socket_path.display(),
        sync_interval_secs = config.sync_interval.as_secs(),
        retention_days = config.retention.retention_days,
        "Starting KeyRecorder"
    );

    let service = Arc::new(RecorderService::new(config));

    let capture = if capture_stdin {
        let (tx, rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
        spawn_stdin_capture(tx);
        Some(rx)
    } else {
        None
    };

    service
        .start(capture)
        .await
        .context("Failed to start recorder service")?;

    info!("KeyRecorder running. Press Ctrl+C to stop.");

    tokio::select! {
        _ = wait_for_shutdown() => info!("Received shutdown signal"),
        _ = service.wait_for_shutdown_request() => {}
    }

    let unflushed = service.stop().await;
    if unflushed > 0 {
        error!(unflushed_events = unflushed, "Some events could not be saved");
    }

    info!("KeyRecorder stopped");
    Ok(())
}

/// Sends one companion command to the running recorder.
async fn run_client(command: Command, socket: PathBuf, timeout: Duration) -> Result<()> {
    let mut client = IpcClient::new(&socket);
    if !client.connect(timeout).await {
        bail!(
            "KeyRecorder is not running (no control channel at {})",
            socket.display()
        );
    }

    match command {
        Command::Status => {
            let response =
                request(&mut client, IpcMessage::new(MessageType::GetStatus), timeout).await?;
            let status: StatusResponse = response
                .payload_as()?
                .context("Status response had no payload")?;
            print_status(&status);
        }
        Command::Recent { limit } => {
            let message = IpcMessage::with_payload(
                MessageType::GetRecentKeystrokes,
                &RecentRequest { limit },
            )?;
            let response = request(&mut client, message, timeout).await?;
            let records: Vec<EventRecord> = response.payload_as()?.unwrap_or_default();
            if records.is_empty() {
                println!("No events recorded.");
            }
            for record in &records {
                println!("{}", format_record(record));
            }
        }
        Command::Pause => {
            client
                .send(&IpcMessage::new(MessageType::PauseRecording))
                .await?;
            println!("Recording paused.");
        }
        Command::Resume => {
            client
                .send(&IpcMessage::new(MessageType::ResumeRecording))
                .await?;
            println!("Recording resumed.");
        }
        Command::Stop => {
            client.send(&IpcMessage::new(MessageType::Shutdown)).await?;
            println!("Shutdown requested.");
        }
        Command::Run { .. } => bail!("'run' starts the service and is not a control command"),
    }

    client.disconnect();
    Ok(())
}

async fn request(
    client: &mut IpcClient,
    message: IpcMessage,
    timeout: Duration,
) -> Result<IpcMessage> {
    client
        .request(&message, timeout)
        .await
        .context("Control channel request failed")?
        .with_context(|| {
            format!(
                "No response to {} within {}ms",
                message.message_type,
                timeout.as_millis()
            )
        })
}

fn print_status(status: &StatusResponse) {
    let when = |time: Option<DateTime<Utc>>| {
        time.map_or_else(
            || "never".to_string(),
            |t| t.with_timezone(&Local).to_rfc3339_opts(SecondsFormat::Secs, false),
        )
    };
    let recording = if status.is_recording { "yes" } else { "paused" };
    println!("Recording:     {recording}");
    println!("Stored events: {}", status.total_event_count);
    println!("Last sync:     {}", when(status.last_sync_time));
    println!("Last snapshot: {}", when(status.last_snapshot_time));
}

fn format_record(record: &EventRecord) -> String {
    let modifiers = &record.action.modifiers;
    let mut held = Vec::new();
    if modifiers.ctrl {
        held.push("Ctrl");
    }
    if modifiers.alt {
        held.push("Alt");
    }
    if modifiers.shift {
        held.push("Shift");
    }
    if modifiers.win {
        held.push("Win");
    }

    let mut line = format!(
        "{} #{:<8} {:<4} {}",
        record
            .timestamp
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S%.3f"),
        record.sequence_id,
        if record.action.is_key_down { "down" } else { "up" },
        record.action.key_name,
    );
    if !held.is_empty() {
        line.push_str(&format!(" [{}]", held.join("+")));
    }
    if let Some(window) = &record.window_title {
        line.push_str(&format!(" ({window})"));
    }
    line
}

/// Initializes the tracing subscriber.
///
/// Human-readable output by default; JSON when `KEYRECORDER_LOG_FORMAT=json`.
/// Logs go to stderr so command output on stdout stays clean.
fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
