//! Line-oriented capture source.
//!
//! Reads newline-delimited JSON captured events and forwards them to the
//! coordinator's consumer channel. This lets any external producer feed the
//! recorder by piping into its standard input. Lines that fail to parse are
//! logged and skipped.

use keyrecorder_core::types::CapturedEvent;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Forwards every event parsed from `reader` into `events`.
///
/// Returns the number of events forwarded. Stops at end of input or when
/// the receiving side is dropped.
pub async fn forward_events<R>(reader: R, events: mpsc::Sender<CapturedEvent>) -> usize
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0;
    let mut line_number = 0usize;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read capture input");
                break;
            }
        };
        line_number += 1;

        if line.trim().is_empty() {
            continue;
        }

        let event: CapturedEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(line = line_number, error = %e, "Skipping malformed captured event");
                continue;
            }
        };

        if events.send(event).await.is_err() {
            debug!("Capture consumer closed");
            break;
        }
        forwarded += 1;
    }

    forwarded
}

/// Spawns a task forwarding events read from standard input.
pub fn spawn_stdin_capture(events: mpsc::Sender<CapturedEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Reading captured events from standard input");
        let forwarded = forward_events(BufReader::new(tokio::io::stdin()), events).await;
        info!(forwarded, "Standard input capture finished");
    })
}
