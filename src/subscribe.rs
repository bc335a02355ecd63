//! Consumer side: an explicit receive loop over delivered messages.
//!
//! Each delivery is decoded by a pure function, handled according to the
//! [`SubscribeMode`], and then acknowledged. Anything that fails before the
//! record is safely on disk is negatively acknowledged so the broker redelivers it.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::output::{append_json_line, dated_output_path};
use crate::record::{BreadcrumbRecord, VEHICLE_ID_KEYS, value_as_text};
use crate::services::message_queue::Delivery;

pub const UNKNOWN_VEHICLE: &str = "UNKNOWN";

pub const DEFAULT_OUTPUT_PREFIX: &str = "lab_sub_output";

/// Progress is logged every this many messages in count-only mode.
pub const COUNT_PROGRESS_EVERY: usize = 1000;

/// What the loop does with each message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeMode {
    /// Decode and append to `<dir>/<prefix>_<today>.json`.
    Archive { dir: PathBuf, prefix: String },
    /// Acknowledge without decoding; only count.
    CountOnly,
}

/// A successfully decoded message.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBreadcrumb {
    pub vehicle_id: String,
    pub record: BreadcrumbRecord,
}

/// Parses one message body. The vehicle id is taken from the first known
/// spelling that is present, else [`UNKNOWN_VEHICLE`].
pub fn decode_message(payload: &[u8]) -> Result<DecodedBreadcrumb> {
    let text = std::str::from_utf8(payload).context("Message is not valid UTF-8")?;
    let record: BreadcrumbRecord =
        serde_json::from_str(text).context("Message is not a JSON object")?;

    let vehicle_id = record
        .first_present(VEHICLE_ID_KEYS)
        .map(value_as_text)
        .unwrap_or_else(|| UNKNOWN_VEHICLE.to_string());

    Ok(DecodedBreadcrumb { vehicle_id, record })
}

/// Totals for one receive loop run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveStats {
    pub received: usize,
    pub acked: usize,
    pub nacked: usize,
    /// Acks or naks the broker did not accept.
    pub ack_errors: usize,
    pub elapsed: Duration,
}

/// Writes a decoded message to today's archive file.
fn archive(payload: &[u8], dir: &Path, prefix: &str, today: NaiveDate) -> Result<String> {
    let decoded = decode_message(payload)?;
    let path = dated_output_path(dir, prefix, today);
    append_json_line(&path, &decoded.record)?;
    Ok(decoded.vehicle_id)
}

/// Forwards deliveries from a broker stream into the receive loop's channel.
///
/// Both waiting for the next message and waiting for channel capacity give way
/// to `cancel`, so a full channel never keeps the pump alive after shutdown.
/// A delivery dropped here was never acked and will be redelivered.
/// Returns how many deliveries were handed to the channel.
pub async fn pump_deliveries<St, E>(
    stream: St,
    tx: mpsc::Sender<Box<dyn Delivery>>,
    cancel: CancellationToken,
) -> usize
where
    St: Stream<Item = Result<Box<dyn Delivery>, E>>,
    E: Display,
{
    let mut stream = std::pin::pin!(stream);
    let mut forwarded = 0;

    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    warn!(error = %e, "Error receiving message from stream");
                    continue;
                }
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = tx.send(delivery) => {
                if sent.is_err() {
                    debug!("Receive loop gone");
                    break;
                }
            }
        }
        forwarded += 1;
    }

    debug!(forwarded, "Message pump stopped");
    forwarded
}

/// Receives until the channel closes or `cancel` fires.
///
/// Cancellation is only observed between messages; a message already taken
/// off the channel is always acked or nacked.
#[tracing::instrument(skip_all, fields(mode = ?mode))]
pub async fn run_receive_loop(
    rx: &mut mpsc::Receiver<Box<dyn Delivery>>,
    mode: &SubscribeMode,
    cancel: &CancellationToken,
) -> ReceiveStats {
    let started = Instant::now();
    let mut stats = ReceiveStats::default();

    loop {
        let delivery = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(delivery) => delivery,
                None => {
                    debug!("Delivery channel closed");
                    break;
                }
            },
        };
        stats.received += 1;

        let handled = match mode {
            SubscribeMode::Archive { dir, prefix } => {
                archive(delivery.payload(), dir, prefix, Local::now().date_naive())
                    .map(Some)
            }
            SubscribeMode::CountOnly => Ok(None),
        };

        match handled {
            Ok(vehicle_id) => match delivery.ack().await {
                Ok(()) => {
                    stats.acked += 1;
                    match vehicle_id {
                        Some(vehicle_id) => {
                            info!(received = stats.received, vehicle_id = %vehicle_id, "Message received");
                        }
                        None if stats.received % COUNT_PROGRESS_EVERY == 0 => {
                            info!(received = stats.received, "Messages received");
                        }
                        None => {}
                    }
                }
                Err(e) => {
                    stats.ack_errors += 1;
                    error!(error = %e, "Failed to acknowledge message");
                }
            },
            Err(e) => {
                error!(error = %format!("{e:#}"), "Failed to handle message, requesting redelivery");
                match delivery.nak().await {
                    Ok(()) => stats.nacked += 1,
                    Err(e) => {
                        stats.ack_errors += 1;
                        warn!(error = %e, "Failed to reject message");
                    }
                }
            }
        }
    }

    stats.elapsed = started.elapsed();
    info!(
        received = stats.received,
        acked = stats.acked,
        nacked = stats.nacked,
        elapsed_secs = stats.elapsed.as_secs_f64(),
        "Receive loop stopped"
    );
    stats
}
