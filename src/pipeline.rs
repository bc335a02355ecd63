//! Fetch → snapshot → publish, one run at a time.

use anyhow::Result;
use chrono::Utc;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::fetch::{DEFAULT_ENDPOINT, FetchError, HttpClient, fetch_all};
use crate::normalize::Normalizer;
use crate::output::{read_snapshot, write_snapshot};
use crate::publish::{PublishReport, Publisher};
use crate::record::BreadcrumbRecord;
use crate::services::message_queue::{MessageSink, TopicPath};

/// What to fetch and how to prepare it.
#[derive(Debug, Clone)]
pub struct GatherConfig {
    pub endpoint: String,
    pub vehicle_ids: Vec<String>,
    pub normalizer: Normalizer,
}

impl GatherConfig {
    pub fn new(vehicle_ids: Vec<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            vehicle_ids,
            normalizer: Normalizer::default(),
        }
    }
}

/// A vehicle that contributed nothing to the batch.
#[derive(Debug)]
pub struct VehicleFailure {
    pub vehicle_id: String,
    pub error: FetchError,
}

#[derive(Debug)]
pub struct GatherReport {
    /// Enriched records from every vehicle, in vehicle order.
    pub records: Vec<BreadcrumbRecord>,
    pub vehicles_ok: usize,
    pub vehicles_failed: Vec<VehicleFailure>,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct RunReport {
    pub gather: GatherReport,
    /// `None` when the run was interrupted before publishing began.
    pub publish: Option<PublishReport>,
}

impl RunReport {
    /// Errors unless every gathered record was published and confirmed.
    pub fn ensure_delivered(&self) -> Result<()> {
        match &self.publish {
            Some(report) => report.ensure_complete(),
            None => anyhow::bail!(
                "run interrupted before publishing {} records",
                self.gather.records.len()
            ),
        }
    }
}

/// Fetches and normalizes breadcrumbs for every configured vehicle.
pub async fn gather<C: HttpClient + ?Sized>(
    client: &C,
    config: &GatherConfig,
    cancel: &CancellationToken,
) -> GatherReport {
    let started = Instant::now();
    let fetches = fetch_all(client, &config.endpoint, &config.vehicle_ids, cancel).await;

    let mut records = Vec::new();
    let mut vehicles_ok = 0;
    let mut vehicles_failed = Vec::new();

    for fetch in fetches {
        match fetch.result {
            Ok(raw) => {
                vehicles_ok += 1;
                let batch = config
                    .normalizer
                    .normalize_batch(&fetch.vehicle_id, raw, Utc::now());
                records.extend(batch);
            }
            Err(error) => vehicles_failed.push(VehicleFailure {
                vehicle_id: fetch.vehicle_id,
                error,
            }),
        }
    }

    let report = GatherReport {
        records,
        vehicles_ok,
        vehicles_failed,
        elapsed: started.elapsed(),
    };

    info!(
        records = report.records.len(),
        vehicles_ok = report.vehicles_ok,
        vehicles_failed = report.vehicles_failed.len(),
        elapsed_secs = report.elapsed.as_secs_f64(),
        "Gather finished"
    );
    report
}

/// Fetches every vehicle and writes the snapshot. Needs no queue connection,
/// so the snapshot exists even when the broker turns out to be unreachable.
///
/// Failing to write the snapshot aborts the run.
#[tracing::instrument(skip_all, fields(snapshot = %snapshot_path.display()))]
pub async fn collect<C: HttpClient + ?Sized>(
    client: &C,
    config: &GatherConfig,
    snapshot_path: &Path,
    cancel: &CancellationToken,
) -> Result<GatherReport> {
    let gather = gather(client, config, cancel).await;
    write_snapshot(snapshot_path, &gather.records)?;
    Ok(gather)
}

/// Publishes a gathered batch, unless the run was already interrupted, and
/// closes the sink either way.
#[tracing::instrument(skip_all, fields(topic = %topic, records = gather.records.len()))]
pub async fn deliver<S: MessageSink + ?Sized>(
    sink: &S,
    topic: &TopicPath,
    gather: GatherReport,
    cancel: &CancellationToken,
) -> RunReport {
    let publish = if cancel.is_cancelled() {
        warn!(records = gather.records.len(), "Interrupted before publishing; snapshot kept for replay");
        None
    } else {
        Some(Publisher::new(sink, topic).publish(&gather.records, cancel).await)
    };

    close_sink(sink).await;
    RunReport { gather, publish }
}

/// Runs one full fetch, snapshot and publish cycle.
///
/// The snapshot is written before anything is published. The sink is closed
/// on every path past the snapshot, including interruption.
pub async fn run<C, S>(
    client: &C,
    sink: &S,
    topic: &TopicPath,
    config: &GatherConfig,
    snapshot_path: &Path,
    cancel: &CancellationToken,
) -> Result<RunReport>
where
    C: HttpClient + ?Sized,
    S: MessageSink + ?Sized,
{
    let gather = collect(client, config, snapshot_path, cancel).await?;
    Ok(deliver(sink, topic, gather, cancel).await)
}

/// Publishes a previously written snapshot without fetching anything.
///
/// The sink is closed even when the snapshot cannot be read.
#[tracing::instrument(skip_all, fields(topic = %topic, snapshot = %snapshot_path.display()))]
pub async fn replay<S: MessageSink + ?Sized>(
    sink: &S,
    topic: &TopicPath,
    snapshot_path: &Path,
    cancel: &CancellationToken,
) -> Result<PublishReport> {
    let records = match read_snapshot(snapshot_path) {
        Ok(records) => records,
        Err(e) => {
            close_sink(sink).await;
            return Err(e);
        }
    };
    info!(records = records.len(), "Replaying snapshot");

    let report = Publisher::new(sink, topic).publish(&records, cancel).await;
    close_sink(sink).await;
    Ok(report)
}

async fn close_sink<S: MessageSink + ?Sized>(sink: &S) {
    if let Err(e) = sink.close().await {
        error!(error = %e, "Failed to close message queue connection");
    }
}
