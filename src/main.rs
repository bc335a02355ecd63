//! CLI entry point for the breadcrumb pipeline.
//!
//! `publish` fetches breadcrumbs for a set of vehicles, snapshots them and
//! publishes one message per record. `replay` republishes a snapshot.
//! `subscribe` archives (or just counts) messages arriving on the topic.

mod infra;

use crate::infra::nats::NatsQueue;
use anyhow::{Context, Result};
use breadcrumb_pipeline::{
    fetch::{BasicClient, DEFAULT_ENDPOINT},
    normalize::Normalizer,
    pipeline::{self, GatherConfig},
    services::message_queue::{Delivery, MessageSink, TopicPath},
    subscribe::{DEFAULT_OUTPUT_PREFIX, SubscribeMode, run_receive_loop},
    vehicles::load_vehicle_ids,
};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "breadcrumb_pipeline")]
#[command(about = "Fetch, publish and archive vehicle breadcrumbs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch breadcrumbs, save a snapshot, and publish every record
    Publish {
        #[command(flatten)]
        vehicles: VehicleSource,

        /// Keep only records whose timestamp fields start with this date
        #[arg(long, value_name = "YYYY-MM-DD")]
        target_date: Option<NaiveDate>,

        /// Add the requested vehicle id to each record as `__vehicle_id`
        #[arg(long, default_value_t = false)]
        tag_vehicle: bool,

        /// Snapshot file written before publishing
        #[arg(short, long, default_value = "bcsample.json")]
        snapshot: PathBuf,

        /// Breadcrumb API endpoint
        #[arg(long, default_value = DEFAULT_ENDPOINT)]
        endpoint: String,

        /// Per-request timeout in seconds
        #[arg(long, default_value_t = 15)]
        timeout_secs: u64,

        #[command(flatten)]
        queue: QueueArgs,
    },
    /// Publish the records in an existing snapshot file
    Replay {
        /// Snapshot file to publish
        #[arg(short, long, default_value = "bcsample.json")]
        snapshot: PathBuf,

        #[command(flatten)]
        queue: QueueArgs,
    },
    /// Receive messages from a subscription until interrupted
    Subscribe {
        /// Durable subscription name
        #[arg(long, env = "BREADCRUMB_SUBSCRIPTION", default_value = "lab-breadcrumbs-sub")]
        subscription: String,

        /// Directory for the dated JSON-lines output
        #[arg(short = 'd', long, default_value = ".")]
        output_dir: PathBuf,

        /// Output file name prefix
        #[arg(long, default_value = DEFAULT_OUTPUT_PREFIX)]
        prefix: String,

        /// Acknowledge and count messages without writing them
        #[arg(long, default_value_t = false)]
        count_only: bool,

        /// Messages buffered between the queue client and the receive loop
        #[arg(long, default_value_t = 256)]
        buffer: usize,

        #[command(flatten)]
        queue: QueueArgs,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct VehicleSource {
    /// Comma-separated vehicle ids
    #[arg(long, value_delimiter = ',')]
    vehicles: Vec<String>,

    /// CSV file of vehicle ids
    #[arg(long)]
    vehicle_csv: Option<PathBuf>,
}

impl VehicleSource {
    fn resolve(self) -> Result<Vec<String>> {
        match self.vehicle_csv {
            Some(path) => load_vehicle_ids(&path),
            None => {
                let ids: Vec<String> = self
                    .vehicles
                    .into_iter()
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .collect();
                anyhow::ensure!(!ids.is_empty(), "No vehicle ids given");
                Ok(ids)
            }
        }
    }
}

#[derive(Args)]
struct QueueArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://localhost:4222")]
    nats_url: String,

    /// Project owning the topic
    #[arg(long, env = "BREADCRUMB_PROJECT", default_value = "breadcrumbs")]
    project: String,

    /// Topic name
    #[arg(long, env = "BREADCRUMB_TOPIC", default_value = "lab-breadcrumbs-topic")]
    topic: String,

    /// Seconds to wait for the queue connection
    #[arg(long, default_value_t = 10)]
    connect_timeout_secs: u64,
}

impl QueueArgs {
    fn topic(&self) -> Result<TopicPath> {
        TopicPath::new(&self.project, &self.topic)
    }

    async fn connect(&self, topic: &TopicPath) -> Result<NatsQueue> {
        let queue =
            NatsQueue::connect(&self.nats_url, Duration::from_secs(self.connect_timeout_secs))
                .await?;
        queue.ensure_stream(topic).await?;
        Ok(queue)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/breadcrumb_pipeline.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("breadcrumb_pipeline.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse().unwrap()));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse().unwrap()));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Publish {
            vehicles,
            target_date,
            tag_vehicle,
            snapshot,
            endpoint,
            timeout_secs,
            queue,
        } => {
            let config = GatherConfig {
                endpoint,
                vehicle_ids: vehicles.resolve()?,
                normalizer: Normalizer {
                    target_date: target_date.map(|d| d.format("%Y-%m-%d").to_string()),
                    tag_vehicle,
                },
            };
            info!(vehicles = config.vehicle_ids.len(), "Using vehicles");

            let topic = queue.topic()?;
            let http_client = BasicClient::with_timeout(Duration::from_secs(timeout_secs))
                .context("Failed to build HTTP client")?;
            let cancel = shutdown_token();

            let gather = pipeline::collect(&http_client, &config, &snapshot, &cancel).await?;
            let sink = queue.connect(&topic).await.with_context(|| {
                format!("Snapshot {} kept; publish it later with `replay`", snapshot.display())
            })?;
            let report = pipeline::deliver(&sink, &topic, gather, &cancel).await;

            for failure in &report.gather.vehicles_failed {
                warn!(
                    vehicle_id = %failure.vehicle_id,
                    kind = failure.error.kind(),
                    "Vehicle skipped"
                );
            }
            report.ensure_delivered()?;
        }
        Commands::Replay { snapshot, queue } => {
            let topic = queue.topic()?;
            let sink = queue.connect(&topic).await?;
            let cancel = shutdown_token();

            let report = pipeline::replay(&sink, &topic, &snapshot, &cancel).await?;
            report.ensure_complete()?;
        }
        Commands::Subscribe {
            subscription,
            output_dir,
            prefix,
            count_only,
            buffer,
            queue,
        } => {
            let topic = queue.topic()?;
            let mode = if count_only {
                SubscribeMode::CountOnly
            } else {
                SubscribeMode::Archive {
                    dir: output_dir,
                    prefix,
                }
            };
            subscribe(&queue, &topic, &subscription, mode, buffer).await?;
        }
    }

    Ok(())
}

/// Runs the receive loop until Ctrl+C, then stops the pump and closes the connection.
#[tracing::instrument(skip(queue, topic, mode), fields(topic = %topic))]
async fn subscribe(
    queue: &QueueArgs,
    topic: &TopicPath,
    subscription: &str,
    mode: SubscribeMode,
    buffer: usize,
) -> Result<()> {
    let nats = queue.connect(topic).await?;
    let cancel = shutdown_token();

    let (tx, mut rx) = mpsc::channel::<Box<dyn Delivery>>(buffer.max(1));
    let pump = nats
        .subscribe(topic, subscription, tx, cancel.child_token())
        .await?;

    info!("Press Ctrl+C to stop");
    let stats = run_receive_loop(&mut rx, &mode, &cancel).await;

    cancel.cancel();
    // Anything still buffered was never acked and will be redelivered.
    drop(rx);
    match pump.await {
        Ok(forwarded) => debug!(forwarded, "Message pump joined"),
        Err(e) => error!(error = %e, "Message pump task failed"),
    }

    info!(
        total_received = stats.received,
        receive_secs = stats.elapsed.as_secs_f64(),
        "Subscriber stopped"
    );

    nats.close().await
}

/// Token cancelled on the first Ctrl+C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, stopping");
                trigger.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });
    token
}
