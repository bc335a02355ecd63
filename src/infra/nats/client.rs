use anyhow::{Context, Result};
use async_nats::jetstream::{
    self,
    consumer::{AckPolicy, PullConsumer, pull},
    stream::Config as StreamConfig,
};
use async_trait::async_trait;
use breadcrumb_pipeline::services::message_queue::{Delivery, MessageSink, PendingAck, TopicPath};
use breadcrumb_pipeline::subscribe::pump_deliveries;
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::delivery::JetStreamDelivery;

pub struct NatsQueue {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl NatsQueue {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        info!(url = %url, timeout_ms = timeout.as_millis(), "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .connection_timeout(timeout)
            .connect(url)
            .await
            .with_context(|| format!("Failed to connect to NATS at {url}"))?;
        let jetstream = jetstream::new(client.clone());

        info!("Connected to NATS");
        Ok(Self { client, jetstream })
    }

    /// Makes sure the project's stream exists and captures `<project>.>`.
    pub async fn ensure_stream(&self, topic: &TopicPath) -> Result<()> {
        let stream_name = topic.project.as_str();

        match self.jetstream.get_stream(stream_name).await {
            Ok(_) => {
                debug!(stream = %stream_name, "Stream already exists");
            }
            Err(_) => {
                self.jetstream
                    .create_stream(StreamConfig {
                        name: stream_name.to_string(),
                        subjects: vec![format!("{stream_name}.>")],
                        description: Some("Vehicle breadcrumb messages".to_string()),
                        ..Default::default()
                    })
                    .await
                    .with_context(|| format!("Failed to create stream {stream_name}"))?;
                info!(stream = %stream_name, "Created stream");
            }
        }

        Ok(())
    }

    /// Starts pulling from the durable consumer `subscription` and forwards each
    /// message into `tx` until `cancel` fires or the receiver is dropped.
    pub async fn subscribe(
        &self,
        topic: &TopicPath,
        subscription: &str,
        tx: mpsc::Sender<Box<dyn Delivery>>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<usize>> {
        let consumer: PullConsumer = self
            .jetstream
            .create_consumer_on_stream(
                pull::Config {
                    name: Some(subscription.to_string()),
                    durable_name: Some(subscription.to_string()),
                    filter_subject: topic.subject(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
                topic.project.as_str(),
            )
            .await
            .with_context(|| format!("Failed to create consumer {subscription}"))?;

        let messages = consumer
            .messages()
            .await
            .context("Failed to open message stream")?
            .map(|next| {
                next.map(|message| Box::new(JetStreamDelivery::new(message)) as Box<dyn Delivery>)
            });

        info!(subscription, subject = %topic.subject(), "Listening for messages");

        Ok(tokio::spawn(pump_deliveries(messages, tx, cancel)))
    }
}

#[async_trait]
impl MessageSink for NatsQueue {
    async fn submit(&self, topic: &TopicPath, payload: Bytes) -> Result<PendingAck> {
        let ack = self
            .jetstream
            .publish(topic.subject(), payload)
            .await
            .context("Failed to publish message to JetStream")?;

        Ok(async move {
            ack.await
                .map(|_| ())
                .context("Failed to receive JetStream acknowledgment")
        }
        .boxed())
    }

    /// Flushes pending publishes, then drains and closes the connection.
    async fn close(&self) -> Result<()> {
        info!("Closing NATS connection");
        self.client
            .flush()
            .await
            .context("Failed to flush NATS connection")?;
        self.client
            .drain()
            .await
            .context("Failed to drain NATS connection")?;
        debug!("NATS connection closed");
        Ok(())
    }
}
