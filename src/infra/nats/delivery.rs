use anyhow::{Result, anyhow};
use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use breadcrumb_pipeline::services::message_queue::Delivery;

/// A JetStream message handed to the receive loop.
pub struct JetStreamDelivery(jetstream::Message);

impl JetStreamDelivery {
    pub fn new(message: jetstream::Message) -> Self {
        Self(message)
    }
}

#[async_trait]
impl Delivery for JetStreamDelivery {
    fn payload(&self) -> &[u8] {
        &self.0.message.payload
    }

    async fn ack(&self) -> Result<()> {
        self.0.ack().await.map_err(|e| anyhow!(e))
    }

    async fn nak(&self) -> Result<()> {
        self.0
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| anyhow!(e))
    }
}
