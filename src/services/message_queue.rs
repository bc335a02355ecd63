//! Traits and types for talking to a publish/subscribe message queue.

use anyhow::{Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::fmt;

/// A topic, identified by the project that owns it and its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPath {
    pub project: String,
    pub topic: String,
}

impl TopicPath {
    /// Validates both parts: non-empty, no whitespace, and none of `.`, `*`, `>`.
    pub fn new(project: &str, topic: &str) -> Result<Self> {
        check_token("project", project)?;
        check_token("topic", topic)?;
        Ok(Self {
            project: project.to_string(),
            topic: topic.to_string(),
        })
    }

    /// Subject messages for this topic are published on: `<project>.<topic>`.
    pub fn subject(&self) -> String {
        format!("{}.{}", self.project, self.topic)
    }
}

impl fmt::Display for TopicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "projects/{}/topics/{}", self.project, self.topic)
    }
}

fn check_token(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        bail!("{what} name must not be empty");
    }
    if value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '.' | '*' | '>'))
    {
        bail!("{what} name {value:?} may not contain whitespace, '.', '*' or '>'");
    }
    Ok(())
}

/// Resolves once the broker has confirmed (or refused) one message.
pub type PendingAck = BoxFuture<'static, Result<()>>;

/// Write side of the queue.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Hands one message to the client without waiting for the broker's
    /// confirmation; that is what the returned [`PendingAck`] is for.
    async fn submit(&self, topic: &TopicPath, payload: Bytes) -> Result<PendingAck>;

    /// Flushes anything buffered and releases the connection.
    async fn close(&self) -> Result<()>;
}

/// One message pulled from a subscription, acknowledged exactly once.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn payload(&self) -> &[u8];

    /// Marks the message handled.
    async fn ack(&self) -> Result<()>;

    /// Asks the broker to redeliver the message.
    async fn nak(&self) -> Result<()>;
}
