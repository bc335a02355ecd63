//! NATS JetStream backing for the message-queue traits.
//!
//! A project maps to a stream, a topic to the subject `<project>.<topic>`, and
//! a subscription to a durable pull consumer on that subject.

mod client;
mod delivery;

pub use client::NatsQueue;
