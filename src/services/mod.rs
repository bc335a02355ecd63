//! Seams to external services, so the pipeline can run against fakes in tests.

pub mod message_queue;
