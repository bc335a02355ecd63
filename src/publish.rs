//! Publishing a batch of records, one message per record.
//!
//! Every record is submitted before any confirmation is awaited. The pending
//! confirmations are then drained in whatever order the broker resolves them.
//! Each resolution is counted exactly once in a [`PublishTally`].

use anyhow::{Result, bail};
use bytes::Bytes;
use futures::{FutureExt, StreamExt, stream::FuturesUnordered};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::record::BreadcrumbRecord;
use crate::services::message_queue::{MessageSink, PendingAck, TopicPath};

/// Where a publish run is.
///
/// `Idle → Submitting → Draining → Done`, or `Incomplete` when interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    Idle,
    Submitting,
    Draining,
    Done,
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TallyEvent {
    Submitted,
    Acknowledged,
    Failed,
}

/// Per-run counters. Safe to share with tasks observing the run.
#[derive(Debug, Default)]
pub struct PublishTally {
    submitted: AtomicUsize,
    acknowledged: AtomicUsize,
    failed: AtomicUsize,
}

impl PublishTally {
    /// Bumps the counter for `event` and returns its new value.
    pub fn record(&self, event: TallyEvent) -> usize {
        let counter = match event {
            TallyEvent::Submitted => &self.submitted,
            TallyEvent::Acknowledged => &self.acknowledged,
            TallyEvent::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn acknowledged(&self) -> usize {
        self.acknowledged.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }
}

/// A record the broker never confirmed.
#[derive(Debug, Clone)]
pub struct PublishFailure {
    /// Position of the record in the published batch.
    pub index: usize,
    pub error: String,
}

#[derive(Debug)]
pub struct PublishReport {
    pub state: PublishState,
    pub submitted: usize,
    pub acknowledged: usize,
    pub failed: usize,
    pub failures: Vec<PublishFailure>,
    pub elapsed: Duration,
}

impl PublishReport {
    /// Submitted messages whose confirmation never arrived.
    pub fn unresolved(&self) -> usize {
        self.submitted - self.acknowledged - self.failed
    }

    /// Errors unless every record was submitted and confirmed.
    pub fn ensure_complete(&self) -> Result<()> {
        if self.state != PublishState::Done {
            bail!(
                "publish interrupted: {} of {} submitted messages confirmed",
                self.acknowledged,
                self.submitted
            );
        }
        if self.failed > 0 {
            bail!(
                "{} of {} messages were not delivered",
                self.failed,
                self.submitted
            );
        }
        Ok(())
    }
}

/// Drives one publish run against a sink.
pub struct Publisher<'a, S: MessageSink + ?Sized> {
    sink: &'a S,
    topic: &'a TopicPath,
    tally: Arc<PublishTally>,
    state: PublishState,
}

impl<'a, S: MessageSink + ?Sized> Publisher<'a, S> {
    pub fn new(sink: &'a S, topic: &'a TopicPath) -> Self {
        Self {
            sink,
            topic,
            tally: Arc::new(PublishTally::default()),
            state: PublishState::Idle,
        }
    }

    pub fn state(&self) -> PublishState {
        self.state
    }

    pub fn tally(&self) -> Arc<PublishTally> {
        Arc::clone(&self.tally)
    }

    fn transition(&mut self, next: PublishState) {
        debug!(from = ?self.state, to = ?next, "Publisher state change");
        self.state = next;
    }

    /// Publishes every record and waits for all confirmations.
    ///
    /// Once `cancel` fires nothing more is submitted and the run ends
    /// [`PublishState::Incomplete`] without waiting on what is in flight.
    #[tracing::instrument(skip_all, fields(topic = %self.topic, records = records.len()))]
    pub async fn publish(
        mut self,
        records: &[BreadcrumbRecord],
        cancel: &CancellationToken,
    ) -> PublishReport {
        let started = Instant::now();
        let mut failures = Vec::new();
        let mut pending = FuturesUnordered::new();
        let mut interrupted = false;

        self.transition(PublishState::Submitting);
        for (index, record) in records.iter().enumerate() {
            if cancel.is_cancelled() {
                interrupted = true;
                break;
            }

            self.tally.record(TallyEvent::Submitted);
            match self.submit(record).await {
                Ok(ack) => pending.push(ack.map(move |result| (index, result))),
                Err(e) => {
                    self.tally.record(TallyEvent::Failed);
                    error!(index, error = %e, "Failed to submit message");
                    failures.push(PublishFailure {
                        index,
                        error: format!("{e:#}"),
                    });
                }
            }
        }

        if !interrupted {
            self.transition(PublishState::Draining);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        interrupted = true;
                        break;
                    }
                    next = pending.next() => match next {
                        Some((_, Ok(()))) => {
                            self.tally.record(TallyEvent::Acknowledged);
                        }
                        Some((index, Err(e))) => {
                            self.tally.record(TallyEvent::Failed);
                            error!(index, error = %e, "Message was not acknowledged");
                            failures.push(PublishFailure {
                                index,
                                error: format!("{e:#}"),
                            });
                        }
                        None => break,
                    }
                }
            }
        }

        self.transition(if interrupted {
            PublishState::Incomplete
        } else {
            PublishState::Done
        });

        failures.sort_by_key(|f| f.index);
        let report = PublishReport {
            state: self.state,
            submitted: self.tally.submitted(),
            acknowledged: self.tally.acknowledged(),
            failed: self.tally.failed(),
            failures,
            elapsed: started.elapsed(),
        };

        if interrupted {
            warn!(
                submitted = report.submitted,
                acknowledged = report.acknowledged,
                failed = report.failed,
                unresolved = report.unresolved(),
                "Publish interrupted"
            );
        } else {
            info!(
                published = report.acknowledged,
                failed = report.failed,
                elapsed_secs = report.elapsed.as_secs_f64(),
                "Publish finished"
            );
        }

        report
    }

    async fn submit(&self, record: &BreadcrumbRecord) -> Result<PendingAck> {
        let payload = Bytes::from(serde_json::to_vec(record)?);
        self.sink.submit(self.topic, payload).await
    }
}
