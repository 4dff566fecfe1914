//! `FailureSink`: the transport a `MessageConsumer`'s handler failures are
//! routed to — either republished to the next Kafka retry topic, or
//! persisted to the database-backed retry queue.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::failure::Failure;
use crate::kafka::KafkaProducer;
use crate::retry::{RetryManager, RetryRepository};

#[async_trait]
pub trait FailureSink: Send + Sync {
    /// Drains `failures` until `cancel` fires and the channel is empty —
    /// buffered failures are drained even after cancellation, since dropping
    /// them would contradict at-least-once delivery for messages already
    /// read off Kafka.
    async fn listen_for_failures(
        self: Box<Self>,
        failures: mpsc::Receiver<Failure>,
        cancel: CancellationToken,
        tasks: &TaskTracker,
    );
}

/// Republishes each `Failure` to its next Kafka retry (or dead-letter)
/// topic. A publish error is logged and not retried by the sink — the
/// source offset is already committed, so this is an accepted loss window.
pub struct KafkaFailureSink {
    producer: KafkaProducer,
}

impl KafkaFailureSink {
    pub fn new(producer: KafkaProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl FailureSink for KafkaFailureSink {
    async fn listen_for_failures(
        self: Box<Self>,
        mut failures: mpsc::Receiver<Failure>,
        cancel: CancellationToken,
        tasks: &TaskTracker,
    ) {
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled(), if failures.is_empty() => {
                        info!("failure sink draining complete, exiting");
                        break;
                    }

                    failure = failures.recv() => {
                        let Some(failure) = failure else {
                            break;
                        };

                        if let Err(err) = self
                            .producer
                            .send(&failure.next_topic, &failure.message_key, &failure.message, None)
                            .await
                        {
                            error!(topic = %failure.next_topic, error = %err, "failed to publish to retry topic");
                        }
                    }
                }
            }

            self.producer.close();
        });
    }
}

/// Persists each `Failure` to the database-backed retry queue via
/// `RetryManager::publish_failure`. Errors are logged, not escalated.
pub struct DatabaseFailureSink<R: RetryRepository + 'static> {
    manager: Arc<RetryManager<R>>,
}

impl<R: RetryRepository + 'static> DatabaseFailureSink<R> {
    pub fn new(manager: Arc<RetryManager<R>>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl<R: RetryRepository + 'static> FailureSink for DatabaseFailureSink<R> {
    async fn listen_for_failures(
        self: Box<Self>,
        mut failures: mpsc::Receiver<Failure>,
        cancel: CancellationToken,
        tasks: &TaskTracker,
    ) {
        let manager = self.manager;
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled(), if failures.is_empty() => {
                        info!("failure sink draining complete, exiting");
                        break;
                    }

                    failure = failures.recv() => {
                        let Some(failure) = failure else {
                            break;
                        };

                        if let Err(err) = manager.publish_failure(&failure).await {
                            error!(topic = %failure.topic, error = %err, "failed to persist failure to retry queue");
                        }
                    }
                }
            }
        });
    }
}
