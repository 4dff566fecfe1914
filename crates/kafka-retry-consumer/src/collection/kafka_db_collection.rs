//! DB-retry mode: main-topic consumers plus one poller task per
//! `(topic, sequence)` pair, polling the database-backed retry queue, plus
//! a background maintenance sweep.
//!
//! Each poll cycle runs under its own `tokio::time::timeout`, deliberately
//! independent of the root cancellation token rather than a child of it —
//! there is no Kafka-session object to derive a shorter-lived context from
//! the way there would be with a consumer-group session, so a batch already
//! in flight is allowed to finish under its own 30-second deadline instead of
//! being cut off the instant shutdown begins.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::clock::Clock;
use crate::config::KafkaConfig;
use crate::consumer::{HandlerMap, MessageConsumer};
use crate::error::RunnerError;
use crate::failure::Failure;
use crate::kafka::{ConsumerMessage, KafkaConsumer, connect_to_kafka};
use crate::retry::{DbRetries, RetryManager, RetryRepository};
use crate::sink::{DatabaseFailureSink, FailureSink};
use crate::topic_chain::TopicChain;

use super::Collection;

/// How often each poller checks its topic/sequence pair for due rows.
pub const DB_RETRY_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Deadline for one poll-and-dispatch cycle.
pub const BATCH_DEADLINE: Duration = Duration::from_secs(30);

pub struct KafkaDbCollection<R: RetryRepository + 'static> {
    config: KafkaConfig,
    chain: Arc<TopicChain>,
    handlers: Arc<HandlerMap>,
    db_retries: DbRetries,
    manager: Arc<RetryManager<R>>,
    clock: Arc<dyn Clock>,
    maintenance_interval: Duration,
    consumers: Vec<Arc<KafkaConsumer>>,
}

impl<R: RetryRepository + 'static> KafkaDbCollection<R> {
    pub fn new(
        config: KafkaConfig,
        chain: Arc<TopicChain>,
        handlers: Arc<HandlerMap>,
        db_retries: DbRetries,
        manager: Arc<RetryManager<R>>,
        clock: Arc<dyn Clock>,
        maintenance_interval: Duration,
    ) -> Self {
        Self {
            config,
            chain,
            handlers,
            db_retries,
            manager,
            clock,
            maintenance_interval,
            consumers: Vec::new(),
        }
    }

    fn spawn_poller(&self, topic: String, sequence: u8, poll_interval: Duration, tasks: &TaskTracker, cancel: CancellationToken) {
        let manager = self.manager.clone();
        let handlers = self.handlers.clone();
        let chain = self.chain.clone();

        tasks.spawn(async move {
            let mut ticker = interval(DB_RETRY_POLL_INTERVAL);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let run = timeout(BATCH_DEADLINE, run_batch(&manager, &handlers, &chain, &topic, sequence, poll_interval));
                match run.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => error!(topic = %topic, sequence, error = %err, "retry batch failed"),
                    Err(_) => error!(topic = %topic, sequence, "retry batch exceeded its 30s deadline"),
                }
            }
        });
    }

    fn spawn_maintenance(&self, tasks: &TaskTracker, cancel: CancellationToken) {
        let manager = self.manager.clone();
        let clock = self.clock.clone();
        let maintenance_interval = self.maintenance_interval;

        tasks.spawn(async move {
            let mut ticker = interval(maintenance_interval);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if let Err(err) = manager.run_maintenance(clock.as_ref()).await {
                    error!(error = %err, "maintenance sweep failed");
                }
            }
        });
    }
}

async fn run_batch<R: RetryRepository>(
    manager: &RetryManager<R>,
    handlers: &HandlerMap,
    chain: &TopicChain,
    topic: &str,
    sequence: u8,
    interval: Duration,
) -> Result<(), crate::error::RetryError> {
    let batch = manager.get_batch(topic, sequence, interval).await?;
    if batch.is_empty() {
        return Ok(());
    }

    let key = chain.find_key(topic);

    for row in batch {
        let msg = ConsumerMessage {
            topic: row.topic.clone(),
            partition: row.kafka_partition,
            offset: row.kafka_offset,
            key: row.payload_key.clone().unwrap_or_default(),
            payload: row.payload_json.clone(),
            headers: row.decoded_headers(),
        };

        let Some(handler) = handlers.get(&key) else {
            error!(topic = %row.topic, "no handler registered for retried topic, skipping row");
            continue;
        };

        match handler(CancellationToken::new(), msg).await {
            Ok(()) => {
                if let Err(err) = manager.mark_successful(row).await {
                    error!(error = %err, "failed to mark retry successful");
                }
            }
            Err(reason) => {
                if let Err(err) = manager.mark_errored(row, &reason).await {
                    error!(error = %err, "failed to mark retry errored");
                }
            }
        }
    }

    Ok(())
}

#[async_trait]
impl<R: RetryRepository + 'static> Collection for KafkaDbCollection<R> {
    async fn start(
        &mut self,
        cancel: CancellationToken,
        tasks: &TaskTracker,
    ) -> Result<(), RunnerError> {
        let (failures_tx, failures_rx) = tokio::sync::mpsc::channel::<Failure>(1);
        let sink: Box<dyn FailureSink> = Box::new(DatabaseFailureSink::new(self.manager.clone()));
        sink.listen_for_failures(failures_rx, cancel.clone(), tasks)
            .await;

        for link in self.chain.main_topics() {
            let link = link.clone();
            let config = self.config.clone();

            let consumer = connect_to_kafka(|| KafkaConsumer::new(&config, Some(&link.name)))
                .await
                .map_err(|e| RunnerError::CannotConnectToKafka(e.to_string()))?;
            consumer
                .subscribe(&[link.name.as_str()])
                .map_err(|e| RunnerError::CannotStartConsumers(e.to_string()))?;

            let consumer = Arc::new(consumer);
            self.consumers.push(consumer.clone());

            let message_consumer = MessageConsumer::new(
                self.chain.clone(),
                self.handlers.clone(),
                failures_tx.clone(),
            );
            let cancel = cancel.clone();
            tasks.spawn(async move {
                loop {
                    message_consumer.run(&consumer, cancel.clone()).await;
                    if cancel.is_cancelled() {
                        break;
                    }
                    info!(topic = %link.name, "consumer stream ended, reconnecting");
                }
            });

            if let Some(tiers) = self.db_retries.get(&link.name) {
                for tier in tiers {
                    self.spawn_poller(link.name.clone(), tier.sequence, tier.interval, tasks, cancel.clone());
                }
            }
        }

        self.spawn_maintenance(tasks, cancel);

        Ok(())
    }

    fn close(&mut self) {
        for consumer in self.consumers.drain(..) {
            consumer.close();
        }
        info!("kafka db collection closed");
    }
}
