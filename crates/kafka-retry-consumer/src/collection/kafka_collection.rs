//! Kafka-retry mode: one consumer group per consumable link in the topic
//! chain, each delayed by its link's configured retry interval.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};

use crate::config::KafkaConfig;
use crate::consumer::{HandlerMap, MessageConsumer};
use crate::error::RunnerError;
use crate::failure::Failure;
use crate::kafka::{KafkaConsumer, KafkaProducer, connect_to_kafka};
use crate::sink::{FailureSink, KafkaFailureSink};
use crate::topic_chain::TopicChain;

use super::Collection;

pub struct KafkaCollection {
    config: KafkaConfig,
    chain: Arc<TopicChain>,
    handlers: Arc<HandlerMap>,
    consumers: Vec<Arc<KafkaConsumer>>,
}

impl KafkaCollection {
    pub fn new(config: KafkaConfig, chain: Arc<TopicChain>, handlers: Arc<HandlerMap>) -> Self {
        Self {
            config,
            chain,
            handlers,
            consumers: Vec::new(),
        }
    }
}

#[async_trait]
impl Collection for KafkaCollection {
    async fn start(
        &mut self,
        cancel: CancellationToken,
        tasks: &TaskTracker,
    ) -> Result<(), RunnerError> {
        let producer = KafkaProducer::new(&self.config)
            .map_err(|e| RunnerError::CannotStartFailureProducer(e.to_string()))?;

        let (failures_tx, failures_rx) = tokio::sync::mpsc::channel::<Failure>(1);

        let sink: Box<dyn FailureSink> = Box::new(KafkaFailureSink::new(producer));
        sink.listen_for_failures(failures_rx, cancel.clone(), tasks)
            .await;

        for link in self.chain.consumable_topics() {
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
            let delay = link.delay;
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }

                    message_consumer.run(&consumer, cancel.clone()).await;

                    if cancel.is_cancelled() {
                        break;
                    }
                    info!(topic = %link.name, "consumer stream ended, reconnecting");
                }
            });
        }

        Ok(())
    }

    fn close(&mut self) {
        for consumer in self.consumers.drain(..) {
            consumer.close();
        }
        info!("kafka collection closed");
    }
}
