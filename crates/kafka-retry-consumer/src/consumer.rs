//! `MessageConsumer`: the per-message claim loop shared by both collection
//! modes. `handle_message` is extracted as a free function, mirroring the
//! teacher's pattern of pulling per-message logic out of the loop driver so
//! it can be exercised directly in tests without a live Kafka stream.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rdkafka::message::BorrowedMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::failure::Failure;
use crate::kafka::{ConsumerMessage, KafkaConsumer};
use crate::topic_chain::{TopicChain, TopicKey};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// A per-chain message handler, supplied by the caller. Expected to be
/// idempotent, since the pipeline only guarantees at-least-once delivery.
pub type Handler = Arc<dyn Fn(CancellationToken, ConsumerMessage) -> HandlerFuture + Send + Sync>;

pub type HandlerMap = HashMap<TopicKey, Handler>;

/// Drives the per-message claim loop for one Kafka topic link.
pub struct MessageConsumer {
    chain: Arc<TopicChain>,
    handlers: Arc<HandlerMap>,
    failures: mpsc::Sender<Failure>,
}

impl MessageConsumer {
    pub fn new(
        chain: Arc<TopicChain>,
        handlers: Arc<HandlerMap>,
        failures: mpsc::Sender<Failure>,
    ) -> Self {
        Self {
            chain,
            handlers,
            failures,
        }
    }

    /// Runs the claim loop for `consumer`'s subscribed stream until the
    /// stream ends or `cancel` fires.
    pub async fn run(&self, consumer: &KafkaConsumer, cancel: CancellationToken) {
        use futures::StreamExt;

        let stream = consumer.stream();
        futures::pin_mut!(stream);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    break;
                }

                next = stream.next() => {
                    let Some(next) = next else {
                        break;
                    };

                    match next {
                        Ok(borrowed) => {
                            self.handle_borrowed(consumer, &borrowed, cancel.clone()).await;
                        }
                        Err(err) => {
                            error!(error = %err, "error receiving kafka message");
                        }
                    }
                }
            }
        }
    }

    async fn handle_borrowed(
        &self,
        consumer: &KafkaConsumer,
        borrowed: &BorrowedMessage<'_>,
        cancel: CancellationToken,
    ) {
        let msg = ConsumerMessage::from_borrowed(borrowed);

        handle_message(&self.chain, &self.handlers, &self.failures, cancel, msg).await;

        // Offset is committed regardless of handler outcome — "mark
        // processed" is an explicit step, not rdkafka's background
        // auto-commit.
        if let Err(err) = consumer.commit(borrowed) {
            error!(error = %err, "failed to commit kafka offset");
        }
    }
}

/// Resolves a handler for `msg.topic`, invokes it, and on failure emits a
/// `Failure` to `failures` addressed to the next link in `chain`. An unknown
/// topic/handler is logged and the message is still considered processed —
/// the consumer must not wedge on a misconfigured or dead-lettered-but-still-
/// subscribed topic.
pub async fn handle_message(
    chain: &TopicChain,
    handlers: &HandlerMap,
    failures: &mpsc::Sender<Failure>,
    cancel: CancellationToken,
    msg: ConsumerMessage,
) {
    let key = chain.find_key(&msg.topic);

    let Some(handler) = handlers.get(&key) else {
        error!(topic = %msg.topic, key = %key, "no handler registered for topic, message marked processed without dispatch");
        return;
    };

    let topic = msg.topic.clone();
    let partition = msg.partition;
    let offset = msg.offset;

    let result = handler(cancel, msg.clone()).await;

    if let Err(reason) = result {
        match chain.next_in_chain(&topic) {
            Ok(next) => {
                let failure = Failure {
                    reason,
                    topic: topic.clone(),
                    next_topic: next.name.clone(),
                    message: msg.payload,
                    message_key: msg.key,
                    message_headers: msg.headers,
                    kafka_partition: partition,
                    kafka_offset: offset,
                };

                // A brief block here during a shutdown race is accepted;
                // the sink drains until the channel is empty.
                if failures.send(failure).await.is_err() {
                    error!(topic = %topic, "failure channel closed, dropping failure");
                }
            }
            Err(_) => {
                // Dead-letter consumed: nothing further to retry into.
                error!(topic = %topic, reason, "handler failed on terminal topic, dropping");
            }
        }
    }
}
