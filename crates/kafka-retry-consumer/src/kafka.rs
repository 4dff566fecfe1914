//! Thin `rdkafka` wrappers: an owned message representation that can cross
//! `.await` points, a JSON-capable producer, and a bounded connection-retry
//! helper.

use std::collections::HashMap;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::KafkaConfig;

/// Up to this many connection attempts are made before giving up.
pub const MAX_CONNECTION_ATTEMPTS: u32 = 10;

/// Delay between connection attempts.
pub const CONNECTION_INTERVAL: Duration = Duration::from_millis(500);

/// Owned representation of a consumed Kafka message, so it can be passed to
/// an async handler across `.await` points without rdkafka's borrow on the
/// underlying consumer.
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, Vec<u8>>,
}

impl ConsumerMessage {
    pub fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg.key().map(|k| k.to_vec()).unwrap_or_default();
        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value {
                    headers.insert(header.key.to_string(), raw.to_vec());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            headers,
        }
    }
}

/// A `FutureProducer` wrapper for publishing to retry/dead-letter topics.
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        let producer: FutureProducer = client_config(config)
            .set("message.timeout.ms", "5000")
            .create()?;

        info!(hosts = ?config.hosts, "kafka producer initialized");
        Ok(Self { producer })
    }

    pub async fn send(
        &self,
        topic: &str,
        key: &[u8],
        payload: &[u8],
        headers: Option<rdkafka::message::OwnedHeaders>,
    ) -> Result<(i32, i64), KafkaError> {
        let mut record = FutureRecord::to(topic).key(key).payload(payload);
        if let Some(h) = headers {
            record = record.headers(h);
        }

        let delivery = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| e)?;

        debug!(topic, partition = delivery.partition, offset = delivery.offset, "message sent");
        Ok((delivery.partition, delivery.offset))
    }

    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        key: &[u8],
        value: &T,
    ) -> Result<(i32, i64), KafkaError> {
        let payload = serde_json::to_vec(value)
            .map_err(|_| KafkaError::MessageProduction(RDKafkaErrorCode::InvalidArgument))?;
        self.send(topic, key, &payload, None).await
    }

    /// Flushes any in-flight deliveries before the producer is dropped, so
    /// shutdown doesn't silently lose a retry/dead-letter publish that was
    /// still in librdkafka's internal queue.
    pub fn close(&self) {
        if let Err(err) = self.producer.flush(Duration::from_secs(5)) {
            warn!(error = %err, "kafka producer flush on shutdown failed");
        }
    }
}

/// A `StreamConsumer` wrapper. Offset commit is explicit (`enable.auto.commit`
/// is left off) so "mark processed" is an observable step in the per-message
/// loop rather than rdkafka's periodic background commit.
pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    pub fn new(config: &KafkaConfig, group_suffix: Option<&str>) -> Result<Self, KafkaError> {
        let group_id = match group_suffix {
            Some(suffix) => format!("{}.{}", config.group, suffix),
            None => config.group.clone(),
        };

        let consumer: StreamConsumer = client_config(config)
            .set("group.id", &group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;

        info!(hosts = ?config.hosts, group_id, "kafka consumer initialized");
        Ok(Self { consumer })
    }

    pub fn subscribe(&self, topics: &[&str]) -> Result<(), KafkaError> {
        self.consumer.subscribe(topics)?;
        info!(?topics, "subscribed to kafka topics");
        Ok(())
    }

    pub fn stream(&self) -> rdkafka::consumer::MessageStream<'_> {
        self.consumer.stream()
    }

    /// Explicitly commits the offset for a consumed message, so "mark
    /// processed" is an observable per-message step rather than rdkafka's
    /// periodic background auto-commit.
    pub fn commit(&self, msg: &BorrowedMessage<'_>) -> Result<(), KafkaError> {
        self.consumer.commit_message(msg, CommitMode::Async)
    }

    pub fn close(&self) {
        self.consumer.unsubscribe();
    }
}

fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", config.hosts.join(","));
    if config.tls_enable {
        client_config.set("security.protocol", "ssl");
        if config.tls_skip_verify_peer {
            client_config.set("enable.ssl.certificate.verification", "false");
        }
    }
    client_config
}

/// Bounded connection-retry helper: retries only on the "no brokers
/// reachable" class of error, up to `MAX_CONNECTION_ATTEMPTS` times,
/// `CONNECTION_INTERVAL` apart. Any other error returns immediately.
pub async fn connect_to_kafka<T, F>(mut connect: F) -> Result<T, KafkaError>
where
    F: FnMut() -> Result<T, KafkaError>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match connect() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= MAX_CONNECTION_ATTEMPTS => return Err(err),
            Err(err) if is_out_of_brokers(&err) => {
                warn!(attempt, error = %err, "kafka unreachable, retrying");
                sleep(CONNECTION_INTERVAL).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_out_of_brokers(err: &KafkaError) -> bool {
    matches!(
        err,
        KafkaError::ClientCreation(_) | KafkaError::MessageConsumption(RDKafkaErrorCode::AllBrokersDown)
    )
}
