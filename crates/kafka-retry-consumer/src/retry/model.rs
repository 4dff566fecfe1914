//! Row model for the database-backed retry queue (`kafka_consumer_retries`).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::topic_chain::TopicKey;

/// One configured retry tier for a main topic: polled every
/// `interval`, with `sequence` giving its 1-based position and the dispatch
/// key it shares with every other link in its chain. A row is only due for
/// tier `n` once its `attempts` count equals `n` — a freshly-published row
/// already carries one attempt (the main-topic invocation that failed), so
/// tier 1 is the first one that ever picks it up.
#[derive(Debug, Clone)]
pub struct DbTopicRetry {
    pub interval: Duration,
    pub sequence: u8,
    pub key: TopicKey,
}

/// Every configured retry tier, keyed by main topic name, ascending by
/// sequence.
#[derive(Debug, Clone, Default)]
pub struct DbRetries(HashMap<String, Vec<DbTopicRetry>>);

impl DbRetries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives one `k`-tier table per source topic from the same
    /// `retry_intervals` a `TopicChain` is built from, so DB-retry mode's
    /// table doesn't have to be hand-assembled by the caller.
    pub fn from_config(source_topics: &[String], retry_intervals: &[Duration]) -> Self {
        let mut map = HashMap::with_capacity(source_topics.len());
        for source in source_topics {
            let tiers = retry_intervals
                .iter()
                .enumerate()
                .map(|(idx, interval)| DbTopicRetry {
                    interval: *interval,
                    sequence: (idx + 1) as u8,
                    key: TopicKey::new(source.clone()),
                })
                .collect();
            map.insert(source.clone(), tiers);
        }
        Self(map)
    }
}

impl std::ops::Deref for DbRetries {
    type Target = HashMap<String, Vec<DbTopicRetry>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for DbRetries {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Computed status of a `Retry` row, derived from its flags rather than
/// stored directly — kept in sync with the row-state invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Pending,
    InBatch,
    Errored,
    Successful,
    Deadlettered,
}

/// A row in `kafka_consumer_retries`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Retry {
    pub id: i64,
    pub topic: String,
    pub payload_json: Vec<u8>,
    pub payload_headers: serde_json::Value,
    pub payload_key: Option<Vec<u8>>,
    pub kafka_offset: i64,
    pub kafka_partition: i32,
    pub attempts: i16,
    pub errored: bool,
    pub deadlettered: bool,
    pub successful: bool,
    pub last_error: Option<String>,
    pub batch_id: Option<Uuid>,
    pub retry_started_at: Option<DateTime<Utc>>,
    pub retry_finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Retry {
    /// Derives [`RetryState`] from the row's flags, for logging and tests
    /// without duplicating the boolean logic at every call site.
    pub fn state(&self) -> RetryState {
        if self.deadlettered {
            RetryState::Deadlettered
        } else if self.successful {
            RetryState::Successful
        } else if self.errored {
            RetryState::Errored
        } else if self.batch_id.is_some() {
            RetryState::InBatch
        } else {
            RetryState::Pending
        }
    }

    /// The decoded header map, as raw bytes.
    pub fn decoded_headers(&self) -> HashMap<String, Vec<u8>> {
        crate::failure::Failure::decode_headers(&self.payload_headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_retry() -> Retry {
        Retry {
            id: 1,
            topic: "orders.created".to_string(),
            payload_json: b"{}".to_vec(),
            payload_headers: serde_json::json!({}),
            payload_key: None,
            kafka_offset: 0,
            kafka_partition: 0,
            attempts: 0,
            errored: false,
            deadlettered: false,
            successful: false,
            last_error: None,
            batch_id: None,
            retry_started_at: None,
            retry_finished_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn from_config_builds_one_ascending_tier_per_interval_per_topic() {
        let db_retries = DbRetries::from_config(
            &["orders.created".to_string(), "orders.updated".to_string()],
            &[Duration::from_secs(30), Duration::from_secs(300)],
        );

        for topic in ["orders.created", "orders.updated"] {
            let tiers = db_retries.get(topic).unwrap();
            assert_eq!(tiers.len(), 2);
            assert_eq!(tiers[0].sequence, 1);
            assert_eq!(tiers[0].interval, Duration::from_secs(30));
            assert_eq!(tiers[1].sequence, 2);
            assert_eq!(tiers[1].interval, Duration::from_secs(300));
            assert_eq!(tiers[0].key, TopicKey::new(topic));
        }
    }

    #[test]
    fn state_precedence_prefers_deadlettered_then_successful_then_errored() {
        let mut r = base_retry();
        assert_eq!(r.state(), RetryState::Pending);

        r.batch_id = Some(Uuid::new_v4());
        assert_eq!(r.state(), RetryState::InBatch);

        r.errored = true;
        assert_eq!(r.state(), RetryState::Errored);

        r.successful = true;
        assert_eq!(r.state(), RetryState::Successful);

        r.deadlettered = true;
        assert_eq!(r.state(), RetryState::Deadlettered);
    }
}
