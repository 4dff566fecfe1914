//! Test doubles for exercising the retry pipeline without a live Postgres or
//! Kafka broker. Gated behind the `testkit` feature so the fakes are only
//! compiled for tests (both this crate's own `#[cfg(test)]` modules and the
//! separate `tests/` integration suite, via the self dev-dependency in
//! `Cargo.toml`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::error::RetryError;
use crate::failure::Failure;
use crate::retry::{Retry, RetryRepository};

/// A `Clock` whose `now()` is set explicitly, so tests can move time forward
/// without sleeping real wall-clock seconds.
#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl FakeClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += chrono::Duration::from_std(by).unwrap_or_default();
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap() = now;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// An in-process fake reproducing `PgRetryRepository`'s batch-lease
/// predicate in plain Rust, for property-style tests (no-double-lease,
/// stale-lease reclaim) that would otherwise need a live Postgres.
#[derive(Default)]
pub struct InMemoryRetryRepository {
    rows: Mutex<HashMap<i64, Retry>>,
    next_id: Mutex<i64>,
    clock: Option<FakeClock>,
}

impl InMemoryRetryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: FakeClock) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
            clock: Some(clock),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.as_ref().map(|c| c.now()).unwrap_or_else(Utc::now)
    }

    /// Seeds a row directly, for tests that need to set up a pre-existing
    /// lease state (e.g. a stale in-flight batch).
    pub fn seed(&self, retry: Retry) -> i64 {
        let id = retry.id;
        self.rows.lock().unwrap().insert(id, retry);
        let mut next_id = self.next_id.lock().unwrap();
        if id >= *next_id {
            *next_id = id + 1;
        }
        id
    }

    pub fn snapshot(&self) -> Vec<Retry> {
        self.rows.lock().unwrap().values().cloned().collect()
    }
}

#[async_trait]
impl RetryRepository for InMemoryRetryRepository {
    async fn publish_failure(&self, failure: &Failure) -> Result<(), RetryError> {
        let mut next_id = self.next_id.lock().unwrap();
        let id = *next_id;
        *next_id += 1;

        let now = self.now();
        let retry = Retry {
            id,
            topic: failure.topic.clone(),
            payload_json: failure.message.clone(),
            payload_headers: failure.encode_headers(),
            payload_key: Some(failure.message_key.clone()),
            kafka_offset: failure.kafka_offset,
            kafka_partition: failure.kafka_partition,
            // Mirrors `PgRetryRepository::publish_failure`: the row already
            // carries the failed main-topic attempt, so tier 1 is due first.
            attempts: 1,
            errored: false,
            deadlettered: false,
            successful: false,
            last_error: None,
            batch_id: None,
            retry_started_at: None,
            retry_finished_at: None,
            created_at: now,
            updated_at: now,
        };

        self.rows.lock().unwrap().insert(id, retry);
        Ok(())
    }

    async fn get_messages_for_retry(
        &self,
        topic: &str,
        sequence: u8,
        interval: Duration,
    ) -> Result<Vec<Retry>, RetryError> {
        let now = self.now();
        let due_before = now - chrono::Duration::from_std(interval).unwrap_or_default();
        let stale_before = now
            - chrono::Duration::from_std(super::retry::STALE_LEASE_THRESHOLD).unwrap_or_default();
        let batch_id = uuid::Uuid::new_v4();

        let mut rows = self.rows.lock().unwrap();
        let mut leased = Vec::new();

        let mut ids: Vec<i64> = rows
            .values()
            .filter(|r| {
                r.topic == topic
                    && r.attempts == sequence as i16
                    && !r.deadlettered
                    && !r.successful
                    && r.updated_at <= due_before
                    && ((r.batch_id.is_none() && r.retry_started_at.is_none())
                        || (r.batch_id.is_some()
                            && r.retry_finished_at.is_none()
                            && r.retry_started_at.map(|t| t < stale_before).unwrap_or(false)))
            })
            .map(|r| r.id)
            .collect();
        ids.sort_unstable();
        ids.truncate(super::retry::RETRY_BATCH_SIZE as usize);

        for id in ids {
            if let Some(row) = rows.get_mut(&id) {
                row.batch_id = Some(batch_id);
                row.retry_started_at = Some(now);
                leased.push(row.clone());
            }
        }

        Ok(leased)
    }

    async fn mark_retry_successful(&self, retry: &Retry) -> Result<(), RetryError> {
        let now = self.now();
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&retry.id) {
            row.attempts = retry.attempts;
            row.errored = false;
            row.successful = true;
            row.last_error = None;
            row.retry_finished_at = Some(now);
            row.updated_at = now;
        }
        Ok(())
    }

    async fn mark_retry_errored(&self, retry: &Retry, err: &str) -> Result<(), RetryError> {
        let now = self.now();
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&retry.id) {
            row.batch_id = None;
            row.retry_started_at = None;
            row.attempts = retry.attempts;
            row.errored = retry.errored;
            row.deadlettered = retry.deadlettered;
            row.last_error = Some(err.to_string());
            row.retry_finished_at = Some(now);
            row.updated_at = now;
        }
        Ok(())
    }

    async fn delete_successful(&self, older_than: DateTime<Utc>) -> Result<u64, RetryError> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, r| !(r.successful && r.updated_at < older_than));
        Ok((before - rows.len()) as u64)
    }
}
