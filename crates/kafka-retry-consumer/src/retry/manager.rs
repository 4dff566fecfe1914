//! Wraps a [`RetryRepository`] with the attempt/state transition rules that
//! decide whether a failed retry is re-queued or dead-lettered.

use std::time::Duration;

use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::RetryError;
use crate::failure::Failure;

use super::model::{DbRetries, Retry};
use super::repository::{RetryRepository, SUCCESSFUL_RETENTION};

pub struct RetryManager<R: RetryRepository> {
    repo: R,
    db_retries: DbRetries,
}

impl<R: RetryRepository> RetryManager<R> {
    pub fn new(repo: R, db_retries: DbRetries) -> Self {
        Self { repo, db_retries }
    }

    pub async fn get_batch(
        &self,
        topic: &str,
        sequence: u8,
        interval: Duration,
    ) -> Result<Vec<Retry>, RetryError> {
        self.repo
            .get_messages_for_retry(topic, sequence, interval)
            .await
    }

    /// Marks `retry` successful, incrementing its attempt count.
    pub async fn mark_successful(&self, mut retry: Retry) -> Result<(), RetryError> {
        retry.attempts += 1;
        retry.errored = false;
        info!(id = retry.id, topic = %retry.topic, attempts = retry.attempts, "retry succeeded");
        self.repo.mark_retry_successful(&retry).await
    }

    /// Marks `retry` errored, incrementing its attempt count and
    /// dead-lettering it once its attempt count has exceeded the highest
    /// configured sequence for its topic (i.e. the last tier's attempt also
    /// errored).
    pub async fn mark_errored(&self, mut retry: Retry, err: &str) -> Result<(), RetryError> {
        retry.attempts += 1;
        retry.errored = true;

        let max_attempts = self.max_sequence_for_topic(&retry.topic);
        if max_attempts > 0 && retry.attempts as u8 > max_attempts {
            retry.deadlettered = true;
            warn!(id = retry.id, topic = %retry.topic, attempts = retry.attempts, "retry exhausted, dead-lettering");
        } else {
            warn!(id = retry.id, topic = %retry.topic, attempts = retry.attempts, error = err, "retry failed, will retry again");
        }

        self.repo.mark_retry_errored(&retry, err).await
    }

    pub async fn publish_failure(&self, failure: &Failure) -> Result<(), RetryError> {
        self.repo.publish_failure(failure).await
    }

    /// Deletes rows that became successful more than an hour ago.
    pub async fn run_maintenance(&self, clock: &dyn Clock) -> Result<u64, RetryError> {
        let older_than = clock.now()
            - chrono::Duration::from_std(SUCCESSFUL_RETENTION).unwrap_or_default();
        let deleted = self.repo.delete_successful(older_than).await?;
        if deleted > 0 {
            info!(deleted, "maintenance purged successful retries");
        }
        Ok(deleted)
    }

    /// The highest configured sequence number for `topic`, or `0` if the
    /// topic has no configured retry tiers.
    pub fn max_sequence_for_topic(&self, topic: &str) -> u8 {
        self.db_retries
            .get(topic)
            .and_then(|tiers| tiers.iter().map(|t| t.sequence).max())
            .unwrap_or(0)
    }
}
