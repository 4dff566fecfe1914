//! Durable retry store: the `RetryRepository` trait and its Postgres
//! implementation.
//!
//! The table this implementation targets (apply as an external migration —
//! this crate does not execute it):
//!
//! ```sql
//! CREATE TABLE kafka_consumer_retries (
//!     id                 BIGSERIAL PRIMARY KEY,
//!     topic              TEXT NOT NULL,
//!     payload_json       BYTEA NOT NULL,
//!     payload_headers    JSONB NOT NULL DEFAULT '{}',
//!     payload_key        BYTEA,
//!     kafka_offset       BIGINT NOT NULL,
//!     kafka_partition    INT NOT NULL,
//!     attempts           SMALLINT NOT NULL DEFAULT 0,
//!     errored            BOOLEAN NOT NULL DEFAULT false,
//!     deadlettered       BOOLEAN NOT NULL DEFAULT false,
//!     successful         BOOLEAN NOT NULL DEFAULT false,
//!     last_error         TEXT,
//!     batch_id           UUID,
//!     retry_started_at   TIMESTAMPTZ,
//!     retry_finished_at  TIMESTAMPTZ,
//!     created_at         TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     updated_at         TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! CREATE INDEX ON kafka_consumer_retries (topic, attempts, updated_at);
//! CREATE INDEX ON kafka_consumer_retries (batch_id);
//! CREATE INDEX ON kafka_consumer_retries (successful, updated_at);
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use crate::error::RetryError;
use crate::failure::Failure;

use super::model::Retry;

/// Rows leased per `get_messages_for_retry` call.
pub const RETRY_BATCH_SIZE: i64 = 250;

/// A lease older than this is considered abandoned (its owner crashed or was
/// killed mid-batch) and is reclaimed by the next poll.
pub const STALE_LEASE_THRESHOLD: Duration = Duration::from_secs(10 * 60);

/// How long after becoming `successful` a row is eligible for deletion by
/// maintenance.
pub const SUCCESSFUL_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Durable retry store contract. `#[cfg_attr(test, mockall::automock)]`
/// mirrors the teacher's repository-trait convention, giving both an
/// automock for unit-isolated tests and (via `testkit::InMemoryRetryRepository`)
/// a fuller in-process fake for property-style tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RetryRepository: Send + Sync {
    async fn publish_failure(&self, failure: &Failure) -> Result<(), RetryError>;

    async fn get_messages_for_retry(
        &self,
        topic: &str,
        sequence: u8,
        interval: Duration,
    ) -> Result<Vec<Retry>, RetryError>;

    async fn mark_retry_successful(&self, retry: &Retry) -> Result<(), RetryError>;

    async fn mark_retry_errored(&self, retry: &Retry, err: &str) -> Result<(), RetryError>;

    async fn delete_successful(&self, older_than: DateTime<Utc>) -> Result<u64, RetryError>;
}

/// Forwards to the wrapped repository, so a shared `Arc<R>` can back both a
/// `RetryManager` and a caller that needs to inspect the same store directly
/// (e.g. a test asserting on final row state).
#[async_trait]
impl<T: RetryRepository + ?Sized> RetryRepository for Arc<T> {
    async fn publish_failure(&self, failure: &Failure) -> Result<(), RetryError> {
        (**self).publish_failure(failure).await
    }

    async fn get_messages_for_retry(
        &self,
        topic: &str,
        sequence: u8,
        interval: Duration,
    ) -> Result<Vec<Retry>, RetryError> {
        (**self).get_messages_for_retry(topic, sequence, interval).await
    }

    async fn mark_retry_successful(&self, retry: &Retry) -> Result<(), RetryError> {
        (**self).mark_retry_successful(retry).await
    }

    async fn mark_retry_errored(&self, retry: &Retry, err: &str) -> Result<(), RetryError> {
        (**self).mark_retry_errored(retry, err).await
    }

    async fn delete_successful(&self, older_than: DateTime<Utc>) -> Result<u64, RetryError> {
        (**self).delete_successful(older_than).await
    }
}

/// Postgres-backed implementation.
pub struct PgRetryRepository {
    pool: PgPool,
}

impl PgRetryRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RetryRepository for PgRetryRepository {
    #[instrument(skip(self, failure), fields(topic = %failure.topic))]
    async fn publish_failure(&self, failure: &Failure) -> Result<(), RetryError> {
        let headers = failure.encode_headers();

        // A row is published after the main-topic handler has already
        // failed once, so it starts at attempts = 1 — tier 1 (sequence = 1)
        // is the first configured retry that becomes due for it.
        sqlx::query(
            r#"
            INSERT INTO kafka_consumer_retries
                (topic, payload_json, payload_headers, payload_key, kafka_offset, kafka_partition, attempts)
            VALUES ($1, $2, $3, $4, $5, $6, 1)
            "#,
        )
        .bind(&failure.topic)
        .bind(&failure.message)
        .bind(&headers)
        .bind(&failure.message_key)
        .bind(failure.kafka_offset)
        .bind(failure.kafka_partition)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self), fields(topic, sequence))]
    async fn get_messages_for_retry(
        &self,
        topic: &str,
        sequence: u8,
        interval: Duration,
    ) -> Result<Vec<Retry>, RetryError> {
        let batch_id = Uuid::new_v4();
        let now = Utc::now();
        let due_before = now - chrono::Duration::from_std(interval).unwrap_or_default();
        let stale_before =
            now - chrono::Duration::from_std(STALE_LEASE_THRESHOLD).unwrap_or_default();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE kafka_consumer_retries
            SET batch_id = $1, retry_started_at = now()
            WHERE id IN (
                SELECT id FROM kafka_consumer_retries
                WHERE topic = $2
                  AND attempts = $3
                  AND NOT deadlettered
                  AND NOT successful
                  AND updated_at <= $4
                  AND (
                      (batch_id IS NULL AND retry_started_at IS NULL)
                      OR (batch_id IS NOT NULL AND retry_finished_at IS NULL AND retry_started_at < $5)
                  )
                ORDER BY id
                LIMIT $6
                FOR UPDATE
            )
            "#,
        )
        .bind(batch_id)
        .bind(topic)
        .bind(sequence as i16)
        .bind(due_before)
        .bind(stale_before)
        .bind(RETRY_BATCH_SIZE)
        .execute(&mut *tx)
        .await?;

        let rows = sqlx::query_as::<_, Retry>(
            r#"
            SELECT id, topic, payload_json, payload_headers, payload_key, kafka_offset,
                   kafka_partition, attempts, errored, deadlettered, successful, last_error,
                   batch_id, retry_started_at, retry_finished_at, created_at, updated_at
            FROM kafka_consumer_retries
            WHERE batch_id = $1
            "#,
        )
        .bind(batch_id)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(rows)
    }

    #[instrument(skip(self, retry), fields(id = retry.id))]
    async fn mark_retry_successful(&self, retry: &Retry) -> Result<(), RetryError> {
        sqlx::query(
            r#"
            UPDATE kafka_consumer_retries
            SET attempts = $2, errored = false, successful = true, last_error = NULL,
                retry_finished_at = now(), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(retry.id)
        .bind(retry.attempts)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self, retry, err), fields(id = retry.id))]
    async fn mark_retry_errored(&self, retry: &Retry, err: &str) -> Result<(), RetryError> {
        sqlx::query(
            r#"
            UPDATE kafka_consumer_retries
            SET batch_id = NULL, retry_started_at = NULL, attempts = $2, errored = $3,
                deadlettered = $4, last_error = $5, retry_finished_at = now(), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(retry.id)
        .bind(retry.attempts)
        .bind(retry.errored)
        .bind(retry.deadlettered)
        .bind(err)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_successful(&self, older_than: DateTime<Utc>) -> Result<u64, RetryError> {
        let result = sqlx::query(
            "DELETE FROM kafka_consumer_retries WHERE successful = true AND updated_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
