//! Crate-wide error types.
//!
//! One enum per module boundary rather than one giant enum, mirroring the
//! error taxonomy in the design notes: Startup, Transient-infra, Handler,
//! Unknown topic/handler, Cancellation.

use thiserror::Error;

/// Errors raised while building a [`crate::topic_chain::TopicChain`].
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("topic chain has no configured source topics")]
    NoSourceTopics,

    #[error("consumer group id must not be empty")]
    EmptyGroup,

    #[error("kafka host list must not be empty")]
    EmptyHosts,

    #[error("retry interval at position {0} could not be parsed")]
    InvalidInterval(usize),

    #[error("topic {0:?} has no next link (it is the terminal dead-letter)")]
    NoNextTopic(String),

    #[error("topic {0:?} is not part of this chain")]
    TopicNotFound(String),
}

/// Errors raised by [`crate::retry::repository::RetryRepository`] implementations.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failure payload could not be encoded: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors surfaced by [`crate::runner::Runner::run`] before any work starts.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("no handlers were registered")]
    NoHandlers,

    #[error("no source topics are configured")]
    NoTopicsConfigured,

    #[error("could not connect to kafka: {0}")]
    CannotConnectToKafka(String),

    #[error("could not connect to the retry database: {0}")]
    CannotConnectToDb(#[from] sqlx::Error),

    #[error("could not start the failure producer: {0}")]
    CannotStartFailureProducer(String),

    #[error("could not start consumers: {0}")]
    CannotStartConsumers(String),

    #[error("invalid topic chain configuration: {0}")]
    Chain(#[from] ChainError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_error_messages_name_the_offending_topic() {
        let err = ChainError::NoNextTopic("deadLetter.g.orders".to_string());
        assert!(err.to_string().contains("deadLetter.g.orders"));
    }

    #[test]
    fn retry_error_wraps_sqlx() {
        let err: RetryError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, RetryError::Database(_)));
    }
}
