//! Kafka consumer collection with a staged, durable retry pipeline.
//!
//! Messages read from one or more "main" Kafka topics are dispatched to a
//! caller-supplied handler. A handler that returns an error schedules its
//! message for one or more delayed retries, then dead-letters it once the
//! configured sequence is exhausted. Two retry transports are supported:
//! chained Kafka retry topics ([`collection::KafkaCollection`]) and a
//! relational-database-backed queue ([`collection::KafkaDbCollection`]).
//!
//! [`runner::Runner::run`] is the single entry point; it selects the
//! transport from [`config::Config`], wires every collaborator, and drives
//! them until the supplied `CancellationToken` fires.

pub mod clock;
pub mod collection;
pub mod config;
pub mod consumer;
pub mod error;
pub mod failure;
pub mod kafka;
pub mod retry;
pub mod runner;
pub mod sink;
pub mod topic_chain;

#[cfg(feature = "testkit")]
pub mod testkit;

pub use config::Config;
pub use consumer::{Handler, HandlerMap};
pub use error::RunnerError;
pub use failure::Failure;
pub use runner::Runner;
pub use topic_chain::{TopicChain, TopicKey};
