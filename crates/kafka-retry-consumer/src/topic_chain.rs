//! Topic chain model: main topic → retry₁ … retryₙ → dead letter.
//!
//! A chain is built once at startup from configuration and never mutated
//! afterward; lookups (`next_in_chain`, `find_key`) are infallible fast
//! paths over a `HashMap`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ChainError;

/// Groups every link of every chain that shares a handler, so the consumer
/// can dispatch on one key regardless of which link in the chain produced
/// the message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicKey(String);

impl TopicKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The key assigned to a message whose topic isn't part of any chain.
    pub fn default_key() -> Self {
        Self("default".to_string())
    }
}

impl From<&str> for TopicKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Display for TopicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One link in a topic chain: the source topic, a retry topic, or the
/// terminal dead letter.
#[derive(Debug, Clone)]
pub struct KafkaTopic {
    pub name: String,
    pub delay: Duration,
    pub key: TopicKey,
    /// Name of the next link, or `None` for the dead-letter terminus.
    pub next: Option<String>,
}

impl KafkaTopic {
    pub fn is_main(&self) -> bool {
        self.delay.is_zero()
    }

    pub fn is_dead_letter(&self) -> bool {
        self.next.is_none()
    }
}

/// Produces retry and dead-letter topic names for a given group/source-topic
/// pair. A custom implementation can be supplied via `Config` to override the
/// default `retry{n}.{group}.{topic}` / `deadLetter.{group}.{topic}` naming.
pub trait TopicNameGenerator: Send + Sync {
    fn retry_name(&self, group: &str, source_topic: &str, sequence: u8) -> String;
    fn dead_letter_name(&self, group: &str, source_topic: &str) -> String;
}

/// The default naming scheme, matching the literal naming table: `retry{n}.{group}.{topic}`
/// and `deadLetter.{group}.{topic}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTopicNameGenerator;

impl TopicNameGenerator for DefaultTopicNameGenerator {
    fn retry_name(&self, group: &str, source_topic: &str, sequence: u8) -> String {
        format!("retry{sequence}.{group}.{source_topic}")
    }

    fn dead_letter_name(&self, group: &str, source_topic: &str) -> String {
        format!("deadLetter.{group}.{source_topic}")
    }
}

/// The full set of chains for a consumer group: one chain per source topic,
/// all sharing one lookup map so `next_in_chain`/`find_key` are O(1).
#[derive(Clone)]
pub struct TopicChain {
    topics: HashMap<String, KafkaTopic>,
    main: Vec<String>,
}

impl TopicChain {
    /// Builds a chain per source topic: a main link (zero delay), one retry
    /// link per entry in `retry_intervals` (ascending), and a terminal
    /// dead-letter link.
    pub fn new(
        group: &str,
        source_topics: &[String],
        retry_intervals: &[Duration],
        name_generator: Arc<dyn TopicNameGenerator>,
    ) -> Result<Self, ChainError> {
        if group.trim().is_empty() {
            return Err(ChainError::EmptyGroup);
        }
        if source_topics.is_empty() {
            return Err(ChainError::NoSourceTopics);
        }

        let mut topics = HashMap::new();
        let mut main = Vec::with_capacity(source_topics.len());

        for source in source_topics {
            let key = TopicKey::new(source.clone());

            let mut link_names = Vec::with_capacity(retry_intervals.len() + 2);
            link_names.push(source.clone());
            for (idx, _) in retry_intervals.iter().enumerate() {
                link_names.push(name_generator.retry_name(group, source, (idx + 1) as u8));
            }
            link_names.push(name_generator.dead_letter_name(group, source));

            for (idx, name) in link_names.iter().enumerate() {
                let delay = if idx == 0 {
                    Duration::ZERO
                } else {
                    retry_intervals[idx - 1]
                };
                let next = link_names.get(idx + 1).cloned();

                topics.insert(
                    name.clone(),
                    KafkaTopic {
                        name: name.clone(),
                        delay,
                        key: key.clone(),
                        next,
                    },
                );
            }

            main.push(source.clone());
        }

        Ok(Self { topics, main })
    }

    /// Returns the next link after `name`, or `ChainError::NoNextTopic` if
    /// `name` is the terminal dead letter, or `ChainError::TopicNotFound` if
    /// `name` is not part of this chain.
    pub fn next_in_chain(&self, name: &str) -> Result<&KafkaTopic, ChainError> {
        let topic = self
            .topics
            .get(name)
            .ok_or_else(|| ChainError::TopicNotFound(name.to_string()))?;

        match &topic.next {
            Some(next_name) => self
                .topics
                .get(next_name)
                .ok_or_else(|| ChainError::TopicNotFound(next_name.clone())),
            None => Err(ChainError::NoNextTopic(name.to_string())),
        }
    }

    /// Returns the dispatch key for `name`, or the `"default"` key if `name`
    /// is unknown — this lookup is infallible by design so dispatch never
    /// panics on an unrecognized topic.
    pub fn find_key(&self, name: &str) -> TopicKey {
        self.topics
            .get(name)
            .map(|t| t.key.clone())
            .unwrap_or_else(TopicKey::default_key)
    }

    /// Every main (zero-delay) link, one per source topic.
    pub fn main_topics(&self) -> Vec<&KafkaTopic> {
        self.main
            .iter()
            .filter_map(|name| self.topics.get(name))
            .collect()
    }

    /// Every link that a Kafka consumer group should subscribe to in
    /// Kafka-retry mode: main topics and retry topics, never the dead
    /// letter.
    pub fn consumable_topics(&self) -> Vec<&KafkaTopic> {
        self.topics.values().filter(|t| !t.is_dead_letter()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&KafkaTopic> {
        self.topics.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> TopicChain {
        TopicChain::new(
            "orders-svc",
            &["orders.created".to_string()],
            &[Duration::from_secs(30), Duration::from_secs(300)],
            Arc::new(DefaultTopicNameGenerator),
        )
        .unwrap()
    }

    #[test]
    fn builds_main_retry_and_dead_letter_links() {
        let chain = chain();
        assert!(chain.get("orders.created").is_some());
        assert!(chain.get("retry1.orders-svc.orders.created").is_some());
        assert!(chain.get("retry2.orders-svc.orders.created").is_some());
        assert!(chain.get("deadLetter.orders-svc.orders.created").is_some());
    }

    #[test]
    fn next_in_chain_walks_main_to_dead_letter() {
        let chain = chain();
        let r1 = chain.next_in_chain("orders.created").unwrap();
        assert_eq!(r1.name, "retry1.orders-svc.orders.created");

        let r2 = chain.next_in_chain(&r1.name).unwrap();
        assert_eq!(r2.name, "retry2.orders-svc.orders.created");

        let dlq = chain.next_in_chain(&r2.name).unwrap();
        assert_eq!(dlq.name, "deadLetter.orders-svc.orders.created");

        assert!(matches!(
            chain.next_in_chain(&dlq.name),
            Err(ChainError::NoNextTopic(_))
        ));
    }

    #[test]
    fn next_in_chain_rejects_unknown_topic() {
        let chain = chain();
        assert!(matches!(
            chain.next_in_chain("nonexistent"),
            Err(ChainError::TopicNotFound(_))
        ));
    }

    #[test]
    fn find_key_shares_one_key_per_source_topic() {
        let chain = chain();
        let main_key = chain.find_key("orders.created");
        let retry_key = chain.find_key("retry1.orders-svc.orders.created");
        assert_eq!(main_key, retry_key);
    }

    #[test]
    fn find_key_defaults_for_unknown_topic() {
        let chain = chain();
        assert_eq!(chain.find_key("unknown.topic"), TopicKey::default_key());
    }

    #[test]
    fn main_topics_excludes_retries_and_dead_letter() {
        let chain = chain();
        let mains = chain.main_topics();
        assert_eq!(mains.len(), 1);
        assert_eq!(mains[0].name, "orders.created");
    }

    #[test]
    fn consumable_topics_excludes_only_dead_letter() {
        let chain = chain();
        let consumable = chain.consumable_topics();
        assert_eq!(consumable.len(), 3);
        assert!(consumable.iter().all(|t| !t.is_dead_letter()));
    }

    #[test]
    fn rejects_empty_group_and_empty_source_topics() {
        assert!(matches!(
            TopicChain::new("", &["a".to_string()], &[], Arc::new(DefaultTopicNameGenerator)),
            Err(ChainError::EmptyGroup)
        ));
        assert!(matches!(
            TopicChain::new("g", &[], &[], Arc::new(DefaultTopicNameGenerator)),
            Err(ChainError::NoSourceTopics)
        ));
    }
}
