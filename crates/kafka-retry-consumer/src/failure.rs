//! The `Failure` envelope: everything a `FailureSink` needs to re-publish or
//! persist a message whose handler returned an error.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A handler failure, carrying enough of the original message to retry it on
/// the next link in its chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub reason: String,
    pub topic: String,
    pub next_topic: String,
    pub message: Vec<u8>,
    pub message_key: Vec<u8>,
    pub message_headers: HashMap<String, Vec<u8>>,
    pub kafka_partition: i32,
    pub kafka_offset: i64,
}

/// Wire representation of `message_headers` for JSON-backed transports: raw
/// bytes, base64-free, so the header map round-trips byte-for-byte. Absent
/// headers encode as `{}`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct EncodedHeaders(pub HashMap<String, Vec<u8>>);

impl Failure {
    /// Encodes `message_headers` as JSON, per §6's header serialization rule.
    pub fn encode_headers(&self) -> serde_json::Value {
        serde_json::to_value(EncodedHeaders(self.message_headers.clone()))
            .unwrap_or_else(|_| serde_json::json!({}))
    }

    /// Decodes a JSON header object back into raw byte values.
    pub fn decode_headers(value: &serde_json::Value) -> HashMap<String, Vec<u8>> {
        serde_json::from_value::<EncodedHeaders>(value.clone())
            .map(|h| h.0)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_round_trip_byte_for_byte() {
        let mut headers = HashMap::new();
        headers.insert("trace-id".to_string(), vec![0xDE, 0xAD, 0xBE, 0xEF]);

        let failure = Failure {
            reason: "boom".to_string(),
            topic: "orders.created".to_string(),
            next_topic: "retry1.g.orders.created".to_string(),
            message: b"payload".to_vec(),
            message_key: b"key-1".to_vec(),
            message_headers: headers.clone(),
            kafka_partition: 0,
            kafka_offset: 42,
        };

        let encoded = failure.encode_headers();
        let decoded = Failure::decode_headers(&encoded);
        assert_eq!(decoded, headers);
    }

    #[test]
    fn absent_headers_encode_as_empty_object() {
        let failure = Failure {
            reason: "boom".to_string(),
            topic: "t".to_string(),
            next_topic: "t2".to_string(),
            message: Vec::new(),
            message_key: Vec::new(),
            message_headers: HashMap::new(),
            kafka_partition: 0,
            kafka_offset: 0,
        };

        assert_eq!(failure.encode_headers(), serde_json::json!({}));
    }
}
