use std::collections::HashSet;

use crate::types::Bytes32;

/// Context of a broadcast topic
pub fn broadcast_context(topic: &str) -> Bytes32 {
    Bytes32::sha256(topic)
}

/// Key a private nonce sequence is tracked under: `topic ‖ group`
pub fn private_context_key(topic: &str, group: &Bytes32) -> Vec<u8> {
    let mut key = Vec::with_capacity(topic.len() + 32);
    key.extend_from_slice(topic.as_bytes());
    key.extend_from_slice(group.as_bytes());
    key
}

/// Pin for one nonce of a private topic: `SHA256(topic ‖ group ‖ author ‖ nonce)`
///
/// The nonce is encoded as 8 bytes, big-endian.
pub fn private_pin(topic: &str, group: &Bytes32, author: &str, nonce: i64) -> Bytes32 {
    let mut preimage = private_context_key(topic, group);
    preimage.extend_from_slice(author.as_bytes());
    preimage.extend_from_slice(&nonce.to_be_bytes());
    Bytes32::sha256(preimage)
}

/// Topics in first-seen order, without repeats
pub fn distinct_topics<'a>(topics: impl IntoIterator<Item = &'a String>) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    topics
        .into_iter()
        .map(String::as_str)
        .filter(|topic| seen.insert(*topic))
        .collect()
}
