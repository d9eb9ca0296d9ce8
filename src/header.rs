use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agv_id::AgvId;
use crate::topic::Topic;

/// The object envelope embedded in every published object (§3, C8).
///
/// `header_id` is a `uint32` on the wire and wraps at `2^32` per
/// `(client, topic)` pair (§3, §8).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub header_id: u32,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub manufacturer: String,
    pub serial_number: String,
}

impl Header {
    pub fn stamp(
        agv_id: &AgvId,
        version: &str,
        header_id: u32,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            header_id,
            timestamp: timestamp.unwrap_or_else(Utc::now),
            version: version.to_string(),
            manufacturer: agv_id.manufacturer.clone(),
            serial_number: agv_id.serial_number.clone(),
        }
    }
}

/// Per-`(client, topic)` monotonic `headerId` counter, wrapping at `2^32`
/// (§3, §8 invariant).
#[derive(Default)]
pub struct HeaderCounters {
    counters: HashMap<String, u32>,
}

impl HeaderCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(topic: &Topic) -> String {
        topic.to_string()
    }

    /// Returns the next `headerId` for `topic`, advancing the counter by
    /// one with wrapping semantics.
    pub fn next(&mut self, topic: &Topic) -> u32 {
        let key = Self::key(topic);
        let entry = self.counters.entry(key).or_insert(0);
        let current = *entry;
        *entry = entry.wrapping_add(1);
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_is_monotonic_per_topic() {
        let mut counters = HeaderCounters::new();
        assert_eq!(counters.next(&Topic::Order), 0);
        assert_eq!(counters.next(&Topic::Order), 1);
        assert_eq!(counters.next(&Topic::State), 0);
        assert_eq!(counters.next(&Topic::Order), 2);
    }

    #[test]
    fn counter_wraps_at_u32_max() {
        let mut counters = HeaderCounters::new();
        counters.counters.insert(Topic::Order.to_string(), u32::MAX);
        assert_eq!(counters.next(&Topic::Order), u32::MAX);
        assert_eq!(counters.next(&Topic::Order), 0);
    }
}
