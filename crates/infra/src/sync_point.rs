//! Durable consumption checkpoint.
//!
//! A [`SyncPoint`] records, per topic, the id of the last delivered log entry plus
//! the time it was taken. On restart the orchestrator resumes every topic from
//! its recorded offset and suppresses log entries stamped at or before the
//! checkpoint time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::topic::Topic;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPoint {
    /// Unix milliseconds.
    pub timestamp: i64,

    /// Last read entry id per topic. Empty for broadcast delivery.
    #[serde(default)]
    pub offsets: BTreeMap<String, String>,
}

impl SyncPoint {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(timestamp: i64, offsets: BTreeMap<String, String>) -> Self {
        Self { timestamp, offsets }
    }

    /// A checkpoint stamped with the current time.
    pub fn stamped_now(offsets: BTreeMap<String, String>) -> Self {
        Self::new(chrono::Utc::now().timestamp_millis(), offsets)
    }

    pub fn offset(&self, topic: &str) -> Option<&str> {
        self.offsets.get(topic).map(String::as_str)
    }

    /// Combine with a later checkpoint: max timestamp, `other` wins on offset conflicts.
    ///
    /// Not commutative; apply in the order workers stopped.
    pub fn merge(&self, other: &SyncPoint) -> SyncPoint {
        let mut merged = self.clone();
        merged.merge_from(other);
        merged
    }

    /// In-place [`SyncPoint::merge`].
    pub fn merge_from(&mut self, other: &SyncPoint) {
        self.timestamp = self.timestamp.max(other.timestamp);
        self.offsets
            .extend(other.offsets.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Turn the recorded offsets into resumable topics.
    pub fn as_topics(&self) -> Vec<Topic> {
        self.offsets
            .iter()
            .map(|(name, offset)| Topic::new(name.as_str()).with_offset(offset.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(ts: i64, offsets: &[(&str, &str)]) -> SyncPoint {
        SyncPoint::new(
            ts,
            offsets
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn merge_takes_max_timestamp_and_right_offsets() {
        let left = point(200, &[("a", "1-0"), ("b", "2-0")]);
        let right = point(100, &[("b", "3-0"), ("c", "4-0")]);

        let merged = left.merge(&right);
        assert_eq!(merged.timestamp, 200);
        assert_eq!(merged, point(200, &[("a", "1-0"), ("b", "3-0"), ("c", "4-0")]));
        // Inputs untouched.
        assert_eq!(left.offset("b"), Some("2-0"));
    }

    #[test]
    fn as_topics_carries_offsets() {
        let topics = point(1, &[("a", "1-0")]).as_topics();
        assert_eq!(topics, vec![Topic::new("a").with_offset("1-0")]);
    }

    #[test]
    fn deserializes_without_offsets() {
        let point: SyncPoint = serde_json::from_str(r#"{"timestamp": 5}"#).unwrap();
        assert_eq!(point, SyncPoint::new(5, BTreeMap::new()));
    }

    mod proptest_tests {
        use super::*;
        use proptest::collection::btree_map;
        use proptest::prelude::*;

        fn arb_point() -> impl Strategy<Value = SyncPoint> {
            (any::<i64>(), btree_map("[a-d]", "[0-9]{1,3}-[0-9]", 0..5))
                .prop_map(|(ts, offsets)| SyncPoint::new(ts, offsets))
        }

        proptest! {
            #[test]
            fn merge_is_left_overridden_by_right(left in arb_point(), right in arb_point()) {
                let merged = left.merge(&right);
                prop_assert_eq!(merged.timestamp, left.timestamp.max(right.timestamp));

                let mut expected = left.offsets.clone();
                for (k, v) in &right.offsets {
                    expected.insert(k.clone(), v.clone());
                }
                prop_assert_eq!(merged.offsets, expected);
            }
        }
    }
}
