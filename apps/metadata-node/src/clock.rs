use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Causality relation between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    Before,
    After,
    Equal,
    Concurrent,
}

/// Mapping from node id to monotonic counter, absent entries read as zero.
///
/// Node ids embed a session epoch, so a restarted host never compares
/// `Equal` against clocks it produced in a previous life.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node_id: &str) -> u64 {
        self.0.get(node_id).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn incremented(&self, node_id: &str) -> Self {
        let mut next = self.0.clone();
        *next.entry(node_id.to_string()).or_insert(0) += 1;
        Self(next)
    }

    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut merged = self.0.clone();
        for (node, counter) in &other.0 {
            let slot = merged.entry(node.clone()).or_insert(0);
            *slot = (*slot).max(*counter);
        }
        Self(merged)
    }

    pub fn compare(&self, other: &Self) -> Causality {
        let mut self_greater = false;
        let mut other_greater = false;

        for node in self.0.keys().chain(other.0.keys()) {
            let a = self.get(node);
            let b = other.get(node);
            if a > b {
                self_greater = true;
            } else if b > a {
                other_greater = true;
            }
        }

        match (self_greater, other_greater) {
            (true, false) => Causality::After,
            (false, true) => Causality::Before,
            (false, false) => Causality::Equal,
            (true, true) => Causality::Concurrent,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(raw: &str) -> Self {
        if raw.is_empty() {
            return Self::new();
        }
        serde_json::from_str(raw).map(Self).unwrap_or_default()
    }

    /// Short digest for peer records and summaries.
    pub fn digest(&self) -> String {
        let hash = blake3::hash(self.to_json().as_bytes());
        hash.to_hex()[..16].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        VectorClock(
            entries
                .iter()
                .map(|(node, counter)| (node.to_string(), *counter))
                .collect(),
        )
    }

    #[test]
    fn empty_clocks_are_equal() {
        assert_eq!(VectorClock::new().compare(&VectorClock::new()), Causality::Equal);
    }

    #[test]
    fn increment_establishes_order() {
        let a = VectorClock::new();
        let b = a.incremented("m1");
        assert_eq!(a.compare(&b), Causality::Before);
        assert_eq!(b.compare(&a), Causality::After);
    }

    #[test]
    fn divergent_histories_are_concurrent() {
        let base = VectorClock::new().incremented("m1");
        let left = base.incremented("m1");
        let right = base.incremented("m2");
        assert_eq!(left.compare(&right), Causality::Concurrent);
        assert_eq!(right.compare(&left), Causality::Concurrent);
    }

    #[test]
    fn merge_takes_pointwise_maximum() {
        let left = clock(&[("m1", 3), ("m2", 1)]);
        let right = clock(&[("m1", 1), ("m3", 4)]);
        let merged = left.merged(&right);
        assert_eq!(merged, clock(&[("m1", 3), ("m2", 1), ("m3", 4)]));
        assert_eq!(merged.compare(&left), Causality::After);
        assert_eq!(merged.compare(&right), Causality::After);
    }

    #[test]
    fn compare_is_a_strict_partial_order() {
        let a = clock(&[("m1", 1)]);
        let b = clock(&[("m1", 2)]);
        let c = clock(&[("m1", 2), ("m2", 1)]);

        assert_eq!(a.compare(&b), Causality::Before);
        assert_eq!(b.compare(&c), Causality::Before);
        assert_eq!(a.compare(&c), Causality::Before);
        assert_eq!(a.compare(&a), Causality::Equal);
    }

    #[test]
    fn session_epochs_keep_restarted_nodes_apart() {
        let before_restart = clock(&[("host-1000", 5)]);
        let after_restart = VectorClock::new().incremented("host-2000");
        assert_ne!(before_restart.compare(&after_restart), Causality::Equal);
    }

    #[test]
    fn json_roundtrip_preserves_ordering() {
        let original = clock(&[("m2", 7), ("m1", 3)]);
        let decoded = VectorClock::from_json(&original.to_json());
        assert_eq!(decoded.compare(&original), Causality::Equal);
        assert_eq!(decoded.digest(), original.digest());
    }
}
