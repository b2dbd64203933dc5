//! Deterministic conflict resolution between two replicas of one entity.
//!
//! Causally ordered versions pick the later one. Concurrent versions merge
//! by a type-specific rule; the merged result carries the pointwise-maximum
//! clock so every replica that performs the merge converges on the same row.

use crate::clock::Causality;
use crate::model::{
    EntityPayload, FileRecord, LocationRecord, TagRecord, UserRecord,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    KeepLocal,
    Take(EntityPayload),
}

impl Resolution {
    pub fn changes_local(&self) -> bool {
        matches!(self, Self::Take(_))
    }
}

pub fn resolve(local: &EntityPayload, remote: &EntityPayload) -> Resolution {
    // Registry facts carry no causal history; freshest report wins.
    match (local, remote) {
        (EntityPayload::StorageNode(a), EntityPayload::StorageNode(b)) => {
            return if b.last_heartbeat_ms > a.last_heartbeat_ms {
                Resolution::Take(remote.clone())
            } else {
                Resolution::KeepLocal
            };
        }
        (EntityPayload::Peer(a), EntityPayload::Peer(b)) => {
            return if b.last_seen_ms > a.last_seen_ms {
                Resolution::Take(remote.clone())
            } else {
                Resolution::KeepLocal
            };
        }
        _ => {}
    }

    match local.clock().compare(&remote.clock()) {
        Causality::After | Causality::Equal => Resolution::KeepLocal,
        Causality::Before => Resolution::Take(remote.clone()),
        Causality::Concurrent => merge_concurrent(local, remote),
    }
}

fn merge_concurrent(local: &EntityPayload, remote: &EntityPayload) -> Resolution {
    let merged = match (local, remote) {
        (EntityPayload::User(a), EntityPayload::User(b)) => {
            EntityPayload::User(merge_users(a, b))
        }
        (EntityPayload::File(a), EntityPayload::File(b)) => {
            EntityPayload::File(merge_files(a, b))
        }
        (EntityPayload::Tag(a), EntityPayload::Tag(b)) => EntityPayload::Tag(merge_tags(a, b)),
        (EntityPayload::ChunkLocation(a), EntityPayload::ChunkLocation(b)) => {
            EntityPayload::ChunkLocation(merge_locations(a, b))
        }
        // Chunk descriptors are immutable; concurrent copies of the same id
        // carry identical content, so only the clocks need joining.
        (EntityPayload::Chunk(a), EntityPayload::Chunk(b)) => {
            let mut merged = a.clone();
            merged.clock = a.clock.merged(&b.clock);
            merged.version = a.version.max(b.version);
            EntityPayload::Chunk(merged)
        }
        _ => return Resolution::KeepLocal,
    };

    if &merged == local {
        Resolution::KeepLocal
    } else {
        Resolution::Take(merged)
    }
}

/// Last write wins on the scalar pair; ties break on the lexicographically
/// greater originator id so both sides pick the same winner.
fn later_of<'a, T>(a: &'a T, b: &'a T, stamp: impl Fn(&T) -> i64, origin: impl Fn(&T) -> &str) -> &'a T {
    match stamp(a).cmp(&stamp(b)) {
        std::cmp::Ordering::Greater => a,
        std::cmp::Ordering::Less => b,
        std::cmp::Ordering::Equal => {
            if origin(a) >= origin(b) {
                a
            } else {
                b
            }
        }
    }
}

fn merge_users(a: &UserRecord, b: &UserRecord) -> UserRecord {
    let winner = later_of(
        a,
        b,
        |u| u.token_rotated_at_ms.unwrap_or(u.created_at_ms),
        |u| u.last_modified_by.as_str(),
    );

    let mut merged = winner.clone();
    merged.clock = a.clock.merged(&b.clock);
    merged.version = a.version.max(b.version) + 1;
    merged
}

fn merge_files(a: &FileRecord, b: &FileRecord) -> FileRecord {
    let winner = later_of(
        a,
        b,
        |f| f.created_at_ms,
        |f| f.last_modified_by.as_str(),
    );

    let mut merged = winner.clone();
    // Soft delete is sticky: deleted on either side stays deleted, keeping
    // the earliest tombstone stamp.
    merged.deleted = a.deleted || b.deleted;
    merged.deleted_at_ms = match (a.deleted_at_ms, b.deleted_at_ms) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    };
    merged.clock = a.clock.merged(&b.clock);
    merged.version = a.version.max(b.version) + 1;
    merged
}

fn merge_tags(a: &TagRecord, b: &TagRecord) -> TagRecord {
    let winner = later_of(a, b, |t| t.stamp_ms, |t| t.last_modified_by.as_str());

    let mut merged = winner.clone();
    merged.deleted = a.deleted || b.deleted;
    merged.stamp_ms = a.stamp_ms.max(b.stamp_ms);
    merged.clock = a.clock.merged(&b.clock);
    merged.version = a.version.max(b.version) + 1;
    merged
}

fn merge_locations(a: &LocationRecord, b: &LocationRecord) -> LocationRecord {
    let mut merged = a.clone();
    merged.removed = a.removed || b.removed;
    merged.discovered_at_ms = a.discovered_at_ms.min(b.discovered_at_ms);
    merged.clock = a.clock.merged(&b.clock);
    merged.version = a.version.max(b.version) + 1;
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::model::StorageNodeStatus;

    fn tag(node: &str, deleted: bool, stamp: i64, clock: VectorClock) -> EntityPayload {
        EntityPayload::Tag(TagRecord {
            file_id: "f1".to_string(),
            tag: "x".to_string(),
            deleted,
            stamp_ms: stamp,
            clock,
            last_modified_by: node.to_string(),
            version: 1,
        })
    }

    fn file(node: &str, created: i64, deleted: bool, clock: VectorClock) -> EntityPayload {
        EntityPayload::File(FileRecord {
            file_id: "f1".to_string(),
            owner_id: "u1".to_string(),
            name: "a.txt".to_string(),
            size: 1,
            created_at_ms: created,
            deleted,
            deleted_at_ms: deleted.then_some(created + 5),
            clock,
            last_modified_by: node.to_string(),
            version: 1,
        })
    }

    fn extract(resolution: Resolution, fallback: &EntityPayload) -> EntityPayload {
        match resolution {
            Resolution::KeepLocal => fallback.clone(),
            Resolution::Take(payload) => payload,
        }
    }

    #[test]
    fn causally_later_version_wins() {
        let older = tag("m1", false, 10, VectorClock::new().incremented("m1"));
        let newer = tag(
            "m1",
            true,
            20,
            VectorClock::new().incremented("m1").incremented("m1"),
        );

        assert_eq!(resolve(&newer, &older), Resolution::KeepLocal);
        assert!(resolve(&older, &newer).changes_local());
    }

    #[test]
    fn equal_clocks_keep_local() {
        let clock = VectorClock::new().incremented("m1");
        let a = tag("m1", false, 10, clock.clone());
        let b = tag("m1", false, 10, clock);
        assert_eq!(resolve(&a, &b), Resolution::KeepLocal);
    }

    #[test]
    fn concurrent_tag_tombstone_is_sticky() {
        let added = tag("m1", false, 30, VectorClock::new().incremented("m1"));
        let removed = tag("m2", true, 20, VectorClock::new().incremented("m2"));

        let from_added = extract(resolve(&added, &removed), &added);
        let from_removed = extract(resolve(&removed, &added), &removed);

        // Both replicas converge on a tombstoned record.
        assert_eq!(from_added, from_removed);
        match from_added {
            EntityPayload::Tag(record) => assert!(record.deleted),
            other => panic!("expected tag, got {other:?}"),
        }
    }

    #[test]
    fn concurrent_merge_is_commutative() {
        let a = file("m1", 100, false, VectorClock::new().incremented("m1"));
        let b = file("m2", 200, true, VectorClock::new().incremented("m2"));

        let ab = extract(resolve(&a, &b), &a);
        let ba = extract(resolve(&b, &a), &b);
        assert_eq!(ab, ba);
    }

    #[test]
    fn concurrent_merge_is_associative() {
        let a = file("m1", 100, false, VectorClock::new().incremented("m1"));
        let b = file("m2", 200, false, VectorClock::new().incremented("m2"));
        let c = file("m3", 150, true, VectorClock::new().incremented("m3"));

        let ab_c = {
            let ab = extract(resolve(&a, &b), &a);
            extract(resolve(&ab, &c), &ab)
        };
        let a_bc = {
            let bc = extract(resolve(&b, &c), &b);
            extract(resolve(&a, &bc), &a)
        };

        match (ab_c, a_bc) {
            (EntityPayload::File(left), EntityPayload::File(right)) => {
                assert_eq!(left.name, right.name);
                assert_eq!(left.deleted, right.deleted);
                assert_eq!(left.created_at_ms, right.created_at_ms);
                assert_eq!(left.clock, right.clock);
            }
            other => panic!("expected files, got {other:?}"),
        }
    }

    #[test]
    fn file_soft_delete_survives_concurrent_update() {
        let deleted = file("m1", 100, true, VectorClock::new().incremented("m1"));
        let updated = file("m2", 300, false, VectorClock::new().incremented("m2"));

        let merged = extract(resolve(&deleted, &updated), &deleted);
        match merged {
            EntityPayload::File(record) => {
                assert!(record.deleted);
                assert_eq!(record.created_at_ms, 300);
            }
            other => panic!("expected file, got {other:?}"),
        }
    }

    #[test]
    fn re_resolving_merged_result_is_stable() {
        let a = tag("m1", false, 30, VectorClock::new().incremented("m1"));
        let b = tag("m2", true, 20, VectorClock::new().incremented("m2"));

        let merged = extract(resolve(&a, &b), &a);
        // The merged clock dominates both inputs, so a second exchange with
        // either side changes nothing.
        assert_eq!(resolve(&merged, &a), Resolution::KeepLocal);
        assert_eq!(resolve(&merged, &b), Resolution::KeepLocal);
    }

    #[test]
    fn storage_node_records_resolve_by_freshness() {
        let stale = EntityPayload::StorageNode(crate::model::StorageNodeRecord {
            node_id: common::NodeId::from_string("s1"),
            address: "10.0.0.1:9000".to_string(),
            last_heartbeat_ms: 100,
            capacity_bytes: 0,
            used_bytes: 0,
            status: StorageNodeStatus::Failed,
        });
        let fresh = EntityPayload::StorageNode(crate::model::StorageNodeRecord {
            node_id: common::NodeId::from_string("s1"),
            address: "10.0.0.1:9000".to_string(),
            last_heartbeat_ms: 200,
            capacity_bytes: 0,
            used_bytes: 0,
            status: StorageNodeStatus::Active,
        });

        assert!(resolve(&stale, &fresh).changes_local());
        assert_eq!(resolve(&fresh, &stale), Resolution::KeepLocal);
    }
}
