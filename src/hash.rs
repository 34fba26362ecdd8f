//! Stable hashing for revision detection.
//!
//! The scheduler decides whether a target or tracked config changed by
//! comparing content hashes stored in the Canary status. Hashes must be
//! stable across processes and insensitive to map ordering, so the input is
//! first normalized into a `serde_json::Value` (whose objects are
//! key-sorted) before being folded through FNV-64a.

use serde::Serialize;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Hash any serializable value into a 16-character hex digest.
///
/// The same algorithm is used for `lastAppliedSpec`, `lastPromotedSpec` and
/// every `trackedConfigs` entry, so hashes computed by different collaborators
/// compare equal.
pub fn compute_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    // Round-trip through Value: serde_json object maps are BTreeMap-backed,
    // which gives a canonical key order regardless of the source container.
    let canonical = serde_json::to_value(value)?;
    let dump = serde_json::to_string(&canonical)?;
    Ok(format!("{:016x}", fnv64a(dump.as_bytes())))
}

fn fnv64a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_same_value_same_hash() {
        let a = compute_hash(&serde_json::json!({"image": "nginx:1.0", "replicas": 3})).unwrap();
        let b = compute_hash(&serde_json::json!({"image": "nginx:1.0", "replicas": 3})).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_different_value_different_hash() {
        let a = compute_hash(&serde_json::json!({"image": "nginx:1.0"})).unwrap();
        let b = compute_hash(&serde_json::json!({"image": "nginx:2.0"})).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_map_ordering_is_irrelevant() {
        // HashMap iteration order is unspecified; the canonical dump must
        // erase it. Build two maps with different insertion orders.
        let mut first = HashMap::new();
        first.insert("zeta", 1);
        first.insert("alpha", 2);
        first.insert("mid", 3);

        let mut second = HashMap::new();
        second.insert("mid", 3);
        second.insert("alpha", 2);
        second.insert("zeta", 1);

        assert_eq!(
            compute_hash(&first).unwrap(),
            compute_hash(&second).unwrap()
        );
    }

    #[test]
    fn test_known_fnv_vector() {
        // FNV-64a of the empty input is the offset basis.
        assert_eq!(fnv64a(b""), 0xcbf2_9ce4_8422_2325);
    }
}
