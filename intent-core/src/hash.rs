//! Process-independent hashing shared by keys and partition placement.
//!
//! `std::hash::DefaultHasher` is randomly seeded per process, so anything that
//! must agree across cluster nodes goes through these helpers instead.

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x1000_0000_01b3;

/// FNV-1a over raw bytes.
#[must_use]
pub fn stable_hash(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, byte| {
        let hash = hash ^ u64::from(*byte);
        hash.wrapping_mul(FNV_PRIME)
    })
}

/// FNV-1a over a string.
#[must_use]
pub fn stable_str_hash(value: &str) -> u64 {
    stable_hash(value.as_bytes())
}

/// Folds a second value into an existing hash.
#[must_use]
pub fn combine(seed: u64, value: u64) -> u64 {
    stable_hash(&value.to_le_bytes()) ^ seed.rotate_left(17).wrapping_mul(FNV_PRIME)
}

/// Highest-random-weight score of `member` for `item`. The member with the
/// highest score owns the item.
#[must_use]
pub fn rendezvous_score(item: u64, member: &str) -> u64 {
    let mut hash = item ^ 0x9e37_79b9_7f4a_7c15;
    for byte in member.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
    }
    // final avalanche so short member ids still spread
    hash ^= hash >> 33;
    hash = hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    hash ^ (hash >> 33)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_hash_is_deterministic() {
        assert_eq!(stable_str_hash("intent"), stable_str_hash("intent"));
        assert_ne!(stable_str_hash("intent-a"), stable_str_hash("intent-b"));
        assert_eq!(stable_hash(&[]), FNV_OFFSET);
    }

    #[test]
    fn rendezvous_prefers_different_members_for_different_items() {
        let members = ["node-1", "node-2", "node-3"];
        let winners: std::collections::HashSet<_> = (0..64_u64)
            .map(|item| {
                members
                    .iter()
                    .max_by_key(|member| rendezvous_score(item, member))
                    .copied()
            })
            .collect();
        assert_eq!(winners.len(), members.len());
    }
}
