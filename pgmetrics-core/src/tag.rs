//! Tag identity: a stable 64-bit hash of a canonicalized tagset.
//!
//! The tagset is carried as a `BTreeMap`, so key order is already
//! canonical by construction; this mirrors how the original plugin's
//! upstream sorts tags before hashing, generalized from `BkdrHasher`
//! in cnosdb's series-identity code to a real fast non-cryptographic
//! hash.

use std::collections::BTreeMap;
use std::hash::Hasher;

use twox_hash::XxHash64;

/// A stable identity for one tagset, used as the primary key of a
/// tag table and as the admission cache's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TagId(pub u64);

pub fn tag_id_for(tags: &BTreeMap<String, String>) -> TagId {
    let mut hasher = XxHash64::with_seed(0);
    for (key, value) in tags {
        hasher.write(key.as_bytes());
        hasher.write_u8(0);
        hasher.write(value.as_bytes());
        hasher.write_u8(0);
    }
    TagId(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn same_tagset_hashes_identically_regardless_of_insertion_order() {
        let a = tags(&[("host", "a"), ("region", "us")]);
        let b = tags(&[("region", "us"), ("host", "a")]);
        assert_eq!(tag_id_for(&a), tag_id_for(&b));
    }

    #[test]
    fn different_tagsets_hash_differently() {
        let a = tags(&[("host", "a")]);
        let b = tags(&[("host", "b")]);
        assert_ne!(tag_id_for(&a), tag_id_for(&b));
    }

    #[test]
    fn empty_tagset_is_stable() {
        let empty: BTreeMap<String, String> = BTreeMap::new();
        assert_eq!(tag_id_for(&empty), tag_id_for(&empty));
    }
}
