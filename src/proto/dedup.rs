//! Suppression of repeated deliveries

use std::{fmt, num::NonZeroUsize};

use serde::{Deserialize, Serialize};

use super::name::{Name, SeqNo};

/// Identifies a delivered object: the hash of its stream identity and sequence number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Compute the id of the object at `seq` in the stream `stream`.
    pub fn new(stream: &Name, seq: SeqNo) -> Self {
        let mut hasher = blake3::Hasher::new();
        stream.hash_into(&mut hasher);
        hasher.update(&seq.to_be_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex representation, for logging.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..5])
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", data_encoding::HEXLOWER.encode(&self.0))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.fmt_short())
    }
}

/// Bounded set of [`ObjectId`]s in insertion order.
///
/// When full, inserting a new id evicts the oldest one. Membership tests never change the
/// eviction order, so the cache is strictly first in, first out.
#[derive(Debug)]
pub struct DedupCache {
    // Only `contains`, `peek_lru` and `push` of absent keys are used, which keeps the
    // recency order equal to the insertion order.
    ids: lru::LruCache<ObjectId, ()>,
}

impl DedupCache {
    /// Create a cache holding up to `capacity` ids. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ids: lru::LruCache::new(capacity),
        }
    }

    /// Whether `id` was inserted and not yet evicted.
    pub fn contains(&self, id: &ObjectId) -> bool {
        self.ids.contains(id)
    }

    /// Insert `id`.
    ///
    /// Returns `false` if it was already present, in which case nothing changes.
    pub fn insert(&mut self, id: ObjectId) -> bool {
        if self.ids.contains(&id) {
            return false;
        }
        self.ids.push(id, ());
        true
    }

    /// The id that will be evicted next.
    pub fn oldest(&self) -> Option<&ObjectId> {
        self.ids.peek_lru().map(|(id, _)| id)
    }

    /// Number of ids in the cache.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Maximum number of ids held.
    pub fn capacity(&self) -> usize {
        self.ids.cap().get()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn id(seq: SeqNo) -> ObjectId {
        ObjectId::new(&"/p".into(), seq)
    }

    #[test]
    fn ids_differ_per_stream_and_seq() {
        assert_ne!(id(1), id(2));
        assert_ne!(ObjectId::new(&"/p".into(), 1), ObjectId::new(&"/q".into(), 1));
        // component boundaries are part of the hash
        assert_ne!(
            ObjectId::new(&"/ab".into(), 1),
            ObjectId::new(&"/a/b".into(), 1)
        );
    }

    #[test]
    fn lookups_do_not_refresh() {
        let mut cache = DedupCache::new(2);
        assert!(cache.insert(id(1)));
        assert!(cache.insert(id(2)));
        assert!(cache.contains(&id(1)));
        assert!(!cache.insert(id(1)));
        assert!(cache.insert(id(3)));
        // 1 was looked up and re-inserted, but is still the oldest
        assert!(!cache.contains(&id(1)));
        assert!(cache.contains(&id(2)));
        assert!(cache.contains(&id(3)));
        assert_eq!(cache.oldest(), Some(&id(2)));
    }

    proptest! {
        #[test]
        fn keeps_most_recent(capacity in 1usize..64, n in 0u64..256) {
            let mut cache = DedupCache::new(capacity);
            for seq in 0..n {
                prop_assert!(cache.insert(id(seq)));
                prop_assert!(cache.contains(&id(seq)));
                prop_assert!(cache.len() <= capacity);
            }
            let kept = (n as usize).min(capacity) as u64;
            prop_assert_eq!(cache.len() as u64, kept);
            for seq in 0..n {
                prop_assert_eq!(cache.contains(&id(seq)), seq >= n - kept);
            }
        }
    }
}
