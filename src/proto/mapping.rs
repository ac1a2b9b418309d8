//! Name mappings: which object name hides behind a `(producer, sequence)` pair

use std::{collections::BTreeMap, fmt, ops::RangeInclusive};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::{
    data::{DecodeError, EncodeError, MalformedSnafu, SerializeSnafu},
    name::{Name, SeqNo},
};

/// An inclusive range of sequence numbers.
///
/// A range with `high < low` is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeqRange {
    /// First sequence number in the range.
    pub low: SeqNo,
    /// Last sequence number in the range.
    pub high: SeqNo,
}

impl SeqRange {
    /// Create a new range covering `low..=high`.
    pub const fn new(low: SeqNo, high: SeqNo) -> Self {
        Self { low, high }
    }

    /// Number of sequence numbers in the range, saturating at `u64::MAX`.
    pub fn len(&self) -> u64 {
        match self.high.checked_sub(self.low) {
            Some(diff) => diff.saturating_add(1),
            None => 0,
        }
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.high < self.low
    }

    /// Whether `seq` lies in the range.
    pub fn contains(&self, seq: SeqNo) -> bool {
        self.low <= seq && seq <= self.high
    }

    /// Iterate over the sequence numbers in the range.
    pub fn iter(&self) -> RangeInclusive<SeqNo> {
        self.low..=self.high
    }

    /// Split the range into consecutive chunks of at most `len` sequence numbers.
    ///
    /// Each chunk starts exactly `len` after the previous one. A `len` of zero is treated as one.
    pub fn chunks(&self, len: u64) -> Chunks {
        Chunks {
            next: (!self.is_empty()).then_some(self.low),
            high: self.high,
            len: len.max(1),
        }
    }
}

impl fmt::Display for SeqRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.low, self.high)
    }
}

/// Iterator returned from [`SeqRange::chunks`].
#[derive(Debug, Clone)]
pub struct Chunks {
    next: Option<SeqNo>,
    high: SeqNo,
    len: u64,
}

impl Iterator for Chunks {
    type Item = SeqRange;

    fn next(&mut self) -> Option<Self::Item> {
        let low = self.next?;
        if low > self.high {
            self.next = None;
            return None;
        }
        let high = low.saturating_add(self.len - 1).min(self.high);
        self.next = low.checked_add(self.len);
        Some(SeqRange::new(low, high))
    }
}

/// A list of `(sequence, name)` pairs of a single producer.
///
/// This is what peers exchange, both piggybacked on sync messages and as the response to a
/// mapping lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingList {
    /// The producer all pairs belong to.
    pub producer: Name,
    /// The pairs, in the order they were recorded.
    pub pairs: Vec<(SeqNo, Name)>,
}

impl MappingList {
    /// Create an empty list for `producer`.
    pub fn new(producer: Name) -> Self {
        Self {
            producer,
            pairs: Vec::new(),
        }
    }

    /// Whether the list contains no pairs.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Encode to bytes.
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let bytes = postcard::to_stdvec(self).context(SerializeSnafu {
            what: "mapping list",
        })?;
        Ok(bytes.into())
    }

    /// Decode from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        postcard::from_bytes(bytes).context(MalformedSnafu {
            what: "mapping list",
        })
    }
}

/// Result of [`MappingStore::insert_mapping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The mapping was new.
    Inserted,
    /// The same mapping was already present.
    Unchanged,
    /// A different name was already recorded for the key. The existing mapping is kept.
    Conflict,
}

/// Storage for `(producer, sequence) -> name` mappings.
///
/// A mapping, once recorded, is never replaced by a different name.
pub trait MappingStore: fmt::Debug {
    /// Look up a mapping. `None` means "not yet known", which is not an error.
    fn get_mapping(&self, producer: &Name, seq: SeqNo) -> Option<Name>;

    /// Record a mapping.
    fn insert_mapping(&mut self, producer: &Name, seq: SeqNo, name: Name) -> InsertOutcome;
}

/// A [`MappingStore`] that keeps everything in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryMappingStore {
    mappings: BTreeMap<Name, BTreeMap<SeqNo, Name>>,
}

impl MemoryMappingStore {
    /// Number of mappings stored.
    pub fn len(&self) -> usize {
        self.mappings.values().map(BTreeMap::len).sum()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

impl MappingStore for MemoryMappingStore {
    fn get_mapping(&self, producer: &Name, seq: SeqNo) -> Option<Name> {
        self.mappings.get(producer)?.get(&seq).cloned()
    }

    fn insert_mapping(&mut self, producer: &Name, seq: SeqNo, name: Name) -> InsertOutcome {
        let entries = self.mappings.entry(producer.clone()).or_default();
        match entries.get(&seq) {
            None => {
                entries.insert(seq, name);
                InsertOutcome::Inserted
            }
            Some(existing) if *existing == name => InsertOutcome::Unchanged,
            Some(_) => InsertOutcome::Conflict,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn chunks_advance_by_fixed_len() {
        let chunks: Vec<_> = SeqRange::new(5, 30).chunks(11).collect();
        assert_eq!(
            chunks,
            vec![
                SeqRange::new(5, 15),
                SeqRange::new(16, 26),
                SeqRange::new(27, 30)
            ]
        );
        assert_eq!(SeqRange::new(5, 5).chunks(11).count(), 1);
        assert_eq!(SeqRange::new(6, 5).chunks(11).count(), 0);
        let top: Vec<_> = SeqRange::new(u64::MAX - 3, u64::MAX).chunks(11).collect();
        assert_eq!(top, vec![SeqRange::new(u64::MAX - 3, u64::MAX)]);
    }

    #[test]
    fn store_never_overwrites() {
        let mut store = MemoryMappingStore::default();
        let producer: Name = "/p".into();
        assert_eq!(store.get_mapping(&producer, 1), None);
        assert_eq!(
            store.insert_mapping(&producer, 1, "/a".into()),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_mapping(&producer, 1, "/a".into()),
            InsertOutcome::Unchanged
        );
        assert_eq!(
            store.insert_mapping(&producer, 1, "/b".into()),
            InsertOutcome::Conflict
        );
        assert_eq!(store.get_mapping(&producer, 1), Some("/a".into()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn malformed_list_is_an_error() {
        assert!(MappingList::decode(&[0xff, 0x01]).is_err());
        let list = MappingList {
            producer: "/p".into(),
            pairs: vec![(3, "/a/b".into())],
        };
        assert_eq!(MappingList::decode(&list.encode().unwrap()).unwrap(), list);
    }

    proptest! {
        #[test]
        fn chunks_cover_range(low in 0u64..1_000, span in 0u64..200, len in 1u64..20) {
            let range = SeqRange::new(low, low + span);
            let chunks: Vec<_> = range.chunks(len).collect();
            // contiguous, bounded, starting at low and reaching high
            prop_assert_eq!(chunks.first().map(|c| c.low), Some(range.low));
            prop_assert_eq!(chunks.last().map(|c| c.high), Some(range.high));
            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert!(chunk.len() <= len);
                prop_assert_eq!(chunk.low, range.low + i as u64 * len);
            }
            let covered: u64 = chunks.iter().map(SeqRange::len).sum();
            prop_assert_eq!(covered, range.len());
        }
    }
}
