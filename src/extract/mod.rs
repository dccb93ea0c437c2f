mod arrays;
mod fixed;
mod hashed;
mod identity;
mod linked;
mod segmented;
mod tree;
pub mod util;
mod wrapper;

pub use arrays::{
    ArrayRangeExtractor, FieldArrayExtractor, FieldSizeArrayExtractor, FieldSizedExtractor,
};
pub use fixed::{
    EmptyExtractor, EmptyMapExtractor, NoContentExtractor, PairExtractor,
    ReplicatedValueExtractor, SingletonExtractor, SingletonMapExtractor,
};
pub use hashed::{HashMapExtractor, HashSetExtractor};
pub use identity::IdentityHashMapExtractor;
pub use linked::{ConcurrentSkipListExtractor, LinkedListExtractor};
pub use segmented::SegmentedMapExtractor;
pub use tree::{TreeMapArrayExtractor, TreeMapExtractor, TreeSetExtractor};
pub use wrapper::{
    EntrySetViewExtractor, KeySetViewExtractor, ValuesViewExtractor, WrapperCollectionExtractor,
    WrapperMapExtractor,
};

use crate::snapshot::HeapObject;
use crate::types::{ExtractionError, ObjectId};

/// Three-way outcome of a single extraction capability.
///
/// `Unsupported` means the operation does not apply to this collection shape
/// (asking a tree map for its raw backing array). `Unknown` means the
/// structural heuristics gave up — zero or multiple equally plausible
/// candidates were found, and guessing would be worse than admitting defeat.
/// Callers must treat `Unknown` as "could not determine", never as zero.
///
/// Hard data-integrity faults travel separately as `ExtractionError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction<T> {
    Value(T),
    Unknown,
    Unsupported,
}

pub type ExtractResult<T> = Result<Extraction<T>, ExtractionError>;

impl<T> Extraction<T> {
    pub fn value(self) -> Option<T> {
        match self {
            Extraction::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Extraction<U> {
        match self {
            Extraction::Value(v) => Extraction::Value(f(v)),
            Extraction::Unknown => Extraction::Unknown,
            Extraction::Unsupported => Extraction::Unsupported,
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Extraction::Value(_))
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Extraction::Unknown)
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Extraction::Unsupported)
    }

    /// Converts an absent optional into `Unknown`.
    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => Extraction::Value(v),
            None => Extraction::Unknown,
        }
    }
}

/// One logical (key, value) pair of an extracted map. Either side may be a
/// null reference on the dumped heap.
pub struct MapEntry<'s> {
    pub key: Option<HeapObject<'s>>,
    pub value: Option<HeapObject<'s>>,
}

/// Lazy, forward-only, single-pass sequence of map entries.
///
/// Consuming the iterator is the only way through it; a second pass requires
/// re-invoking the strategy, which re-reads the snapshot from scratch.
pub struct MapEntries<'s> {
    inner: Box<dyn Iterator<Item = Result<MapEntry<'s>, ExtractionError>> + 's>,
}

impl<'s> MapEntries<'s> {
    pub fn new(inner: impl Iterator<Item = Result<MapEntry<'s>, ExtractionError>> + 's) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    pub fn empty() -> Self {
        Self::new(std::iter::empty())
    }
}

impl<'s> Iterator for MapEntries<'s> {
    type Item = Result<MapEntry<'s>, ExtractionError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

/// The capability contract every extraction strategy implements.
///
/// Strategies are stateless policy objects: configuration (field paths) is
/// fixed at registration time and one instance serves every object of its
/// matched class, so they are `Send + Sync` by construction. Every operation
/// must tolerate partial or missing field data and degrade to structural
/// inference rather than failing; the `has_*` predicates are cheap static
/// pre-flight checks on the shape, not on the individual object.
pub trait CollectionExtractor: Send + Sync {
    fn has_size(&self) -> bool {
        false
    }

    /// Logical element count.
    fn size(&self, _coll: &HeapObject) -> ExtractResult<u32> {
        Ok(Extraction::Unsupported)
    }

    fn has_capacity(&self) -> bool {
        false
    }

    /// Backing storage slot count.
    fn capacity(&self, _coll: &HeapObject) -> ExtractResult<u32> {
        Ok(Extraction::Unsupported)
    }

    fn has_fill_ratio(&self) -> bool {
        false
    }

    /// size/capacity, with the 0/0 case pinned to 1.0: an empty collection
    /// with no allocated storage wastes nothing and must not show up in
    /// wasted-space reports.
    fn fill_ratio(&self, _coll: &HeapObject) -> ExtractResult<f64> {
        Ok(Extraction::Unsupported)
    }

    fn has_collision_ratio(&self) -> bool {
        false
    }

    /// Fraction of entries stored beyond the first slot of their hash bucket.
    fn collision_ratio(&self, _coll: &HeapObject) -> ExtractResult<f64> {
        Ok(Extraction::Unsupported)
    }

    fn has_extractable_contents(&self) -> bool {
        false
    }

    /// Flat ordered list of element object ids.
    fn extract_entry_ids(&self, _coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        Ok(Extraction::Unsupported)
    }

    fn has_extractable_array(&self) -> bool {
        false
    }

    /// The single object array the collection is directly backed by, exposed
    /// for zero-copy access by callers that want the raw slots.
    fn backing_array(&self, _coll: &HeapObject) -> ExtractResult<ObjectId> {
        Ok(Extraction::Unsupported)
    }

    /// Count of non-null slots in the backing storage.
    fn non_null_element_count(&self, _coll: &HeapObject) -> ExtractResult<u32> {
        Ok(Extraction::Unsupported)
    }

    fn has_map_entries(&self) -> bool {
        false
    }

    /// Lazy (key, value) pair sequence for map-shaped collections.
    fn map_entries<'s>(&self, _coll: &HeapObject<'s>) -> ExtractResult<MapEntries<'s>> {
        Ok(Extraction::Unsupported)
    }
}

/// size/capacity → fill ratio with the documented 0/0 → 1.0 special case.
pub(crate) fn fill_ratio_of(size: u32, capacity: u32) -> f64 {
    if size == 0 && capacity == 0 {
        1.0
    } else {
        size as f64 / capacity as f64
    }
}

/// Builds the standard lazy entry iterator over extracted entry ids,
/// resolving the key and value fields of each entry object on demand.
///
/// A key field with a trailing `[]` is not resolvable per-entry and must be
/// handled by the owning strategy instead.
pub(crate) fn entries_from_ids<'s>(
    coll: &HeapObject<'s>,
    ids: Vec<ObjectId>,
    key_field: String,
    value_field: String,
) -> MapEntries<'s> {
    let snap = coll.snapshot();
    MapEntries::new(ids.into_iter().map(move |id| {
        let entry = HeapObject::new(snap, id);
        let key = entry.resolve_object(&key_field)?;
        let value = entry.resolve_object(&value_field)?;
        Ok(MapEntry { key, value })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_accessors() {
        let v: Extraction<u32> = Extraction::Value(3);
        assert_eq!(v.value(), Some(3));
        assert!(Extraction::<u32>::Unknown.is_unknown());
        assert!(Extraction::<u32>::Unsupported.is_unsupported());
        assert_eq!(Extraction::Value(2).map(|x: u32| x * 2).value(), Some(4));
        assert_eq!(Extraction::<u32>::from_option(None), Extraction::Unknown);
    }

    #[test]
    fn test_fill_ratio_zero_zero_is_full() {
        assert_eq!(fill_ratio_of(0, 0), 1.0);
        assert_eq!(fill_ratio_of(10, 16), 0.625);
    }
}
