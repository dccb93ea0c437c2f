//! Strategies for degenerate collection shapes whose answers are constants
//! or a couple of field reads: empty collections, singletons, pairs and
//! replicated-value lists.

use crate::extract::{
    CollectionExtractor, ExtractResult, Extraction, MapEntries, MapEntry,
};
use crate::extract::util::resolve_u32_path;
use crate::snapshot::HeapObject;
use crate::types::ObjectId;

/// Shared empty collection instances (Collections.EMPTY_LIST and friends).
pub struct EmptyExtractor;

impl CollectionExtractor for EmptyExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, _coll: &HeapObject) -> ExtractResult<u32> {
        Ok(Extraction::Value(0))
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    fn extract_entry_ids(&self, _coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        Ok(Extraction::Value(Vec::new()))
    }

    fn non_null_element_count(&self, _coll: &HeapObject) -> ExtractResult<u32> {
        Ok(Extraction::Value(0))
    }
}

/// Shared empty map instances.
pub struct EmptyMapExtractor;

impl CollectionExtractor for EmptyMapExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, _coll: &HeapObject) -> ExtractResult<u32> {
        Ok(Extraction::Value(0))
    }

    fn has_collision_ratio(&self) -> bool {
        true
    }

    fn collision_ratio(&self, _coll: &HeapObject) -> ExtractResult<f64> {
        Ok(Extraction::Value(0.0))
    }

    fn has_map_entries(&self) -> bool {
        true
    }

    fn map_entries<'s>(&self, _coll: &HeapObject<'s>) -> ExtractResult<MapEntries<'s>> {
        Ok(Extraction::Value(MapEntries::empty()))
    }
}

/// Classes known to hold no extractable per-entry content (interned lookup
/// tables, caches with exotic storage). Reporting a definite "nothing to
/// list" here keeps them out of the unknown bucket.
pub struct NoContentExtractor;

impl CollectionExtractor for NoContentExtractor {
    fn has_extractable_contents(&self) -> bool {
        true
    }

    fn extract_entry_ids(&self, _coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        Ok(Extraction::Value(Vec::new()))
    }
}

/// Collections.singleton / singletonList: exactly one element in a named
/// field.
pub struct SingletonExtractor {
    element_field: String,
}

impl SingletonExtractor {
    pub fn new(element_field: &str) -> Self {
        Self {
            element_field: element_field.to_string(),
        }
    }
}

impl CollectionExtractor for SingletonExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, _coll: &HeapObject) -> ExtractResult<u32> {
        Ok(Extraction::Value(1))
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        match coll.resolve_object(&self.element_field)? {
            Some(elem) => Ok(Extraction::Value(vec![elem.id()])),
            None => Ok(Extraction::Value(Vec::new())),
        }
    }
}

/// Collections.singletonMap: one (key, value) pair in two named fields.
pub struct SingletonMapExtractor {
    key_field: String,
    value_field: String,
}

impl SingletonMapExtractor {
    pub fn new(key_field: &str, value_field: &str) -> Self {
        Self {
            key_field: key_field.to_string(),
            value_field: value_field.to_string(),
        }
    }
}

impl CollectionExtractor for SingletonMapExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, _coll: &HeapObject) -> ExtractResult<u32> {
        Ok(Extraction::Value(1))
    }

    fn has_collision_ratio(&self) -> bool {
        true
    }

    fn collision_ratio(&self, _coll: &HeapObject) -> ExtractResult<f64> {
        Ok(Extraction::Value(0.0))
    }

    fn has_map_entries(&self) -> bool {
        true
    }

    fn map_entries<'s>(&self, coll: &HeapObject<'s>) -> ExtractResult<MapEntries<'s>> {
        let key = coll.resolve_object(&self.key_field)?;
        let value = coll.resolve_object(&self.value_field)?;
        Ok(Extraction::Value(MapEntries::new(std::iter::once(Ok(
            MapEntry { key, value },
        )))))
    }
}

/// Two-element holders exposed as collections (Map.Entry views, pairs).
pub struct PairExtractor {
    first_field: String,
    second_field: String,
}

impl PairExtractor {
    pub fn new(first_field: &str, second_field: &str) -> Self {
        Self {
            first_field: first_field.to_string(),
            second_field: second_field.to_string(),
        }
    }
}

impl CollectionExtractor for PairExtractor {
    fn has_size(&self) -> bool {
        true
    }

    /// Null slots do not count; a half-empty pair has size 1.
    fn size(&self, coll: &HeapObject) -> ExtractResult<u32> {
        Ok(self.extract_entry_ids(coll)?.map(|ids| ids.len() as u32))
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        let mut ids = Vec::with_capacity(2);
        if let Some(first) = coll.resolve_object(&self.first_field)? {
            ids.push(first.id());
        }
        if let Some(second) = coll.resolve_object(&self.second_field)? {
            ids.push(second.id());
        }
        Ok(Extraction::Value(ids))
    }
}

/// Collections.nCopies: a count field plus a single shared element.
pub struct ReplicatedValueExtractor {
    count_field: String,
    element_field: String,
}

impl ReplicatedValueExtractor {
    pub fn new(count_field: &str, element_field: &str) -> Self {
        Self {
            count_field: count_field.to_string(),
            element_field: element_field.to_string(),
        }
    }
}

impl CollectionExtractor for ReplicatedValueExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, coll: &HeapObject) -> ExtractResult<u32> {
        Ok(Extraction::from_option(resolve_u32_path(
            coll,
            &self.count_field,
        )?))
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    /// The one shared element, listed once; repeating it `n` times would add
    /// no information and a lot of noise.
    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        match coll.resolve_object(&self.element_field)? {
            Some(elem) => Ok(Extraction::Value(vec![elem.id()])),
            None => Ok(Extraction::Value(Vec::new())),
        }
    }

    fn non_null_element_count(&self, coll: &HeapObject) -> ExtractResult<u32> {
        match coll.resolve_object(&self.element_field)? {
            Some(_) => self.size(coll),
            None => Ok(Extraction::Value(0)),
        }
    }
}
