//! Strategies for collections backed by a single object array: plain
//! array-field shapes, size-field-plus-array shapes (ArrayList, Vector,
//! PriorityQueue) and index-range shapes (ArrayDeque and friends).

use crate::extract::util::{
    non_null_array_elements, only_array_field, reference_array_to_ids, resolve_u32_path,
};
use crate::extract::{CollectionExtractor, ExtractResult, Extraction, fill_ratio_of};
use crate::snapshot::HeapObject;
use crate::types::{NULL_ADDRESS, ObjectId};

/// Resolves the backing array of `coll` by field path, falling back to the
/// only object array reachable from it when the field is missing from the
/// dump. Ambiguity yields `Unknown`.
fn resolve_backing_array<'s>(
    coll: &HeapObject<'s>,
    array_field: &str,
) -> ExtractResult<HeapObject<'s>> {
    if let Some(obj) = coll.resolve_object(array_field)? {
        if obj.is_array() {
            return Ok(Extraction::Value(obj));
        }
    }
    Ok(Extraction::from_option(only_array_field(coll)?))
}

/// Collection whose element count lives in a plain numeric field and whose
/// storage layout is opaque (no backing array known to us).
pub struct FieldSizedExtractor {
    size_field: String,
}

impl FieldSizedExtractor {
    pub fn new(size_field: &str) -> Self {
        Self {
            size_field: size_field.to_string(),
        }
    }
}

impl CollectionExtractor for FieldSizedExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, coll: &HeapObject) -> ExtractResult<u32> {
        Ok(Extraction::from_option(resolve_u32_path(
            coll,
            &self.size_field,
        )?))
    }
}

/// Collection fully described by its backing array: the logical size is the
/// number of non-null slots.
pub struct FieldArrayExtractor {
    array_field: String,
}

impl FieldArrayExtractor {
    pub fn new(array_field: &str) -> Self {
        Self {
            array_field: array_field.to_string(),
        }
    }

    fn array<'s>(&self, coll: &HeapObject<'s>) -> ExtractResult<HeapObject<'s>> {
        resolve_backing_array(coll, &self.array_field)
    }
}

impl CollectionExtractor for FieldArrayExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, coll: &HeapObject) -> ExtractResult<u32> {
        self.non_null_element_count(coll)
    }

    fn has_capacity(&self) -> bool {
        true
    }

    fn capacity(&self, coll: &HeapObject) -> ExtractResult<u32> {
        match self.array(coll)? {
            Extraction::Value(arr) => Ok(Extraction::Value(
                coll.snapshot().array_length(arr.id())? as u32
            )),
            other => Ok(other.map(|_| 0)),
        }
    }

    fn has_fill_ratio(&self) -> bool {
        true
    }

    fn fill_ratio(&self, coll: &HeapObject) -> ExtractResult<f64> {
        let arr = match self.array(coll)? {
            Extraction::Value(arr) => arr,
            other => return Ok(other.map(|_| 0.0)),
        };
        let capacity = coll.snapshot().array_length(arr.id())? as u32;
        let size = non_null_array_elements(&arr)?;
        Ok(Extraction::Value(fill_ratio_of(size, capacity)))
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        let arr = match self.array(coll)? {
            Extraction::Value(arr) => arr,
            other => return Ok(other.map(|_| Vec::new())),
        };
        let snap = coll.snapshot();
        let addresses = snap.reference_array(arr.id())?;
        Ok(Extraction::Value(reference_array_to_ids(snap, &addresses)?))
    }

    fn has_extractable_array(&self) -> bool {
        true
    }

    fn backing_array(&self, coll: &HeapObject) -> ExtractResult<ObjectId> {
        Ok(self.array(coll)?.map(|arr| arr.id()))
    }

    fn non_null_element_count(&self, coll: &HeapObject) -> ExtractResult<u32> {
        match self.array(coll)? {
            Extraction::Value(arr) => Ok(Extraction::Value(non_null_array_elements(&arr)?)),
            other => Ok(other.map(|_| 0)),
        }
    }
}

/// Backing array plus an explicit size field (ArrayList, Vector,
/// PriorityQueue). Size prefers the field; a dump missing the field degrades
/// to counting non-null slots.
pub struct FieldSizeArrayExtractor {
    size_field: String,
    arrays: FieldArrayExtractor,
}

impl FieldSizeArrayExtractor {
    pub fn new(size_field: &str, array_field: &str) -> Self {
        Self {
            size_field: size_field.to_string(),
            arrays: FieldArrayExtractor::new(array_field),
        }
    }
}

impl CollectionExtractor for FieldSizeArrayExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, coll: &HeapObject) -> ExtractResult<u32> {
        match resolve_u32_path(coll, &self.size_field)? {
            Some(size) => Ok(Extraction::Value(size)),
            None => self.arrays.non_null_element_count(coll),
        }
    }

    fn has_capacity(&self) -> bool {
        true
    }

    fn capacity(&self, coll: &HeapObject) -> ExtractResult<u32> {
        self.arrays.capacity(coll)
    }

    fn has_fill_ratio(&self) -> bool {
        true
    }

    fn fill_ratio(&self, coll: &HeapObject) -> ExtractResult<f64> {
        let size = match self.size(coll)? {
            Extraction::Value(v) => v,
            other => return Ok(other.map(|_| 0.0)),
        };
        let capacity = match self.capacity(coll)? {
            Extraction::Value(v) => v,
            other => return Ok(other.map(|_| 0.0)),
        };
        Ok(Extraction::Value(fill_ratio_of(size, capacity)))
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        self.arrays.extract_entry_ids(coll)
    }

    fn has_extractable_array(&self) -> bool {
        true
    }

    fn backing_array(&self, coll: &HeapObject) -> ExtractResult<ObjectId> {
        self.arrays.backing_array(coll)
    }

    fn non_null_element_count(&self, coll: &HeapObject) -> ExtractResult<u32> {
        self.arrays.non_null_element_count(coll)
    }
}

/// Circular-buffer collection addressed by a [first, last) index pair over a
/// backing array (ArrayDeque, IBM ArrayList variants). Indices wrap, so a
/// last index below the first means the live range crosses the end of the
/// array.
pub struct ArrayRangeExtractor {
    first_field: String,
    last_field: String,
    arrays: FieldArrayExtractor,
}

impl ArrayRangeExtractor {
    pub fn new(first_field: &str, last_field: &str, array_field: &str) -> Self {
        Self {
            first_field: first_field.to_string(),
            last_field: last_field.to_string(),
            arrays: FieldArrayExtractor::new(array_field),
        }
    }

    fn range(&self, coll: &HeapObject, capacity: u32) -> ExtractResult<(u32, u32)> {
        let first = resolve_u32_path(coll, &self.first_field)?;
        let last = resolve_u32_path(coll, &self.last_field)?;
        let (first, last) = match (first, last) {
            (Some(f), Some(l)) => (f, l),
            _ => return Ok(Extraction::Unknown),
        };
        let size = if last >= first {
            last - first
        } else {
            last + capacity - first
        };
        Ok(Extraction::Value((first, size)))
    }
}

impl CollectionExtractor for ArrayRangeExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, coll: &HeapObject) -> ExtractResult<u32> {
        let capacity = match self.capacity(coll)? {
            Extraction::Value(v) => v,
            other => return Ok(other),
        };
        Ok(self.range(coll, capacity)?.map(|(_, size)| size))
    }

    fn has_capacity(&self) -> bool {
        true
    }

    fn capacity(&self, coll: &HeapObject) -> ExtractResult<u32> {
        self.arrays.capacity(coll)
    }

    fn has_fill_ratio(&self) -> bool {
        true
    }

    fn fill_ratio(&self, coll: &HeapObject) -> ExtractResult<f64> {
        let capacity = match self.capacity(coll)? {
            Extraction::Value(v) => v,
            other => return Ok(other.map(|_| 0.0)),
        };
        Ok(self
            .range(coll, capacity)?
            .map(|(_, size)| fill_ratio_of(size, capacity)))
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        let arr = match self.arrays.array(coll)? {
            Extraction::Value(arr) => arr,
            other => return Ok(other.map(|_| Vec::new())),
        };
        let snap = coll.snapshot();
        let addresses = snap.reference_array(arr.id())?;
        let capacity = addresses.len() as u32;
        let (first, size) = match self.range(coll, capacity)? {
            Extraction::Value(r) => r,
            other => return Ok(other.map(|_| Vec::new())),
        };
        if capacity == 0 {
            return Ok(Extraction::Value(Vec::new()));
        }

        let mut ids = Vec::with_capacity(size as usize);
        for offset in 0..size {
            let addr = addresses[((first + offset) % capacity) as usize];
            if addr != NULL_ADDRESS {
                ids.push(snap.map_address_to_id(addr)?);
            }
        }
        Ok(Extraction::Value(ids))
    }

    fn has_extractable_array(&self) -> bool {
        true
    }

    fn backing_array(&self, coll: &HeapObject) -> ExtractResult<ObjectId> {
        self.arrays.backing_array(coll)
    }

    fn non_null_element_count(&self, coll: &HeapObject) -> ExtractResult<u32> {
        self.arrays.non_null_element_count(coll)
    }
}
