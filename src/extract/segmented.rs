//! Segmented concurrent map strategy (pre-Java-8 ConcurrentHashMap): the
//! outer object holds an array of segments, each segment is itself a small
//! hash map handled by whatever strategy its class is registered with.

use crate::extract::{CollectionExtractor, ExtractResult, Extraction, MapEntries};
use crate::registry;
use crate::snapshot::HeapObject;
use crate::types::{NULL_ADDRESS, ObjectId};

pub struct SegmentedMapExtractor {
    segments_field: String,
}

impl SegmentedMapExtractor {
    pub fn new(segments_field: &str) -> Self {
        Self {
            segments_field: segments_field.to_string(),
        }
    }

    fn segments<'s>(&self, coll: &HeapObject<'s>) -> ExtractResult<Vec<HeapObject<'s>>> {
        let arr = match coll.resolve_object(&self.segments_field)? {
            Some(arr) if arr.is_array() => arr,
            _ => return Ok(Extraction::Unknown),
        };
        let snap = coll.snapshot();
        let mut segments = Vec::new();
        for addr in snap.reference_array(arr.id())? {
            if addr != NULL_ADDRESS {
                segments.push(HeapObject::new(snap, snap.map_address_to_id(addr)?));
            }
        }
        Ok(Extraction::Value(segments))
    }
}

impl CollectionExtractor for SegmentedMapExtractor {
    fn has_size(&self) -> bool {
        true
    }

    /// Sum over segments. One unreadable segment makes the total unknown;
    /// a partial sum would be silently wrong.
    fn size(&self, coll: &HeapObject) -> ExtractResult<u32> {
        let segments = match self.segments(coll)? {
            Extraction::Value(s) => s,
            other => return Ok(other.map(|_| 0)),
        };
        let mut total = 0u32;
        for segment in &segments {
            let extractor = match registry::global().extractor_for(segment)? {
                Some(x) => x,
                None => return Ok(Extraction::Unknown),
            };
            match extractor.size(segment)? {
                Extraction::Value(size) => total += size,
                _ => return Ok(Extraction::Unknown),
            }
        }
        Ok(Extraction::Value(total))
    }

    fn has_capacity(&self) -> bool {
        true
    }

    fn capacity(&self, coll: &HeapObject) -> ExtractResult<u32> {
        let segments = match self.segments(coll)? {
            Extraction::Value(s) => s,
            other => return Ok(other.map(|_| 0)),
        };
        let mut total = 0u32;
        for segment in &segments {
            let extractor = match registry::global().extractor_for(segment)? {
                Some(x) => x,
                None => return Ok(Extraction::Unknown),
            };
            match extractor.capacity(segment)? {
                Extraction::Value(capacity) => total += capacity,
                _ => return Ok(Extraction::Unknown),
            }
        }
        Ok(Extraction::Value(total))
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        let segments = match self.segments(coll)? {
            Extraction::Value(s) => s,
            other => return Ok(other.map(|_| Vec::new())),
        };
        let mut ids = Vec::new();
        for segment in &segments {
            let extractor = match registry::global().extractor_for(segment)? {
                Some(x) => x,
                None => return Ok(Extraction::Unknown),
            };
            match extractor.extract_entry_ids(segment)? {
                Extraction::Value(mut segment_ids) => ids.append(&mut segment_ids),
                _ => return Ok(Extraction::Unknown),
            }
        }
        Ok(Extraction::Value(ids))
    }

    fn has_map_entries(&self) -> bool {
        true
    }

    fn map_entries<'s>(&self, coll: &HeapObject<'s>) -> ExtractResult<MapEntries<'s>> {
        let segments = match self.segments(coll)? {
            Extraction::Value(s) => s,
            other => return Ok(other.map(|_| MapEntries::empty())),
        };
        let mut parts = Vec::with_capacity(segments.len());
        for segment in segments {
            let extractor = match registry::global().extractor_for(&segment)? {
                Some(x) => x,
                None => return Ok(Extraction::Unknown),
            };
            match extractor.map_entries(&segment)? {
                Extraction::Value(entries) => parts.push(entries),
                _ => return Ok(Extraction::Unknown),
            }
        }
        Ok(Extraction::Value(MapEntries::new(
            parts.into_iter().flatten(),
        )))
    }
}
