//! IdentityHashMap strategy. No entry objects here: the table is a flat
//! array with keys in even slots and values in odd slots, probed linearly.

use crate::extract::util::{only_array_field, resolve_u32_path};
use crate::extract::{
    CollectionExtractor, ExtractResult, Extraction, MapEntries, MapEntry, fill_ratio_of,
};
use crate::snapshot::HeapObject;
use crate::types::{Address, NULL_ADDRESS, ObjectId};

pub struct IdentityHashMapExtractor {
    size_field: String,
    array_field: String,
}

impl IdentityHashMapExtractor {
    pub fn new(size_field: &str, array_field: &str) -> Self {
        Self {
            size_field: size_field.to_string(),
            array_field: array_field.to_string(),
        }
    }

    fn table_addresses(&self, coll: &HeapObject) -> ExtractResult<Vec<Address>> {
        let arr = match coll.resolve_object(&self.array_field)? {
            Some(arr) if arr.is_array() => arr,
            _ => match only_array_field(coll)? {
                Some(arr) => arr,
                None => return Ok(Extraction::Unknown),
            },
        };
        Ok(Extraction::Value(
            coll.snapshot().reference_array(arr.id())?,
        ))
    }
}

impl CollectionExtractor for IdentityHashMapExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, coll: &HeapObject) -> ExtractResult<u32> {
        Ok(Extraction::from_option(resolve_u32_path(
            coll,
            &self.size_field,
        )?))
    }

    fn has_capacity(&self) -> bool {
        true
    }

    /// Half the table length: each logical slot spends two array cells.
    fn capacity(&self, coll: &HeapObject) -> ExtractResult<u32> {
        Ok(self
            .table_addresses(coll)?
            .map(|addrs| (addrs.len() / 2) as u32))
    }

    fn has_fill_ratio(&self) -> bool {
        true
    }

    fn fill_ratio(&self, coll: &HeapObject) -> ExtractResult<f64> {
        let size = match self.size(coll)? {
            Extraction::Value(v) => v,
            other => return Ok(other.map(|_| 0.0)),
        };
        Ok(self
            .capacity(coll)?
            .map(|capacity| fill_ratio_of(size, capacity)))
    }

    fn has_collision_ratio(&self) -> bool {
        true
    }

    /// Linear probing leaves no chains to count, so collisions are estimated
    /// from clustering: each pair of adjacent occupied slots suggests one
    /// displaced entry with probability one half.
    fn collision_ratio(&self, coll: &HeapObject) -> ExtractResult<f64> {
        let addrs = match self.table_addresses(coll)? {
            Extraction::Value(a) => a,
            other => return Ok(other.map(|_| 0.0)),
        };
        let mut occupied = 0u32;
        let mut adjacent = 0u32;
        let mut previous_occupied = false;
        for pair in addrs.chunks(2) {
            let used = pair.iter().any(|a| *a != NULL_ADDRESS);
            if used {
                occupied += 1;
                if previous_occupied {
                    adjacent += 1;
                }
            }
            previous_occupied = used;
        }
        if occupied == 0 {
            return Ok(Extraction::Value(0.0));
        }
        Ok(Extraction::Value(0.5 * adjacent as f64 / occupied as f64))
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    /// Everything the map holds, keys and values interleaved in table order.
    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        let addrs = match self.table_addresses(coll)? {
            Extraction::Value(a) => a,
            other => return Ok(other.map(|_| Vec::new())),
        };
        let snap = coll.snapshot();
        let mut ids = Vec::new();
        for addr in addrs {
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
        match coll.resolve_object(&self.array_field)? {
            Some(arr) if arr.is_array() => Ok(Extraction::Value(arr.id())),
            _ => Ok(Extraction::from_option(
                only_array_field(coll)?.map(|a| a.id()),
            )),
        }
    }

    fn non_null_element_count(&self, coll: &HeapObject) -> ExtractResult<u32> {
        Ok(self.extract_entry_ids(coll)?.map(|ids| ids.len() as u32))
    }

    fn has_map_entries(&self) -> bool {
        true
    }

    fn map_entries<'s>(&self, coll: &HeapObject<'s>) -> ExtractResult<MapEntries<'s>> {
        let addrs = match self.table_addresses(coll)? {
            Extraction::Value(a) => a,
            other => return Ok(other.map(|_| MapEntries::empty())),
        };
        let snap = coll.snapshot();
        let entries = addrs
            .chunks(2)
            .map(|pair| (pair[0], pair.get(1).copied().unwrap_or(NULL_ADDRESS)))
            .filter(|(k, v)| *k != NULL_ADDRESS || *v != NULL_ADDRESS)
            .collect::<Vec<_>>()
            .into_iter()
            .map(move |(k, v)| {
                let resolve = |addr: Address| -> Result<Option<HeapObject<'s>>, _> {
                    if addr == NULL_ADDRESS {
                        Ok(None)
                    } else {
                        snap.map_address_to_id(addr)
                            .map(|id| Some(HeapObject::new(snap, id)))
                    }
                };
                Ok(MapEntry {
                    key: resolve(k)?,
                    value: resolve(v)?,
                })
            });
        Ok(Extraction::Value(MapEntries::new(entries)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{HeapDump, HeapDumpBuilder};

    /// 8-cell table (4 logical slots): slots 0 and 1 occupied (adjacent),
    /// slot 3 occupied.
    fn identity_dump() -> (HeapDump, ObjectId, Vec<ObjectId>) {
        let mut b = HeapDumpBuilder::new();
        let cls_map = b.class("java.util.IdentityHashMap");
        let cls_arr = b.class("java.lang.Object[]");
        let cls_s = b.class("java.lang.String");
        let objs: Vec<_> = (0..5).map(|_| b.instance(cls_s)).collect();
        let table = b.ref_array(
            cls_arr,
            &[
                Some(objs[0]),
                Some(objs[1]), // slot 0: k, v
                Some(objs[2]),
                None, // slot 1: key with null value
                None,
                None, // slot 2: empty
                Some(objs[3]),
                Some(objs[4]), // slot 3
            ],
        );
        let map = b.instance(cls_map);
        b.set_int_field(map, "size", 3);
        b.set_ref_field(map, "table", table);
        let dump = b.finish();
        (dump, map, objs)
    }

    fn extractor() -> IdentityHashMapExtractor {
        IdentityHashMapExtractor::new("size", "table")
    }

    #[test]
    fn test_identity_map_size_and_capacity() {
        let (dump, map, _) = identity_dump();
        let coll = HeapObject::new(&dump, map);
        let x = extractor();
        assert_eq!(x.size(&coll).unwrap().value(), Some(3));
        assert_eq!(x.capacity(&coll).unwrap().value(), Some(4));
        assert_eq!(x.fill_ratio(&coll).unwrap().value(), Some(0.75));
        assert_eq!(x.non_null_element_count(&coll).unwrap().value(), Some(5));
    }

    #[test]
    fn test_identity_map_collision_estimate() {
        let (dump, map, _) = identity_dump();
        let coll = HeapObject::new(&dump, map);
        // 3 occupied slots, 1 adjacent pair: 0.5 * 1/3
        let ratio = extractor().collision_ratio(&coll).unwrap().value().unwrap();
        assert!((ratio - 0.5 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_identity_map_entries_pair_slots() {
        let (dump, map, objs) = identity_dump();
        let coll = HeapObject::new(&dump, map);
        let entries: Vec<_> = extractor()
            .map_entries(&coll)
            .unwrap()
            .value()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].key.unwrap().id(), objs[0]);
        assert_eq!(entries[0].value.unwrap().id(), objs[1]);
        // slot 1 has a key but no value
        assert_eq!(entries[1].key.unwrap().id(), objs[2]);
        assert!(entries[1].value.is_none());
    }
}
