//! Strategies for open-hashing maps and the sets built on them: HashMap,
//! Hashtable, WeakHashMap, HashSet and vendor variants.
//!
//! The interesting part is chain walking. Entry objects link to the next
//! entry of their bucket, but field names may be absent from the dump, so
//! the walk is structural: from each entry, every outbound referent of the
//! entry's own class is a chain continuation. A visited set makes corrupt
//! or cyclic chains terminate, and tree-ified buckets (HashMap$TreeBin)
//! fall out naturally because tree nodes reference their neighbors with
//! same-class links too.

use fixedbitset::FixedBitSet;

use crate::extract::util::{
    follow_only_outgoing_except_last, non_null_array_elements, only_array_field,
};
use crate::extract::{
    CollectionExtractor, ExtractResult, Extraction, MapEntries, entries_from_ids, fill_ratio_of,
};
use crate::extract::util::resolve_u32_path;
use crate::snapshot::{HeapObject, Snapshot};
use crate::types::{ExtractionError, NULL_ADDRESS, ObjectId};

const TREE_BIN_CLASS: &str = "java.util.HashMap$TreeBin";
const PLAIN_OBJECT_CLASS: &str = "java.lang.Object";

/// Bucket-array hash map with chained entries.
pub struct HashMapExtractor {
    size_field: String,
    array_field: String,
    key_field: String,
    value_field: String,
}

impl HashMapExtractor {
    pub fn new(size_field: &str, array_field: &str, key_field: &str, value_field: &str) -> Self {
        Self {
            size_field: size_field.to_string(),
            array_field: array_field.to_string(),
            key_field: key_field.to_string(),
            value_field: value_field.to_string(),
        }
    }

    /// Resolves the bucket table. Named resolution first; a dump without
    /// field names degrades to structural inference through the dotted path
    /// and finally to the only array in sight.
    fn table<'s>(&self, coll: &HeapObject<'s>) -> ExtractResult<HeapObject<'s>> {
        if let Some(obj) = coll.resolve_object(&self.array_field)? {
            if obj.is_array() {
                return Ok(Extraction::Value(obj));
            }
            if !obj.snapshot().is_class(obj.id()) && obj.id() != coll.id() {
                return Err(ExtractionError::BadBackingField {
                    field: self.array_field.clone(),
                    object: coll.display_name(),
                    found: obj.display_name(),
                });
            }
        }
        if let Some(holder) = follow_only_outgoing_except_last(&self.array_field, coll)? {
            if let Some(arr) = only_array_field(&holder)? {
                return Ok(Extraction::Value(arr));
            }
        }
        Ok(Extraction::from_option(only_array_field(coll)?))
    }

    /// Walks every bucket chain of the table, returning entry object ids.
    fn collect_entries(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        let table = match self.table(coll)? {
            Extraction::Value(t) => t,
            other => return Ok(other.map(|_| Vec::new())),
        };
        let snap = coll.snapshot();
        let addresses = snap.reference_array(table.id())?;

        let mut entries = Vec::new();
        let mut seen = FixedBitSet::with_capacity(snap.info().object_count);
        for addr in addresses {
            if addr == NULL_ADDRESS {
                continue;
            }
            let mut first = snap.map_address_to_id(addr)?;
            if snap.is_class(first) {
                continue;
            }
            // Tree-ified buckets interpose a TreeBin holder before the
            // first real entry.
            if snap.class_name(snap.class_of(first)?)? == TREE_BIN_CLASS {
                match HeapObject::new(snap, first).resolve_object("first")? {
                    Some(entry) => first = entry.id(),
                    None => continue,
                }
            }
            // A slot can also hold non-entry objects (open-addressed
            // vendor layouts store values directly); classes and bare
            // Object instances never head a chain.
            if snap.is_class(first)
                || snap.class_name(snap.class_of(first)?)? == PLAIN_OBJECT_CLASS
            {
                continue;
            }
            walk_chain(snap, first, &mut seen, &mut entries)?;
        }
        Ok(Extraction::Value(entries))
    }
}

/// Depth-first walk over same-class links starting at `first`. The visited
/// set spans all buckets, so an entry reachable twice is counted once and
/// self-referencing or cyclic chains terminate.
fn walk_chain(
    snap: &dyn Snapshot,
    first: ObjectId,
    seen: &mut FixedBitSet,
    entries: &mut Vec<ObjectId>,
) -> Result<(), ExtractionError> {
    let mut pending = vec![first];
    while let Some(entry) = pending.pop() {
        if seen.put(entry as usize) {
            continue;
        }
        entries.push(entry);
        let entry_class = snap.class_of(entry)?;
        for referent in snap.outbound_referent_ids(entry)? {
            if referent != entry
                && !snap.is_class(referent)
                && !seen.contains(referent as usize)
                && snap.class_of(referent)? == entry_class
            {
                pending.push(referent);
            }
        }
    }
    Ok(())
}

impl CollectionExtractor for HashMapExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, coll: &HeapObject) -> ExtractResult<u32> {
        match resolve_u32_path(coll, &self.size_field)? {
            Some(size) => Ok(Extraction::Value(size)),
            // Counting extracted entries is exact, just slower.
            None => Ok(self.collect_entries(coll)?.map(|e| e.len() as u32)),
        }
    }

    fn has_capacity(&self) -> bool {
        true
    }

    fn capacity(&self, coll: &HeapObject) -> ExtractResult<u32> {
        match self.table(coll)? {
            Extraction::Value(t) => Ok(Extraction::Value(
                coll.snapshot().array_length(t.id())? as u32
            )),
            other => Ok(other.map(|_| 0)),
        }
    }

    fn has_fill_ratio(&self) -> bool {
        true
    }

    /// Unknown capacity reads as "fully used": better to underreport waste
    /// than to flag a collection we cannot actually measure.
    fn fill_ratio(&self, coll: &HeapObject) -> ExtractResult<f64> {
        let size = match self.size(coll)? {
            Extraction::Value(v) => v,
            other => return Ok(other.map(|_| 0.0)),
        };
        match self.capacity(coll)? {
            Extraction::Value(capacity) => Ok(Extraction::Value(fill_ratio_of(size, capacity))),
            _ => Ok(Extraction::Value(1.0)),
        }
    }

    fn has_collision_ratio(&self) -> bool {
        true
    }

    /// Fraction of entries that sit behind another entry in their bucket:
    /// (size − occupied buckets) / size, zero for an empty map.
    fn collision_ratio(&self, coll: &HeapObject) -> ExtractResult<f64> {
        let size = match self.size(coll)? {
            Extraction::Value(v) => v,
            other => return Ok(other.map(|_| 0.0)),
        };
        if size == 0 {
            return Ok(Extraction::Value(0.0));
        }
        let table = match self.table(coll)? {
            Extraction::Value(t) => t,
            other => return Ok(other.map(|_| 0.0)),
        };
        let occupied = non_null_array_elements(&table)?.min(size);
        Ok(Extraction::Value((size - occupied) as f64 / size as f64))
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        self.collect_entries(coll)
    }

    fn has_extractable_array(&self) -> bool {
        true
    }

    fn backing_array(&self, coll: &HeapObject) -> ExtractResult<ObjectId> {
        Ok(self.table(coll)?.map(|t| t.id()))
    }

    fn non_null_element_count(&self, coll: &HeapObject) -> ExtractResult<u32> {
        match self.table(coll)? {
            Extraction::Value(t) => Ok(Extraction::Value(non_null_array_elements(&t)?)),
            other => Ok(other.map(|_| 0)),
        }
    }

    fn has_map_entries(&self) -> bool {
        true
    }

    fn map_entries<'s>(&self, coll: &HeapObject<'s>) -> ExtractResult<MapEntries<'s>> {
        let ids = match self.collect_entries(coll)? {
            Extraction::Value(ids) => ids,
            other => return Ok(other.map(|_| MapEntries::empty())),
        };
        Ok(Extraction::Value(entries_from_ids(
            coll,
            ids,
            self.key_field.clone(),
            self.value_field.clone(),
        )))
    }
}

/// HashSet and friends: a hash map in disguise whose logical elements are
/// the keys of the inner map's entries.
pub struct HashSetExtractor {
    map: HashMapExtractor,
    key_field: String,
}

impl HashSetExtractor {
    pub fn new(size_field: &str, array_field: &str, key_field: &str, value_field: &str) -> Self {
        Self {
            map: HashMapExtractor::new(size_field, array_field, key_field, value_field),
            key_field: key_field.to_string(),
        }
    }
}

impl CollectionExtractor for HashSetExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, coll: &HeapObject) -> ExtractResult<u32> {
        self.map.size(coll)
    }

    fn has_capacity(&self) -> bool {
        true
    }

    fn capacity(&self, coll: &HeapObject) -> ExtractResult<u32> {
        self.map.capacity(coll)
    }

    fn has_fill_ratio(&self) -> bool {
        true
    }

    fn fill_ratio(&self, coll: &HeapObject) -> ExtractResult<f64> {
        self.map.fill_ratio(coll)
    }

    fn has_collision_ratio(&self) -> bool {
        true
    }

    fn collision_ratio(&self, coll: &HeapObject) -> ExtractResult<f64> {
        self.map.collision_ratio(coll)
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    /// Projects each map entry onto its key; entries whose key cannot be
    /// resolved are skipped rather than miscounted as null elements.
    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        let entries = match self.map.collect_entries(coll)? {
            Extraction::Value(ids) => ids,
            other => return Ok(other),
        };
        let snap = coll.snapshot();
        let mut keys = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Some(key) = HeapObject::new(snap, entry).resolve_object(&self.key_field)? {
                keys.push(key.id());
            }
        }
        Ok(Extraction::Value(keys))
    }

    fn has_extractable_array(&self) -> bool {
        true
    }

    fn backing_array(&self, coll: &HeapObject) -> ExtractResult<ObjectId> {
        self.map.backing_array(coll)
    }

    fn non_null_element_count(&self, coll: &HeapObject) -> ExtractResult<u32> {
        self.map.non_null_element_count(coll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{HeapDump, HeapDumpBuilder};

    /// 16-slot table, 3 entries: slot 1 holds a 2-entry chain, slot 7 a
    /// single entry. size=3, occupied buckets=2.
    fn hash_map_dump() -> (HeapDump, ObjectId, ObjectId, Vec<ObjectId>) {
        let mut b = HeapDumpBuilder::new();
        let cls_map = b.class("java.util.HashMap");
        let cls_entry = b.class("java.util.HashMap$Node");
        let cls_arr = b.class("java.util.HashMap$Node[]");
        let cls_s = b.class("java.lang.String");

        let k: Vec<_> = (0..3).map(|_| b.instance(cls_s)).collect();
        let v: Vec<_> = (0..3).map(|_| b.instance(cls_s)).collect();

        let e2 = b.instance(cls_entry);
        b.set_ref_field(e2, "key", k[2]);
        b.set_ref_field(e2, "value", v[2]);
        let e1 = b.instance(cls_entry);
        b.set_ref_field(e1, "key", k[1]);
        b.set_ref_field(e1, "value", v[1]);
        b.set_ref_field(e1, "next", e2);
        let e0 = b.instance(cls_entry);
        b.set_ref_field(e0, "key", k[0]);
        b.set_ref_field(e0, "value", v[0]);

        let mut slots = vec![None; 16];
        slots[1] = Some(e1);
        slots[7] = Some(e0);
        let table = b.ref_array(cls_arr, &slots);

        let map = b.instance(cls_map);
        b.set_int_field(map, "size", 3);
        b.set_ref_field(map, "table", table);
        let dump = b.finish();
        (dump, map, table, vec![e0, e1, e2])
    }

    fn extractor() -> HashMapExtractor {
        HashMapExtractor::new("size", "table", "key", "value")
    }

    #[test]
    fn test_hash_map_size_capacity_fill() {
        let (dump, map, table, _) = hash_map_dump();
        let coll = HeapObject::new(&dump, map);
        let x = extractor();
        assert_eq!(x.size(&coll).unwrap().value(), Some(3));
        assert_eq!(x.capacity(&coll).unwrap().value(), Some(16));
        assert_eq!(x.fill_ratio(&coll).unwrap().value(), Some(3.0 / 16.0));
        assert_eq!(x.backing_array(&coll).unwrap().value(), Some(table));
        assert_eq!(x.non_null_element_count(&coll).unwrap().value(), Some(2));
    }

    #[test]
    fn test_hash_map_collision_ratio() {
        let (dump, map, _, _) = hash_map_dump();
        let coll = HeapObject::new(&dump, map);
        // 3 entries in 2 buckets: one entry collides
        let ratio = extractor().collision_ratio(&coll).unwrap().value().unwrap();
        assert!((ratio - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_hash_map_chain_walk_finds_all_entries() {
        let (dump, map, _, entries) = hash_map_dump();
        let coll = HeapObject::new(&dump, map);
        let mut ids = extractor().extract_entry_ids(&coll).unwrap().value().unwrap();
        ids.sort_unstable();
        let mut expected = entries;
        expected.sort_unstable();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_hash_map_entries_resolve_keys_and_values() {
        let (dump, map, _, _) = hash_map_dump();
        let coll = HeapObject::new(&dump, map);
        let entries: Vec<_> = extractor()
            .map_entries(&coll)
            .unwrap()
            .value()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(entries.len(), 3);
        for entry in &entries {
            assert!(entry.key.is_some());
            assert!(entry.value.is_some());
        }
    }

    #[test]
    fn test_chain_with_self_loop_terminates() {
        let mut b = HeapDumpBuilder::new();
        let cls_map = b.class("java.util.Hashtable");
        let cls_entry = b.class("java.util.Hashtable$Entry");
        let cls_arr = b.class("Entry[]");
        let e = b.instance(cls_entry);
        b.set_ref_field(e, "next", e); // corrupt: points at itself
        let table = b.ref_array(cls_arr, &[Some(e)]);
        let map = b.instance(cls_map);
        b.set_int_field(map, "count", 1);
        b.set_ref_field(map, "table", table);
        let dump = b.finish();

        let x = HashMapExtractor::new("count", "table", "key", "value");
        let ids = x
            .extract_entry_ids(&HeapObject::new(&dump, map))
            .unwrap()
            .value()
            .unwrap();
        assert_eq!(ids, vec![e]);
    }

    #[test]
    fn test_tree_bin_bucket_is_unpacked() {
        let mut b = HeapDumpBuilder::new();
        let cls_map = b.class("java.util.HashMap");
        let cls_bin = b.class("java.util.HashMap$TreeBin");
        let cls_node = b.class("java.util.HashMap$TreeNode");
        let cls_arr = b.class("Node[]");

        let n1 = b.instance(cls_node);
        let n0 = b.instance(cls_node);
        b.set_ref_field(n0, "right", n1);
        let bin = b.instance(cls_bin);
        b.set_ref_field(bin, "first", n0);
        let table = b.ref_array(cls_arr, &[Some(bin), None]);
        let map = b.instance(cls_map);
        b.set_int_field(map, "size", 2);
        b.set_ref_field(map, "table", table);
        let dump = b.finish();

        let mut ids = extractor()
            .extract_entry_ids(&HeapObject::new(&dump, map))
            .unwrap()
            .value()
            .unwrap();
        ids.sort_unstable();
        let mut expected = vec![n0, n1];
        expected.sort_unstable();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_non_entry_slot_objects_are_not_entries() {
        let mut b = HeapDumpBuilder::new();
        let cls_map = b.class("java.util.HashMap");
        let cls_entry = b.class("java.util.HashMap$Node");
        let cls_arr = b.class("Node[]");
        let cls_obj = b.class("java.lang.Object");

        let plain = b.instance(cls_obj);
        let e = b.instance(cls_entry);
        // slot 0 holds a bare Object, slot 2 a class object; only slot 1
        // heads a real chain
        let table = b.ref_array(cls_arr, &[Some(plain), Some(e), Some(cls_obj)]);
        let map = b.instance(cls_map);
        b.set_int_field(map, "size", 1);
        b.set_ref_field(map, "table", table);
        let dump = b.finish();

        let ids = extractor()
            .extract_entry_ids(&HeapObject::new(&dump, map))
            .unwrap()
            .value()
            .unwrap();
        assert_eq!(ids, vec![e]);
    }

    #[test]
    fn test_bad_backing_field_is_an_error() {
        let mut b = HeapDumpBuilder::new();
        let cls_map = b.class("java.util.HashMap");
        let cls_s = b.class("java.lang.String");
        let not_an_array = b.instance(cls_s);
        let map = b.instance(cls_map);
        b.set_ref_field(map, "table", not_an_array);
        let dump = b.finish();

        let result = extractor().backing_array(&HeapObject::new(&dump, map));
        assert!(matches!(
            result,
            Err(ExtractionError::BadBackingField { .. })
        ));
    }

    #[test]
    fn test_hash_set_projects_keys() {
        let mut b = HeapDumpBuilder::new();
        let cls_set = b.class("java.util.HashSet");
        let cls_map = b.class("java.util.HashMap");
        let cls_entry = b.class("java.util.HashMap$Node");
        let cls_arr = b.class("Node[]");
        let cls_s = b.class("java.lang.String");

        let k0 = b.instance(cls_s);
        let e0 = b.instance(cls_entry);
        b.set_ref_field(e0, "key", k0);
        let table = b.ref_array(cls_arr, &[Some(e0), None]);
        let map = b.instance(cls_map);
        b.set_int_field(map, "size", 1);
        b.set_ref_field(map, "table", table);
        let set = b.instance(cls_set);
        b.set_ref_field(set, "map", map);
        let dump = b.finish();

        let x = HashSetExtractor::new("map.size", "map.table", "key", "value");
        let coll = HeapObject::new(&dump, set);
        assert_eq!(x.size(&coll).unwrap().value(), Some(1));
        assert_eq!(x.extract_entry_ids(&coll).unwrap().value(), Some(vec![k0]));
    }
}
