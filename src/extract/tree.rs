//! Strategies for red-black-tree maps and sets: TreeMap, TreeSet, and the
//! vendor hybrid that stores sorted keys and values in parallel arrays.

use fixedbitset::FixedBitSet;

use crate::extract::util::resolve_u32_path;
use crate::extract::{
    CollectionExtractor, ExtractResult, Extraction, MapEntries, MapEntry, entries_from_ids,
    fill_ratio_of,
};
use crate::snapshot::{HeapObject, Snapshot};
use crate::types::ObjectId;

/// Node-based sorted map. Entries are collected by an iterative in-order
/// walk over the `left`/`right` links of the node objects.
pub struct TreeMapExtractor {
    size_field: String,
    root_field: String,
    key_field: String,
    value_field: String,
}

impl TreeMapExtractor {
    /// The root reference conventionally sits next to the size field with
    /// the same path prefix ("size" → "root", "m.size" → "m.root").
    pub fn new(size_field: &str, key_field: &str, value_field: &str) -> Self {
        let root_field = match size_field.strip_suffix("size") {
            Some(prefix) => format!("{}root", prefix),
            None => "root".to_string(),
        };
        Self {
            size_field: size_field.to_string(),
            root_field,
            key_field: key_field.to_string(),
            value_field: value_field.to_string(),
        }
    }

    /// In-order traversal with an explicit stack. A visited bitset guards
    /// against corrupt trees where a node is reachable twice; such nodes are
    /// reported once and the walk still terminates.
    fn in_order_entries(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        let snap = coll.snapshot();
        let root = match coll.resolve_object(&self.root_field)? {
            Some(root) => root,
            None => return Ok(Extraction::Value(Vec::new())),
        };

        let mut entries = Vec::new();
        let mut visited = FixedBitSet::with_capacity(snap.info().object_count);
        let mut stack: Vec<ObjectId> = Vec::new();
        let mut current = Some(root.id());

        loop {
            while let Some(node) = current {
                if visited.put(node as usize) {
                    current = None;
                    break;
                }
                stack.push(node);
                current = left_or_right(snap, node, "left", &visited)?;
            }
            let node = match stack.pop() {
                Some(node) => node,
                None => break,
            };
            entries.push(node);
            current = left_or_right(snap, node, "right", &visited)?;
        }
        Ok(Extraction::Value(entries))
    }
}

fn left_or_right(
    snap: &dyn Snapshot,
    node: ObjectId,
    side: &str,
    visited: &FixedBitSet,
) -> Result<Option<ObjectId>, crate::types::ExtractionError> {
    let child = HeapObject::new(snap, node).resolve_object(side)?;
    Ok(child
        .map(|c| c.id())
        .filter(|id| !visited.contains(*id as usize)))
}

impl CollectionExtractor for TreeMapExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, coll: &HeapObject) -> ExtractResult<u32> {
        match resolve_u32_path(coll, &self.size_field)? {
            Some(size) => Ok(Extraction::Value(size)),
            None => Ok(self.in_order_entries(coll)?.map(|e| e.len() as u32)),
        }
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    /// Entry nodes in key order.
    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        self.in_order_entries(coll)
    }

    fn has_map_entries(&self) -> bool {
        true
    }

    fn map_entries<'s>(&self, coll: &HeapObject<'s>) -> ExtractResult<MapEntries<'s>> {
        let ids = match self.in_order_entries(coll)? {
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

/// TreeSet: a TreeMap whose logical elements are the entry keys.
pub struct TreeSetExtractor {
    map: TreeMapExtractor,
    key_field: String,
}

impl TreeSetExtractor {
    pub fn new(size_field: &str, key_field: &str) -> Self {
        Self {
            map: TreeMapExtractor::new(size_field, key_field, key_field),
            key_field: key_field.to_string(),
        }
    }
}

impl CollectionExtractor for TreeSetExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, coll: &HeapObject) -> ExtractResult<u32> {
        self.map.size(coll)
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    /// Keys in sorted order.
    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        let nodes = match self.map.in_order_entries(coll)? {
            Extraction::Value(ids) => ids,
            other => return Ok(other),
        };
        let snap = coll.snapshot();
        let mut keys = Vec::with_capacity(nodes.len());
        for node in nodes {
            if let Some(key) = HeapObject::new(snap, node).resolve_object(&self.key_field)? {
                keys.push(key.id());
            }
        }
        Ok(Extraction::Value(keys))
    }
}

/// Vendor hybrid sorted map backed by parallel `keys[]` / `values[]` arrays
/// instead of linked nodes.
pub struct TreeMapArrayExtractor {
    size_field: String,
    keys_field: String,
    values_field: String,
}

impl TreeMapArrayExtractor {
    pub fn new(size_field: &str, keys_field: &str, values_field: &str) -> Self {
        Self {
            size_field: size_field.to_string(),
            keys_field: keys_field.to_string(),
            values_field: values_field.to_string(),
        }
    }

    fn keys_array<'s>(&self, coll: &HeapObject<'s>) -> ExtractResult<HeapObject<'s>> {
        match coll.resolve_object(&self.keys_field)? {
            Some(arr) if arr.is_array() => Ok(Extraction::Value(arr)),
            _ => Ok(Extraction::Unknown),
        }
    }
}

impl CollectionExtractor for TreeMapArrayExtractor {
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

    fn capacity(&self, coll: &HeapObject) -> ExtractResult<u32> {
        match self.keys_array(coll)? {
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
        let size = match self.size(coll)? {
            Extraction::Value(v) => v,
            other => return Ok(other.map(|_| 0.0)),
        };
        match self.capacity(coll)? {
            Extraction::Value(capacity) => Ok(Extraction::Value(fill_ratio_of(size, capacity))),
            other => Ok(other.map(|_| 0.0)),
        }
    }

    fn has_collision_ratio(&self) -> bool {
        true
    }

    /// Empirical estimate tuned against observed heaps of this map variant:
    /// 0.29·f + 0.21·f² of entries share a slot at fill ratio f.
    fn collision_ratio(&self, coll: &HeapObject) -> ExtractResult<f64> {
        Ok(self
            .fill_ratio(coll)?
            .map(|f| 0.29 * f + 0.21 * f * f))
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        let arr = match self.keys_array(coll)? {
            Extraction::Value(arr) => arr,
            other => return Ok(other.map(|_| Vec::new())),
        };
        let snap = coll.snapshot();
        let addresses = snap.reference_array(arr.id())?;
        Ok(Extraction::Value(
            crate::extract::util::reference_array_to_ids(snap, &addresses)?,
        ))
    }

    fn has_map_entries(&self) -> bool {
        true
    }

    /// Zips the parallel arrays index-wise; a pair with both sides null is
    /// an unused slot, not an entry.
    fn map_entries<'s>(&self, coll: &HeapObject<'s>) -> ExtractResult<MapEntries<'s>> {
        let keys = match self.keys_array(coll)? {
            Extraction::Value(arr) => arr,
            other => return Ok(other.map(|_| MapEntries::empty())),
        };
        let values = match coll.resolve_object(&self.values_field)? {
            Some(arr) if arr.is_array() => arr,
            _ => return Ok(Extraction::Unknown),
        };
        let snap = coll.snapshot();
        let key_addrs = snap.reference_array(keys.id())?;
        let value_addrs = snap.reference_array(values.id())?;

        let entries = key_addrs
            .into_iter()
            .zip(value_addrs)
            .filter(|(k, v)| *k != 0 || *v != 0)
            .map(move |(k, v)| {
                let resolve = |addr: u64| -> Result<Option<HeapObject<'s>>, _> {
                    if addr == 0 {
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
