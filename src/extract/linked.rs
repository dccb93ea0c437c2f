//! Doubly-linked list strategy (LinkedList and vendor variants).
//!
//! Two generations of layout exist: the legacy one keeps a circular list
//! with a sentinel header node (`header` / `voidLink`) whose element is
//! null, the modern one points `first` straight at a real node and
//! terminates with a null `next`. Both are handled by the same walk; the
//! declared size caps the step count so a corrupt circular link cannot
//! spin forever. The concurrent skip list reuses the node-to-node walk
//! along its base level.

use fixedbitset::FixedBitSet;

use crate::extract::util::resolve_u32_path;
use crate::extract::{
    CollectionExtractor, ExtractResult, Extraction, MapEntries, entries_from_ids,
};
use crate::snapshot::{HeapObject, Snapshot};
use crate::types::{ExtractionError, ObjectId};

const HEADER_FIELDS: [&str; 2] = ["header", "voidLink"];
const ELEMENT_FIELDS: [&str; 2] = ["element", "item"];

pub struct LinkedListExtractor {
    size_field: String,
}

impl LinkedListExtractor {
    pub fn new(size_field: &str) -> Self {
        Self {
            size_field: size_field.to_string(),
        }
    }
}

/// Next node after `node`: the `next` field when named, otherwise the only
/// same-class outbound that is neither the node itself nor the node we just
/// came from. Two candidates after that filter means the layout is not
/// understood, and the walk stops rather than picking one.
fn next_node(
    snap: &dyn Snapshot,
    node: ObjectId,
    previous: Option<ObjectId>,
) -> Result<Option<ObjectId>, ExtractionError> {
    if let Some(next) = HeapObject::new(snap, node).resolve_object("next")? {
        return Ok(Some(next.id()));
    }
    let node_class = snap.class_of(node)?;
    let mut found = None;
    for referent in snap.outbound_referent_ids(node)? {
        if referent != node
            && Some(referent) != previous
            && !snap.is_class(referent)
            && snap.class_of(referent)? == node_class
        {
            if found.is_some() {
                return Ok(None);
            }
            found = Some(referent);
        }
    }
    Ok(found)
}

fn element_of<'s>(node: &HeapObject<'s>) -> Result<Option<HeapObject<'s>>, ExtractionError> {
    for field in ELEMENT_FIELDS {
        if let Some(elem) = node.resolve_object(field)? {
            return Ok(Some(elem));
        }
    }
    Ok(None)
}

impl CollectionExtractor for LinkedListExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, coll: &HeapObject) -> ExtractResult<u32> {
        Ok(Extraction::from_option(resolve_u32_path(
            coll,
            &self.size_field,
        )?))
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        let snap = coll.snapshot();
        let size = match self.size(coll)? {
            Extraction::Value(v) => v,
            other => return Ok(other.map(|_| Vec::new())),
        };
        if size == 0 {
            return Ok(Extraction::Value(Vec::new()));
        }

        // Sentinel layouts stop when the walk returns to the header; the
        // header itself carries no element.
        let mut sentinel = None;
        let mut start = None;
        for field in HEADER_FIELDS {
            if let Some(header) = coll.resolve_object(field)? {
                sentinel = Some(header.id());
                start = next_node(snap, header.id(), None)?;
                break;
            }
        }
        if sentinel.is_none() {
            start = coll.resolve_object("first")?.map(|o| o.id());
        }

        let mut elements = Vec::with_capacity(size as usize);
        let mut visited = FixedBitSet::with_capacity(snap.info().object_count);
        let mut previous = sentinel;
        let mut current = start;
        while let Some(node) = current {
            if Some(node) == sentinel || visited.put(node as usize) {
                break;
            }
            if let Some(elem) = element_of(&HeapObject::new(snap, node))? {
                elements.push(elem.id());
            }
            if elements.len() as u32 >= size {
                break;
            }
            current = next_node(snap, node, previous)?;
            previous = Some(node);
        }
        Ok(Extraction::Value(elements))
    }
}

/// Concurrent skip list, map and set alike. The index towers above the
/// base level are ignored: every entry sits on the base-level node chain,
/// headed by a sentinel node without a key. Deletion markers carry no key
/// either and are skipped the same way.
pub struct ConcurrentSkipListExtractor {
    first_node_path: String,
    key_field: String,
    value_field: String,
}

impl ConcurrentSkipListExtractor {
    pub fn new(first_node_path: &str, key_field: &str, value_field: &str) -> Self {
        Self {
            first_node_path: first_node_path.to_string(),
            key_field: key_field.to_string(),
            value_field: value_field.to_string(),
        }
    }

    fn collect_nodes(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        let snap = coll.snapshot();
        let start = match coll.resolve_object(&self.first_node_path)? {
            Some(node) => node.id(),
            None => return Ok(Extraction::Unknown),
        };
        let mut nodes = Vec::new();
        let mut visited = FixedBitSet::with_capacity(snap.info().object_count);
        let mut previous = None;
        let mut current = Some(start);
        while let Some(node) = current {
            if visited.put(node as usize) {
                break;
            }
            if HeapObject::new(snap, node)
                .resolve_object(&self.key_field)?
                .is_some()
            {
                nodes.push(node);
            }
            current = next_node(snap, node, previous)?;
            previous = Some(node);
        }
        Ok(Extraction::Value(nodes))
    }
}

impl CollectionExtractor for ConcurrentSkipListExtractor {
    fn has_size(&self) -> bool {
        true
    }

    /// There is no size field to read; the node count is the size.
    fn size(&self, coll: &HeapObject) -> ExtractResult<u32> {
        Ok(self.collect_nodes(coll)?.map(|nodes| nodes.len() as u32))
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        self.collect_nodes(coll)
    }

    fn has_map_entries(&self) -> bool {
        true
    }

    fn map_entries<'s>(&self, coll: &HeapObject<'s>) -> ExtractResult<MapEntries<'s>> {
        let ids = match self.collect_nodes(coll)? {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::HeapDumpBuilder;

    #[test]
    fn test_modern_linked_list() {
        // first -> n0 -> n1, elements e0, e1
        let mut b = HeapDumpBuilder::new();
        let cls_list = b.class("java.util.LinkedList");
        let cls_node = b.class("java.util.LinkedList$Node");
        let cls_s = b.class("java.lang.String");
        let e0 = b.instance(cls_s);
        let e1 = b.instance(cls_s);
        let n1 = b.instance(cls_node);
        b.set_ref_field(n1, "item", e1);
        let n0 = b.instance(cls_node);
        b.set_ref_field(n0, "item", e0);
        b.set_ref_field(n0, "next", n1);
        let list = b.instance(cls_list);
        b.set_int_field(list, "size", 2);
        b.set_ref_field(list, "first", n0);
        let dump = b.finish();

        let x = LinkedListExtractor::new("size");
        let coll = HeapObject::new(&dump, list);
        assert_eq!(x.size(&coll).unwrap().value(), Some(2));
        assert_eq!(
            x.extract_entry_ids(&coll).unwrap().value(),
            Some(vec![e0, e1])
        );
    }

    #[test]
    fn test_sentinel_header_list_without_next_names() {
        // circular header <-> n0 <-> n1 list, links unnamed in the dump so
        // the walk must infer them structurally
        let mut b = HeapDumpBuilder::new();
        let cls_list = b.class("java.util.LinkedList");
        let cls_entry = b.class("java.util.LinkedList$Entry");
        let cls_s = b.class("java.lang.String");
        let e0 = b.instance(cls_s);
        let e1 = b.instance(cls_s);
        let header = b.instance(cls_entry);
        let n0 = b.instance(cls_entry);
        let n1 = b.instance(cls_entry);
        // structural links: header -> n0 -> n1 -> header; each node also
        // links back, which the predecessor filter must ignore
        b.set_ref_field(header, "f", n0);
        b.set_ref_field(n0, "element", e0);
        b.set_ref_field(n0, "b", header);
        b.set_ref_field(n0, "f", n1);
        b.set_ref_field(n1, "element", e1);
        b.set_ref_field(n1, "b", n0);
        b.set_ref_field(n1, "f", header);
        let list = b.instance(cls_list);
        b.set_int_field(list, "size", 2);
        b.set_ref_field(list, "header", header);
        let dump = b.finish();

        let x = LinkedListExtractor::new("size");
        let coll = HeapObject::new(&dump, list);
        assert_eq!(
            x.extract_entry_ids(&coll).unwrap().value(),
            Some(vec![e0, e1])
        );
    }

    #[test]
    fn test_corrupt_cycle_stops_at_declared_size() {
        let mut b = HeapDumpBuilder::new();
        let cls_list = b.class("java.util.LinkedList");
        let cls_node = b.class("java.util.LinkedList$Node");
        let cls_s = b.class("java.lang.String");
        let e0 = b.instance(cls_s);
        let n0 = b.instance(cls_node);
        b.set_ref_field(n0, "item", e0);
        b.set_ref_field(n0, "next", n0); // corrupt self-link
        let list = b.instance(cls_list);
        b.set_int_field(list, "size", 10);
        b.set_ref_field(list, "first", n0);
        let dump = b.finish();

        let x = LinkedListExtractor::new("size");
        let ids = x
            .extract_entry_ids(&HeapObject::new(&dump, list))
            .unwrap()
            .value()
            .unwrap();
        assert_eq!(ids, vec![e0]);
    }

    #[test]
    fn test_skip_list_counts_keyed_base_nodes_only() {
        let mut b = HeapDumpBuilder::new();
        let cls_map = b.class("java.util.concurrent.ConcurrentSkipListMap");
        let cls_head = b.class("java.util.concurrent.ConcurrentSkipListMap$HeadIndex");
        let cls_node = b.class("java.util.concurrent.ConcurrentSkipListMap$Node");
        let cls_s = b.class("java.lang.String");

        let k0 = b.instance(cls_s);
        let v0 = b.instance(cls_s);
        let k1 = b.instance(cls_s);
        let v1 = b.instance(cls_s);
        let n2 = b.instance(cls_node);
        b.set_ref_field(n2, "key", k1);
        b.set_ref_field(n2, "value", v1);
        // deletion marker: a node without a key
        let marker = b.instance(cls_node);
        b.set_ref_field(marker, "next", n2);
        let n1 = b.instance(cls_node);
        b.set_ref_field(n1, "key", k0);
        b.set_ref_field(n1, "value", v0);
        b.set_ref_field(n1, "next", marker);
        // base header, key null
        let n0 = b.instance(cls_node);
        b.set_ref_field(n0, "next", n1);
        let head = b.instance(cls_head);
        b.set_ref_field(head, "node", n0);
        let map = b.instance(cls_map);
        b.set_ref_field(map, "head", head);
        let dump = b.finish();

        let x = ConcurrentSkipListExtractor::new("head.node", "key", "value");
        let coll = HeapObject::new(&dump, map);
        assert_eq!(x.size(&coll).unwrap().value(), Some(2));
        assert_eq!(
            x.extract_entry_ids(&coll).unwrap().value(),
            Some(vec![n1, n2])
        );
        let entries: Vec<_> = x
            .map_entries(&coll)
            .unwrap()
            .value()
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key.as_ref().map(|k| k.id()), Some(k0));
    }

    #[test]
    fn test_empty_list() {
        let mut b = HeapDumpBuilder::new();
        let cls_list = b.class("java.util.LinkedList");
        let list = b.instance(cls_list);
        b.set_int_field(list, "size", 0);
        let dump = b.finish();

        let x = LinkedListExtractor::new("size");
        assert_eq!(
            x.extract_entry_ids(&HeapObject::new(&dump, list))
                .unwrap()
                .value(),
            Some(vec![])
        );
    }
}
