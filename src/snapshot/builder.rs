use ahash::AHashMap;
use petgraph::algo::dominators::simple_fast;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::snapshot::heap::{ClassMeta, HeapDump, ObjectKind};
use crate::snapshot::{FieldValue, SnapshotInfo};
use crate::types::{Address, NULL_ADDRESS, ObjectId};

const BASE_ADDRESS: Address = 0x1000_0000;
const ADDRESS_STRIDE: Address = 0x40;

const DEFAULT_CLASS_SIZE: u64 = 80;
const DEFAULT_INSTANCE_SIZE: u64 = 32;
const REFERENCE_SIZE: u64 = 8;
const ARRAY_HEADER_SIZE: u64 = 16;

/// Builds an in-memory `HeapDump` object by object.
///
/// Addresses are assigned sequentially at creation time, so an object must
/// exist before anything references it; fields and array slots can be rewired
/// afterwards (tests use this to inject cycles). `finish` flattens the edge
/// lists and precomputes the dominator tree and retained sizes.
pub struct HeapDumpBuilder {
    kinds: Vec<ObjectKind>,
    addresses: Vec<Address>,
    class_ids: Vec<ObjectId>,
    heap_sizes: Vec<u64>,
    fields: Vec<Vec<(String, FieldValue)>>,
    ref_arrays: Vec<Option<Vec<Address>>>,
    prim_array_lengths: Vec<u32>,
    class_meta: AHashMap<ObjectId, ClassMeta>,
    gc_roots: Vec<ObjectId>,
    jvm_info: Option<String>,
}

impl Default for HeapDumpBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapDumpBuilder {
    pub fn new() -> Self {
        Self {
            kinds: Vec::new(),
            addresses: Vec::new(),
            class_ids: Vec::new(),
            heap_sizes: Vec::new(),
            fields: Vec::new(),
            ref_arrays: Vec::new(),
            prim_array_lengths: Vec::new(),
            class_meta: AHashMap::new(),
            gc_roots: Vec::new(),
            jvm_info: None,
        }
    }

    pub fn jvm_info(&mut self, info: impl Into<String>) -> &mut Self {
        self.jvm_info = Some(info.into());
        self
    }

    fn push(&mut self, kind: ObjectKind, class_id: ObjectId, size: u64) -> ObjectId {
        let id = self.kinds.len() as ObjectId;
        self.kinds.push(kind);
        self.addresses
            .push(BASE_ADDRESS + id as Address * ADDRESS_STRIDE);
        self.class_ids.push(class_id);
        self.heap_sizes.push(size);
        self.fields.push(Vec::new());
        self.ref_arrays.push(None);
        self.prim_array_lengths.push(0);
        id
    }

    /// Registers a class object. Class objects are their own class and are
    /// treated as GC roots (reachable via the system classloader), matching
    /// how real dumps anchor class metadata.
    pub fn class(&mut self, name: impl Into<String>) -> ObjectId {
        self.class_with_loader(name, None)
    }

    pub fn class_with_loader(
        &mut self,
        name: impl Into<String>,
        loader: Option<ObjectId>,
    ) -> ObjectId {
        let id = self.push(ObjectKind::Class, 0, DEFAULT_CLASS_SIZE);
        self.class_ids[id as usize] = id;
        self.class_meta.insert(
            id,
            ClassMeta {
                name: name.into(),
                loader,
            },
        );
        self.gc_roots.push(id);
        id
    }

    pub fn instance(&mut self, class_id: ObjectId) -> ObjectId {
        self.push(ObjectKind::Instance, class_id, DEFAULT_INSTANCE_SIZE)
    }

    pub fn instance_sized(&mut self, class_id: ObjectId, size: u64) -> ObjectId {
        self.push(ObjectKind::Instance, class_id, size)
    }

    /// Creates a reference array; `None` slots are null.
    pub fn ref_array(&mut self, class_id: ObjectId, slots: &[Option<ObjectId>]) -> ObjectId {
        let size = ARRAY_HEADER_SIZE + slots.len() as u64 * REFERENCE_SIZE;
        let id = self.push(ObjectKind::RefArray, class_id, size);
        let addresses = slots
            .iter()
            .map(|slot| match slot {
                Some(target) => self.addresses[*target as usize],
                None => NULL_ADDRESS,
            })
            .collect();
        self.ref_arrays[id as usize] = Some(addresses);
        id
    }

    pub fn prim_array(&mut self, class_id: ObjectId, length: u32, size: u64) -> ObjectId {
        let id = self.push(ObjectKind::PrimArray, class_id, size);
        self.prim_array_lengths[id as usize] = length;
        id
    }

    pub fn set_array_slot(&mut self, array: ObjectId, index: usize, target: Option<ObjectId>) {
        let addr = target.map_or(NULL_ADDRESS, |t| self.addresses[t as usize]);
        self.ref_arrays[array as usize]
            .as_mut()
            .expect("not a reference array")[index] = addr;
    }

    pub fn set_int_field(&mut self, object: ObjectId, name: &str, value: i64) {
        self.set_field(object, name, FieldValue::Int(value));
    }

    pub fn set_bool_field(&mut self, object: ObjectId, name: &str, value: bool) {
        self.set_field(object, name, FieldValue::Bool(value));
    }

    pub fn set_ref_field(&mut self, object: ObjectId, name: &str, target: ObjectId) {
        let addr = self.addresses[target as usize];
        self.set_field(object, name, FieldValue::Ref(addr));
    }

    pub fn set_null_field(&mut self, object: ObjectId, name: &str) {
        self.set_field(object, name, FieldValue::Null);
    }

    pub fn set_field(&mut self, object: ObjectId, name: &str, value: FieldValue) {
        let fields = &mut self.fields[object as usize];
        match fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value,
            None => fields.push((name.to_string(), value)),
        }
    }

    pub fn gc_root(&mut self, id: ObjectId) {
        if !self.gc_roots.contains(&id) {
            self.gc_roots.push(id);
        }
    }

    pub fn address_of(&self, id: ObjectId) -> Address {
        self.addresses[id as usize]
    }

    pub fn finish(self) -> HeapDump {
        let object_count = self.kinds.len();
        let addr_to_id: AHashMap<Address, ObjectId> = self
            .addresses
            .iter()
            .enumerate()
            .map(|(id, addr)| (*addr, id as ObjectId))
            .collect();

        // Flatten outbound edges: class first, then field refs / array slots.
        let mut edge_ranges = Vec::with_capacity(object_count);
        let mut edge_targets: Vec<ObjectId> = Vec::new();
        for id in 0..object_count {
            let start = edge_targets.len() as u32;
            match self.kinds[id] {
                ObjectKind::Class => {
                    if let Some(loader) = self.class_meta[&(id as ObjectId)].loader {
                        edge_targets.push(loader);
                    }
                }
                _ => {
                    edge_targets.push(self.class_ids[id]);
                    for (_, value) in &self.fields[id] {
                        if let FieldValue::Ref(addr) = value {
                            if let Some(target) = addr_to_id.get(addr) {
                                edge_targets.push(*target);
                            }
                        }
                    }
                    if let Some(slots) = &self.ref_arrays[id] {
                        for addr in slots {
                            if *addr != NULL_ADDRESS {
                                if let Some(target) = addr_to_id.get(addr) {
                                    edge_targets.push(*target);
                                }
                            }
                        }
                    }
                }
            }
            edge_ranges.push((start, edge_targets.len() as u32));
        }

        let (dom_roots, dom_children, retained_sizes) = compute_dominators(
            object_count,
            &edge_ranges,
            &edge_targets,
            &self.gc_roots,
            &self.heap_sizes,
        );

        let info = SnapshotInfo {
            object_count,
            used_heap_size: self.heap_sizes.iter().sum(),
            identifier_size: 8,
            jvm_info: self.jvm_info,
        };

        HeapDump {
            info,
            kinds: self.kinds,
            addresses: self.addresses,
            class_ids: self.class_ids,
            heap_sizes: self.heap_sizes,
            fields: self.fields,
            ref_arrays: self.ref_arrays,
            prim_array_lengths: self.prim_array_lengths,
            edge_ranges,
            edge_targets,
            class_meta: self.class_meta,
            addr_to_id,
            gc_roots: self.gc_roots,
            dom_roots,
            dom_children,
            retained_sizes,
        }
    }
}

/// Computes the dominator tree and per-object retained sizes.
///
/// A synthetic super-root is wired to every GC root so the whole reachable
/// graph has a single entry; retained size is then the sum of the shallow
/// sizes over each object's dominated subtree. Unreachable objects keep their
/// shallow size.
fn compute_dominators(
    object_count: usize,
    edge_ranges: &[(u32, u32)],
    edge_targets: &[ObjectId],
    gc_roots: &[ObjectId],
    heap_sizes: &[u64],
) -> (Vec<ObjectId>, Vec<Vec<ObjectId>>, Vec<u64>) {
    let mut dom_roots = Vec::new();
    let mut dom_children = vec![Vec::new(); object_count];
    let mut retained: Vec<u64> = heap_sizes.to_vec();

    if gc_roots.is_empty() || object_count == 0 {
        return (dom_roots, dom_children, retained);
    }

    let mut graph: DiGraph<(), ()> = DiGraph::with_capacity(object_count + 1, edge_targets.len());
    let indices: Vec<NodeIndex> = (0..object_count).map(|_| graph.add_node(())).collect();
    let super_root = graph.add_node(());

    for &root in gc_roots {
        graph.add_edge(super_root, indices[root as usize], ());
    }
    for (id, &(start, end)) in edge_ranges.iter().enumerate() {
        for &target in &edge_targets[start as usize..end as usize] {
            graph.add_edge(indices[id], indices[target as usize], ());
        }
    }

    let dominators = simple_fast(&graph, super_root);

    for id in 0..object_count {
        match dominators.immediate_dominator(indices[id]) {
            Some(idom) if idom == super_root => dom_roots.push(id as ObjectId),
            Some(idom) => dom_children[idom.index()].push(id as ObjectId),
            None => {} // unreachable from any GC root
        }
    }

    // Accumulate retained sizes bottom-up: children before parents, ordered
    // by dominator-tree depth.
    let mut depth_order: Vec<ObjectId> = Vec::with_capacity(object_count);
    let mut queue: std::collections::VecDeque<ObjectId> = dom_roots.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        depth_order.push(id);
        queue.extend(dom_children[id as usize].iter().copied());
    }
    for &id in depth_order.iter().rev() {
        let sum: u64 = dom_children[id as usize]
            .iter()
            .map(|c| retained[*c as usize])
            .sum();
        retained[id as usize] += sum;
    }

    (dom_roots, dom_children, retained)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;

    #[test]
    fn test_diamond_retained_sizes() {
        // root -> a -> c, root -> b -> c: c is retained by the root, not a or b
        let mut b = HeapDumpBuilder::new();
        let cls = b.class("X");
        let c = b.instance_sized(cls, 100);
        let a = b.instance_sized(cls, 10);
        let bb = b.instance_sized(cls, 20);
        let root = b.instance_sized(cls, 1);
        b.set_ref_field(a, "down", c);
        b.set_ref_field(bb, "down", c);
        b.set_ref_field(root, "left", a);
        b.set_ref_field(root, "right", bb);
        b.gc_root(root);
        let dump = b.finish();

        assert_eq!(dump.retained_heap_size(a).unwrap(), 10);
        assert_eq!(dump.retained_heap_size(bb).unwrap(), 20);
        assert_eq!(dump.retained_heap_size(root).unwrap(), 131);
    }

    #[test]
    fn test_unreachable_objects_keep_shallow_size() {
        let mut b = HeapDumpBuilder::new();
        let cls = b.class("X");
        let orphan = b.instance_sized(cls, 64);
        let root = b.instance(cls);
        b.gc_root(root);
        let dump = b.finish();

        assert_eq!(dump.retained_heap_size(orphan).unwrap(), 64);
        assert!(!dump.immediate_dominated_ids(None).unwrap().contains(&orphan));
    }

    #[test]
    fn test_field_rewiring_overwrites() {
        let mut b = HeapDumpBuilder::new();
        let cls = b.class("X");
        let first = b.instance(cls);
        let second = b.instance(cls);
        let holder = b.instance(cls);
        b.set_ref_field(holder, "target", first);
        b.set_ref_field(holder, "target", second);
        let dump = b.finish();

        let outs = dump.outbound_referent_ids(holder).unwrap();
        assert_eq!(outs, vec![cls, second]);
    }
}
