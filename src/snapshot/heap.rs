use ahash::AHashMap;

use crate::snapshot::{FieldValue, Snapshot, SnapshotInfo};
use crate::types::{Address, ObjectId, SnapshotError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectKind {
    Instance,
    RefArray,
    PrimArray,
    Class,
}

#[derive(Debug, Clone)]
pub(crate) struct ClassMeta {
    pub name: String,
    pub loader: Option<ObjectId>,
}

/// In-memory snapshot in structure-of-arrays layout.
///
/// Object data is kept column-wise, one entry per object id; outbound edges
/// are flattened into a single target vector with per-object ranges. The
/// dominator tree and retained sizes are precomputed by the builder, so every
/// `Snapshot` read below is a plain lookup.
pub struct HeapDump {
    pub(crate) info: SnapshotInfo,

    // Object data (Structure of Arrays)
    pub(crate) kinds: Vec<ObjectKind>,
    pub(crate) addresses: Vec<Address>,
    pub(crate) class_ids: Vec<ObjectId>,
    pub(crate) heap_sizes: Vec<u64>,
    pub(crate) fields: Vec<Vec<(String, FieldValue)>>,
    pub(crate) ref_arrays: Vec<Option<Vec<Address>>>,
    pub(crate) prim_array_lengths: Vec<u32>,

    // Edge data
    pub(crate) edge_ranges: Vec<(u32, u32)>,
    pub(crate) edge_targets: Vec<ObjectId>,

    // Metadata
    pub(crate) class_meta: AHashMap<ObjectId, ClassMeta>,
    pub(crate) addr_to_id: AHashMap<Address, ObjectId>,
    pub(crate) gc_roots: Vec<ObjectId>,

    // Dominator precompute
    pub(crate) dom_roots: Vec<ObjectId>,
    pub(crate) dom_children: Vec<Vec<ObjectId>>,
    pub(crate) retained_sizes: Vec<u64>,
}

impl HeapDump {
    pub fn object_count(&self) -> usize {
        self.kinds.len()
    }

    fn check_id(&self, id: ObjectId) -> Result<usize, SnapshotError> {
        let idx = id as usize;
        if idx < self.kinds.len() {
            Ok(idx)
        } else {
            Err(SnapshotError::ObjectNotFound(id))
        }
    }
}

impl Snapshot for HeapDump {
    fn info(&self) -> &SnapshotInfo {
        &self.info
    }

    fn map_address_to_id(&self, addr: Address) -> Result<ObjectId, SnapshotError> {
        self.addr_to_id
            .get(&addr)
            .copied()
            .ok_or(SnapshotError::UnmappedAddress(addr))
    }

    fn map_id_to_address(&self, id: ObjectId) -> Result<Address, SnapshotError> {
        Ok(self.addresses[self.check_id(id)?])
    }

    fn outbound_referent_ids(&self, id: ObjectId) -> Result<Vec<ObjectId>, SnapshotError> {
        let idx = self.check_id(id)?;
        let (start, end) = self.edge_ranges[idx];
        Ok(self.edge_targets[start as usize..end as usize].to_vec())
    }

    fn is_array(&self, id: ObjectId) -> bool {
        matches!(
            self.kinds.get(id as usize),
            Some(ObjectKind::RefArray | ObjectKind::PrimArray)
        )
    }

    fn is_class(&self, id: ObjectId) -> bool {
        matches!(self.kinds.get(id as usize), Some(ObjectKind::Class))
    }

    fn class_of(&self, id: ObjectId) -> Result<ObjectId, SnapshotError> {
        Ok(self.class_ids[self.check_id(id)?])
    }

    fn class_name(&self, class_id: ObjectId) -> Result<&str, SnapshotError> {
        self.class_meta
            .get(&class_id)
            .map(|m| m.name.as_str())
            .ok_or(SnapshotError::NotAClass(class_id))
    }

    fn class_loader_of(&self, class_id: ObjectId) -> Result<Option<ObjectId>, SnapshotError> {
        self.class_meta
            .get(&class_id)
            .map(|m| m.loader)
            .ok_or(SnapshotError::NotAClass(class_id))
    }

    fn classes_by_name(&self, name: &str) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self
            .class_meta
            .iter()
            .filter(|(_, m)| m.name == name)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn heap_size(&self, id: ObjectId) -> Result<u64, SnapshotError> {
        Ok(self.heap_sizes[self.check_id(id)?])
    }

    fn retained_heap_size(&self, id: ObjectId) -> Result<u64, SnapshotError> {
        Ok(self.retained_sizes[self.check_id(id)?])
    }

    fn immediate_dominated_ids(
        &self,
        parent: Option<ObjectId>,
    ) -> Result<Vec<ObjectId>, SnapshotError> {
        match parent {
            None => Ok(self.dom_roots.clone()),
            Some(id) => Ok(self.dom_children[self.check_id(id)?].clone()),
        }
    }

    fn gc_root_ids(&self) -> &[ObjectId] {
        &self.gc_roots
    }

    fn field(&self, id: ObjectId, name: &str) -> Result<Option<FieldValue>, SnapshotError> {
        let idx = self.check_id(id)?;
        Ok(self.fields[idx]
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v))
    }

    fn fields(&self, id: ObjectId) -> Result<Vec<(String, FieldValue)>, SnapshotError> {
        Ok(self.fields[self.check_id(id)?].clone())
    }

    fn array_length(&self, id: ObjectId) -> Result<usize, SnapshotError> {
        let idx = self.check_id(id)?;
        match self.kinds[idx] {
            ObjectKind::RefArray => Ok(self.ref_arrays[idx].as_ref().map_or(0, |a| a.len())),
            ObjectKind::PrimArray => Ok(self.prim_array_lengths[idx] as usize),
            _ => Err(SnapshotError::NotAnArray(id)),
        }
    }

    fn reference_array(&self, id: ObjectId) -> Result<Vec<Address>, SnapshotError> {
        let idx = self.check_id(id)?;
        match &self.ref_arrays[idx] {
            Some(addresses) => Ok(addresses.clone()),
            None => Err(SnapshotError::NotAnArray(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::HeapDumpBuilder;

    fn small_dump() -> HeapDump {
        // root -> holder -> arr[elem, null]
        let mut b = HeapDumpBuilder::new();
        let cls = b.class("Holder");
        let cls_arr = b.class("java.lang.Object[]");
        let elem = b.instance(cls);
        let arr = b.ref_array(cls_arr, &[Some(elem), None]);
        let holder = b.instance(cls);
        b.set_ref_field(holder, "table", arr);
        b.gc_root(holder);
        b.finish()
    }

    #[test]
    fn test_address_mapping_round_trip() {
        let dump = small_dump();
        for id in 0..dump.object_count() as ObjectId {
            let addr = dump.map_id_to_address(id).unwrap();
            assert_eq!(dump.map_address_to_id(addr).unwrap(), id);
        }
        assert!(dump.map_address_to_id(0xdead).is_err());
    }

    #[test]
    fn test_outbounds_class_first_then_refs() {
        let dump = small_dump();
        let holder = 4; // fifth object created
        let outs = dump.outbound_referent_ids(holder).unwrap();
        assert_eq!(outs[0], dump.class_of(holder).unwrap());
        assert_eq!(outs.len(), 2); // class + table
    }

    #[test]
    fn test_array_accessors() {
        let dump = small_dump();
        let arr = 3;
        assert!(dump.is_array(arr));
        assert_eq!(dump.array_length(arr).unwrap(), 2);
        let refs = dump.reference_array(arr).unwrap();
        assert_ne!(refs[0], 0);
        assert_eq!(refs[1], 0);
        // arrays reference class + one id per non-null slot
        assert_eq!(dump.outbound_referent_ids(arr).unwrap().len(), 2);
    }

    #[test]
    fn test_retained_sizes_follow_dominator_tree() {
        let dump = small_dump();
        let holder = 4;
        let arr = 3;
        let elem = 2;
        // holder retains itself + array + element
        let expected = dump.heap_size(holder).unwrap()
            + dump.heap_size(arr).unwrap()
            + dump.heap_size(elem).unwrap();
        assert_eq!(dump.retained_heap_size(holder).unwrap(), expected);
        // the element is only reachable through the array
        assert_eq!(
            dump.retained_heap_size(arr).unwrap(),
            dump.heap_size(arr).unwrap() + dump.heap_size(elem).unwrap()
        );
    }

    #[test]
    fn test_dominator_roots_from_synthetic_root() {
        let dump = small_dump();
        // class objects are roots via the system classloader, plus the
        // explicit holder root
        let roots = dump.immediate_dominated_ids(None).unwrap();
        assert!(roots.contains(&4));
        assert!(roots.contains(&0));
        let children = dump.immediate_dominated_ids(Some(4)).unwrap();
        assert!(children.contains(&3));
    }

    #[test]
    fn test_classes_by_name() {
        let dump = small_dump();
        assert_eq!(dump.classes_by_name("Holder").len(), 1);
        assert!(dump.classes_by_name("missing.Class").is_empty());
    }
}
