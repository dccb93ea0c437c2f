mod builder;
mod dump_file;
mod heap;

pub use builder::HeapDumpBuilder;
pub use dump_file::{read_dump_file, write_dump_file};
pub use heap::HeapDump;

use crate::types::{Address, ObjectId, SnapshotError};

/// Identifying metadata of a loaded snapshot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotInfo {
    pub object_count: usize,
    pub used_heap_size: u64,
    /// Size in bytes of an object identifier on the dumped heap; also the
    /// smallest meaningful heap-size delta.
    pub identifier_size: u32,
    /// Free-form JVM vendor/version banner as captured in the dump, if any.
    pub jvm_info: Option<String>,
}

/// A single named field value of a heap object.
///
/// References are kept as raw addresses until the last possible moment;
/// `Snapshot::map_address_to_id` is the only conversion to object ids.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue {
    Null,
    Ref(Address),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl FieldValue {
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            FieldValue::Int(v) => u32::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Short human-readable rendering for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            FieldValue::Null => "null".to_string(),
            FieldValue::Ref(addr) => format!("ref {:#x}", addr),
            FieldValue::Int(v) => format!("int {}", v),
            FieldValue::Float(v) => format!("float {}", v),
            FieldValue::Bool(v) => format!("bool {}", v),
        }
    }
}

/// Read-only view of a loaded heap dump. All extraction and traversal in this
/// crate is expressed against this trait; the in-memory `HeapDump` is one
/// implementation, embedders may bring their own index-backed one.
///
/// The snapshot is immutable once loaded. Implementations must be safe for
/// concurrent readers; nothing in this crate writes through this trait.
pub trait Snapshot: Send + Sync {
    fn info(&self) -> &SnapshotInfo;

    fn map_address_to_id(&self, addr: Address) -> Result<ObjectId, SnapshotError>;
    fn map_id_to_address(&self, id: ObjectId) -> Result<Address, SnapshotError>;

    /// Outbound referent ids of an object: its class first, then one id per
    /// non-null field reference (for instances) or per non-null slot (for
    /// reference arrays), in layout order. Not deduplicated.
    fn outbound_referent_ids(&self, id: ObjectId) -> Result<Vec<ObjectId>, SnapshotError>;

    fn is_array(&self, id: ObjectId) -> bool;
    fn is_class(&self, id: ObjectId) -> bool;

    /// The class object of `id`.
    fn class_of(&self, id: ObjectId) -> Result<ObjectId, SnapshotError>;

    /// Fully-qualified runtime name of a class object.
    fn class_name(&self, class_id: ObjectId) -> Result<&str, SnapshotError>;

    /// Defining classloader of a class object, if recorded.
    fn class_loader_of(&self, class_id: ObjectId) -> Result<Option<ObjectId>, SnapshotError>;

    /// Class objects whose fully-qualified name equals `name` exactly.
    fn classes_by_name(&self, name: &str) -> Vec<ObjectId>;

    fn heap_size(&self, id: ObjectId) -> Result<u64, SnapshotError>;
    fn retained_heap_size(&self, id: ObjectId) -> Result<u64, SnapshotError>;

    /// Children of `parent` in the dominator tree; `None` expands the
    /// synthetic root (the dominator-tree roots themselves).
    fn immediate_dominated_ids(
        &self,
        parent: Option<ObjectId>,
    ) -> Result<Vec<ObjectId>, SnapshotError>;

    /// Objects kept alive for a reason external to the object graph.
    fn gc_root_ids(&self) -> &[ObjectId];

    /// Named field of an instance, `Ok(None)` when absent. Dumps captured
    /// with incomplete metadata may be missing fields entirely; extraction
    /// strategies fall back to structural inference in that case.
    fn field(&self, id: ObjectId, name: &str) -> Result<Option<FieldValue>, SnapshotError>;

    /// All fields of an instance in declaration order (subclass before
    /// superclass, matching on-heap layout).
    fn fields(&self, id: ObjectId) -> Result<Vec<(String, FieldValue)>, SnapshotError>;

    /// Slot count of an array object.
    fn array_length(&self, id: ObjectId) -> Result<usize, SnapshotError>;

    /// Raw reference array of an object array; zero addresses mark null slots.
    fn reference_array(&self, id: ObjectId) -> Result<Vec<Address>, SnapshotError>;
}

/// Lightweight handle pairing an object id with its snapshot. This is the
/// currency of the extraction layer.
#[derive(Clone, Copy)]
pub struct HeapObject<'s> {
    snap: &'s dyn Snapshot,
    id: ObjectId,
}

/// Outcome of resolving a dotted field path: either another heap object or a
/// primitive leaf value.
pub enum Value<'s> {
    Object(HeapObject<'s>),
    Primitive(FieldValue),
}

impl<'s> HeapObject<'s> {
    pub fn new(snap: &'s dyn Snapshot, id: ObjectId) -> Self {
        Self { snap, id }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn snapshot(&self) -> &'s dyn Snapshot {
        self.snap
    }

    pub fn address(&self) -> Result<Address, SnapshotError> {
        self.snap.map_id_to_address(self.id)
    }

    pub fn class_id(&self) -> Result<ObjectId, SnapshotError> {
        self.snap.class_of(self.id)
    }

    pub fn class_name(&self) -> Result<&'s str, SnapshotError> {
        self.snap.class_name(self.snap.class_of(self.id)?)
    }

    pub fn is_array(&self) -> bool {
        self.snap.is_array(self.id)
    }

    /// `<class name> @ 0x<address>`, the conventional diagnostic identity.
    pub fn display_name(&self) -> String {
        let name = self.class_name().unwrap_or("<unknown class>");
        match self.address() {
            Ok(addr) => format!("{} @ {:#x}", name, addr),
            Err(_) => format!("{} #{}", name, self.id),
        }
    }

    pub fn field(&self, name: &str) -> Result<Option<FieldValue>, SnapshotError> {
        self.snap.field(self.id, name)
    }

    /// Resolves a dot-separated field path, chaining through intermediate
    /// objects. A trailing `[]` marks the final referent as an array whose
    /// elements (not the array object itself) are the logical target; the
    /// array object is returned and the caller indexes it.
    ///
    /// `Ok(None)` means a null link or an absent field anywhere along the
    /// path — indistinguishable on purpose, since both mean "no value here".
    pub fn resolve_value(&self, path: &str) -> Result<Option<Value<'s>>, SnapshotError> {
        let path = path.strip_suffix("[]").unwrap_or(path);
        let mut current = *self;
        let mut segments = path.split('.').peekable();

        while let Some(segment) = segments.next() {
            if segment.is_empty() {
                // Trailing dot: the path names the object itself, not a field.
                return Ok(Some(Value::Object(current)));
            }
            let value = match current.field(segment)? {
                Some(v) => v,
                None => return Ok(None),
            };
            match value {
                FieldValue::Null => return Ok(None),
                FieldValue::Ref(addr) => {
                    let id = self.snap.map_address_to_id(addr)?;
                    current = HeapObject::new(self.snap, id);
                }
                primitive => {
                    return if segments.peek().is_none() {
                        Ok(Some(Value::Primitive(primitive)))
                    } else {
                        // Can't chain through a primitive.
                        Ok(None)
                    };
                }
            }
        }
        Ok(Some(Value::Object(current)))
    }

    /// Resolves a path expecting an object referent.
    pub fn resolve_object(&self, path: &str) -> Result<Option<HeapObject<'s>>, SnapshotError> {
        match self.resolve_value(path)? {
            Some(Value::Object(obj)) => Ok(Some(obj)),
            _ => Ok(None),
        }
    }
}

impl std::fmt::Debug for HeapObject<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HeapObject({})", self.display_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_value_chains_through_objects() {
        let mut b = HeapDumpBuilder::new();
        let cls_outer = b.class("Outer");
        let cls_inner = b.class("Inner");
        let inner = b.instance(cls_inner);
        b.set_int_field(inner, "size", 7);
        let outer = b.instance(cls_outer);
        b.set_ref_field(outer, "child", inner);
        let dump = b.finish();

        let obj = HeapObject::new(&dump, outer);
        match obj.resolve_value("child.size").unwrap() {
            Some(Value::Primitive(FieldValue::Int(7))) => {}
            other => panic!("unexpected resolution: {:?}", other.is_some()),
        }
        // null link along the path
        assert!(obj.resolve_value("child.missing.size").unwrap().is_none());
    }

    #[test]
    fn test_resolve_value_array_suffix_returns_array_object() {
        let mut b = HeapDumpBuilder::new();
        let cls = b.class("Holder");
        let cls_arr = b.class("java.lang.Object[]");
        let elem = b.instance(cls);
        let arr = b.ref_array(cls_arr, &[Some(elem), None]);
        let holder = b.instance(cls);
        b.set_ref_field(holder, "keys", arr);
        let dump = b.finish();

        let obj = HeapObject::new(&dump, holder);
        let resolved = obj.resolve_object("keys[]").unwrap().unwrap();
        assert_eq!(resolved.id(), arr);
        assert!(resolved.is_array());
    }

    #[test]
    fn test_display_name_contains_class_and_address() {
        let mut b = HeapDumpBuilder::new();
        let cls = b.class("java.util.HashMap");
        let obj = b.instance(cls);
        let dump = b.finish();

        let name = HeapObject::new(&dump, obj).display_name();
        assert!(name.starts_with("java.util.HashMap @ 0x"), "{}", name);
    }
}
