//! Delegating strategies: decorator collections (unmodifiable, synchronized,
//! checked) that hold a real collection in a field, and the key/value/entry
//! views a map hands out.
//!
//! None of these know anything about storage themselves. They locate the
//! wrapped collection, ask the registry which strategy understands it, and
//! forward every question there.

use crate::extract::{
    CollectionExtractor, ExtractResult, Extraction, MapEntries,
};
use crate::registry;
use crate::snapshot::HeapObject;
use crate::types::ObjectId;

/// Locates the wrapped collection. The named field wins; a dump without
/// field names falls back to the only outbound referent the registry
/// recognizes as a collection. Zero or several recognized referents means
/// the delegation target is ambiguous, which reads as `Unknown` throughout.
fn resolve_inner<'s>(
    coll: &HeapObject<'s>,
    inner_field: &str,
) -> ExtractResult<(HeapObject<'s>, &'static dyn CollectionExtractor)> {
    if let Some(inner) = coll.resolve_object(inner_field)? {
        return match registry::global().extractor_for(&inner)? {
            Some(extractor) => Ok(Extraction::Value((inner, extractor))),
            None => Ok(Extraction::Unknown),
        };
    }

    let snap = coll.snapshot();
    let mut found = None;
    for id in snap.outbound_referent_ids(coll.id())? {
        if snap.is_class(id) || id == coll.id() {
            continue;
        }
        let candidate = HeapObject::new(snap, id);
        if let Some(extractor) = registry::global().extractor_for(&candidate)? {
            if found.is_some() {
                return Ok(Extraction::Unknown);
            }
            found = Some((candidate, extractor));
        }
    }
    Ok(Extraction::from_option(found))
}

macro_rules! delegate {
    ($self:ident, $coll:ident, $method:ident, $fallback:expr) => {
        match resolve_inner($coll, &$self.inner_field)? {
            Extraction::Value((inner, extractor)) => extractor.$method(&inner),
            other => Ok(other.map(|_| $fallback)),
        }
    };
}

/// Collections.unmodifiableCollection / synchronizedCollection / checked
/// wrappers around lists and sets.
pub struct WrapperCollectionExtractor {
    inner_field: String,
}

impl WrapperCollectionExtractor {
    pub fn new(inner_field: &str) -> Self {
        Self {
            inner_field: inner_field.to_string(),
        }
    }
}

impl CollectionExtractor for WrapperCollectionExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, coll: &HeapObject) -> ExtractResult<u32> {
        delegate!(self, coll, size, 0)
    }

    fn has_capacity(&self) -> bool {
        true
    }

    fn capacity(&self, coll: &HeapObject) -> ExtractResult<u32> {
        delegate!(self, coll, capacity, 0)
    }

    fn has_fill_ratio(&self) -> bool {
        true
    }

    fn fill_ratio(&self, coll: &HeapObject) -> ExtractResult<f64> {
        delegate!(self, coll, fill_ratio, 0.0)
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        delegate!(self, coll, extract_entry_ids, Vec::new())
    }

    fn has_extractable_array(&self) -> bool {
        true
    }

    fn backing_array(&self, coll: &HeapObject) -> ExtractResult<ObjectId> {
        delegate!(self, coll, backing_array, 0)
    }

    fn non_null_element_count(&self, coll: &HeapObject) -> ExtractResult<u32> {
        delegate!(self, coll, non_null_element_count, 0)
    }
}

/// The map-shaped wrappers (unmodifiableMap, synchronizedMap, checkedMap).
pub struct WrapperMapExtractor {
    inner_field: String,
}

impl WrapperMapExtractor {
    pub fn new(inner_field: &str) -> Self {
        Self {
            inner_field: inner_field.to_string(),
        }
    }
}

impl CollectionExtractor for WrapperMapExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, coll: &HeapObject) -> ExtractResult<u32> {
        delegate!(self, coll, size, 0)
    }

    fn has_capacity(&self) -> bool {
        true
    }

    fn capacity(&self, coll: &HeapObject) -> ExtractResult<u32> {
        delegate!(self, coll, capacity, 0)
    }

    fn has_fill_ratio(&self) -> bool {
        true
    }

    fn fill_ratio(&self, coll: &HeapObject) -> ExtractResult<f64> {
        delegate!(self, coll, fill_ratio, 0.0)
    }

    fn has_collision_ratio(&self) -> bool {
        true
    }

    fn collision_ratio(&self, coll: &HeapObject) -> ExtractResult<f64> {
        delegate!(self, coll, collision_ratio, 0.0)
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        delegate!(self, coll, extract_entry_ids, Vec::new())
    }

    fn has_map_entries(&self) -> bool {
        true
    }

    fn map_entries<'s>(&self, coll: &HeapObject<'s>) -> ExtractResult<MapEntries<'s>> {
        delegate!(self, coll, map_entries, MapEntries::empty())
    }
}

/// Projects delegated map entries onto one side.
#[derive(Clone, Copy)]
enum Side {
    Key,
    Value,
}

fn project_entries(
    coll: &HeapObject,
    inner_field: &str,
    side: Side,
) -> ExtractResult<Vec<ObjectId>> {
    let (inner, extractor) = match resolve_inner(coll, inner_field)? {
        Extraction::Value(found) => found,
        other => return Ok(other.map(|_| Vec::new())),
    };
    let entries = match extractor.map_entries(&inner)? {
        Extraction::Value(entries) => entries,
        other => return Ok(other.map(|_| Vec::new())),
    };
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry?;
        let picked = match side {
            Side::Key => entry.key,
            Side::Value => entry.value,
        };
        if let Some(obj) = picked {
            ids.push(obj.id());
        }
    }
    Ok(Extraction::Value(ids))
}

macro_rules! view_extractor {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        pub struct $name {
            inner_field: String,
        }

        impl $name {
            pub fn new(inner_field: &str) -> Self {
                Self {
                    inner_field: inner_field.to_string(),
                }
            }
        }
    };
}

view_extractor!(
    KeySetViewExtractor,
    "Map key-set view: elements are the keys of the backing map."
);
view_extractor!(
    ValuesViewExtractor,
    "Map values view: elements are the values of the backing map."
);
view_extractor!(
    EntrySetViewExtractor,
    "Map entry-set view: elements are the entry objects of the backing map."
);

impl CollectionExtractor for KeySetViewExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, coll: &HeapObject) -> ExtractResult<u32> {
        delegate!(self, coll, size, 0)
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        project_entries(coll, &self.inner_field, Side::Key)
    }
}

impl CollectionExtractor for ValuesViewExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, coll: &HeapObject) -> ExtractResult<u32> {
        delegate!(self, coll, size, 0)
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        project_entries(coll, &self.inner_field, Side::Value)
    }
}

impl CollectionExtractor for EntrySetViewExtractor {
    fn has_size(&self) -> bool {
        true
    }

    fn size(&self, coll: &HeapObject) -> ExtractResult<u32> {
        delegate!(self, coll, size, 0)
    }

    fn has_extractable_contents(&self) -> bool {
        true
    }

    fn extract_entry_ids(&self, coll: &HeapObject) -> ExtractResult<Vec<ObjectId>> {
        delegate!(self, coll, extract_entry_ids, Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{HeapDump, HeapDumpBuilder};

    /// unmodifiableList(ArrayList of 2 elements)
    fn wrapped_list_dump(wrapper_field: Option<&str>) -> (HeapDump, ObjectId) {
        let mut b = HeapDumpBuilder::new();
        let cls_wrap = b.class("java.util.Collections$UnmodifiableList");
        let cls_list = b.class("java.util.ArrayList");
        let cls_arr = b.class("java.lang.Object[]");
        let cls_s = b.class("java.lang.String");
        let e0 = b.instance(cls_s);
        let e1 = b.instance(cls_s);
        let arr = b.ref_array(cls_arr, &[Some(e0), Some(e1), None, None]);
        let list = b.instance(cls_list);
        b.set_int_field(list, "size", 2);
        b.set_ref_field(list, "elementData", arr);
        let wrap = b.instance(cls_wrap);
        if let Some(field) = wrapper_field {
            b.set_ref_field(wrap, field, list);
        } else {
            b.set_ref_field(wrap, "anonymous", list);
        }
        (b.finish(), wrap)
    }

    #[test]
    fn test_wrapper_delegates_by_field_name() {
        let (dump, wrap) = wrapped_list_dump(Some("c"));
        let x = WrapperCollectionExtractor::new("c");
        let coll = HeapObject::new(&dump, wrap);
        assert_eq!(x.size(&coll).unwrap().value(), Some(2));
        assert_eq!(x.capacity(&coll).unwrap().value(), Some(4));
        assert_eq!(x.fill_ratio(&coll).unwrap().value(), Some(0.5));
        assert_eq!(x.extract_entry_ids(&coll).unwrap().value().unwrap().len(), 2);
    }

    #[test]
    fn test_wrapper_falls_back_to_recognized_referent() {
        // field name in the dump differs from the configured one
        let (dump, wrap) = wrapped_list_dump(None);
        let x = WrapperCollectionExtractor::new("c");
        let coll = HeapObject::new(&dump, wrap);
        assert_eq!(x.size(&coll).unwrap().value(), Some(2));
    }

    fn map_view_dump() -> (HeapDump, ObjectId, ObjectId, ObjectId) {
        let mut b = HeapDumpBuilder::new();
        let cls_view = b.class("java.util.HashMap$KeySet");
        let cls_map = b.class("java.util.HashMap");
        let cls_entry = b.class("java.util.HashMap$Node");
        let cls_arr = b.class("Node[]");
        let cls_s = b.class("java.lang.String");
        let k = b.instance(cls_s);
        let v = b.instance(cls_s);
        let e = b.instance(cls_entry);
        b.set_ref_field(e, "key", k);
        b.set_ref_field(e, "value", v);
        let table = b.ref_array(cls_arr, &[Some(e), None]);
        let map = b.instance(cls_map);
        b.set_int_field(map, "size", 1);
        b.set_ref_field(map, "table", table);
        let view = b.instance(cls_view);
        b.set_ref_field(view, "this$0", map);
        (b.finish(), view, k, v)
    }

    #[test]
    fn test_key_and_value_views_project_entries() {
        let (dump, view, k, v) = map_view_dump();
        let coll = HeapObject::new(&dump, view);

        let keys = KeySetViewExtractor::new("this$0");
        assert_eq!(keys.size(&coll).unwrap().value(), Some(1));
        assert_eq!(keys.extract_entry_ids(&coll).unwrap().value(), Some(vec![k]));

        let values = ValuesViewExtractor::new("this$0");
        assert_eq!(
            values.extract_entry_ids(&coll).unwrap().value(),
            Some(vec![v])
        );
    }

    #[test]
    fn test_unrecognized_inner_is_unknown() {
        let mut b = HeapDumpBuilder::new();
        let cls_wrap = b.class("java.util.Collections$UnmodifiableList");
        let cls_other = b.class("com.example.Custom");
        let inner = b.instance(cls_other);
        let wrap = b.instance(cls_wrap);
        b.set_ref_field(wrap, "c", inner);
        let dump = b.finish();

        let x = WrapperCollectionExtractor::new("c");
        assert!(x.size(&HeapObject::new(&dump, wrap)).unwrap().is_unknown());
    }
}
