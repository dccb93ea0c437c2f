//! The strategy registry: maps a collection's runtime class name plus the
//! JVM generation that produced the dump to the extraction strategy that
//! understands its layout.
//!
//! Field layouts drifted across vendors and releases (the same class name
//! can be a chained hash map on one JVM and an index-range array list on
//! another), so every registration carries a version mask and lookup takes
//! the resolved dump version. Registration order matters: the first entry
//! whose mask covers the version wins.

use std::ops::{BitOr, Not};
use std::sync::OnceLock;

use ahash::AHashMap;

use crate::extract::{
    ArrayRangeExtractor, CollectionExtractor, ConcurrentSkipListExtractor, EmptyExtractor,
    EmptyMapExtractor, EntrySetViewExtractor, ExtractResult, FieldArrayExtractor,
    FieldSizeArrayExtractor, FieldSizedExtractor, HashMapExtractor, HashSetExtractor,
    IdentityHashMapExtractor, KeySetViewExtractor, LinkedListExtractor, MapEntries,
    NoContentExtractor, PairExtractor, ReplicatedValueExtractor, SegmentedMapExtractor,
    SingletonExtractor, SingletonMapExtractor, TreeMapArrayExtractor, TreeMapExtractor,
    TreeSetExtractor, ValuesViewExtractor, WrapperCollectionExtractor, WrapperMapExtractor,
};
use crate::snapshot::{HeapObject, Snapshot};
use crate::types::{ObjectId, SnapshotError};

/// Bit set of JVM generations a registration applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionMask(u32);

impl VersionMask {
    pub const SUN: VersionMask = VersionMask(1 << 0);
    pub const IBM14: VersionMask = VersionMask(1 << 1);
    pub const IBM15: VersionMask = VersionMask(1 << 2);
    pub const IBM16: VersionMask = VersionMask(1 << 3);
    pub const IBM17: VersionMask = VersionMask(1 << 4);
    pub const IBM18: VersionMask = VersionMask(1 << 5);
    pub const JAVA18: VersionMask = VersionMask(1 << 6);
    pub const ALL: VersionMask = VersionMask(!0);

    pub fn contains(self, version: VersionMask) -> bool {
        self.0 & version.0 != 0
    }
}

impl BitOr for VersionMask {
    type Output = VersionMask;

    fn bitor(self, rhs: VersionMask) -> VersionMask {
        VersionMask(self.0 | rhs.0)
    }
}

impl Not for VersionMask {
    type Output = VersionMask;

    fn not(self) -> VersionMask {
        VersionMask(!self.0)
    }
}

/// Determines which JVM generation produced the dump.
///
/// The vendor banner is authoritative when present. Dumps without one are
/// fingerprinted by the presence of vendor-private bootstrap classes, and
/// everything unidentifiable is treated as a modern Sun/OpenJDK heap, by
/// far the most common case.
pub fn resolve_version(snap: &dyn Snapshot) -> VersionMask {
    if let Some(info) = snap.info().jvm_info.as_deref() {
        if info.contains("IBM") {
            if info.contains("1.8") {
                return VersionMask::IBM18;
            }
            if info.contains("1.7") {
                // Early 1.7 service releases still shipped the 1.6
                // collection layouts.
                for sr in ["SR1", "SR2", "SR3"] {
                    if info.contains(sr) {
                        return VersionMask::IBM16;
                    }
                }
                return VersionMask::IBM17;
            }
            if info.contains("1.6") {
                return VersionMask::IBM16;
            }
            if info.contains("1.5") {
                return VersionMask::IBM15;
            }
            if info.contains("1.4") {
                return VersionMask::IBM14;
            }
        }
        if info.contains("1.8") || info.contains("(8") {
            return VersionMask::JAVA18;
        }
    }

    if !snap.classes_by_name("com.ibm.oti.vm.BootstrapClassLoader").is_empty() {
        return VersionMask::IBM16;
    }
    if !snap.classes_by_name("com.ibm.misc.JavaRuntimeVersion").is_empty() {
        return VersionMask::IBM15;
    }
    if !snap.classes_by_name("com.ibm.jvm.Trace").is_empty() {
        return VersionMask::IBM14;
    }
    if !snap.classes_by_name("java.lang.invoke.LambdaMetafactory").is_empty() {
        return VersionMask::JAVA18;
    }
    VersionMask::SUN
}

struct Entry {
    class_name: &'static str,
    versions: VersionMask,
    extractor: Box<dyn CollectionExtractor>,
}

pub struct Registry {
    entries: Vec<Entry>,
    by_name: AHashMap<&'static str, Vec<usize>>,
}

impl Registry {
    fn new() -> Self {
        let mut registry = Registry {
            entries: Vec::new(),
            by_name: AHashMap::new(),
        };
        registry.register_known();
        registry
    }

    fn add(
        &mut self,
        class_name: &'static str,
        versions: VersionMask,
        extractor: impl CollectionExtractor + 'static,
    ) {
        let index = self.entries.len();
        self.entries.push(Entry {
            class_name,
            versions,
            extractor: Box::new(extractor),
        });
        self.by_name.entry(class_name).or_default().push(index);
    }

    /// First registered strategy for `class_name` whose mask covers
    /// `version`.
    pub fn lookup(
        &self,
        class_name: &str,
        version: VersionMask,
    ) -> Option<&dyn CollectionExtractor> {
        let indices = self.by_name.get(class_name)?;
        indices
            .iter()
            .map(|i| &self.entries[*i])
            .find(|e| e.versions.contains(version))
            .map(|e| e.extractor.as_ref())
    }

    /// Strategy for a concrete heap object, or `None` when its class is not
    /// a known collection.
    pub fn extractor_for<'a>(
        &'a self,
        obj: &HeapObject,
    ) -> Result<Option<&'a dyn CollectionExtractor>, SnapshotError> {
        let name = obj.class_name()?;
        Ok(self.lookup(name, resolve_version(obj.snapshot())))
    }

    fn register_known(&mut self) {
        use VersionMask as V;
        let all = V::ALL;
        let non_ibm16 = !V::IBM16;
        let ibm14_15 = V::IBM14 | V::IBM15;
        let ibm16 = V::IBM16;

        // Shared empty instances.
        self.add("java.util.Collections$EmptyList", all, EmptyExtractor);
        self.add("java.util.Collections$EmptySet", all, EmptyExtractor);
        self.add("java.util.Collections$EmptyMap", all, EmptyMapExtractor);

        // Array-backed lists and queues.
        self.add(
            "java.util.ArrayList",
            non_ibm16,
            FieldSizeArrayExtractor::new("size", "elementData"),
        );
        self.add(
            "java.util.ArrayList",
            ibm16,
            ArrayRangeExtractor::new("firstIndex", "lastIndex", "array"),
        );
        self.add(
            "java.util.ArrayList$SubList",
            all,
            FieldSizedExtractor::new("size"),
        );
        self.add(
            "java.util.Vector",
            all,
            FieldSizeArrayExtractor::new("elementCount", "elementData"),
        );
        self.add(
            "java.util.Stack",
            all,
            FieldSizeArrayExtractor::new("elementCount", "elementData"),
        );
        self.add(
            "java.util.ArrayDeque",
            all,
            ArrayRangeExtractor::new("head", "tail", "elements"),
        );
        self.add(
            "java.util.PriorityQueue",
            non_ibm16,
            FieldSizeArrayExtractor::new("size", "queue"),
        );
        self.add(
            "java.util.PriorityQueue",
            ibm16,
            FieldSizeArrayExtractor::new("size", "elements"),
        );
        self.add(
            "java.util.concurrent.DelayQueue",
            non_ibm16,
            FieldSizeArrayExtractor::new("q.size", "q.queue"),
        );
        self.add(
            "java.util.concurrent.DelayQueue",
            ibm16,
            FieldSizeArrayExtractor::new("q.size", "q.elements"),
        );
        self.add(
            "java.util.concurrent.CopyOnWriteArrayList",
            all,
            FieldArrayExtractor::new("array"),
        );
        self.add(
            "java.util.concurrent.CopyOnWriteArraySet",
            all,
            FieldArrayExtractor::new("al.array"),
        );

        // Size-only linked queues.
        self.add(
            "java.util.concurrent.LinkedBlockingDeque",
            all,
            FieldSizedExtractor::new("count"),
        );
        self.add(
            "java.util.concurrent.LinkedBlockingQueue",
            all,
            FieldSizedExtractor::new("count.value"),
        );

        // Linked lists.
        self.add("java.util.LinkedList", all, LinkedListExtractor::new("size"));

        // Chained hash maps.
        self.add(
            "java.util.HashMap",
            non_ibm16,
            HashMapExtractor::new("size", "table", "key", "value"),
        );
        self.add(
            "java.util.HashMap",
            ibm16,
            HashMapExtractor::new("elementCount", "elementData", "key", "value"),
        );
        self.add(
            "java.util.LinkedHashMap",
            non_ibm16,
            HashMapExtractor::new("size", "table", "key", "value"),
        );
        self.add(
            "java.util.Hashtable",
            non_ibm16,
            HashMapExtractor::new("count", "table", "key", "value"),
        );
        self.add(
            "java.util.Hashtable",
            ibm16,
            HashMapExtractor::new("elementCount", "elementData", "key", "value"),
        );
        self.add(
            "java.util.Properties",
            non_ibm16,
            HashMapExtractor::new("count", "table", "key", "value"),
        );
        self.add(
            "java.util.WeakHashMap",
            all,
            HashMapExtractor::new("size", "table", "referent", "value"),
        );
        self.add(
            "java.lang.ThreadLocal$ThreadLocalMap",
            all,
            HashMapExtractor::new("size", "table", "referent", "value"),
        );

        // Concurrent maps: Java 8 flattened the segments away.
        self.add(
            "java.util.concurrent.ConcurrentHashMap",
            V::JAVA18,
            HashMapExtractor::new("baseCount", "table", "key", "val"),
        );
        self.add(
            "java.util.concurrent.ConcurrentHashMap",
            !V::JAVA18,
            SegmentedMapExtractor::new("segments"),
        );
        self.add(
            "java.util.concurrent.ConcurrentHashMap$Segment",
            all,
            HashMapExtractor::new("count", "table", "key", "value"),
        );

        // Hash sets over an inner map.
        self.add(
            "java.util.HashSet",
            non_ibm16,
            HashSetExtractor::new("map.size", "map.table", "key", "value"),
        );
        self.add(
            "java.util.HashSet",
            ibm16,
            HashSetExtractor::new(
                "backingMap.elementCount",
                "backingMap.elementData",
                "key",
                "value",
            ),
        );
        self.add(
            "java.util.LinkedHashSet",
            non_ibm16,
            HashSetExtractor::new("map.size", "map.table", "key", "value"),
        );

        // Linear-probed identity map.
        self.add(
            "java.util.IdentityHashMap",
            !ibm14_15,
            IdentityHashMapExtractor::new("size", "table"),
        );
        self.add(
            "java.util.IdentityHashMap",
            ibm14_15,
            IdentityHashMapExtractor::new("size", "elementData"),
        );

        // Skip lists: only the base-level node chain is walked.
        self.add(
            "java.util.concurrent.ConcurrentSkipListMap",
            all,
            ConcurrentSkipListExtractor::new("head.node", "key", "value"),
        );
        self.add(
            "java.util.concurrent.ConcurrentSkipListSet",
            all,
            ConcurrentSkipListExtractor::new("m.head.node", "key", "value"),
        );

        // Sorted maps and sets.
        self.add(
            "java.util.TreeMap",
            non_ibm16,
            TreeMapExtractor::new("size", "key", "value"),
        );
        self.add(
            "java.util.TreeMap",
            ibm16,
            TreeMapArrayExtractor::new("size", "keys[]", "values[]"),
        );
        self.add(
            "java.util.TreeSet",
            non_ibm16,
            TreeSetExtractor::new("m.size", "key"),
        );
        self.add(
            "java.util.TreeSet",
            ibm16,
            TreeMapArrayExtractor::new("m.size", "m.keys[]", "m.values[]"),
        );

        // Decorators.
        for name in [
            "java.util.Collections$UnmodifiableCollection",
            "java.util.Collections$UnmodifiableList",
            "java.util.Collections$UnmodifiableRandomAccessList",
            "java.util.Collections$UnmodifiableSet",
            "java.util.Collections$SynchronizedCollection",
            "java.util.Collections$SynchronizedList",
            "java.util.Collections$SynchronizedRandomAccessList",
            "java.util.Collections$SynchronizedSet",
            "java.util.Collections$CheckedCollection",
            "java.util.Collections$CheckedList",
            "java.util.Collections$CheckedSet",
        ] {
            self.add(name, all, WrapperCollectionExtractor::new("c"));
        }
        for name in [
            "java.util.Collections$UnmodifiableMap",
            "java.util.Collections$SynchronizedMap",
            "java.util.Collections$CheckedMap",
        ] {
            self.add(name, all, WrapperMapExtractor::new("m"));
        }

        // Singletons and replicated values.
        self.add(
            "java.util.Collections$SingletonList",
            all,
            SingletonExtractor::new("element"),
        );
        self.add(
            "java.util.Collections$SingletonSet",
            all,
            SingletonExtractor::new("element"),
        );
        self.add(
            "java.util.Collections$SingletonMap",
            all,
            SingletonMapExtractor::new("k", "v"),
        );
        self.add(
            "java.util.Collections$CopiesList",
            all,
            ReplicatedValueExtractor::new("n", "element"),
        );

        // Map.Entry holders.
        self.add(
            "java.util.AbstractMap$SimpleEntry",
            all,
            PairExtractor::new("key", "value"),
        );
        self.add(
            "java.util.AbstractMap$SimpleImmutableEntry",
            all,
            PairExtractor::new("key", "value"),
        );

        // Map views.
        self.add(
            "java.util.HashMap$KeySet",
            all,
            KeySetViewExtractor::new("this$0"),
        );
        self.add(
            "java.util.HashMap$Values",
            all,
            ValuesViewExtractor::new("this$0"),
        );
        self.add(
            "java.util.HashMap$EntrySet",
            all,
            EntrySetViewExtractor::new("this$0"),
        );
        self.add(
            "java.util.TreeMap$KeySet",
            all,
            KeySetViewExtractor::new("m"),
        );
        self.add(
            "java.util.TreeMap$Values",
            all,
            ValuesViewExtractor::new("this$0"),
        );
        self.add(
            "java.util.TreeMap$EntrySet",
            all,
            EntrySetViewExtractor::new("this$0"),
        );
        self.add(
            "java.util.concurrent.ConcurrentHashMap$KeySetView",
            all,
            KeySetViewExtractor::new("map"),
        );
        self.add(
            "java.util.concurrent.ConcurrentHashMap$ValuesView",
            all,
            ValuesViewExtractor::new("map"),
        );
        self.add(
            "java.util.concurrent.ConcurrentHashMap$EntrySetView",
            all,
            EntrySetViewExtractor::new("map"),
        );

        // Lookup tables whose storage we deliberately do not walk.
        self.add("sun.util.PreHashedMap", all, NoContentExtractor);
        self.add("sun.misc.SoftCache", all, NoContentExtractor);
    }
}

/// Process-wide registry, built on first use. The table is immutable after
/// construction, which is what lets `lookup` hand out plain references.
pub fn global() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Registry::new)
}

/// A heap object paired with its resolved strategy: the main entry point for
/// callers that just want answers about one collection.
pub struct ExtractedCollection<'s> {
    obj: HeapObject<'s>,
    extractor: &'static dyn CollectionExtractor,
}

impl<'s> ExtractedCollection<'s> {
    pub fn object(&self) -> &HeapObject<'s> {
        &self.obj
    }

    pub fn extractor(&self) -> &'static dyn CollectionExtractor {
        self.extractor
    }

    pub fn size(&self) -> ExtractResult<u32> {
        self.extractor.size(&self.obj)
    }

    pub fn capacity(&self) -> ExtractResult<u32> {
        self.extractor.capacity(&self.obj)
    }

    pub fn fill_ratio(&self) -> ExtractResult<f64> {
        self.extractor.fill_ratio(&self.obj)
    }

    pub fn collision_ratio(&self) -> ExtractResult<f64> {
        self.extractor.collision_ratio(&self.obj)
    }

    pub fn extract_entry_ids(&self) -> ExtractResult<Vec<ObjectId>> {
        self.extractor.extract_entry_ids(&self.obj)
    }

    pub fn backing_array(&self) -> ExtractResult<ObjectId> {
        self.extractor.backing_array(&self.obj)
    }

    pub fn map_entries(&self) -> ExtractResult<MapEntries<'s>> {
        self.extractor.map_entries(&self.obj)
    }
}

/// Looks up the strategy for `obj`; `None` when its class is not a known
/// collection type.
pub fn extract_collection<'s>(
    obj: HeapObject<'s>,
) -> Result<Option<ExtractedCollection<'s>>, SnapshotError> {
    Ok(global()
        .extractor_for(&obj)?
        .map(|extractor| ExtractedCollection { obj, extractor }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::HeapDumpBuilder;

    #[test]
    fn test_version_mask_operations() {
        let mask = VersionMask::IBM14 | VersionMask::IBM15;
        assert!(mask.contains(VersionMask::IBM14));
        assert!(!mask.contains(VersionMask::SUN));
        assert!((!mask).contains(VersionMask::SUN));
        assert!(VersionMask::ALL.contains(VersionMask::JAVA18));
    }

    #[test]
    fn test_resolve_version_from_banner() {
        let version_of = |info: &str| {
            let mut b = HeapDumpBuilder::new();
            b.jvm_info(info);
            let dump = b.finish();
            resolve_version(&dump)
        };
        assert_eq!(version_of("IBM J9 VM JRE 1.8.0"), VersionMask::IBM18);
        assert_eq!(version_of("IBM J9 VM JRE 1.7.0 SR2"), VersionMask::IBM16);
        assert_eq!(version_of("IBM J9 VM JRE 1.7.0 SR5"), VersionMask::IBM17);
        assert_eq!(version_of("Java HotSpot 1.8.0_181"), VersionMask::JAVA18);
        assert_eq!(version_of("Java HotSpot 1.7.0"), VersionMask::SUN);
    }

    #[test]
    fn test_resolve_version_from_class_presence() {
        let mut b = HeapDumpBuilder::new();
        b.class("com.ibm.oti.vm.BootstrapClassLoader");
        let dump = b.finish();
        assert_eq!(resolve_version(&dump), VersionMask::IBM16);

        let dump = HeapDumpBuilder::new().finish();
        assert_eq!(resolve_version(&dump), VersionMask::SUN);
    }

    #[test]
    fn test_lookup_respects_version_masks() {
        let registry = global();
        // ArrayList means two different layouts depending on the JVM
        assert!(registry.lookup("java.util.ArrayList", VersionMask::SUN).is_some());
        assert!(registry.lookup("java.util.ArrayList", VersionMask::IBM16).is_some());
        assert!(
            registry
                .lookup("java.util.concurrent.ConcurrentSkipListMap", VersionMask::SUN)
                .is_some()
        );
        assert!(registry.lookup("com.example.MyList", VersionMask::SUN).is_none());
    }

    #[test]
    fn test_lookup_first_match_wins() {
        let registry = global();
        // CHM resolves to the flat layout on Java 8, segments elsewhere
        let modern = registry
            .lookup("java.util.concurrent.ConcurrentHashMap", VersionMask::JAVA18)
            .unwrap();
        assert!(modern.has_collision_ratio());
        let legacy = registry
            .lookup("java.util.concurrent.ConcurrentHashMap", VersionMask::SUN)
            .unwrap();
        assert!(!legacy.has_collision_ratio());
    }

    #[test]
    fn test_extract_collection_end_to_end() {
        let mut b = HeapDumpBuilder::new();
        let cls = b.class("java.util.ArrayList");
        let cls_arr = b.class("java.lang.Object[]");
        let cls_s = b.class("java.lang.String");
        let e = b.instance(cls_s);
        let arr = b.ref_array(cls_arr, &[Some(e), None, None, None]);
        let list = b.instance(cls);
        b.set_int_field(list, "size", 1);
        b.set_ref_field(list, "elementData", arr);
        let dump = b.finish();

        let coll = extract_collection(HeapObject::new(&dump, list))
            .unwrap()
            .unwrap();
        assert_eq!(coll.size().unwrap().value(), Some(1));
        assert_eq!(coll.fill_ratio().unwrap().value(), Some(0.25));

        let plain = extract_collection(HeapObject::new(&dump, e)).unwrap();
        assert!(plain.is_none());
    }
}
