//! Dominator-tree browsing with optional grouping.
//!
//! The raw dominator tree answers "what does this object keep alive"; the
//! groupings aggregate that per class, per classloader, or into a package
//! trie, because a million ungrouped byte arrays tell nobody anything.

use std::cell::OnceCell;
use std::collections::BTreeMap;

use ahash::AHashMap;
use itertools::Itertools;

use crate::progress::CancellationToken;
use crate::query::QueryError;
use crate::snapshot::{HeapObject, Snapshot};
use crate::types::ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grouping {
    None,
    ByClass,
    ByClassLoader,
    ByPackage,
}

enum NodeKind {
    Object(ObjectId),
    /// All same-class objects at one tree level, keyed by their class.
    Class {
        class_id: ObjectId,
        objects: Vec<ObjectId>,
    },
    /// Same, keyed by the defining loader of the objects' classes. `None`
    /// is the bootstrap loader.
    ClassLoader {
        loader: Option<ObjectId>,
        objects: Vec<ObjectId>,
    },
}

/// One expandable row of a grouped dominator tree.
pub struct Node<'s> {
    snap: &'s dyn Snapshot,
    kind: NodeKind,
    label: OnceCell<String>,
    retained: OnceCell<u64>,
}

impl<'s> Node<'s> {
    fn object(snap: &'s dyn Snapshot, id: ObjectId) -> Self {
        Self {
            snap,
            kind: NodeKind::Object(id),
            label: OnceCell::new(),
            retained: OnceCell::new(),
        }
    }

    /// The objects this row stands for: one for plain nodes, the whole
    /// group otherwise.
    pub fn object_ids(&self) -> &[ObjectId] {
        match &self.kind {
            NodeKind::Object(id) => std::slice::from_ref(id),
            NodeKind::Class { objects, .. } => objects,
            NodeKind::ClassLoader { objects, .. } => objects,
        }
    }

    pub fn object_count(&self) -> usize {
        self.object_ids().len()
    }

    /// Display label, computed on first use and kept.
    pub fn label(&self) -> &str {
        self.label.get_or_init(|| match &self.kind {
            NodeKind::Object(id) => HeapObject::new(self.snap, *id).display_name(),
            NodeKind::Class { class_id, .. } => self
                .snap
                .class_name(*class_id)
                .unwrap_or("<unknown class>")
                .to_string(),
            NodeKind::ClassLoader { loader, .. } => match loader {
                Some(id) => HeapObject::new(self.snap, *id).display_name(),
                None => "<bootstrap class loader>".to_string(),
            },
        })
    }

    pub fn shallow_size(&self) -> Result<u64, QueryError> {
        let mut total = 0;
        for id in self.object_ids() {
            total += self.snap.heap_size(*id)?;
        }
        Ok(total)
    }

    /// Sum of retained sizes, computed on first use and kept; grouped rows
    /// get re-read while sorting, so the memo pays for itself.
    pub fn retained_size(&self) -> Result<u64, QueryError> {
        if let Some(total) = self.retained.get() {
            return Ok(*total);
        }
        let mut total = 0;
        for id in self.object_ids() {
            total += self.snap.retained_heap_size(*id)?;
        }
        let _ = self.retained.set(total);
        Ok(total)
    }
}

pub struct DominatorQuery<'s> {
    snap: &'s dyn Snapshot,
    grouping: Grouping,
}

const CANCEL_BATCH: u32 = 4096;

impl<'s> DominatorQuery<'s> {
    pub fn new(snap: &'s dyn Snapshot, grouping: Grouping) -> Self {
        Self { snap, grouping }
    }

    /// The dominator-tree roots, grouped. For `ByPackage` use
    /// [`DominatorQuery::package_tree`] instead.
    pub fn top_level(&self, token: &CancellationToken) -> Result<Vec<Node<'s>>, QueryError> {
        let roots = self.snap.immediate_dominated_ids(None)?;
        self.group(roots, token)
    }

    /// Children of a grouped node: the union of the dominated children of
    /// its objects, grouped the same way.
    pub fn children_of(
        &self,
        node: &Node<'s>,
        token: &CancellationToken,
    ) -> Result<Vec<Node<'s>>, QueryError> {
        let mut children = Vec::new();
        for id in node.object_ids() {
            children.extend(self.snap.immediate_dominated_ids(Some(*id))?);
        }
        self.group(children, token)
    }

    fn group(
        &self,
        mut ids: Vec<ObjectId>,
        token: &CancellationToken,
    ) -> Result<Vec<Node<'s>>, QueryError> {
        // Class objects are metadata anchored by their loader, not
        // application data; browsing them alongside instances only buries
        // the signal.
        ids.retain(|id| !self.snap.is_class(*id));
        let mut ticker = token.ticker(CANCEL_BATCH);
        match self.grouping {
            Grouping::None => {
                let mut nodes = Vec::with_capacity(ids.len());
                for id in ids {
                    ticker.tick()?;
                    nodes.push(Node::object(self.snap, id));
                }
                Ok(nodes)
            }
            Grouping::ByClass => {
                let mut groups: AHashMap<ObjectId, Vec<ObjectId>> = AHashMap::new();
                for id in ids {
                    ticker.tick()?;
                    groups.entry(self.snap.class_of(id)?).or_default().push(id);
                }
                Ok(groups
                    .into_iter()
                    .sorted_by_key(|(class_id, _)| *class_id)
                    .map(|(class_id, objects)| Node {
                        snap: self.snap,
                        kind: NodeKind::Class { class_id, objects },
                        label: OnceCell::new(),
                        retained: OnceCell::new(),
                    })
                    .collect())
            }
            Grouping::ByClassLoader => {
                let mut groups: AHashMap<Option<ObjectId>, Vec<ObjectId>> = AHashMap::new();
                for id in ids {
                    ticker.tick()?;
                    let loader = self.snap.class_loader_of(self.snap.class_of(id)?)?;
                    groups.entry(loader).or_default().push(id);
                }
                Ok(groups
                    .into_iter()
                    .sorted_by_key(|(loader, _)| *loader)
                    .map(|(loader, objects)| Node {
                        snap: self.snap,
                        kind: NodeKind::ClassLoader { loader, objects },
                        label: OnceCell::new(),
                        retained: OnceCell::new(),
                    })
                    .collect())
            }
            Grouping::ByPackage => Err(QueryError::Snapshot(
                crate::types::SnapshotError::Format(
                    "package grouping is a whole-tree aggregation, use package_tree".to_string(),
                ),
            )),
        }
    }

    /// Aggregates the entire dominator tree into a package trie. Every
    /// object in the tree lands in the package of its class; inner packages
    /// carry the sums of everything below them.
    pub fn package_tree(&self, token: &CancellationToken) -> Result<PackageNode, QueryError> {
        let mut root = PackageNode::new("<all>".to_string());
        let mut ticker = token.ticker(CANCEL_BATCH);
        let mut pending = self.snap.immediate_dominated_ids(None)?;
        while let Some(id) = pending.pop() {
            ticker.tick()?;
            if !self.snap.is_class(id) {
                let class_id = self.snap.class_of(id)?;
                let class_name = self.snap.class_name(class_id)?;
                let shallow = self.snap.heap_size(id)?;
                let retained = self.snap.retained_heap_size(id)?;
                root.insert(class_name, shallow, retained);
            }
            pending.extend(self.snap.immediate_dominated_ids(Some(id))?);
        }
        Ok(root)
    }
}

/// Node of the package trie. Children are ordered by segment name so a
/// printed tree is stable.
pub struct PackageNode {
    pub name: String,
    pub children: BTreeMap<String, PackageNode>,
    /// Objects whose class lives exactly at this node, per simple class
    /// name.
    pub classes: BTreeMap<String, ClassStats>,
    pub object_count: u64,
    pub shallow_size: u64,
    /// Sum of the per-object retained sizes. An object dominated by
    /// another object of the same package counts both on its own and
    /// through its dominator.
    pub retained_size: u64,
}

#[derive(Default, Clone)]
pub struct ClassStats {
    pub object_count: u64,
    pub shallow_size: u64,
    pub retained_size: u64,
}

impl PackageNode {
    fn new(name: String) -> Self {
        Self {
            name,
            children: BTreeMap::new(),
            classes: BTreeMap::new(),
            object_count: 0,
            shallow_size: 0,
            retained_size: 0,
        }
    }

    fn insert(&mut self, class_name: &str, shallow: u64, retained: u64) {
        self.object_count += 1;
        self.shallow_size += shallow;
        self.retained_size += retained;
        match class_name.rsplit_once('.') {
            Some((package, simple)) => {
                let mut node = self;
                for segment in package.split('.') {
                    node = node
                        .children
                        .entry(segment.to_string())
                        .or_insert_with(|| PackageNode::new(segment.to_string()));
                    node.object_count += 1;
                    node.shallow_size += shallow;
                    node.retained_size += retained;
                }
                let stats = node.classes.entry(simple.to_string()).or_default();
                stats.object_count += 1;
                stats.shallow_size += shallow;
                stats.retained_size += retained;
            }
            None => {
                // default-package class
                let stats = self.classes.entry(class_name.to_string()).or_default();
                stats.object_count += 1;
                stats.shallow_size += shallow;
                stats.retained_size += retained;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{HeapDump, HeapDumpBuilder};

    /// Two com.example.Holder roots, each dominating a byte[]; one
    /// java.util.ArrayList root.
    fn dump() -> (HeapDump, Vec<ObjectId>) {
        let mut b = HeapDumpBuilder::new();
        let cls_holder = b.class("com.example.Holder");
        let cls_list = b.class("java.util.ArrayList");
        let cls_bytes = b.class("byte[]");

        let a0 = b.prim_array(cls_bytes, 64, 80);
        let h0 = b.instance(cls_holder);
        b.set_ref_field(h0, "data", a0);
        let a1 = b.prim_array(cls_bytes, 32, 48);
        let h1 = b.instance(cls_holder);
        b.set_ref_field(h1, "data", a1);
        let list = b.instance(cls_list);
        b.gc_root(h0);
        b.gc_root(h1);
        b.gc_root(list);
        let dump = b.finish();
        (dump, vec![h0, h1, list])
    }

    #[test]
    fn test_ungrouped_top_level_and_expansion() {
        let (dump, roots) = dump();
        let q = DominatorQuery::new(&dump, Grouping::None);
        let token = CancellationToken::new();
        let top = q.top_level(&token).unwrap();
        let ids: Vec<_> = top.iter().flat_map(|n| n.object_ids().to_vec()).collect();
        for root in &roots {
            assert!(ids.contains(root));
        }

        let h0 = top
            .iter()
            .find(|n| n.object_ids() == &[roots[0]][..])
            .unwrap();
        let children = q.children_of(h0, &token).unwrap();
        assert_eq!(children.len(), 1);
        assert!(children[0].label().starts_with("byte[]"));
        assert_eq!(children[0].shallow_size().unwrap(), 80);
    }

    #[test]
    fn test_group_by_class_merges_same_class_roots() {
        let (dump, roots) = dump();
        let q = DominatorQuery::new(&dump, Grouping::ByClass);
        let token = CancellationToken::new();
        let top = q.top_level(&token).unwrap();

        let holders = top
            .iter()
            .find(|n| n.label() == "com.example.Holder")
            .unwrap();
        assert_eq!(holders.object_count(), 2);
        let expected: u64 = roots[..2]
            .iter()
            .map(|id| dump.retained_heap_size(*id).unwrap())
            .sum();
        assert_eq!(holders.retained_size().unwrap(), expected);

        // grouped children of both holders: one byte[] group with 2 objects
        let children = q.children_of(holders, &token).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].object_count(), 2);
        assert_eq!(children[0].shallow_size().unwrap(), 128);
    }

    #[test]
    fn test_group_by_classloader() {
        let (dump, _) = dump();
        let q = DominatorQuery::new(&dump, Grouping::ByClassLoader);
        let top = q.top_level(&CancellationToken::new()).unwrap();
        // everything is bootstrap-loaded in the fixture
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].label(), "<bootstrap class loader>");
    }

    #[test]
    fn test_package_tree_accumulates_along_path() {
        let (dump, roots) = dump();
        let q = DominatorQuery::new(&dump, Grouping::ByPackage);
        let tree = q.package_tree(&CancellationToken::new()).unwrap();

        let com = tree.children.get("com").unwrap();
        let example = com.children.get("example").unwrap();
        assert_eq!(example.classes.get("Holder").unwrap().object_count, 2);
        assert_eq!(com.object_count, 2);
        // each holder retains itself plus its byte[]
        let holders_retained: u64 = roots[..2]
            .iter()
            .map(|id| dump.retained_heap_size(*id).unwrap())
            .sum();
        assert_eq!(com.retained_size, holders_retained);
        assert_eq!(
            example.classes.get("Holder").unwrap().retained_size,
            holders_retained
        );

        let java = tree.children.get("java").unwrap();
        let util = java.children.get("util").unwrap();
        assert_eq!(util.classes.get("ArrayList").unwrap().object_count, 1);

        // byte[] has no package: counted at the root
        assert_eq!(tree.classes.get("byte[]").unwrap().object_count, 2);
    }
}
