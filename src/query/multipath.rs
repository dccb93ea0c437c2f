//! Merged paths between GC roots and a set of target objects.
//!
//! One shortest root-to-target path is computed per target with a single
//! breadth-first sweep from all GC roots. The interesting work is merging:
//! many leak suspects share their first hops (the same static field, the
//! same cache), so paths are folded into a tree on their common prefix from
//! the root end, optionally collapsing same-class objects, or on their
//! common suffix from the target end to show the shared referrer chain.

use ahash::AHashMap;
use fixedbitset::FixedBitSet;

use crate::progress::CancellationToken;
use crate::query::QueryError;
use crate::snapshot::{FieldValue, Snapshot};
use crate::types::{ObjectId, SnapshotError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathGrouping {
    /// Merge on common prefixes, one node per distinct object.
    FromGcRoots,
    /// Merge on common prefixes, collapsing objects of the same class.
    FromGcRootsByClass,
    /// Merge on common suffixes: tree roots are the targets, children walk
    /// toward the GC roots.
    FromObjectsBack,
}

pub struct PathsFromRoots<'s> {
    snap: &'s dyn Snapshot,
    /// Each path runs root..=target.
    paths: Vec<Vec<ObjectId>>,
}

const CANCEL_BATCH: u32 = 4096;

impl<'s> PathsFromRoots<'s> {
    /// Computes one shortest path per reachable target. Unreachable targets
    /// (dead at snapshot time) simply yield no path.
    pub fn compute(
        snap: &'s dyn Snapshot,
        targets: &[ObjectId],
        token: &CancellationToken,
    ) -> Result<Self, QueryError> {
        let object_count = snap.info().object_count;
        let mut parent: Vec<ObjectId> = vec![0; object_count];
        let mut visited = FixedBitSet::with_capacity(object_count);
        let mut queue = std::collections::VecDeque::new();
        let mut is_root = FixedBitSet::with_capacity(object_count);

        for root in snap.gc_root_ids() {
            if !visited.put(*root as usize) {
                is_root.insert(*root as usize);
                queue.push_back(*root);
            }
        }

        let mut ticker = token.ticker(CANCEL_BATCH);
        while let Some(id) = queue.pop_front() {
            ticker.tick()?;
            for referent in snap.outbound_referent_ids(id)? {
                if !visited.put(referent as usize) {
                    parent[referent as usize] = id;
                    queue.push_back(referent);
                }
            }
        }

        let mut paths = Vec::new();
        for target in targets {
            if !visited.contains(*target as usize) {
                continue;
            }
            let mut path = vec![*target];
            let mut current = *target;
            while !is_root.contains(current as usize) {
                current = parent[current as usize];
                path.push(current);
            }
            path.reverse();
            paths.push(path);
        }
        Ok(Self { snap, paths })
    }

    pub fn paths(&self) -> &[Vec<ObjectId>] {
        &self.paths
    }

    pub fn merge(&self, grouping: PathGrouping) -> Result<PathTree, QueryError> {
        let paths: Vec<&[ObjectId]> = match grouping {
            PathGrouping::FromObjectsBack => {
                // reversed views are materialized once; paths are short
                let reversed: Vec<Vec<ObjectId>> = self
                    .paths
                    .iter()
                    .map(|p| p.iter().rev().copied().collect())
                    .collect();
                return Ok(PathTree {
                    roots: merge_level(
                        self.snap,
                        &reversed.iter().map(|p| p.as_slice()).collect::<Vec<_>>(),
                        false,
                    )?,
                });
            }
            _ => self.paths.iter().map(|p| p.as_slice()).collect(),
        };
        let by_class = grouping == PathGrouping::FromGcRootsByClass;
        Ok(PathTree {
            roots: merge_level(self.snap, &paths, by_class)?,
        })
    }
}

/// Groups the heads of `paths` (by identity or class) and recurses into the
/// tails. Insertion order of the first occurrence decides sibling order.
fn merge_level(
    snap: &dyn Snapshot,
    paths: &[&[ObjectId]],
    by_class: bool,
) -> Result<Vec<PathTreeNode>, QueryError> {
    let mut order: Vec<ObjectId> = Vec::new();
    let mut buckets: AHashMap<ObjectId, (Vec<ObjectId>, Vec<&[ObjectId]>)> = AHashMap::new();

    for path in paths {
        let Some(head) = path.first() else { continue };
        let group_key = if by_class {
            snap.class_of(*head)?
        } else {
            *head
        };
        let bucket = buckets.entry(group_key).or_insert_with(|| {
            order.push(group_key);
            (Vec::new(), Vec::new())
        });
        if !bucket.0.contains(head) {
            bucket.0.push(*head);
        }
        bucket.1.push(&path[1..]);
    }

    let mut nodes = Vec::with_capacity(order.len());
    for key in order {
        let (objects, tails) = buckets.remove(&key).expect("bucket for ordered key");
        let class_id = snap.class_of(objects[0])?;
        let path_count = tails.len();
        let children = merge_level(snap, &tails, by_class)?;
        nodes.push(PathTreeNode {
            objects,
            class_id,
            path_count,
            children,
        });
    }
    Ok(nodes)
}

pub struct PathTree {
    pub roots: Vec<PathTreeNode>,
}

pub struct PathTreeNode {
    /// Distinct objects merged into this node; a single id unless grouping
    /// by class.
    pub objects: Vec<ObjectId>,
    pub class_id: ObjectId,
    /// Number of computed paths running through this node.
    pub path_count: usize,
    pub children: Vec<PathTreeNode>,
}

/// Name of the reference connecting `parent` to `child`: a field name, an
/// array index rendered as `[i]`, or `None` when the link is not visible in
/// the dump (class pointer, unnamed reference).
///
/// Derived on demand by scanning the parent rather than stored per tree
/// node: most nodes are never expanded far enough for the label to be read.
pub fn edge_label(
    snap: &dyn Snapshot,
    parent: ObjectId,
    child: ObjectId,
) -> Result<Option<String>, SnapshotError> {
    let child_addr = snap.map_id_to_address(child)?;
    if snap.is_array(parent) {
        if let Ok(addresses) = snap.reference_array(parent) {
            for (index, addr) in addresses.iter().enumerate() {
                if *addr == child_addr {
                    return Ok(Some(format!("[{}]", index)));
                }
            }
        }
        return Ok(None);
    }
    for (name, value) in snap.fields(parent)? {
        if let FieldValue::Ref(addr) = value {
            if addr == child_addr {
                return Ok(Some(name));
            }
        }
    }
    Ok(None)
}
