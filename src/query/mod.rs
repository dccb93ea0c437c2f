//! Interactive-style heap queries: dominator-tree grouping and merged
//! paths from GC roots. Both produce expansion-oriented tree nodes rather
//! than flat reports, mirroring how a UI or REPL consumes them.

pub mod dominator;
pub mod multipath;

pub use dominator::{DominatorQuery, Grouping, Node, PackageNode};
pub use multipath::{PathGrouping, PathTree, PathTreeNode, PathsFromRoots};

use crate::types::{Cancelled, SnapshotError};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}
