//! Multi-table comparison engine.
//!
//! Takes N result tables (typically the same query run against N snapshots),
//! merges their rows by key, and exposes per-column values either absolutely
//! or as deltas/ratios against the first or previous table. Rows carrying
//! object-id sets additionally support set operations across tables.
//!
//! The awkward part is duplicate keys: one table may legitimately contain
//! several rows with the same key (two unrelated `ArrayList @ ...` rows
//! masked down to `ArrayList`). Those spawn one merged row per duplicate and
//! a structural matching pass decides which rows across tables line up.

pub mod setops;

use ahash::AHashMap;
use regex::Regex;

use crate::progress::CancellationToken;
use crate::snapshot::Snapshot;
use crate::types::{Cancelled, ObjectId};

/// Read-only view the engine needs of one input table.
pub trait ResultTable {
    fn row_count(&self) -> usize;

    /// Key column rendering for a row, before masking.
    fn key_of(&self, row: usize) -> &str;

    /// The heap object a row is about, when the table has one per row.
    fn context_object(&self, row: usize) -> Option<ObjectId>;

    fn retained_size(&self, row: usize) -> Option<u64>;

    /// Sorted, duplicate-free object-id set of a row (empty when the table
    /// does not track per-row objects).
    fn object_ids(&self, row: usize) -> &[ObjectId];

    fn column_count(&self) -> usize;
    fn column_label(&self, column: usize) -> &str;
    fn value(&self, row: usize, column: usize) -> Option<f64>;
}

/// One input table plus the snapshot its object ids are local to. The
/// snapshot is optional: tables without per-row objects compare fine
/// without one, they just never match duplicates by identity.
pub struct TableInput<'a> {
    pub table: &'a dyn ResultTable,
    pub snapshot: Option<&'a dyn Snapshot>,
}

/// How the key column is derived from the raw key rendering.
#[derive(Default)]
pub struct KeyConfig {
    /// Portions matching the mask are replaced before merging, typically to
    /// strip addresses so rows align across snapshots.
    pub mask: Option<Regex>,
    pub replacement: String,
}

impl KeyConfig {
    fn apply(&self, raw: &str) -> String {
        match &self.mask {
            Some(mask) => mask.replace_all(raw, self.replacement.as_str()).into_owned(),
            None => raw.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Absolute,
    DiffToFirst,
    DiffToPrevious,
    DiffRatioToFirst,
    DiffRatioToPrevious,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Intersection,
    Union,
    SymmetricDifference,
    Difference,
}

/// A merged row: one key, at most one source row per input table.
#[derive(Debug)]
pub struct ComparedRow {
    pub key: String,
    /// Row index into each input table, in input order.
    pub slots: Vec<Option<usize>>,
}

pub struct Comparison<'a> {
    inputs: &'a [TableInput<'a>],
    rows: Vec<ComparedRow>,
}

const CANCEL_BATCH: u32 = 1024;

/// Merges the tables by key. Row order follows first appearance of each key
/// across tables in input order.
pub fn compare_tables<'a>(
    inputs: &'a [TableInput<'a>],
    key_config: &KeyConfig,
    token: &CancellationToken,
) -> Result<Comparison<'a>, Cancelled> {
    let mut rows: Vec<ComparedRow> = Vec::new();
    // key → indices of merged rows carrying it, in creation order
    let mut by_key: AHashMap<String, Vec<usize>> = AHashMap::new();
    let mut ticker = token.ticker(CANCEL_BATCH);

    for (t, input) in inputs.iter().enumerate() {
        for row in 0..input.table.row_count() {
            ticker.tick()?;
            let key = key_config.apply(input.table.key_of(row));
            let groups = by_key.entry(key.clone()).or_default();
            // first merged row with this key that has no entry for table t
            // yet; a second same-key row in the same table opens a new one
            match groups.iter().find(|g| rows[**g].slots[t].is_none()) {
                Some(g) => rows[*g].slots[t] = Some(row),
                None => {
                    let mut slots = vec![None; inputs.len()];
                    slots[t] = Some(row);
                    groups.push(rows.len());
                    rows.push(ComparedRow { key, slots });
                }
            }
        }
    }

    for groups in by_key.values() {
        if groups.len() > 1 {
            resolve_duplicates(inputs, &mut rows, groups);
        }
    }

    Ok(Comparison { inputs, rows })
}

/// Re-matches same-key rows across tables. Initial placement is first-free
/// and usually wrong when keys collide; this pass prefers, per table, rows
/// that are identical to an already-placed row (same object in the same
/// snapshot, same address across snapshots), then rows of equal retained
/// size, fills the rest in placement order and finally swaps filled rows
/// between groups while that raises the overall match quality. Still
/// imperfect when three or more rows collide.
fn resolve_duplicates(inputs: &[TableInput], rows: &mut [ComparedRow], groups: &[usize]) {
    for t in 1..inputs.len() {
        // pull table t's rows back out of the merged rows
        let mut candidates: Vec<usize> = Vec::new();
        for g in groups {
            if let Some(row) = rows[*g].slots[t].take() {
                candidates.push(row);
            }
        }
        let mut taken = vec![false; candidates.len()];

        // pass 1: identity against any earlier-table row of the group
        for g in groups {
            if rows[*g].slots[t].is_some() {
                continue;
            }
            'cand: for (ci, candidate) in candidates.iter().enumerate() {
                if taken[ci] {
                    continue;
                }
                for u in 0..t {
                    if let Some(anchor) = rows[*g].slots[u] {
                        if rows_identical(inputs, t, *candidate, u, anchor) {
                            rows[*g].slots[t] = Some(*candidate);
                            taken[ci] = true;
                            break 'cand;
                        }
                    }
                }
            }
        }

        // pass 2: equal retained size, when big enough to be meaningful
        for g in groups {
            if rows[*g].slots[t].is_some() {
                continue;
            }
            'cand: for (ci, candidate) in candidates.iter().enumerate() {
                if taken[ci] {
                    continue;
                }
                for u in 0..t {
                    if let Some(anchor) = rows[*g].slots[u] {
                        if rows_same_size(inputs, t, *candidate, u, anchor) {
                            rows[*g].slots[t] = Some(*candidate);
                            taken[ci] = true;
                            break 'cand;
                        }
                    }
                }
            }
        }

        // pass 3: leftover candidates fill leftover groups in order
        let mut remaining = candidates
            .iter()
            .zip(&taken)
            .filter(|(_, taken)| !**taken)
            .map(|(row, _)| *row);
        for g in groups {
            if rows[*g].slots[t].is_none() {
                match remaining.next() {
                    Some(row) => rows[*g].slots[t] = Some(row),
                    None => break,
                }
            }
        }

        // pass 4: the fill is order-based and pass 1 is greedy, so a row
        // may sit in a group that another group matches outright; swap
        // (or move into an empty slot) while the total match quality goes
        // up. Duplicate groups are tiny, the quadratic sweep is fine.
        let mut changed = true;
        while changed {
            changed = false;
            'sweep: for (i, gi) in groups.iter().enumerate() {
                let Some(ri) = rows[*gi].slots[t] else {
                    continue;
                };
                for gj in &groups[i + 1..] {
                    match rows[*gj].slots[t] {
                        Some(rj) => {
                            let placed = match_score(inputs, rows, *gi, t, ri)
                                + match_score(inputs, rows, *gj, t, rj);
                            let swapped = match_score(inputs, rows, *gi, t, rj)
                                + match_score(inputs, rows, *gj, t, ri);
                            if swapped > placed {
                                rows[*gi].slots[t] = Some(rj);
                                rows[*gj].slots[t] = Some(ri);
                                changed = true;
                                break 'sweep;
                            }
                        }
                        None => {
                            if match_score(inputs, rows, *gj, t, ri)
                                > match_score(inputs, rows, *gi, t, ri)
                            {
                                rows[*gj].slots[t] = Some(ri);
                                rows[*gi].slots[t] = None;
                                changed = true;
                                break 'sweep;
                            }
                        }
                    }
                }
            }
        }
    }
}

/// How well a table-`t` row fits a merged row's earlier-table anchors:
/// 2 for an identity match, 1 for a retained-size match, 0 otherwise.
fn match_score(
    inputs: &[TableInput],
    rows: &[ComparedRow],
    g: usize,
    t: usize,
    row: usize,
) -> u32 {
    for u in 0..t {
        if let Some(anchor) = rows[g].slots[u] {
            if rows_identical(inputs, t, row, u, anchor) {
                return 2;
            }
        }
    }
    for u in 0..t {
        if let Some(anchor) = rows[g].slots[u] {
            if rows_same_size(inputs, t, row, u, anchor) {
                return 1;
            }
        }
    }
    0
}

/// Same heap object: same id when both tables read one snapshot, same
/// address when they read different ones.
fn rows_identical(
    inputs: &[TableInput],
    t1: usize,
    row1: usize,
    t2: usize,
    row2: usize,
) -> bool {
    let (Some(obj1), Some(obj2)) = (
        inputs[t1].table.context_object(row1),
        inputs[t2].table.context_object(row2),
    ) else {
        return false;
    };
    let (Some(snap1), Some(snap2)) = (inputs[t1].snapshot, inputs[t2].snapshot) else {
        return false;
    };
    if std::ptr::eq(
        snap1 as *const dyn Snapshot as *const (),
        snap2 as *const dyn Snapshot as *const (),
    ) {
        return obj1 == obj2;
    }
    match (snap1.map_id_to_address(obj1), snap2.map_id_to_address(obj2)) {
        (Ok(a1), Ok(a2)) => a1 == a2,
        _ => false,
    }
}

/// Equal retained sizes, but only above one identifier size: tiny objects
/// share sizes far too often for this to mean anything.
fn rows_same_size(inputs: &[TableInput], t1: usize, row1: usize, t2: usize, row2: usize) -> bool {
    let (Some(s1), Some(s2)) = (
        inputs[t1].table.retained_size(row1),
        inputs[t2].table.retained_size(row2),
    ) else {
        return false;
    };
    let threshold = inputs[t1]
        .snapshot
        .map(|s| s.info().identifier_size as u64)
        .unwrap_or(0);
    s1 == s2 && s1 > threshold
}

impl<'a> Comparison<'a> {
    pub fn rows(&self) -> &[ComparedRow] {
        &self.rows
    }

    pub fn table_count(&self) -> usize {
        self.inputs.len()
    }

    /// Value of `column` for `table` in a merged row, under `mode`. `None`
    /// when the row or either operand of a delta is absent.
    pub fn value(&self, row: usize, table: usize, column: usize, mode: Mode) -> Option<f64> {
        let read = |t: usize| -> Option<f64> {
            let source_row = self.rows[row].slots[t]?;
            self.inputs[t].table.value(source_row, column)
        };
        let current = read(table)?;
        let base = match mode {
            Mode::Absolute => return Some(current),
            Mode::DiffToFirst | Mode::DiffRatioToFirst => read(0)?,
            Mode::DiffToPrevious | Mode::DiffRatioToPrevious => {
                if table == 0 {
                    return Some(current);
                }
                read(table - 1)?
            }
        };
        match mode {
            Mode::DiffToFirst | Mode::DiffToPrevious => Some(current - base),
            Mode::DiffRatioToFirst | Mode::DiffRatioToPrevious => {
                if base == 0.0 {
                    None
                } else {
                    Some((current / base - 1.0) * 100.0)
                }
            }
            Mode::Absolute => unreachable!(),
        }
    }

    /// Folds the per-table object-id sets of a merged row with `op`, left to
    /// right across tables. Absent rows contribute the empty set.
    pub fn set_op(&self, row: usize, op: SetOp) -> Vec<ObjectId> {
        let ids_of = |t: usize| -> &[ObjectId] {
            match self.rows[row].slots[t] {
                Some(source_row) => self.inputs[t].table.object_ids(source_row),
                None => &[],
            }
        };
        let mut acc = ids_of(0).to_vec();
        for t in 1..self.inputs.len() {
            let next = ids_of(t);
            acc = match op {
                SetOp::Intersection => setops::intersection(&acc, next),
                SetOp::Union => setops::union(&acc, next),
                SetOp::SymmetricDifference => setops::symmetric_difference(&acc, next),
                SetOp::Difference => setops::difference(&acc, next),
            };
        }
        acc
    }
}

/// Straightforward owned implementation of `ResultTable`, used by the CLI
/// and as a fixture type in tests.
pub struct SimpleTable {
    column_labels: Vec<String>,
    rows: Vec<SimpleRow>,
}

pub struct SimpleRow {
    pub key: String,
    pub context: Option<ObjectId>,
    pub retained_size: Option<u64>,
    pub object_ids: Vec<ObjectId>,
    pub values: Vec<Option<f64>>,
}

impl SimpleTable {
    pub fn new(column_labels: Vec<String>) -> Self {
        Self {
            column_labels,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, mut row: SimpleRow) {
        row.object_ids.sort_unstable();
        row.object_ids.dedup();
        self.rows.push(row);
    }
}

impl ResultTable for SimpleTable {
    fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn key_of(&self, row: usize) -> &str {
        &self.rows[row].key
    }

    fn context_object(&self, row: usize) -> Option<ObjectId> {
        self.rows[row].context
    }

    fn retained_size(&self, row: usize) -> Option<u64> {
        self.rows[row].retained_size
    }

    fn object_ids(&self, row: usize) -> &[ObjectId] {
        &self.rows[row].object_ids
    }

    fn column_count(&self) -> usize {
        self.column_labels.len()
    }

    fn column_label(&self, column: usize) -> &str {
        &self.column_labels[column]
    }

    fn value(&self, row: usize, column: usize) -> Option<f64> {
        self.rows[row].values[column]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(key: &str, value: f64, ids: &[ObjectId]) -> SimpleRow {
        SimpleRow {
            key: key.to_string(),
            context: None,
            retained_size: None,
            object_ids: ids.to_vec(),
            values: vec![Some(value)],
        }
    }

    fn table(rows: Vec<SimpleRow>) -> SimpleTable {
        let mut t = SimpleTable::new(vec!["count".to_string()]);
        for r in rows {
            t.push(r);
        }
        t
    }

    fn inputs<'a>(tables: &'a [SimpleTable]) -> Vec<TableInput<'a>> {
        tables
            .iter()
            .map(|t| TableInput {
                table: t,
                snapshot: None,
            })
            .collect()
    }

    #[test]
    fn test_merge_aligns_keys_across_tables() {
        let a = table(vec![row("alpha", 1.0, &[]), row("beta", 2.0, &[])]);
        let b = table(vec![row("beta", 5.0, &[]), row("gamma", 7.0, &[])]);
        let tables = [a, b];
        let inputs = inputs(&tables);
        let cmp = compare_tables(&inputs, &KeyConfig::default(), &CancellationToken::new())
            .unwrap();

        let keys: Vec<_> = cmp.rows().iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["alpha", "beta", "gamma"]);
        assert_eq!(cmp.value(1, 0, 0, Mode::Absolute), Some(2.0));
        assert_eq!(cmp.value(1, 1, 0, Mode::Absolute), Some(5.0));
        assert_eq!(cmp.value(1, 1, 0, Mode::DiffToFirst), Some(3.0));
        assert_eq!(cmp.value(1, 1, 0, Mode::DiffRatioToFirst), Some(150.0));
        // gamma has no row in the first table
        assert_eq!(cmp.value(2, 1, 0, Mode::DiffToFirst), None);
        assert_eq!(cmp.value(2, 1, 0, Mode::Absolute), Some(7.0));
    }

    #[test]
    fn test_compare_table_to_itself() {
        let make = || {
            table(vec![
                row("a", 1.0, &[1, 2, 3]),
                row("b", 2.0, &[4, 5]),
            ])
        };
        let tables = [make(), make()];
        let inputs = inputs(&tables);
        let cmp = compare_tables(&inputs, &KeyConfig::default(), &CancellationToken::new())
            .unwrap();

        assert_eq!(cmp.rows().len(), 2);
        for (i, ids) in [(0, vec![1, 2, 3]), (1, vec![4, 5])] {
            assert_eq!(cmp.set_op(i, SetOp::Intersection), ids);
            assert_eq!(cmp.set_op(i, SetOp::Union), ids);
            assert!(cmp.set_op(i, SetOp::Difference).is_empty());
            assert!(cmp.set_op(i, SetOp::SymmetricDifference).is_empty());
        }
    }

    #[test]
    fn test_duplicate_keys_spawn_rows_without_dropping_any() {
        let a = table(vec![row("k", 1.0, &[])]);
        let b = table(vec![row("k", 10.0, &[]), row("k", 20.0, &[])]);
        let tables = [a, b];
        let inputs = inputs(&tables);
        let cmp = compare_tables(&inputs, &KeyConfig::default(), &CancellationToken::new())
            .unwrap();

        assert_eq!(cmp.rows().len(), 2);
        // the single first-table row pairs with exactly one duplicate
        let paired: Vec<_> = cmp
            .rows()
            .iter()
            .filter(|r| r.slots[0].is_some() && r.slots[1].is_some())
            .collect();
        assert_eq!(paired.len(), 1);
        // both second-table rows survive
        let mut b_rows: Vec<_> = cmp.rows().iter().filter_map(|r| r.slots[1]).collect();
        b_rows.sort_unstable();
        assert_eq!(b_rows, vec![0, 1]);
    }

    #[test]
    fn test_duplicates_rematch_by_retained_size() {
        let mut a = SimpleTable::new(vec!["n".to_string()]);
        a.push(SimpleRow {
            key: "k".to_string(),
            context: None,
            retained_size: Some(4096),
            object_ids: vec![],
            values: vec![Some(1.0)],
        });
        let mut b = SimpleTable::new(vec!["n".to_string()]);
        // the size-matching row comes second, so first-free placement alone
        // would misalign it
        b.push(SimpleRow {
            key: "k".to_string(),
            context: None,
            retained_size: Some(64),
            object_ids: vec![],
            values: vec![Some(2.0)],
        });
        b.push(SimpleRow {
            key: "k".to_string(),
            context: None,
            retained_size: Some(4096),
            object_ids: vec![],
            values: vec![Some(3.0)],
        });
        let tables = [a, b];
        let inputs = inputs(&tables);
        let cmp = compare_tables(&inputs, &KeyConfig::default(), &CancellationToken::new())
            .unwrap();

        let anchored = cmp
            .rows()
            .iter()
            .find(|r| r.slots[0] == Some(0))
            .unwrap();
        assert_eq!(anchored.slots[1], Some(1));
    }

    #[test]
    fn test_filled_duplicates_swap_toward_better_matches() {
        use crate::snapshot::HeapDumpBuilder;

        let mut b = HeapDumpBuilder::new();
        let cls = b.class("java.lang.Object");
        let shared = b.instance(cls);
        let dump = b.finish();

        let with = |context: Option<ObjectId>, retained: Option<u64>, value: f64| SimpleRow {
            key: "k".to_string(),
            context,
            retained_size: retained,
            object_ids: vec![],
            values: vec![Some(value)],
        };
        // both first-table rows reference the same object; greedy identity
        // matching hands the identity candidate to the first group even
        // though the first group also has a size match available
        let mut a = SimpleTable::new(vec!["n".to_string()]);
        a.push(with(Some(shared), Some(300), 1.0));
        a.push(with(Some(shared), None, 2.0));
        let mut c = SimpleTable::new(vec!["n".to_string()]);
        c.push(with(Some(shared), None, 3.0));
        c.push(with(None, Some(300), 4.0));

        let tables = [a, c];
        let inputs: Vec<TableInput> = tables
            .iter()
            .map(|t| TableInput {
                table: t,
                snapshot: Some(&dump as &dyn Snapshot),
            })
            .collect();
        let cmp = compare_tables(&inputs, &KeyConfig::default(), &CancellationToken::new())
            .unwrap();

        // the swap leaves the identity pair for the group that matches
        // nothing else: row 0 keeps the size match, row 1 the identity one
        let g1 = cmp.rows().iter().find(|r| r.slots[0] == Some(0)).unwrap();
        assert_eq!(g1.slots[1], Some(1));
        let g2 = cmp.rows().iter().find(|r| r.slots[0] == Some(1)).unwrap();
        assert_eq!(g2.slots[1], Some(0));
    }

    #[test]
    fn test_key_masking_aligns_decorated_keys() {
        let a = table(vec![row("java.util.ArrayList @ 0x12ab", 1.0, &[])]);
        let b = table(vec![row("java.util.ArrayList @ 0x99ff", 2.0, &[])]);
        let tables = [a, b];
        let inputs = inputs(&tables);
        let config = KeyConfig {
            mask: Some(Regex::new(r" @ 0x[0-9a-f]+").unwrap()),
            replacement: String::new(),
        };
        let cmp = compare_tables(&inputs, &config, &CancellationToken::new()).unwrap();
        assert_eq!(cmp.rows().len(), 1);
        assert_eq!(cmp.rows()[0].key, "java.util.ArrayList");
    }

    #[test]
    fn test_cancellation_aborts() {
        let rows: Vec<_> = (0..5000).map(|i| row(&format!("k{}", i), 1.0, &[])).collect();
        let tables = [table(rows)];
        let inputs = inputs(&tables);
        let token = CancellationToken::new();
        token.cancel();
        assert!(compare_tables(&inputs, &KeyConfig::default(), &token).is_err());
    }
}
