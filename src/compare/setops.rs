//! Sorted-slice set operations over object-id lists.
//!
//! Row-level set operations in the comparison engine work on per-table
//! object-id sets that are kept sorted, so every operation is a linear
//! merge. Inputs must be sorted and duplicate-free; outputs are too.

use crate::types::ObjectId;

pub fn intersection(a: &[ObjectId], b: &[ObjectId]) -> Vec<ObjectId> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

pub fn union(a: &[ObjectId], b: &[ObjectId]) -> Vec<ObjectId> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

pub fn symmetric_difference(a: &[ObjectId], b: &[ObjectId]) -> Vec<ObjectId> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                out.push(b[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

/// Elements of `a` not present in `b`.
pub fn difference(a: &[ObjectId], b: &[ObjectId]) -> Vec<ObjectId> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => {
                out.push(a[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_operations() {
        let a = [1, 3, 5, 7];
        let b = [3, 4, 5, 8];
        assert_eq!(intersection(&a, &b), vec![3, 5]);
        assert_eq!(union(&a, &b), vec![1, 3, 4, 5, 7, 8]);
        assert_eq!(symmetric_difference(&a, &b), vec![1, 4, 7, 8]);
        assert_eq!(difference(&a, &b), vec![1, 7]);
        assert_eq!(difference(&b, &a), vec![4, 8]);
    }

    #[test]
    fn test_empty_and_self() {
        let a = [2, 4, 6];
        assert_eq!(intersection(&a, &a), a.to_vec());
        assert_eq!(union(&a, &[]), a.to_vec());
        assert!(difference(&a, &a).is_empty());
        assert!(symmetric_difference(&a, &a).is_empty());
    }
}
