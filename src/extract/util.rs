//! Structural helpers shared by the extraction strategies.
//!
//! These encode the crate's cardinal heuristic rule: when field names are
//! missing and the object graph offers more than one plausible way forward,
//! give up (`None`) instead of guessing. A wrong guess poisons every number
//! derived from it; an honest "unknown" merely leaves a blank.

use crate::snapshot::{HeapObject, Snapshot, Value};
use crate::types::{Address, NULL_ADDRESS, ObjectId, SnapshotError};

/// Resolves a dotted field path to a non-negative integer, `None` when the
/// path is broken or the leaf is not numeric.
pub fn resolve_u32_path(obj: &HeapObject, path: &str) -> Result<Option<u32>, SnapshotError> {
    match obj.resolve_value(path)? {
        Some(Value::Primitive(v)) => Ok(v.as_u32()),
        _ => Ok(None),
    }
}

/// Counts non-null slots in a raw reference array.
pub fn count_non_null_addresses(addresses: &[Address]) -> u32 {
    addresses.iter().filter(|a| **a != NULL_ADDRESS).count() as u32
}

/// Counts non-null entries of an id array (0 is never a valid referent here).
pub fn count_non_null_ids(ids: &[ObjectId]) -> u32 {
    ids.iter().filter(|id| **id != 0).count() as u32
}

/// Non-null element count of an array object.
///
/// Fast path: an array's outbound references are its class plus one per
/// non-null slot, so when the outbound count is exactly 1 (class only, all
/// slots null) or length+1 (no null slots) the answer falls out in O(1)
/// without materializing a multi-million-slot reference array.
pub fn non_null_array_elements(array: &HeapObject) -> Result<u32, SnapshotError> {
    let snap = array.snapshot();
    if let Ok(outs) = snap.outbound_referent_ids(array.id()) {
        let length = snap.array_length(array.id())?;
        if outs.len() == 1 || outs.len() == length + 1 {
            return Ok((outs.len() - 1) as u32);
        }
    }
    Ok(count_non_null_addresses(&snap.reference_array(array.id())?))
}

/// Maps every non-zero address of a raw reference array to an object id,
/// skipping null slots.
pub fn reference_array_to_ids(
    snap: &dyn Snapshot,
    addresses: &[Address],
) -> Result<Vec<ObjectId>, SnapshotError> {
    let mut ids = Vec::with_capacity(addresses.len());
    for addr in addresses {
        if *addr != NULL_ADDRESS {
            ids.push(snap.map_address_to_id(*addr)?);
        }
    }
    Ok(ids)
}

/// Follows the only non-array, non-class outbound reference of an object.
///
/// Used to hop from a wrapper toward its nested backing structure when the
/// intermediate field names were lost with the dump format. Returns `None`
/// when zero or two-plus candidates exist — never guesses among equals.
pub fn follow_only_non_array_outgoing<'s>(
    obj: &HeapObject<'s>,
) -> Result<Option<HeapObject<'s>>, SnapshotError> {
    let snap = obj.snapshot();
    let mut found: Option<ObjectId> = None;
    for id in snap.outbound_referent_ids(obj.id())? {
        if !snap.is_array(id) && !snap.is_class(id) {
            if found.is_some() {
                return Ok(None);
            }
            found = Some(id);
        }
    }
    Ok(found.map(|id| HeapObject::new(snap, id)))
}

/// Walks toward the object holding the final segment of a dotted field path,
/// stopping one hop short of the leaf.
///
/// When the prefix resolves by name, that wins. Otherwise each intermediate
/// hop is inferred structurally via `follow_only_non_array_outgoing`, one hop
/// per dot in the path.
pub fn follow_only_outgoing_except_last<'s>(
    field_path: &str,
    obj: &HeapObject<'s>,
) -> Result<Option<HeapObject<'s>>, SnapshotError> {
    if let Some(prefix) = field_path.rfind('.').map(|i| &field_path[..i]) {
        if let Some(resolved) = obj.resolve_object(prefix)? {
            return Ok(Some(resolved));
        }
    }

    let mut current = Some(*obj);
    for _ in field_path.split('.').skip(1) {
        match current {
            Some(obj) => current = follow_only_non_array_outgoing(&obj)?,
            None => break,
        }
    }
    Ok(current)
}

/// The only object-array referenced by `obj`, or `None` when there is no
/// array or the choice is ambiguous.
pub fn only_array_field<'s>(obj: &HeapObject<'s>) -> Result<Option<HeapObject<'s>>, SnapshotError> {
    let snap = obj.snapshot();
    let mut found: Option<ObjectId> = None;
    for id in snap.outbound_referent_ids(obj.id())? {
        if snap.is_array(id) && snap.reference_array(id).is_ok() {
            if found.is_some() {
                return Ok(None);
            }
            found = Some(id);
        }
    }
    Ok(found.map(|id| HeapObject::new(snap, id)))
}
