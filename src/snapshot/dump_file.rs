//! JSON interchange format for in-memory dumps.
//!
//! This is a developer-tooling format used by the CLI and test fixtures, not
//! a parser for any real heap-dump file format (those live in the storage
//! layer that produces `Snapshot` implementations).

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::snapshot::heap::{HeapDump, ObjectKind};
use crate::snapshot::{FieldValue, HeapDumpBuilder, Snapshot};
use crate::types::{NULL_ADDRESS, ObjectId, SnapshotError};

#[derive(Debug, Serialize, Deserialize)]
pub struct DumpFile {
    #[serde(default)]
    pub jvm_info: Option<String>,
    pub objects: Vec<ObjectRecord>,
    #[serde(default)]
    pub gc_roots: Vec<ObjectId>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObjectRecord {
    Class {
        name: String,
        #[serde(default)]
        loader: Option<ObjectId>,
    },
    Instance {
        class: ObjectId,
        #[serde(default)]
        size: Option<u64>,
        #[serde(default)]
        fields: Vec<FieldRecord>,
    },
    RefArray {
        class: ObjectId,
        slots: Vec<Option<ObjectId>>,
    },
    PrimArray {
        class: ObjectId,
        length: u32,
        size: u64,
    },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FieldRecord {
    pub name: String,
    pub value: FieldValueRecord,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldValueRecord {
    Null,
    Ref(ObjectId),
    Int(i64),
    Float(f64),
    Bool(bool),
}

pub fn read_dump_file(path: &Path) -> Result<HeapDump, SnapshotError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let dump: DumpFile = serde_json::from_reader(reader)
        .map_err(|e| SnapshotError::Format(format!("{}: {}", path.display(), e)))?;
    build(dump)
}

fn build(file: DumpFile) -> Result<HeapDump, SnapshotError> {
    let mut b = HeapDumpBuilder::new();
    if let Some(info) = file.jvm_info.clone() {
        b.jvm_info(info);
    }

    // Two passes: create every object first so forward references resolve,
    // then wire fields and array slots.
    for record in &file.objects {
        match record {
            ObjectRecord::Class { name, loader } => {
                b.class_with_loader(name.clone(), *loader);
            }
            ObjectRecord::Instance { class, size, .. } => match size {
                Some(size) => {
                    b.instance_sized(*class, *size);
                }
                None => {
                    b.instance(*class);
                }
            },
            ObjectRecord::RefArray { class, slots } => {
                b.ref_array(*class, &vec![None; slots.len()]);
            }
            ObjectRecord::PrimArray {
                class,
                length,
                size,
            } => {
                b.prim_array(*class, *length, *size);
            }
        }
    }

    let object_count = file.objects.len() as ObjectId;
    let check = |id: ObjectId| -> Result<ObjectId, SnapshotError> {
        if id < object_count {
            Ok(id)
        } else {
            Err(SnapshotError::Format(format!("dangling object id {}", id)))
        }
    };

    for (id, record) in file.objects.iter().enumerate() {
        let id = id as ObjectId;
        match record {
            ObjectRecord::Instance { fields, .. } => {
                for field in fields {
                    let value = match &field.value {
                        FieldValueRecord::Null => FieldValue::Null,
                        FieldValueRecord::Ref(target) => {
                            b.set_ref_field(id, &field.name, check(*target)?);
                            continue;
                        }
                        FieldValueRecord::Int(v) => FieldValue::Int(*v),
                        FieldValueRecord::Float(v) => FieldValue::Float(*v),
                        FieldValueRecord::Bool(v) => FieldValue::Bool(*v),
                    };
                    b.set_field(id, &field.name, value);
                }
            }
            ObjectRecord::RefArray { slots, .. } => {
                for (index, slot) in slots.iter().enumerate() {
                    if let Some(target) = slot {
                        b.set_array_slot(id, index, Some(check(*target)?));
                    }
                }
            }
            _ => {}
        }
    }

    for root in &file.gc_roots {
        b.gc_root(check(*root)?);
    }

    Ok(b.finish())
}

pub fn write_dump_file(dump: &HeapDump, path: &Path) -> Result<(), SnapshotError> {
    let file = to_records(dump);
    let out = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(out), &file)
        .map_err(|e| SnapshotError::Format(e.to_string()))?;
    Ok(())
}

fn to_records(dump: &HeapDump) -> DumpFile {
    let mut objects = Vec::with_capacity(dump.object_count());
    for id in 0..dump.object_count() {
        let oid = id as ObjectId;
        let record = match dump.kinds[id] {
            ObjectKind::Class => {
                let meta = &dump.class_meta[&oid];
                ObjectRecord::Class {
                    name: meta.name.clone(),
                    loader: meta.loader,
                }
            }
            ObjectKind::Instance => ObjectRecord::Instance {
                class: dump.class_ids[id],
                size: Some(dump.heap_sizes[id]),
                fields: dump.fields[id]
                    .iter()
                    .map(|(name, value)| FieldRecord {
                        name: name.clone(),
                        value: match value {
                            FieldValue::Null => FieldValueRecord::Null,
                            FieldValue::Ref(addr) => match dump.addr_to_id.get(addr) {
                                Some(target) => FieldValueRecord::Ref(*target),
                                None => FieldValueRecord::Null,
                            },
                            FieldValue::Int(v) => FieldValueRecord::Int(*v),
                            FieldValue::Float(v) => FieldValueRecord::Float(*v),
                            FieldValue::Bool(v) => FieldValueRecord::Bool(*v),
                        },
                    })
                    .collect(),
            },
            ObjectKind::RefArray => ObjectRecord::RefArray {
                class: dump.class_ids[id],
                slots: dump.ref_arrays[id]
                    .as_ref()
                    .map(|slots| {
                        slots
                            .iter()
                            .map(|addr| {
                                if *addr == NULL_ADDRESS {
                                    None
                                } else {
                                    dump.addr_to_id.get(addr).copied()
                                }
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            ObjectKind::PrimArray => ObjectRecord::PrimArray {
                class: dump.class_ids[id],
                length: dump.prim_array_lengths[id],
                size: dump.heap_sizes[id],
            },
        };
        objects.push(record);
    }

    // Class roots are re-added on load; only explicit roots need recording,
    // but keeping all of them makes the file self-describing.
    DumpFile {
        jvm_info: dump.info().jvm_info.clone(),
        objects,
        gc_roots: dump.gc_roots.clone(),
    }
}
