pub mod compare;
pub mod extract;
pub mod progress;
pub mod query;
pub mod registry;
pub mod snapshot;
pub mod types;
pub mod utils;

use ahash::AHashMap;

use crate::progress::CancellationToken;
use crate::query::QueryError;
use crate::registry::extract_collection;
use crate::snapshot::{HeapObject, Snapshot};

pub use crate::extract::{CollectionExtractor, Extraction};
pub use crate::registry::ExtractedCollection;
pub use crate::types::{Address, ObjectId};

/// Per-class aggregate over every recognized collection in a snapshot.
pub struct CollectionHistogramRow {
    pub class_name: String,
    /// Recognized collection instances of this class.
    pub instances: u64,
    /// Sum of logical sizes over instances where the size was extractable.
    pub total_entries: u64,
    /// Mean fill ratio over instances that reported one.
    pub avg_fill_ratio: Option<f64>,
    /// Instances whose size came back unknown.
    pub unknown_sizes: u64,
    /// Instances whose extraction failed outright (corrupt data or a wrong
    /// strategy binding). Kept per row instead of aborting the scan.
    pub extraction_errors: u64,
}

/// Scans every object of the snapshot and aggregates collection statistics
/// per class. Unrecognized classes are skipped; per-object extraction
/// failures are counted on their row rather than failing the scan.
pub fn collection_histogram(
    snap: &dyn Snapshot,
    token: &CancellationToken,
) -> Result<Vec<CollectionHistogramRow>, QueryError> {
    struct Accum {
        instances: u64,
        total_entries: u64,
        fill_sum: f64,
        fill_samples: u64,
        unknown_sizes: u64,
        extraction_errors: u64,
    }

    let mut per_class: AHashMap<String, Accum> = AHashMap::new();
    let mut ticker = token.ticker(4096);
    for id in 0..snap.info().object_count as ObjectId {
        ticker.tick()?;
        // class objects share their class's name but hold no entries
        if snap.is_class(id) || snap.is_array(id) {
            continue;
        }
        let obj = HeapObject::new(snap, id);
        let Some(coll) = extract_collection(obj)? else {
            continue;
        };
        let class_name = obj.class_name()?.to_string();
        let acc = per_class.entry(class_name).or_insert(Accum {
            instances: 0,
            total_entries: 0,
            fill_sum: 0.0,
            fill_samples: 0,
            unknown_sizes: 0,
            extraction_errors: 0,
        });
        acc.instances += 1;

        match coll.size() {
            Ok(Extraction::Value(size)) => acc.total_entries += size as u64,
            Ok(Extraction::Unknown) => acc.unknown_sizes += 1,
            Ok(Extraction::Unsupported) => {}
            Err(_) => {
                acc.extraction_errors += 1;
                continue;
            }
        }
        match coll.fill_ratio() {
            Ok(Extraction::Value(fill)) => {
                acc.fill_sum += fill;
                acc.fill_samples += 1;
            }
            Ok(_) => {}
            Err(_) => acc.extraction_errors += 1,
        }
    }

    let mut rows: Vec<CollectionHistogramRow> = per_class
        .into_iter()
        .map(|(class_name, acc)| CollectionHistogramRow {
            class_name,
            instances: acc.instances,
            total_entries: acc.total_entries,
            avg_fill_ratio: (acc.fill_samples > 0)
                .then(|| acc.fill_sum / acc.fill_samples as f64),
            unknown_sizes: acc.unknown_sizes,
            extraction_errors: acc.extraction_errors,
        })
        .collect();
    rows.sort_by(|a, b| {
        b.instances
            .cmp(&a.instances)
            .then_with(|| a.class_name.cmp(&b.class_name))
    });
    Ok(rows)
}
