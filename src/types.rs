/// Snapshot-local dense object identifier.
pub type ObjectId = u32;

/// 64-bit heap address. Zero is the null sentinel in raw reference arrays.
pub type Address = u64;

pub const NULL_ADDRESS: Address = 0;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("no object with id {0}")]
    ObjectNotFound(ObjectId),

    #[error("no object at address {0:#x}")]
    UnmappedAddress(Address),

    #[error("object {0} is not an array")]
    NotAnArray(ObjectId),

    #[error("object {0} is not a class")]
    NotAClass(ObjectId),

    #[error("heap index corrupt: {0}")]
    IndexCorrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dump format error: {0}")]
    Format(String),
}

/// Hard failure during collection extraction. Distinct from the soft
/// `Extraction::Unknown` / `Extraction::Unsupported` outcomes: an error here
/// means either a wrong strategy-to-class binding or genuinely corrupt data,
/// and is surfaced with enough context to diagnose which.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("field '{field}' of {object} is not a backing array (found {found})")]
    BadBackingField {
        field: String,
        object: String,
        found: String,
    },

    #[error("field '{field}' of {object} holds an unexpected value: {found}")]
    BadFieldValue {
        field: String,
        object: String,
        found: String,
    },

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Raised when a caller-driven cancellation signal aborts a long-running
/// operation. Partial results are discarded; the caller re-issues the whole
/// operation if it still wants an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;
