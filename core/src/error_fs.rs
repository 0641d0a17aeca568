//! The layered error types of the device core.
//!
//! Each layer wraps the one below it with `#[from]`, so the `?` operator
//! carries errors upward without explicit mapping. The kinds mirror what a
//! caller has to distinguish: exhaustion (evict or erase, then retry),
//! lookup misses, sink/source IO (retry), stream corruption (fall back to a
//! full flash scan) and fatal internal inconsistencies (report, never
//! recover).

use nandfs_api::error_api::ApiError;
use thiserror::Error;

///Error type used in the node pool
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    ///The pool has no free slot left
    #[error("No free node slot left in the pool")]
    Exhausted,

    ///A node index does not fall inside the pool
    #[error("Node index {0} is outside the pool")]
    OutOfRange(u16),

    ///A byte offset into the node slab does not name an integer slot
    #[error("Byte offset {0} does not name a node slot")]
    Unaligned(u32),
}

///Error type used in the device tree
#[derive(Error, Debug)]
pub enum TreeError {
    ///errors from the node pool
    #[error("Error in the node pool")]
    Pool(#[from] PoolError),

    ///a lookup by serial number or block number failed
    #[error("Lookup failed: {0}")]
    NotFound(&'static str),

    ///an internal invariant check failed; reported with context but never
    ///recovered
    #[error("Tree invariant violated: {0}")]
    Fatal(&'static str),
}

///The ways a serialized state stream can fail validation
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptKind {
    ///an externalized node index does not fall inside the pool
    #[error("node index out of range")]
    OutOfRange,

    ///an externalized node reference does not name an integer slot
    #[error("node reference does not name an integer slot")]
    Unaligned,

    ///a node class count exceeds the pool capacity
    #[error("node count exceeds the pool capacity")]
    CountTooLarge,

    ///a restored chain or cross-reference is inconsistent with itself
    #[error("restored structure is inconsistent")]
    Structural,
}

///Error type used in the serializer
#[derive(Error, Debug)]
pub enum SerializeError {
    ///the serialization sink or source reported a failure
    #[error("Issue using the serialization sink or source")]
    Io(#[from] ApiError),

    ///the stream failed validation; the tree has been reset
    #[error("Serialized state is corrupt: {0}")]
    Corrupt(CorruptKind),

    ///errors from the device tree
    #[error("Error in the device tree")]
    Tree(#[from] TreeError),

    ///the device has no serialization operations configured
    #[error("Serialization operations are not set on this device")]
    OpsNotSet,
}

///Index validation failures on the read side are stream corruption, not
///pool misuse; exhaustion stays a tree-level error
impl From<PoolError> for SerializeError {
    fn from(e: PoolError) -> SerializeError {
        match e {
            PoolError::OutOfRange(_) => SerializeError::Corrupt(CorruptKind::OutOfRange),
            PoolError::Unaligned(_) => SerializeError::Corrupt(CorruptKind::Unaligned),
            PoolError::Exhausted => SerializeError::Tree(TreeError::Pool(e)),
        }
    }
}

///Error type used in the device container
#[derive(Error, Debug)]
pub enum DeviceError {
    ///errors from the serializer
    #[error("Error in the serializer")]
    Serialize(#[from] SerializeError),

    ///errors from the device tree
    #[error("Error in the device tree")]
    Tree(#[from] TreeError),

    ///the device lock was used against its discipline
    #[error("Device lock misuse: {0}")]
    Lock(&'static str),

    ///the device was constructed with an inconsistent configuration
    #[error("Invalid device configuration: {0}")]
    Config(&'static str),
}
