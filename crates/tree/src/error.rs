//! Tree and storage errors

use thiserror::Error;

/// Result alias for tree operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by a [`KvStore`](crate::KvStore) backend
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend rejected or failed the operation
    #[error("storage backend: {0}")]
    Backend(String),
    /// A lock guarding the store was poisoned by a panicking writer
    #[error("store lock poisoned")]
    Poisoned,
}

/// Errors raised by [`MerkleTree`](crate::MerkleTree)
#[derive(Debug, Error)]
pub enum Error {
    /// Depth outside `1..=32`
    #[error("invalid tree depth {0}, expected 1..={max}", max = crate::MAX_DEPTH)]
    InvalidDepth(u32),
    /// The stored tree has a different depth than the caller requires
    #[error("tree stored with depth {stored}, but depth {requested} was required")]
    InconsistentState {
        /// Depth found in the metadata record
        stored: u32,
        /// Depth requested by the caller
        requested: u32,
    },
    /// Index does not address a leaf of this tree
    #[error("index {index} out of range for depth {depth}")]
    IndexOutOfRange {
        /// Requested index
        index: u64,
        /// Tree depth
        depth: u32,
    },
    /// Underlying store I/O failed
    #[error("storage failure: {0}")]
    StorageFailure(#[from] StoreError),
    /// No metadata record exists under the name
    #[error("no tree named {0:?}")]
    UnknownTree(String),
    /// The metadata record has the wrong length
    #[error("corrupt tree metadata ({0} bytes)")]
    CorruptMetadata(usize),
    /// A stored node is not a 32-byte hash
    #[error("corrupt node ({layer}, {index}): {len} bytes")]
    CorruptNode {
        /// Node layer
        layer: u32,
        /// Node index within the layer
        index: u64,
        /// Length found in the store
        len: usize,
    },
}
