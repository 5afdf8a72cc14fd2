//! Persistent sparse Merkle tree
//!
//! This crate provides a fixed-depth (1..=32 levels) Merkle tree whose nodes
//! live in a key-value store. Key features:
//! - Implicit addressing: every node is a `(layer, index)` pair, no pointers
//! - Sparse: unwritten subtrees resolve to memoized empty-subtree hashes
//! - Crash consistent: each update commits nodes and metadata in one batch

mod error;
mod hash_path;
mod hasher;
mod store;
mod tree;

pub use error::{Error, Result, StoreError};
pub use hash_path::HashPath;
pub use hasher::{EmptyHashes, Hasher, Sha256Hasher};
#[cfg(feature = "rocksdb")]
pub use store::RocksDbStore;
pub use store::{KvStore, MemoryStore, WriteBatch};
pub use tree::{MerkleTree, TreeMeta};

/// 32-byte node digest
pub type Hash = [u8; 32];

/// Maximum supported tree depth
pub const MAX_DEPTH: u32 = 32;

/// Size in bytes of the leaf values used by the reference data set
pub const LEAF_BYTES: usize = 64;
