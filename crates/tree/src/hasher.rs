//! SHA-256 hasher for the Merkle tree

use std::sync::RwLock;

use sha2::{Digest, Sha256};

use crate::{Hash, LEAF_BYTES};

/// Leaf hashing and two-child compression.
///
/// `compress` must depend on argument order.
pub trait Hasher: Send + Sync {
    /// Hash a leaf value
    fn hash(&self, data: &[u8]) -> Hash;

    /// Hash two child digests into their parent
    fn compress(&self, left: &Hash, right: &Hash) -> Hash;

    /// Hash of an entirely unwritten subtree rooted at `layer`.
    ///
    /// The default recomputes from the empty leaf every call; implementations
    /// should memoize.
    fn empty_hash(&self, layer: u32) -> Hash {
        let mut current = self.hash(&[0u8; LEAF_BYTES]);
        for _ in 0..layer {
            current = self.compress(&current, &current);
        }
        current
    }
}

/// Lazily grown table of empty-subtree hashes.
///
/// Entry `d` is the root of an empty subtree of height `d`. Entries are
/// appended on demand and never invalidated.
#[derive(Debug, Default)]
pub struct EmptyHashes {
    layers: RwLock<Vec<Hash>>,
}

impl EmptyHashes {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty-subtree hash at `layer`, extending the table with `hasher` if needed
    pub fn get<H: Hasher + ?Sized>(&self, hasher: &H, layer: u32) -> Hash {
        let layer = layer as usize;
        if let Ok(layers) = self.layers.read() {
            if let Some(hash) = layers.get(layer) {
                return *hash;
            }
        }

        let mut layers = match self.layers.write() {
            Ok(guard) => guard,
            // The table is append-only, so a poisoned guard still holds valid prefixes.
            Err(poisoned) => poisoned.into_inner(),
        };
        if layers.is_empty() {
            layers.push(hasher.hash(&[0u8; LEAF_BYTES]));
        }
        while layers.len() <= layer {
            let below = layers[layers.len() - 1];
            layers.push(hasher.compress(&below, &below));
        }
        layers[layer]
    }

    /// Number of memoized layers
    pub fn len(&self) -> usize {
        self.layers.read().map(|l| l.len()).unwrap_or(0)
    }

    /// Whether nothing has been memoized yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// SHA-256 hasher
#[derive(Debug, Default)]
pub struct Sha256Hasher {
    empty: EmptyHashes,
}

impl Sha256Hasher {
    /// Create a hasher with an empty memo table
    pub fn new() -> Self {
        Self::default()
    }

    fn digest(parts: &[&[u8]]) -> Hash {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().into()
    }
}

impl Hasher for Sha256Hasher {
    fn hash(&self, data: &[u8]) -> Hash {
        Self::digest(&[data])
    }

    fn compress(&self, left: &Hash, right: &Hash) -> Hash {
        Self::digest(&[left.as_slice(), right.as_slice()])
    }

    fn empty_hash(&self, layer: u32) -> Hash {
        self.empty.get(self, layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_is_order_dependent() {
        let hasher = Sha256Hasher::new();
        let left = [1u8; 32];
        let right = [2u8; 32];
        assert_ne!(hasher.compress(&left, &right), hasher.compress(&right, &left));
    }

    #[test]
    fn test_empty_leaf_hash() {
        let hasher = Sha256Hasher::new();
        assert_eq!(
            hex::encode(hasher.empty_hash(0)),
            "f5a5fd42d16a20302798ef6ed309979b43003d2320d9f0e8ea9831a92759fb4b"
        );
    }

    #[test]
    fn test_empty_hashes_memoized_lazily() {
        let hasher = Sha256Hasher::new();
        assert!(hasher.empty.is_empty());

        let e3 = hasher.empty_hash(3);
        assert_eq!(hasher.empty.len(), 4);

        // Lower layers come from the memo without growing it.
        let e1 = hasher.empty_hash(1);
        assert_eq!(hasher.empty.len(), 4);

        let e2 = hasher.compress(&e1, &e1);
        assert_eq!(hasher.compress(&e2, &e2), e3);
    }

    #[test]
    fn test_default_empty_hash_matches_memoized() {
        struct Plain;
        impl Hasher for Plain {
            fn hash(&self, data: &[u8]) -> Hash {
                Sha256Hasher::digest(&[data])
            }
            fn compress(&self, left: &Hash, right: &Hash) -> Hash {
                Sha256Hasher::digest(&[left.as_slice(), right.as_slice()])
            }
        }

        let memoized = Sha256Hasher::new();
        for layer in [0, 1, 7, 32] {
            assert_eq!(Plain.empty_hash(layer), memoized.empty_hash(layer));
        }
    }
}
