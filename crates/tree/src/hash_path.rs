//! Inclusion proofs

use crate::{hasher::Hasher, Hash};

/// Sibling pairs from the leaf layer up to the children of the root.
///
/// Entry `i` holds the `(left, right)` children of the layer `i + 1` node on
/// the path. The flat encoding is `depth × 64` bytes, left before right.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HashPath {
    /// `(left, right)` pair per layer, leaf layer first
    pub data: Vec<(Hash, Hash)>,
}

impl HashPath {
    /// Create a path from per-layer pairs
    pub const fn new(data: Vec<(Hash, Hash)>) -> Self {
        Self { data }
    }

    /// Number of layers covered
    pub fn depth(&self) -> usize {
        self.data.len()
    }

    /// Flatten into `depth × 64` bytes
    pub fn to_buffer(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.data.len() * 64);
        for (left, right) in &self.data {
            buf.extend_from_slice(left);
            buf.extend_from_slice(right);
        }
        buf
    }

    /// Parse a buffer produced by [`HashPath::to_buffer`].
    ///
    /// Returns `None` unless the length is a multiple of 64.
    pub fn from_buffer(buf: &[u8]) -> Option<Self> {
        if buf.len() % 64 != 0 {
            return None;
        }
        let data = buf
            .chunks_exact(64)
            .map(|pair| {
                let mut left = [0u8; 32];
                let mut right = [0u8; 32];
                left.copy_from_slice(&pair[..32]);
                right.copy_from_slice(&pair[32..]);
                (left, right)
            })
            .collect();
        Some(Self { data })
    }

    /// Check that the tree with `root` holds `leaf` at `index`.
    ///
    /// At each layer the running hash must equal the pair member selected by
    /// the index bit, and the top pair must compress to `root`.
    pub fn validate<H: Hasher + ?Sized>(
        &self,
        root: &Hash,
        index: u64,
        leaf: &[u8],
        hasher: &H,
    ) -> bool {
        let depth = self.data.len();
        if depth == 0 || (depth < 64 && index >> depth != 0) {
            return false;
        }

        let mut current = hasher.hash(leaf);
        let mut index = index;
        for (left, right) in &self.data {
            let on_path = if index & 1 == 0 { left } else { right };
            if *on_path != current {
                return false;
            }
            current = hasher.compress(left, right);
            index >>= 1;
        }

        current == *root
    }
}
