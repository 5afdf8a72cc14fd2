//! Persistent sparse Merkle tree

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{
    error::{Error, Result},
    hash_path::HashPath,
    hasher::Hasher,
    store::{KvStore, WriteBatch},
    Hash, MAX_DEPTH,
};

const META_BYTES: usize = 40;
const NODE_TAG: u8 = 0x00;
const LEAF_TAG: u8 = 0x01;

/// Root, depth and size of a tree, replaced as a whole on every update.
///
/// Persisted as `root (32) || depth (u32 LE) || size (u32 LE)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeMeta {
    /// Current root hash
    pub root: Hash,
    /// Number of layers below the root
    pub depth: u32,
    /// Highest written index plus one
    pub size: u64,
}

impl TreeMeta {
    fn encode(&self) -> [u8; META_BYTES] {
        let mut buf = [0u8; META_BYTES];
        buf[..32].copy_from_slice(&self.root);
        buf[32..36].copy_from_slice(&self.depth.to_le_bytes());
        // `size` never exceeds u32::MAX, see `MerkleTree::update_element`.
        buf[36..].copy_from_slice(&(self.size as u32).to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != META_BYTES {
            return Err(Error::CorruptMetadata(buf.len()));
        }
        let mut root = [0u8; 32];
        root.copy_from_slice(&buf[..32]);
        let mut word = [0u8; 4];
        word.copy_from_slice(&buf[32..36]);
        let depth = u32::from_le_bytes(word);
        word.copy_from_slice(&buf[36..]);
        let size = u64::from(u32::from_le_bytes(word));
        Ok(Self { root, depth, size })
    }
}

/// Fixed-depth Merkle tree persisted in a [`KvStore`].
///
/// Nodes are addressed by `(layer, index)`, layer 0 being the leaves and
/// layer `depth` the root. Only nodes on written paths are stored; any
/// missing node is the empty-subtree hash of its layer.
///
/// A tree expects a single writer. Reads through `&self` are safe alongside
/// each other, and every update lands in one atomic batch.
#[derive(Debug)]
pub struct MerkleTree<S, H> {
    store: S,
    hasher: H,
    name: String,
    meta: TreeMeta,
}

impl<S: KvStore, H: Hasher> MerkleTree<S, H> {
    /// Create the tree `name`, or restore it if the store already holds it.
    ///
    /// On restore the stored depth wins over `depth`.
    pub fn new(store: S, hasher: H, name: impl Into<String>, depth: u32) -> Result<Self> {
        Self::open(store, hasher, name.into(), depth, false)
    }

    /// Like [`MerkleTree::new`], but a stored tree must have exactly `depth`
    pub fn new_with_exact_depth(
        store: S,
        hasher: H,
        name: impl Into<String>,
        depth: u32,
    ) -> Result<Self> {
        Self::open(store, hasher, name.into(), depth, true)
    }

    /// Restore an existing tree, failing if `name` was never created
    pub fn from_name(store: S, hasher: H, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let meta = match store.get(name.as_bytes())? {
            Some(buf) => TreeMeta::decode(&buf)?,
            None => return Err(Error::UnknownTree(name)),
        };
        check_depth(meta.depth)?;
        Ok(Self { store, hasher, name, meta })
    }

    fn open(store: S, hasher: H, name: String, depth: u32, exact: bool) -> Result<Self> {
        check_depth(depth)?;

        if let Some(buf) = store.get(name.as_bytes())? {
            let meta = TreeMeta::decode(&buf)?;
            check_depth(meta.depth)?;
            if exact && meta.depth != depth {
                return Err(Error::InconsistentState { stored: meta.depth, requested: depth });
            }
            debug!(name = %name, depth = meta.depth, size = meta.size, "restored tree");
            return Ok(Self { store, hasher, name, meta });
        }

        let meta = TreeMeta { root: hasher.empty_hash(depth), depth, size: 0 };
        store.put(name.as_bytes(), &meta.encode())?;
        debug!(name = %name, depth, "created tree");
        Ok(Self { store, hasher, name, meta })
    }

    /// Current root hash
    pub const fn root(&self) -> Hash {
        self.meta.root
    }

    /// Highest written index plus one
    pub const fn size(&self) -> u64 {
        self.meta.size
    }

    /// Tree depth
    pub const fn depth(&self) -> u32 {
        self.meta.depth
    }

    /// Consistent snapshot of root, depth and size
    pub const fn meta(&self) -> TreeMeta {
        self.meta
    }

    /// Logical tree name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hasher used for nodes
    pub const fn hasher(&self) -> &H {
        &self.hasher
    }

    /// Value last written at `index`, or `None` if never written
    pub fn get_element(&self, index: u64) -> Result<Option<Vec<u8>>> {
        self.check_index(index)?;
        Ok(self.store.get(&self.leaf_key(index))?)
    }

    /// Sibling pairs proving the leaf at `index` against the current root
    pub fn get_hash_path(&self, index: u64) -> Result<HashPath> {
        self.check_index(index)?;

        let mut data = Vec::with_capacity(self.meta.depth as usize);
        let mut index = index;
        for layer in 0..self.meta.depth {
            let left = index & !1;
            data.push((self.node(layer, left)?, self.node(layer, left | 1)?));
            index >>= 1;
        }
        Ok(HashPath::new(data))
    }

    /// Write `value` at `index` and return the new root.
    ///
    /// Leaf value, path nodes and metadata are committed in one batch. On
    /// error nothing is written and the root is unchanged.
    pub fn update_element(&mut self, index: u64, value: &[u8]) -> Result<Hash> {
        self.check_index(index)?;

        let mut batch = WriteBatch::new();
        batch.put(self.leaf_key(index), value);

        let mut current = self.hasher.hash(value);
        let mut index_at_layer = index;
        batch.put(self.node_key(0, index_at_layer), current);

        for layer in 1..=self.meta.depth {
            let below = layer - 1;
            let sibling = self.node(below, index_at_layer ^ 1)?;
            current = if index_at_layer & 1 == 0 {
                self.hasher.compress(&current, &sibling)
            } else {
                self.hasher.compress(&sibling, &current)
            };
            index_at_layer >>= 1;
            batch.put(self.node_key(layer, index_at_layer), current);
        }

        let size = self.meta.size.max(index + 1).min(u64::from(u32::MAX));
        let meta = TreeMeta { root: current, depth: self.meta.depth, size };
        batch.put(self.name.as_bytes(), meta.encode());

        self.store.write_batch(batch)?;
        self.meta = meta;
        Ok(current)
    }

    fn check_index(&self, index: u64) -> Result<()> {
        if index >> self.meta.depth != 0 {
            return Err(Error::IndexOutOfRange { index, depth: self.meta.depth });
        }
        Ok(())
    }

    fn node(&self, layer: u32, index: u64) -> Result<Hash> {
        match self.store.get(&self.node_key(layer, index))? {
            Some(buf) if buf.len() == 32 => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&buf);
                Ok(hash)
            }
            Some(buf) => Err(Error::CorruptNode { layer, index, len: buf.len() }),
            None => Ok(self.hasher.empty_hash(layer)),
        }
    }

    fn node_key(&self, layer: u32, index: u64) -> Hash {
        Sha256::new()
            .chain_update(self.name.as_bytes())
            .chain_update([NODE_TAG])
            .chain_update(layer.to_le_bytes())
            .chain_update(index.to_le_bytes())
            .finalize()
            .into()
    }

    fn leaf_key(&self, index: u64) -> Hash {
        Sha256::new()
            .chain_update(self.name.as_bytes())
            .chain_update([LEAF_TAG])
            .chain_update(index.to_le_bytes())
            .finalize()
            .into()
    }
}

fn check_depth(depth: u32) -> Result<()> {
    if depth == 0 || depth > MAX_DEPTH {
        return Err(Error::InvalidDepth(depth));
    }
    Ok(())
}
