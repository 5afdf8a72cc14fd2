//! World state contract

use async_trait::async_trait;
use hashpath_tree::{Hasher, KvStore, MerkleTree, Sha256Hasher, MAX_DEPTH};

use crate::error::Result;
use crate::{Hash, HashPath};

/// Name of the tree holding leaf data
pub const DATA_TREE_NAME: &str = "data_tree";

/// Storage of indexed leaves with a provable root.
///
/// `put` must be serialised by the caller.
#[async_trait]
pub trait WorldStateDb: Send + Sync {
    /// Current root
    fn root(&self) -> Hash;

    /// Highest written index plus one
    fn size(&self) -> u64;

    /// Tree depth
    fn depth(&self) -> u32;

    /// Value at `index`, `None` if never written
    async fn get(&self, index: u64) -> Result<Option<Vec<u8>>>;

    /// Hash path for `index`
    async fn get_hash_path(&self, index: u64) -> Result<HashPath>;

    /// Write `value` at `index`, returning the new root
    async fn put(&mut self, index: u64, value: &[u8]) -> Result<Hash>;
}

/// In-process world state over a [`MerkleTree`]
#[derive(Debug)]
pub struct InternalWorldStateDb<S, H = Sha256Hasher> {
    tree: MerkleTree<S, H>,
}

impl<S: KvStore> InternalWorldStateDb<S> {
    /// Open the data tree in `store`, creating it at full depth if absent
    pub fn open(store: S) -> Result<Self> {
        Self::open_named(store, DATA_TREE_NAME, MAX_DEPTH)
    }

    /// Open or create the tree `name`; `depth` applies only on creation
    pub fn open_named(store: S, name: &str, depth: u32) -> Result<Self> {
        let tree = MerkleTree::new(store, Sha256Hasher::new(), name, depth)?;
        Ok(Self { tree })
    }
}

impl<S, H> InternalWorldStateDb<S, H> {
    /// Wrap an already opened tree
    pub const fn from_tree(tree: MerkleTree<S, H>) -> Self {
        Self { tree }
    }

    /// Underlying tree
    pub const fn tree(&self) -> &MerkleTree<S, H> {
        &self.tree
    }
}

#[async_trait]
impl<S: KvStore, H: Hasher> WorldStateDb for InternalWorldStateDb<S, H> {
    fn root(&self) -> Hash {
        self.tree.root()
    }

    fn size(&self) -> u64 {
        self.tree.size()
    }

    fn depth(&self) -> u32 {
        self.tree.depth()
    }

    async fn get(&self, index: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.get_element(index)?)
    }

    async fn get_hash_path(&self, index: u64) -> Result<HashPath> {
        Ok(self.tree.get_hash_path(index)?)
    }

    async fn put(&mut self, index: u64, value: &[u8]) -> Result<Hash> {
        Ok(self.tree.update_element(index, value)?)
    }
}

#[cfg(test)]
mod tests {
    use hashpath_tree::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn test_delegates_to_tree() {
        let mut db = InternalWorldStateDb::open_named(MemoryStore::new(), "t", 4).unwrap();
        assert_eq!(db.depth(), 4);

        let root = db.put(3, b"leaf").await.unwrap();
        assert_eq!(db.root(), root);
        assert_eq!(db.size(), 4);
        assert_eq!(db.get(3).await.unwrap(), Some(b"leaf".to_vec()));
        assert_eq!(db.get(2).await.unwrap(), None);

        let path = db.get_hash_path(3).await.unwrap();
        assert!(path.validate(&root, 3, b"leaf", db.tree().hasher()));
    }

    #[tokio::test]
    async fn test_open_defaults_to_full_depth() {
        let db = InternalWorldStateDb::open(MemoryStore::new()).unwrap();
        assert_eq!(db.depth(), MAX_DEPTH);
        assert_eq!(
            hex::encode(db.root()),
            "1c9a7e5ff1cf48b4ad1582d3f4e4a1004f3b20d8c5a2b71387a4254ad933ebc5"
        );
    }
}
