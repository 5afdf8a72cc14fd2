//! Tree state and hash path query contract

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::{Hash, HashPath};

/// Root and size of the tree at one instant
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeState {
    /// Root hash
    pub root: Hash,
    /// Highest written index plus one
    pub size: u64,
}

/// Anything that can answer tree state and hash path queries
#[async_trait]
pub trait HashPathSource: Send + Sync {
    /// Current root and size
    async fn get_tree_state(&self) -> Result<TreeState>;

    /// Hash path for the leaf at `index`
    async fn get_hash_path(&self, index: u64) -> Result<HashPath>;
}

/// JSON body of `GET /get-tree-state`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTreeStateResponse {
    /// Hex-encoded root
    pub root: String,
    /// Tree size
    pub size: u64,
}

impl From<TreeState> for GetTreeStateResponse {
    fn from(state: TreeState) -> Self {
        Self { root: hex::encode(state.root), size: state.size }
    }
}

impl TryFrom<GetTreeStateResponse> for TreeState {
    type Error = Error;

    fn try_from(response: GetTreeStateResponse) -> Result<Self> {
        let raw = hex::decode(&response.root)
            .map_err(|err| Error::Protocol(format!("bad root hex: {err}")))?;
        let root = Hash::try_from(raw.as_slice())
            .map_err(|_| Error::Protocol(format!("root of {} bytes", raw.len())))?;
        Ok(Self { root, size: response.size })
    }
}

/// JSON body of `GET /get-hash-path/:index`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetHashPathResponse {
    /// Hex-encoded flat hash path
    pub hash_path: String,
}

impl From<&HashPath> for GetHashPathResponse {
    fn from(path: &HashPath) -> Self {
        Self { hash_path: hex::encode(path.to_buffer()) }
    }
}

impl TryFrom<GetHashPathResponse> for HashPath {
    type Error = Error;

    fn try_from(response: GetHashPathResponse) -> Result<Self> {
        let raw = hex::decode(&response.hash_path)
            .map_err(|err| Error::Protocol(format!("bad hash path hex: {err}")))?;
        Self::from_buffer(&raw)
            .ok_or_else(|| Error::Protocol(format!("hash path of {} bytes", raw.len())))
    }
}
