//! Durable sync bookmark

use std::path::PathBuf;

use async_trait::async_trait;
use hashpath_tree::KvStore;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::Result;

/// Key under which [`KvServerStateDb`] stores its record by default
///
/// Tree metadata lives under the tree's UTF-8 name, so the leading `0xff`
/// keeps this key clear of every possible tree name.
pub const SERVER_STATE_KEY: &[u8] = b"\xffserver_state";

/// Data persisted between server restarts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerState {
    /// Id of the last fully applied block, `-1` before the first
    pub last_block: i64,
}

impl Default for ServerState {
    fn default() -> Self {
        Self { last_block: -1 }
    }
}

impl ServerState {
    /// Bookmark after applying block `id`
    pub fn applied(id: u64) -> Self {
        Self { last_block: i64::try_from(id).unwrap_or(i64::MAX) }
    }

    /// Id of the next block to apply
    pub fn next_block(&self) -> u64 {
        u64::try_from(self.last_block.saturating_add(1)).unwrap_or(0)
    }

    /// Whether block `id` is already applied
    pub fn has_applied(&self, id: u64) -> bool {
        id < self.next_block()
    }
}

/// Load and save [`ServerState`]
#[async_trait]
pub trait ServerStateDb: Send + Sync {
    /// Stored state, or the default when nothing was saved yet
    async fn read_state(&self) -> Result<ServerState>;

    /// Durably replace the stored state
    async fn write_state(&self, state: ServerState) -> Result<()>;
}

/// JSON record in a [`KvStore`], typically the one holding the tree
#[derive(Clone, Debug)]
pub struct KvServerStateDb<S> {
    store: S,
    key: Vec<u8>,
}

impl<S: KvStore> KvServerStateDb<S> {
    /// Use [`SERVER_STATE_KEY`] in `store`
    pub fn new(store: S) -> Self {
        Self::with_key(store, SERVER_STATE_KEY)
    }

    /// Use a custom key in `store`
    pub fn with_key(store: S, key: impl Into<Vec<u8>>) -> Self {
        Self { store, key: key.into() }
    }
}

#[async_trait]
impl<S: KvStore> ServerStateDb for KvServerStateDb<S> {
    async fn read_state(&self) -> Result<ServerState> {
        match self.store.get(&self.key)? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(ServerState::default()),
        }
    }

    async fn write_state(&self, state: ServerState) -> Result<()> {
        self.store.put(&self.key, &serde_json::to_vec(&state)?)?;
        Ok(())
    }
}

/// JSON file, replaced through a temporary file and a rename
#[derive(Clone, Debug)]
pub struct JsonFileServerStateDb {
    path: PathBuf,
}

impl JsonFileServerStateDb {
    /// Store state at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ServerStateDb for JsonFileServerStateDb {
    async fn read_state(&self) -> Result<ServerState> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ServerState::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_state(&self, state: ServerState) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let raw = serde_json::to_vec(&state)?;
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&raw).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
