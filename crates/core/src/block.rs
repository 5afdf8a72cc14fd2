//! Blocks and block sources

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::Hash;

/// Maximum number of blocks returned by one [`BlockSource::get_blocks`] call
pub const MAX_BLOCKS_PER_PAGE: usize = 5;

/// Capacity of the channel handed out by [`LocalBlockSource::start`]
const CHANNEL_CAPACITY: usize = 64;

/// A batch of leaves occupying consecutive indices
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Block id, dense and increasing from 0
    pub id: u64,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Index of the first leaf
    pub data_start_index: u64,
    /// Leaf values, hex-concatenated in JSON
    #[serde(with = "leaf_data_hex")]
    pub leaf_data: Vec<Hash>,
}

impl Block {
    /// Create a block stamped with the current time
    pub fn new(id: u64, data_start_index: u64, leaf_data: Vec<Hash>) -> Self {
        Self { id, created: Utc::now(), data_start_index, leaf_data }
    }
}

mod leaf_data_hex {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    use crate::Hash;

    pub(super) fn serialize<S: Serializer>(leaves: &[Hash], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(leaves.concat()))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Hash>, D::Error> {
        let raw = hex::decode(String::deserialize(d)?).map_err(D::Error::custom)?;
        if raw.len() % 32 != 0 {
            return Err(D::Error::custom(format!("leaf data of {} bytes", raw.len())));
        }
        Ok(raw
            .chunks_exact(32)
            .map(|chunk| {
                let mut leaf = [0u8; 32];
                leaf.copy_from_slice(chunk);
                leaf
            })
            .collect())
    }
}

/// Ordered stream of blocks.
///
/// `start` hands back a channel that yields every block from `from` onward,
/// including blocks produced later. The source waits on channel capacity, so
/// the consumer sets the pace.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Up to [`MAX_BLOCKS_PER_PAGE`] blocks starting at id `from`
    async fn get_blocks(&self, from: u64) -> Result<Vec<Block>>;

    /// Begin delivering blocks from id `from`
    async fn start(&self, from: u64) -> Result<mpsc::Receiver<Block>>;

    /// Cease delivery
    async fn stop(&self);
}

/// In-process block source, optionally backed by a JSON file.
///
/// Clones share the same chain.
#[derive(Clone, Debug)]
pub struct LocalBlockSource {
    inner: Arc<LocalBlockSourceInner>,
}

#[derive(Debug)]
struct LocalBlockSourceInner {
    data_path: Option<PathBuf>,
    blocks: RwLock<Vec<Block>>,
    count: watch::Sender<usize>,
    feeder: Mutex<Option<JoinHandle<()>>>,
}

impl Default for LocalBlockSource {
    fn default() -> Self {
        Self::with_blocks(None, Vec::new())
    }
}

impl LocalBlockSource {
    /// Create an empty, memory-only source
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a source persisted at `path`, loading any blocks already there
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let blocks = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        info!(path = %path.display(), blocks = blocks.len(), "Loaded block source");
        Ok(Self::with_blocks(Some(path), blocks))
    }

    fn with_blocks(data_path: Option<PathBuf>, blocks: Vec<Block>) -> Self {
        let (count, _) = watch::channel(blocks.len());
        Self {
            inner: Arc::new(LocalBlockSourceInner {
                data_path,
                blocks: RwLock::new(blocks),
                count,
                feeder: Mutex::new(None),
            }),
        }
    }

    /// Number of blocks in the chain
    pub async fn len(&self) -> usize {
        self.inner.blocks.read().await.len()
    }

    /// Whether the chain is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Simulate the arrival of a new block.
    ///
    /// The id must be the next in sequence.
    pub async fn add_block(&self, block: Block) -> Result<()> {
        let mut blocks = self.inner.blocks.write().await;
        let expected = blocks.len() as u64;
        if block.id != expected {
            return Err(Error::BlockSource(format!(
                "block {} added, expected {expected}",
                block.id
            )));
        }
        blocks.push(block);

        if let Some(path) = &self.inner.data_path {
            tokio::fs::write(path, serde_json::to_vec_pretty(&*blocks)?).await?;
        }

        self.inner.count.send_replace(blocks.len());
        Ok(())
    }

    fn take_feeder(&self) -> Option<JoinHandle<()>> {
        match self.inner.feeder.lock() {
            Ok(mut feeder) => feeder.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

#[async_trait]
impl BlockSource for LocalBlockSource {
    async fn get_blocks(&self, from: u64) -> Result<Vec<Block>> {
        let blocks = self.inner.blocks.read().await;
        let start = usize::try_from(from).unwrap_or(usize::MAX).min(blocks.len());
        let end = start.saturating_add(MAX_BLOCKS_PER_PAGE).min(blocks.len());
        Ok(blocks[start..end].to_vec())
    }

    async fn start(&self, from: u64) -> Result<mpsc::Receiver<Block>> {
        self.stop().await;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let inner = self.inner.clone();
        let mut count = self.inner.count.subscribe();
        let mut next = usize::try_from(from).unwrap_or(usize::MAX);

        let feeder = tokio::spawn(async move {
            loop {
                let block = inner.blocks.read().await.get(next).cloned();
                match block {
                    Some(block) => {
                        if tx.send(block).await.is_err() {
                            break;
                        }
                        next += 1;
                    }
                    None => {
                        if count.wait_for(|len| *len > next).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(next, "Block feeder finished");
        });

        match self.inner.feeder.lock() {
            Ok(mut slot) => *slot = Some(feeder),
            Err(poisoned) => *poisoned.into_inner() = Some(feeder),
        }
        Ok(rx)
    }

    async fn stop(&self) {
        if let Some(feeder) = self.take_feeder() {
            feeder.abort();
            let _ = feeder.await;
        }
    }
}
