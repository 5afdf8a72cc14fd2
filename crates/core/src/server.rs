//! Block synchronisation server
//!
//! The server pulls blocks from a [`BlockSource`], writes their leaves into a
//! [`WorldStateDb`] and advances a durable bookmark once a block is fully
//! applied. [`Server::start`] drains the existing backlog before returning and
//! leaves a background task ingesting blocks produced later.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::block::{Block, BlockSource};
use crate::error::{Error, Result};
use crate::server_state::{ServerState, ServerStateDb};
use crate::source::{HashPathSource, TreeState};
use crate::world_state::WorldStateDb;
use crate::HashPath;

/// Lifecycle of a [`Server`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerStatus {
    /// Not ingesting, queries rejected
    Stopped,
    /// Catching up with the block source
    Starting,
    /// Caught up and ingesting new blocks
    Running,
    /// Waiting for ingestion to finish
    Stopping,
}

/// Synchronisation server over a world state `W`
pub struct Server<W> {
    applier: Applier<W>,
    block_source: Arc<dyn BlockSource>,
    status: Arc<watch::Sender<ServerStatus>>,
    ingest: Mutex<Option<Ingest>>,
}

impl<W> std::fmt::Debug for Server<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("status", &*self.status.borrow()).finish_non_exhaustive()
    }
}

struct Ingest {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The single writer: applies blocks and advances the bookmark
struct Applier<W> {
    world_state: Arc<RwLock<W>>,
    state_db: Arc<dyn ServerStateDb>,
    bookmark: Arc<Mutex<ServerState>>,
}

impl<W> Clone for Applier<W> {
    fn clone(&self) -> Self {
        Self {
            world_state: self.world_state.clone(),
            state_db: self.state_db.clone(),
            bookmark: self.bookmark.clone(),
        }
    }
}

impl<W: WorldStateDb> Applier<W> {
    async fn next_block(&self) -> u64 {
        self.bookmark.lock().await.next_block()
    }

    async fn apply(&self, block: Block) -> Result<()> {
        let mut bookmark = self.bookmark.lock().await;
        if bookmark.has_applied(block.id) {
            debug!(id = block.id, "Skipping applied block");
            return Ok(());
        }
        let expected = bookmark.next_block();
        if block.id != expected {
            return Err(Error::UnexpectedBlock { expected, received: block.id });
        }

        for (offset, leaf) in block.leaf_data.iter().enumerate() {
            let index = block.data_start_index.saturating_add(offset as u64);
            self.world_state.write().await.put(index, leaf).await?;
        }

        let state = ServerState::applied(block.id);
        self.state_db.write_state(state).await?;
        *bookmark = state;

        let root = self.world_state.read().await.root();
        info!(
            id = block.id,
            leaves = block.leaf_data.len(),
            root = %hex::encode(&root[..8]),
            "Applied block"
        );
        Ok(())
    }
}

impl<W: WorldStateDb + 'static> Server<W> {
    /// Create a stopped server
    pub fn new(
        world_state: W,
        state_db: impl ServerStateDb + 'static,
        block_source: impl BlockSource + 'static,
    ) -> Self {
        let (status, _) = watch::channel(ServerStatus::Stopped);
        Self {
            applier: Applier {
                world_state: Arc::new(RwLock::new(world_state)),
                state_db: Arc::new(state_db),
                bookmark: Arc::new(Mutex::new(ServerState::default())),
            },
            block_source: Arc::new(block_source),
            status: Arc::new(status),
            ingest: Mutex::new(None),
        }
    }

    /// Current lifecycle state
    pub fn status(&self) -> ServerStatus {
        *self.status.borrow()
    }

    /// Watch lifecycle changes
    pub fn subscribe_status(&self) -> watch::Receiver<ServerStatus> {
        self.status.subscribe()
    }

    /// Shared handle to the world state
    pub fn world_state(&self) -> Arc<RwLock<W>> {
        self.applier.world_state.clone()
    }

    /// Catch up with the block source, then keep ingesting in the background.
    ///
    /// Returns once every block available at subscription time is applied.
    /// Calling it on a running server does nothing. A server whose ingestion
    /// halted on a failed block resumes from its bookmark.
    pub async fn start(&self) -> Result<()> {
        let mut ingest = self.ingest.lock().await;
        if let Some(previous) = ingest.take() {
            if self.status() == ServerStatus::Running {
                *ingest = Some(previous);
                return Ok(());
            }
            if let Err(err) = previous.task.await {
                warn!(%err, "Ingestion task ended abnormally");
            }
            self.block_source.stop().await;
        }

        self.status.send_replace(ServerStatus::Starting);
        match self.catch_up().await {
            Ok(handle) => {
                *ingest = Some(handle);
                let world_state = self.applier.world_state.read().await;
                info!(
                    size = world_state.size(),
                    root = %hex::encode(world_state.root()),
                    "Server synchronised"
                );
                Ok(())
            }
            Err(err) => {
                self.block_source.stop().await;
                self.status.send_replace(ServerStatus::Stopped);
                Err(err)
            }
        }
    }

    async fn catch_up(&self) -> Result<Ingest> {
        let state = self.applier.state_db.read_state().await?;
        *self.applier.bookmark.lock().await = state;
        info!(from = state.next_block(), "Synchronising chain state");

        loop {
            let next = self.applier.next_block().await;
            let blocks = self.block_source.get_blocks(next).await?;
            if blocks.is_empty() {
                break;
            }
            for block in blocks {
                self.applier.apply(block).await?;
            }
            if self.applier.next_block().await == next {
                warn!(next, "Block source returned no new blocks");
                break;
            }
        }

        let next = self.applier.next_block().await;
        let blocks = self.block_source.start(next).await?;
        let (shutdown, signal) = watch::channel(false);
        // Running before the task exists, so a halt inside it is never overwritten
        self.status.send_replace(ServerStatus::Running);
        let task =
            tokio::spawn(ingest(self.applier.clone(), self.status.clone(), blocks, signal));
        Ok(Ingest { shutdown, task })
    }

    /// Stop ingesting and wait for the block in flight, if any
    pub async fn stop(&self) {
        let Some(Ingest { shutdown, task }) = self.ingest.lock().await.take() else {
            return;
        };

        self.status.send_replace(ServerStatus::Stopping);
        let _ = shutdown.send(true);
        if let Err(err) = task.await {
            warn!(%err, "Ingestion task ended abnormally");
        }
        self.block_source.stop().await;
        self.status.send_replace(ServerStatus::Stopped);
        info!("Server stopped");
    }

    fn ensure_running(&self) -> Result<()> {
        match self.status() {
            ServerStatus::Running => Ok(()),
            _ => Err(Error::NotStarted),
        }
    }

    /// Current root and size
    pub async fn get_tree_state(&self) -> Result<TreeState> {
        self.ensure_running()?;
        let world_state = self.applier.world_state.read().await;
        Ok(TreeState { root: world_state.root(), size: world_state.size() })
    }

    /// Hash path for `index`, which must lie in `[0, 2^depth)`
    pub async fn get_hash_path(&self, index: u64) -> Result<HashPath> {
        self.ensure_running()?;
        let world_state = self.applier.world_state.read().await;
        let depth = world_state.depth();
        if index.checked_shr(depth).unwrap_or(0) != 0 {
            return Err(Error::IndexOutOfRange { index, depth });
        }
        world_state.get_hash_path(index).await
    }
}

async fn ingest<W: WorldStateDb>(
    applier: Applier<W>,
    status: Arc<watch::Sender<ServerStatus>>,
    mut blocks: mpsc::Receiver<Block>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            block = blocks.recv() => {
                let Some(block) = block else { break };
                let id = block.id;
                if let Err(err) = applier.apply(block).await {
                    error!(id, %err, "Failed to apply block, ingestion halted");
                    status.send_replace(ServerStatus::Stopped);
                    break;
                }
            }
        }
    }
    debug!("Block ingestion finished");
}

#[async_trait]
impl<W: WorldStateDb + 'static> HashPathSource for Server<W> {
    async fn get_tree_state(&self) -> Result<TreeState> {
        Self::get_tree_state(self).await
    }

    async fn get_hash_path(&self, index: u64) -> Result<HashPath> {
        Self::get_hash_path(self, index).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use hashpath_tree::{KvStore, MemoryStore, StoreError, WriteBatch};
    use tokio::sync::{Notify, Semaphore};

    use super::*;
    use crate::{InternalWorldStateDb, KvServerStateDb, LocalBlockSource};

    fn block(id: u64) -> Block {
        let first = id as u8 * 2;
        Block::new(id, id * 2, vec![[first; 32], [first + 1; 32]])
    }

    async fn seeded(count: u64) -> LocalBlockSource {
        let source = LocalBlockSource::new();
        for id in 0..count {
            source.add_block(block(id)).await.unwrap();
        }
        source
    }

    fn server<S: KvStore + Clone + 'static>(
        store: S,
        source: impl BlockSource + 'static,
    ) -> Server<InternalWorldStateDb<S>> {
        let world_state = InternalWorldStateDb::open(store.clone()).unwrap();
        Server::new(world_state, KvServerStateDb::new(store), source)
    }

    async fn wait_for_size<W: WorldStateDb + 'static>(server: &Server<W>, size: u64) {
        for _ in 0..200 {
            if server.get_tree_state().await.unwrap().size == size {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("tree never reached size {size}");
    }

    async fn wait_for_status<W: WorldStateDb + 'static>(
        server: &Server<W>,
        status: ServerStatus,
    ) {
        for _ in 0..200 {
            if server.status() == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server never reached {status:?}");
    }

    /// Records where each subscription starts
    #[derive(Clone)]
    struct RecordingSource {
        inner: LocalBlockSource,
        started: Arc<std::sync::Mutex<Vec<u64>>>,
    }

    #[async_trait]
    impl BlockSource for RecordingSource {
        async fn get_blocks(&self, from: u64) -> Result<Vec<Block>> {
            self.inner.get_blocks(from).await
        }

        async fn start(&self, from: u64) -> Result<mpsc::Receiver<Block>> {
            self.started.lock().unwrap().push(from);
            self.inner.start(from).await
        }

        async fn stop(&self) {
            self.inner.stop().await;
        }
    }

    /// Delivers every block twice
    struct RepeatingSource {
        inner: LocalBlockSource,
    }

    #[async_trait]
    impl BlockSource for RepeatingSource {
        async fn get_blocks(&self, from: u64) -> Result<Vec<Block>> {
            let blocks = self.inner.get_blocks(from).await?;
            Ok(blocks.iter().flat_map(|b| [b.clone(), b.clone()]).collect())
        }

        async fn start(&self, from: u64) -> Result<mpsc::Receiver<Block>> {
            self.inner.start(from).await
        }

        async fn stop(&self) {
            self.inner.stop().await;
        }
    }

    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail: AtomicBool,
    }

    impl KvStore for FlakyStore {
        fn get(&self, key: &[u8]) -> std::result::Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key)
        }

        fn put(&self, key: &[u8], value: &[u8]) -> std::result::Result<(), StoreError> {
            self.inner.put(key, value)
        }

        fn write_batch(&self, batch: WriteBatch) -> std::result::Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("disk full".into()));
            }
            self.inner.write_batch(batch)
        }
    }

    /// World state whose writes wait for a permit while closed
    struct GatedWorldState {
        inner: InternalWorldStateDb<MemoryStore>,
        closed: Arc<AtomicBool>,
        entered: Arc<Notify>,
        permits: Arc<Semaphore>,
    }

    #[async_trait]
    impl WorldStateDb for GatedWorldState {
        fn root(&self) -> crate::Hash {
            self.inner.root()
        }

        fn size(&self) -> u64 {
            self.inner.size()
        }

        fn depth(&self) -> u32 {
            self.inner.depth()
        }

        async fn get(&self, index: u64) -> Result<Option<Vec<u8>>> {
            self.inner.get(index).await
        }

        async fn get_hash_path(&self, index: u64) -> Result<HashPath> {
            self.inner.get_hash_path(index).await
        }

        async fn put(&mut self, index: u64, value: &[u8]) -> Result<crate::Hash> {
            if self.closed.load(Ordering::SeqCst) {
                self.entered.notify_one();
                self.permits.acquire().await.unwrap().forget();
            }
            self.inner.put(index, value).await
        }
    }

    #[tokio::test]
    async fn test_sync_with_new_blocks() {
        let source = seeded(1).await;
        let server = server(MemoryStore::new(), source.clone());
        server.start().await.unwrap();
        assert_eq!(server.status(), ServerStatus::Running);
        assert_eq!(server.get_tree_state().await.unwrap().size, 2);

        source.add_block(block(1)).await.unwrap();
        wait_for_size(&server, 4).await;

        let state = server.get_tree_state().await.unwrap();
        assert_eq!(
            hex::encode(state.root),
            "d75b9c13d280c162faa7fa330e8b424c67dcb6d4c6aa0345e3681016a3a2c446"
        );

        let path = server.get_hash_path(3).await.unwrap();
        let world_state = server.world_state();
        let world_state = world_state.read().await;
        assert!(path.validate(&state.root, 3, &[3u8; 32], world_state.tree().hasher()));
        drop(world_state);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_start_drains_backlog_larger_than_a_page() {
        let server = server(MemoryStore::new(), seeded(12).await);
        server.start().await.unwrap();
        assert_eq!(server.get_tree_state().await.unwrap().size, 24);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_restart_resumes_after_bookmark() {
        let store = MemoryStore::new();
        let source = seeded(2).await;

        let first = server(store.clone(), source.clone());
        first.start().await.unwrap();
        let before = first.get_tree_state().await.unwrap();
        first.stop().await;

        let recording = RecordingSource { inner: source, started: Default::default() };
        let second = server(store.clone(), recording.clone());
        second.start().await.unwrap();

        assert_eq!(*recording.started.lock().unwrap(), vec![2]);
        assert_eq!(second.get_tree_state().await.unwrap(), before);
        assert_eq!(before.size, 4);
        second.stop().await;
    }

    #[tokio::test]
    async fn test_redelivered_blocks_are_skipped() {
        let store = MemoryStore::new();
        let source = RepeatingSource { inner: seeded(3).await };
        let server = server(store.clone(), source);
        server.start().await.unwrap();

        assert_eq!(server.get_tree_state().await.unwrap().size, 6);
        let bookmark = KvServerStateDb::new(store).read_state().await.unwrap();
        assert_eq!(bookmark.last_block, 2);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_queries_require_running_server() {
        let server = server(MemoryStore::new(), seeded(1).await);
        assert!(matches!(server.get_tree_state().await, Err(Error::NotStarted)));
        assert!(matches!(server.get_hash_path(0).await, Err(Error::NotStarted)));

        server.start().await.unwrap();
        server.start().await.unwrap();
        assert!(server.get_tree_state().await.is_ok());

        server.stop().await;
        server.stop().await;
        assert_eq!(server.status(), ServerStatus::Stopped);
        assert!(matches!(server.get_tree_state().await, Err(Error::NotStarted)));
    }

    #[tokio::test]
    async fn test_hash_path_index_out_of_range() {
        let server = server(MemoryStore::new(), LocalBlockSource::new());
        server.start().await.unwrap();

        assert_eq!(server.get_hash_path(u64::from(u32::MAX)).await.unwrap().depth(), 32);
        let err = server.get_hash_path(1 << 32).await.unwrap_err();
        assert!(matches!(err, Error::IndexOutOfRange { depth: 32, .. }));
        assert!(err.is_client_error());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_bookmark() {
        let store = Arc::new(FlakyStore::default());
        let source = seeded(2).await;

        store.fail.store(true, Ordering::SeqCst);
        let failing = server(store.clone(), source.clone());
        assert!(failing.start().await.is_err());
        assert_eq!(failing.status(), ServerStatus::Stopped);
        let bookmark = KvServerStateDb::new(store.clone()).read_state().await.unwrap();
        assert_eq!(bookmark, ServerState::default());

        store.fail.store(false, Ordering::SeqCst);
        let retry = server(store.clone(), source);
        retry.start().await.unwrap();
        assert_eq!(retry.get_tree_state().await.unwrap().size, 4);
        retry.stop().await;
    }

    #[tokio::test]
    async fn test_stop_waits_for_block_in_flight() {
        let store = MemoryStore::new();
        let closed = Arc::new(AtomicBool::new(false));
        let entered = Arc::new(Notify::new());
        let permits = Arc::new(Semaphore::new(0));
        let world_state = GatedWorldState {
            inner: InternalWorldStateDb::open(store.clone()).unwrap(),
            closed: closed.clone(),
            entered: entered.clone(),
            permits: permits.clone(),
        };
        let source = seeded(1).await;
        let server =
            Arc::new(Server::new(world_state, KvServerStateDb::new(store.clone()), source.clone()));
        server.start().await.unwrap();

        closed.store(true, Ordering::SeqCst);
        source.add_block(block(1)).await.unwrap();
        entered.notified().await;

        let stopping = tokio::spawn({
            let server = server.clone();
            async move { server.stop().await }
        });
        wait_for_status(&server, ServerStatus::Stopping).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopping.is_finished());
        let bookmark = KvServerStateDb::new(store.clone()).read_state().await.unwrap();
        assert_eq!(bookmark.last_block, 0);

        permits.add_permits(2);
        stopping.await.unwrap();
        assert_eq!(server.status(), ServerStatus::Stopped);

        let bookmark = KvServerStateDb::new(store).read_state().await.unwrap();
        assert_eq!(bookmark.last_block, 1);
        let world_state = server.world_state();
        let world_state = world_state.read().await;
        assert_eq!(world_state.size(), 4);
        assert_eq!(world_state.inner.get(3).await.unwrap(), Some(vec![3u8; 32]));
    }

    #[tokio::test]
    async fn test_ingest_failure_stops_server() {
        let store = Arc::new(FlakyStore::default());
        let source = seeded(1).await;
        let server = server(store.clone(), source.clone());
        server.start().await.unwrap();

        store.fail.store(true, Ordering::SeqCst);
        source.add_block(block(1)).await.unwrap();
        wait_for_status(&server, ServerStatus::Stopped).await;

        assert!(matches!(server.get_tree_state().await, Err(Error::NotStarted)));
        assert!(matches!(server.get_hash_path(0).await, Err(Error::NotStarted)));
        let bookmark = KvServerStateDb::new(store.clone()).read_state().await.unwrap();
        assert_eq!(bookmark.last_block, 0);

        store.fail.store(false, Ordering::SeqCst);
        server.start().await.unwrap();
        assert_eq!(server.status(), ServerStatus::Running);
        assert_eq!(server.get_tree_state().await.unwrap().size, 4);
        server.stop().await;
        assert_eq!(server.status(), ServerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_trait_object_queries() {
        let server = server(MemoryStore::new(), seeded(2).await);
        server.start().await.unwrap();

        let source: &dyn HashPathSource = &server;
        let state = source.get_tree_state().await.unwrap();
        let path = source.get_hash_path(0).await.unwrap();
        assert_eq!(path.depth(), 32);
        assert_eq!(state.size, 4);
        server.stop().await;
    }
}
