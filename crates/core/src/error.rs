//! Error types

use hashpath_tree::StoreError;
use thiserror::Error;

/// Result alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the server and its collaborators
#[derive(Debug, Error)]
pub enum Error {
    /// Query issued before the initial sync completed
    #[error("server has not completed its initial sync")]
    NotStarted,
    /// Query index outside `[0, 2^depth)`
    #[error("index {index} out of range for depth {depth}")]
    IndexOutOfRange {
        /// Requested index
        index: u64,
        /// Tree depth
        depth: u32,
    },
    /// Block delivered out of sequence
    #[error("received block {received}, expected {expected}")]
    UnexpectedBlock {
        /// Next block id after the bookmark
        expected: u64,
        /// Id actually delivered
        received: u64,
    },
    /// Tree engine failure, including storage failures
    #[error(transparent)]
    Tree(#[from] hashpath_tree::Error),
    /// Block source failure
    #[error("block source: {0}")]
    BlockSource(String),
    /// Malformed exchange with an external world state process
    #[error("external world state: {0}")]
    Protocol(String),
    /// Failure reported by, or while reaching, a remote query API
    #[error("remote: {0}")]
    Remote(String),
    /// I/O failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// (De)serialisation failure
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Self::Tree(hashpath_tree::Error::StorageFailure(err))
    }
}

impl Error {
    /// Whether the caller, not the server, is at fault
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::IndexOutOfRange { .. } | Self::Tree(hashpath_tree::Error::IndexOutOfRange { .. })
        )
    }
}
