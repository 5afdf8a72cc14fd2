//! Block synchronisation and world state for the hash path server
//!
//! This crate contains everything between the block stream and the query API:
//! - Blocks and block sources
//! - The world state contract and its in-process / out-of-process backends
//! - Durable sync bookmark storage
//! - The synchronisation server

pub mod block;
pub mod error;
pub mod external;
pub mod protocol;
pub mod server;
pub mod server_state;
pub mod source;
pub mod world_state;

pub use block::{Block, BlockSource, LocalBlockSource};
pub use error::{Error, Result};
pub use external::ExternalWorldStateDb;
pub use server::{Server, ServerStatus};
pub use server_state::{JsonFileServerStateDb, KvServerStateDb, ServerState, ServerStateDb};
pub use source::{GetHashPathResponse, GetTreeStateResponse, HashPathSource, TreeState};
pub use world_state::{InternalWorldStateDb, WorldStateDb};

pub use hashpath_tree::{Hash, HashPath};
