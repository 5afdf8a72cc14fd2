//! Node configuration

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use hashpath_core::world_state::DATA_TREE_NAME;
use hashpath_tree::MAX_DEPTH;
use tracing::warn;

/// Which world state backend to run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum WorldStateKind {
    /// Tree in the node's own store
    #[default]
    Internal,
    /// Tree served by a child process
    External,
}

impl FromStr for WorldStateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "internal" => Ok(Self::Internal),
            "external" => Ok(Self::External),
            other => Err(format!("unknown world state backend {other:?}")),
        }
    }
}

/// Node configuration
#[derive(Clone, Debug)]
pub(crate) struct Config {
    /// HTTP listen port
    pub(crate) port: u16,
    /// Prefix for all query routes
    pub(crate) api_prefix: String,
    /// Root of all persisted state
    pub(crate) data_dir: PathBuf,
    /// JSON file backing the local block source
    pub(crate) blocks_path: PathBuf,
    /// Logical tree name
    pub(crate) tree_name: String,
    /// Depth used when the tree is first created
    pub(crate) tree_depth: u32,
    /// World state backend
    pub(crate) world_state: WorldStateKind,
    /// Binary spawned for [`WorldStateKind::External`]
    pub(crate) db_cli_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            port: 8080,
            api_prefix: String::new(),
            blocks_path: data_dir.join("blocks"),
            data_dir,
            tree_name: DATA_TREE_NAME.to_string(),
            tree_depth: MAX_DEPTH,
            world_state: WorldStateKind::Internal,
            db_cli_path: PathBuf::from("./db_cli"),
        }
    }
}

impl Config {
    /// Load from environment variables
    pub(crate) fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let data_dir = lookup("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir);
        let blocks_path =
            lookup("BLOCKS_PATH").map(PathBuf::from).unwrap_or_else(|| data_dir.join("blocks"));

        Self {
            port: parse_var(&lookup, "PORT").unwrap_or(defaults.port),
            api_prefix: lookup("API_PREFIX").unwrap_or(defaults.api_prefix),
            data_dir,
            blocks_path,
            tree_name: lookup("TREE_NAME").unwrap_or(defaults.tree_name),
            tree_depth: parse_var(&lookup, "TREE_DEPTH").unwrap_or(defaults.tree_depth),
            world_state: parse_var(&lookup, "WORLD_STATE").unwrap_or(defaults.world_state),
            db_cli_path: lookup("DB_CLI_PATH").map(PathBuf::from).unwrap_or(defaults.db_cli_path),
        }
    }

    /// RocksDB directory used by the internal backend
    #[cfg_attr(not(feature = "rocksdb"), allow(dead_code))]
    pub(crate) fn store_path(&self) -> PathBuf {
        self.data_dir.join("world_state.db")
    }

    /// Store directory handed to the external binary
    pub(crate) fn external_store_path(&self) -> PathBuf {
        self.data_dir.join("external_world_state.db")
    }

    /// Sync bookmark file used by the external backend
    pub(crate) fn server_state_path(&self) -> PathBuf {
        self.data_dir.join("server_state.json")
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    lookup(key).and_then(|raw| parse_or_warn(key, &raw))
}

fn parse_or_warn<T: FromStr>(key: &str, raw: &str) -> Option<T>
where
    T::Err: std::fmt::Display,
{
    match raw.parse() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, value = raw, %err, "Ignoring invalid setting");
            None
        }
    }
}
