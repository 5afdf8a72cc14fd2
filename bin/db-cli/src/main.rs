//! World state process for the `external` node backend.
//!
//! Serves one [`MerkleTree`] over stdin / stdout using the binary protocol in
//! [`hashpath_core::protocol`]. Logs go to stderr.
//!
//! Usage: `db_cli [TREE_NAME] [DEPTH] [STORE_PATH]`

use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use hashpath_core::protocol::{Command, MAX_VALUE_BYTES};
use hashpath_core::world_state::DATA_TREE_NAME;
use hashpath_tree::{Hasher, KvStore, MerkleTree, Sha256Hasher, MAX_DEPTH};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();

    let mut args = std::env::args().skip(1);
    let name = args.next().unwrap_or_else(|| DATA_TREE_NAME.to_string());
    let depth = match args.next() {
        Some(raw) => raw.parse().with_context(|| format!("invalid depth {raw:?}"))?,
        None => MAX_DEPTH,
    };
    let store = open_store(args.next())?;

    let mut tree = MerkleTree::new(store, Sha256Hasher::new(), &name, depth)?;
    info!(%name, depth = tree.depth(), size = tree.size(), "db_cli ready");

    let stdin = io::stdin().lock();
    let stdout = io::stdout().lock();
    serve(&mut tree, BufReader::new(stdin), BufWriter::new(stdout))?;
    info!("stdin closed, exiting");
    Ok(())
}

#[cfg(feature = "rocksdb")]
fn open_store(path: Option<String>) -> anyhow::Result<Arc<dyn KvStore>> {
    match path {
        Some(path) => {
            let store = hashpath_tree::RocksDbStore::open(&path)
                .with_context(|| format!("opening {path}"))?;
            info!(%path, "Opened store");
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(hashpath_tree::MemoryStore::new())),
    }
}

#[cfg(not(feature = "rocksdb"))]
fn open_store(path: Option<String>) -> anyhow::Result<Arc<dyn KvStore>> {
    if let Some(path) = path {
        tracing::warn!(%path, "Built without rocksdb, ignoring store path");
    }
    Ok(Arc::new(hashpath_tree::MemoryStore::new()))
}

/// Write the handshake, then answer requests until `input` is exhausted
fn serve<S, H, R, W>(tree: &mut MerkleTree<S, H>, mut input: R, mut output: W) -> anyhow::Result<()>
where
    S: KvStore,
    H: Hasher,
    R: Read,
    W: Write,
{
    let size = u32::try_from(tree.size()).unwrap_or(u32::MAX);
    output.write_all(&tree.root())?;
    output.write_all(&size.to_be_bytes())?;
    output.write_all(&tree.depth().to_be_bytes())?;
    output.flush()?;

    loop {
        let mut opcode = [0u8; 1];
        match input.read_exact(&mut opcode) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        let command =
            Command::try_from(opcode[0]).map_err(|byte| anyhow!("unknown command {byte:#04x}"))?;
        let index = u64::from(read_u32(&mut input)?);
        debug!(?command, index, "request");

        match command {
            Command::Get => match tree.get_element(index)? {
                Some(value) => {
                    let len = u32::try_from(value.len()).context("stored value too large")?;
                    output.write_all(&len.to_be_bytes())?;
                    output.write_all(&value)?;
                }
                None => output.write_all(&0u32.to_be_bytes())?,
            },
            Command::Put => {
                let len = read_u32(&mut input)?;
                if len > MAX_VALUE_BYTES {
                    bail!("value of {len} bytes");
                }
                let mut value = vec![0u8; len as usize];
                input.read_exact(&mut value)?;
                let root = tree.update_element(index, &value)?;
                output.write_all(&root)?;
            }
            Command::GetHashPath => {
                let path = tree.get_hash_path(index)?;
                output.write_all(&tree.depth().to_be_bytes())?;
                output.write_all(&path.to_buffer())?;
            }
        }
        output.flush()?;
    }
}

fn read_u32(input: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}
