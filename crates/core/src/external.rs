//! World state served by a child process

use std::ffi::OsStr;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command as ProcessCommand};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::protocol::{self, Command, MAX_VALUE_BYTES};
use crate::world_state::WorldStateDb;
use crate::{Hash, HashPath};

/// [`WorldStateDb`] backed by an external binary speaking [`protocol`]
#[derive(Debug)]
pub struct ExternalWorldStateDb<R = ChildStdout, W = ChildStdin> {
    io: Mutex<Pipes<R, W>>,
    root: Hash,
    size: u64,
    depth: u32,
}

#[derive(Debug)]
struct Pipes<R, W> {
    reader: R,
    writer: W,
    child: Option<Child>,
    /// Set once an exchange fails part way, the stream position is then unknown
    broken: bool,
}

impl<R, W> Pipes<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn ensure_usable(&self) -> Result<()> {
        if self.broken {
            return Err(Error::Protocol("connection broken by an earlier failure".into()));
        }
        Ok(())
    }

    fn settle<T>(&mut self, reply: Result<T>) -> Result<T> {
        if let Err(err) = &reply {
            warn!(%err, "External world state connection broken");
            self.broken = true;
        }
        reply
    }

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn get(&mut self, wire: u32) -> Result<Option<Vec<u8>>> {
        self.send(&protocol::request(Command::Get, wire)).await?;
        let len = self.reader.read_u32().await?;
        if len == 0 {
            return Ok(None);
        }
        if len > MAX_VALUE_BYTES {
            return Err(Error::Protocol(format!("value of {len} bytes")));
        }
        let mut value = vec![0u8; len as usize];
        self.reader.read_exact(&mut value).await?;
        Ok(Some(value))
    }

    async fn get_hash_path(&mut self, wire: u32, expected: u32) -> Result<HashPath> {
        self.send(&protocol::request(Command::GetHashPath, wire)).await?;
        let depth = self.reader.read_u32().await?;
        if depth != expected {
            return Err(Error::Protocol(format!("hash path of depth {depth}, expected {expected}")));
        }
        let mut buf = vec![0u8; depth as usize * 64];
        self.reader.read_exact(&mut buf).await?;
        HashPath::from_buffer(&buf).ok_or_else(|| Error::Protocol("truncated hash path".into()))
    }

    async fn put(&mut self, wire: u32, value: &[u8], len: u32) -> Result<Hash> {
        let mut frame = protocol::request(Command::Put, wire).to_vec();
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(value);
        self.send(&frame).await?;
        read_hash(&mut self.reader).await
    }
}

impl ExternalWorldStateDb {
    /// Spawn `program` and read its initial metadata
    pub async fn spawn<I, A>(program: impl AsRef<OsStr>, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = A>,
        A: AsRef<OsStr>,
    {
        let mut child = ProcessCommand::new(program.as_ref())
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let writer = child.stdin.take().ok_or_else(|| Error::Protocol("no stdin".into()))?;
        let reader = child.stdout.take().ok_or_else(|| Error::Protocol("no stdout".into()))?;

        let mut db = Self::connect(reader, writer).await?;
        db.io.get_mut().child = Some(child);
        info!(
            program = %program.as_ref().to_string_lossy(),
            size = db.size,
            depth = db.depth,
            "External world state started"
        );
        Ok(db)
    }

    /// Terminate the child process
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(mut child) = self.io.get_mut().child.take() {
            child.kill().await?;
            let status = child.wait().await?;
            if !status.success() {
                warn!(%status, "External world state exited");
            }
        }
        Ok(())
    }
}

impl<R, W> ExternalWorldStateDb<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Speak the protocol over an existing pair of streams
    pub async fn connect(mut reader: R, writer: W) -> Result<Self> {
        let root = read_hash(&mut reader).await?;
        let size = u64::from(reader.read_u32().await?);
        let depth = reader.read_u32().await?;
        let io = Mutex::new(Pipes { reader, writer, child: None, broken: false });
        Ok(Self { io, root, size, depth })
    }

    fn wire_index(&self, index: u64) -> Result<u32> {
        if index.checked_shr(self.depth).unwrap_or(0) != 0 {
            return Err(Error::IndexOutOfRange { index, depth: self.depth });
        }
        u32::try_from(index).map_err(|_| Error::IndexOutOfRange { index, depth: self.depth })
    }
}

async fn read_hash<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Hash> {
    let mut hash = [0u8; 32];
    reader.read_exact(&mut hash).await?;
    Ok(hash)
}

#[async_trait]
impl<R, W> WorldStateDb for ExternalWorldStateDb<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn root(&self) -> Hash {
        self.root
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn depth(&self) -> u32 {
        self.depth
    }

    async fn get(&self, index: u64) -> Result<Option<Vec<u8>>> {
        let wire = self.wire_index(index)?;
        let mut io = self.io.lock().await;
        io.ensure_usable()?;
        let reply = io.get(wire).await;
        io.settle(reply)
    }

    async fn get_hash_path(&self, index: u64) -> Result<HashPath> {
        let wire = self.wire_index(index)?;
        let mut io = self.io.lock().await;
        io.ensure_usable()?;
        let reply = io.get_hash_path(wire, self.depth).await;
        io.settle(reply)
    }

    async fn put(&mut self, index: u64, value: &[u8]) -> Result<Hash> {
        let wire = self.wire_index(index)?;
        let len = u32::try_from(value.len())
            .ok()
            .filter(|len| *len <= MAX_VALUE_BYTES)
            .ok_or_else(|| Error::Protocol(format!("value of {} bytes", value.len())))?;

        let io = self.io.get_mut();
        io.ensure_usable()?;
        let reply = io.put(wire, value, len).await;
        self.root = io.settle(reply)?;
        self.size = self.size.max(index + 1);
        Ok(self.root)
    }
}
