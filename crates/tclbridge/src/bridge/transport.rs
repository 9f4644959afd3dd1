//! Named-pipe transport between controller and remote.
//!
//! Every session gets a private directory holding three FIFOs:
//! - `outbound`: controller -> remote messages
//! - `inbound`: remote -> controller messages
//! - `sentinel`: held open for writing by the remote, never written
//!
//! Each message is carried by its own open: the writer opens, writes one
//! frame, closes; the reader reads until EOF. Opening a FIFO for writing
//! blocks until a reader arrives, so the write side runs that open on the
//! blocking pool and races it against the sentinel and the deadline.

use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use futures::{SinkExt, StreamExt};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use tempfile::TempDir;
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::MessageCodec;
use super::liveness::Sentinel;
use super::protocol::{Frame, FrameError};

pub const ENV_PIPE_OUTBOUND: &str = "TCLBRIDGE_PIPE_OUTBOUND";
pub const ENV_PIPE_INBOUND: &str = "TCLBRIDGE_PIPE_INBOUND";
pub const ENV_PIPE_SENTINEL: &str = "TCLBRIDGE_PIPE_SENTINEL";

const DIR_PREFIX: &str = "tclbridge-";

/// How long an empty or truncated inbound message waits for the sentinel
/// before it is blamed on the remote rather than on the protocol.
const SETTLE_TIME: Duration = Duration::from_millis(100);

/// Upper bound on releasing a writer stuck in its open.
const ABANDON_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("remote closed the sentinel pipe")]
    RemoteClosed,

    #[error("deadline elapsed")]
    Timeout,

    #[error("writer closed the pipe without sending a message")]
    EmptyMessage,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Frame decoding reports I/O through [`FrameError::Io`]; unwrap it so
    /// callers can match on the error kind.
    fn flatten(self) -> Self {
        match self {
            Self::Frame(FrameError::Io(e)) => Self::Io(e),
            other => other,
        }
    }
}

/// Sleep until `deadline`, or forever without one.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// The private FIFO directory of one session.
///
/// Owned exclusively by its session. The directory and everything in it is
/// removed by [`PipeSet::cleanup`] or on drop.
pub struct PipeSet {
    dir: Option<TempDir>,
    path: PathBuf,
    outbound: PathBuf,
    inbound: PathBuf,
    sentinel: PathBuf,
}

impl PipeSet {
    /// Create the directory (mode 0700) and the three FIFOs (mode 0600).
    pub fn create() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix(DIR_PREFIX).tempdir()?;
        let path = dir.path().to_path_buf();

        let make_fifo = |name: &str| -> io::Result<PathBuf> {
            let fifo = path.join(name);
            nix::unistd::mkfifo(&fifo, Mode::S_IRUSR | Mode::S_IWUSR)?;
            tracing::trace!(path = %fifo.display(), "Created fifo");
            Ok(fifo)
        };
        let outbound = make_fifo("outbound")?;
        let inbound = make_fifo("inbound")?;
        let sentinel = make_fifo("sentinel")?;

        tracing::debug!(dir = %path.display(), "Created pipe set");
        Ok(Self {
            dir: Some(dir),
            path,
            outbound,
            inbound,
            sentinel,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.path
    }

    pub fn outbound(&self) -> &Path {
        &self.outbound
    }

    pub fn inbound(&self) -> &Path {
        &self.inbound
    }

    pub fn sentinel(&self) -> &Path {
        &self.sentinel
    }

    /// Environment handed to the remote so it can find the pipes.
    pub fn child_env(&self) -> [(&'static str, &Path); 3] {
        [
            (ENV_PIPE_OUTBOUND, self.outbound.as_path()),
            (ENV_PIPE_INBOUND, self.inbound.as_path()),
            (ENV_PIPE_SENTINEL, self.sentinel.as_path()),
        ]
    }

    /// Whether the directory is still on disk under this set's ownership.
    pub fn is_live(&self) -> bool {
        self.dir.is_some()
    }

    /// Remove the directory. Idempotent.
    pub fn cleanup(&mut self) -> io::Result<()> {
        if let Some(dir) = self.dir.take() {
            tracing::debug!(dir = %self.path.display(), "Cleaning up pipe directory");
            dir.close()?;
        }
        Ok(())
    }

    /// Complete any open-for-write still blocked on the outbound FIFO, such
    /// as one left behind by a cancelled send.
    pub fn release_blocked_writers(&self) {
        if !self.is_live() {
            return;
        }
        match open_read_nonblocking(&self.outbound) {
            Ok(reader) => drop(reader),
            Err(e) => tracing::debug!(error = %e, "Failed to open outbound pipe for release"),
        }
    }

    /// Send one message to the remote over the outbound FIFO.
    pub async fn send<M: Into<Frame>>(
        &self,
        msg: M,
        sentinel: &Sentinel,
        deadline: Option<Instant>,
    ) -> Result<(), TransportError> {
        send_guarded(&self.outbound, msg, sentinel, deadline).await
    }

    /// Receive one message from the remote over the inbound FIFO.
    pub async fn receive<M>(
        &self,
        sentinel: &Sentinel,
        deadline: Option<Instant>,
    ) -> Result<M, TransportError>
    where
        M: TryFrom<Frame, Error = FrameError>,
    {
        receive_guarded(&self.inbound, sentinel, deadline).await
    }
}

impl Drop for PipeSet {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, dir = %self.path.display(), "Failed to cleanup pipe directory");
        }
    }
}

fn spawn_open_for_write(path: &Path) -> JoinHandle<io::Result<std::fs::File>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || std::fs::OpenOptions::new().write(true).open(path))
}

async fn join_open(handle: JoinHandle<io::Result<std::fs::File>>) -> io::Result<pipe::Sender> {
    let file = handle.await.map_err(io::Error::other)??;
    pipe::Sender::from_file(file)
}

/// Open the read end of a FIFO without blocking and without the reactor.
fn open_read_nonblocking(path: &Path) -> io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(OFlag::O_NONBLOCK.bits())
        .open(path)
}

/// Release a writer whose open never met a reader.
///
/// Briefly opening the read end completes the rendezvous so the blocking
/// thread returns; both ends are then dropped.
async fn abandon_open(path: &Path, handle: JoinHandle<io::Result<std::fs::File>>) {
    let reader = match open_read_nonblocking(path) {
        Ok(reader) => reader,
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "Failed to release blocked pipe open");
            return;
        }
    };
    match tokio::time::timeout(ABANDON_TIMEOUT, handle).await {
        Ok(_) => tracing::trace!(path = %path.display(), "Released blocked pipe open"),
        Err(_) => {
            tracing::warn!(path = %path.display(), "Blocked pipe open did not return after release")
        }
    }
    drop(reader);
}

async fn write_message<M: Into<Frame>>(tx: pipe::Sender, msg: M) -> Result<(), TransportError> {
    let mut framed = FramedWrite::new(tx, MessageCodec::<M>::new());
    framed.send(msg).await?;
    framed.close().await?;
    Ok(())
}

/// Open `path` for writing and send one message, giving up when the remote
/// dies or the deadline passes.
pub(crate) async fn send_guarded<M: Into<Frame>>(
    path: &Path,
    msg: M,
    sentinel: &Sentinel,
    deadline: Option<Instant>,
) -> Result<(), TransportError> {
    let mut open = spawn_open_for_write(path);

    let tx = tokio::select! {
        biased;
        res = &mut open => {
            let file = res.map_err(io::Error::other)??;
            pipe::Sender::from_file(file)?
        }
        res = sentinel.closed() => {
            abandon_open(path, open).await;
            res?;
            return Err(TransportError::RemoteClosed);
        }
        _ = sleep_until_opt(deadline) => {
            abandon_open(path, open).await;
            return Err(TransportError::Timeout);
        }
    };

    tokio::select! {
        biased;
        res = write_message(tx, msg) => res.map_err(TransportError::flatten),
        res = sentinel.closed() => {
            res?;
            Err(TransportError::RemoteClosed)
        }
        _ = sleep_until_opt(deadline) => Err(TransportError::Timeout),
    }
}

/// Send one message with no liveness guard. Used by the remote side, which
/// has no sentinel to watch.
pub(crate) async fn send_unguarded<M: Into<Frame>>(
    path: &Path,
    msg: M,
) -> Result<(), TransportError> {
    let tx = join_open(spawn_open_for_write(path)).await?;
    write_message(tx, msg).await.map_err(TransportError::flatten)
}

/// Read one message from `path` until EOF.
///
/// `Ok(None)` means the writer closed without sending anything.
pub(crate) async fn read_message<M>(path: &Path) -> Result<Option<M>, TransportError>
where
    M: TryFrom<Frame, Error = FrameError>,
{
    let rx = pipe::OpenOptions::new().open_receiver(path)?;
    let mut framed = FramedRead::new(rx, MessageCodec::<M>::new());
    match framed.next().await {
        Some(Ok(msg)) => Ok(Some(msg)),
        Some(Err(e)) => Err(TransportError::from(e).flatten()),
        None => Ok(None),
    }
}

/// Read one message, giving up when the remote dies or the deadline passes.
pub(crate) async fn receive_guarded<M>(
    path: &Path,
    sentinel: &Sentinel,
    deadline: Option<Instant>,
) -> Result<M, TransportError>
where
    M: TryFrom<Frame, Error = FrameError>,
{
    let outcome = tokio::select! {
        biased;
        res = read_message::<M>(path) => res,
        res = sentinel.closed() => {
            res?;
            return Err(TransportError::RemoteClosed);
        }
        _ = sleep_until_opt(deadline) => return Err(TransportError::Timeout),
    };

    match outcome {
        Ok(Some(msg)) => Ok(msg),
        // An empty or cut-off message is what a dying writer leaves behind.
        Ok(None) => Err(settle(sentinel, TransportError::EmptyMessage).await),
        Err(TransportError::Frame(e)) => Err(settle(sentinel, TransportError::Frame(e)).await),
        Err(e) => Err(e),
    }
}

async fn settle(sentinel: &Sentinel, otherwise: TransportError) -> TransportError {
    match tokio::time::timeout(SETTLE_TIME, sentinel.closed()).await {
        Ok(Ok(())) => TransportError::RemoteClosed,
        _ => otherwise,
    }
}

/// Pipe paths as seen from the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePipes {
    /// Messages from the controller are read here.
    pub outbound: PathBuf,
    /// Replies to the controller are written here.
    pub inbound: PathBuf,
    pub sentinel: PathBuf,
}

impl RemotePipes {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var_os(key).map(PathBuf::from))
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<PathBuf>) -> io::Result<Self> {
        let get = |key: &str| {
            lookup(key).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("environment variable {key} is not set"),
                )
            })
        };
        Ok(Self {
            outbound: get(ENV_PIPE_OUTBOUND)?,
            inbound: get(ENV_PIPE_INBOUND)?,
            sentinel: get(ENV_PIPE_SENTINEL)?,
        })
    }

    /// Open the sentinel for writing. The returned handle must stay alive for
    /// as long as the remote serves the protocol.
    pub async fn hold_sentinel(&self) -> io::Result<std::fs::File> {
        spawn_open_for_write(&self.sentinel)
            .await
            .map_err(io::Error::other)?
    }
}
