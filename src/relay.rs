//! Status relay: a per-transfer publish/subscribe channel over a Unix socket.
//!
//! The transfer binds a [`Publisher`] at a path derived from the pair's
//! fingerprint and mirrors the remote send pipeline's output onto it. Any
//! number of monitors may connect and receive the raw bytes. The socket file
//! doubles as the pair's liveness artifact.

use bytes::Bytes;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Chunks buffered per subscriber before it starts missing output.
const SUBSCRIBER_BACKLOG: usize = 256;

const READ_CHUNK: usize = 8 * 1024;

/// True when a publisher is bound at `path` and accepting connections.
///
/// A socket file left behind by a process that died is not live.
pub fn is_live(path: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(path).is_ok()
}

pub struct Publisher {
    path: PathBuf,
    tx: broadcast::Sender<Bytes>,
    accept: JoinHandle<()>,
    closed: bool,
}

impl Publisher {
    /// Bind the relay endpoint. Must be called from within a tokio runtime.
    ///
    /// A leftover socket file at `path` is replaced; callers hold the pair
    /// lock, so nothing else can be publishing there.
    pub fn bind(path: &Path) -> Result<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale relay socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(path)?;
        let (tx, _) = broadcast::channel(SUBSCRIBER_BACKLOG);
        let accept = tokio::spawn(accept_loop(listener, tx.clone()));

        Ok(Self {
            path: path.to_path_buf(),
            tx,
            accept,
            closed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Send a chunk to every connected monitor. Having none is not an error.
    pub fn publish(&self, chunk: Bytes) {
        let _ = self.tx.send(chunk);
    }

    /// Stop accepting monitors and remove the socket file.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.accept.abort();
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove relay socket");
            }
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: UnixListener, tx: broadcast::Sender<Bytes>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let rx = tx.subscribe();
                tokio::spawn(forward(stream, rx));
            }
            Err(e) => {
                tracing::warn!(error = %e, "relay accept failed");
                return;
            }
        }
    }
}

async fn forward(mut stream: UnixStream, mut rx: broadcast::Receiver<Bytes>) {
    loop {
        match rx.recv().await {
            Ok(chunk) => {
                if stream.write_all(&chunk).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "relay subscriber lagging");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// No publisher was bound; nothing was subscribed.
    NotRunning,
    /// The stop signal fired.
    Interrupted,
    /// The publisher went away.
    Finished,
}

/// Copy everything published at `path` to `out` until `stop` resolves or the
/// publisher disappears. Either way a trailing newline is written.
pub async fn monitor<W, S>(path: &Path, out: &mut W, stop: S) -> Result<MonitorOutcome>
where
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    let mut stream = match UnixStream::connect(path).await {
        Ok(stream) => stream,
        Err(_) => return Ok(MonitorOutcome::NotRunning),
    };

    tokio::pin!(stop);
    let mut buf = vec![0u8; READ_CHUNK];

    let outcome = loop {
        tokio::select! {
            _ = &mut stop => break MonitorOutcome::Interrupted,
            n = stream.read(&mut buf) => match n {
                Ok(0) | Err(_) => break MonitorOutcome::Finished,
                Ok(n) => {
                    out.write_all(&buf[..n]).await?;
                    out.flush().await?;
                }
            },
        }
    };

    out.write_all(b"\n").await?;
    out.flush().await?;
    Ok(outcome)
}
