//! Per-pair exclusive lock with a liveness check.
//!
//! The marker is a directory created atomically with `mkdir`. Because a
//! crashed transfer leaves the marker behind, its presence alone never means
//! "running": liveness is decided by the status relay socket.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::relay;

#[derive(Debug, Clone)]
pub struct Lock {
    marker: PathBuf,
    socket: PathBuf,
    destination: String,
    port: u16,
}

impl Lock {
    pub fn new(marker: PathBuf, socket: PathBuf, destination: String, port: u16) -> Self {
        Self {
            marker,
            socket,
            destination,
            port,
        }
    }

    pub fn marker(&self) -> &Path {
        &self.marker
    }

    pub fn is_locked(&self) -> bool {
        self.marker.exists()
    }

    pub fn is_live(&self) -> bool {
        relay::is_live(&self.socket)
    }

    /// Claim the pair. Yields [`Error::IsRunning`] when another transfer holds
    /// it and [`Error::Lock`] when the marker is stale.
    pub fn acquire(&self) -> Result<LockGuard> {
        match fs::create_dir(&self.marker) {
            Ok(()) => {
                tracing::debug!(marker = %self.marker.display(), "lock acquired");
                Ok(LockGuard {
                    marker: self.marker.clone(),
                    released: false,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if self.is_live() {
                    Err(self.running())
                } else {
                    Err(Error::Lock {
                        destination: self.destination.clone(),
                        port: self.port,
                        path: self.marker.clone(),
                    })
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the marker. Refused while a transfer is live; a missing marker
    /// is fine.
    pub fn release(&self) -> Result<()> {
        if self.is_live() {
            return Err(self.running());
        }
        remove_marker(&self.marker)?;
        match fs::remove_file(&self.socket) {
            Ok(()) => tracing::info!(socket = %self.socket.display(), "removed stale relay socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn running(&self) -> Error {
        Error::IsRunning {
            destination: self.destination.clone(),
        }
    }
}

/// Held for the duration of a transfer; releases the marker when dropped.
#[derive(Debug)]
pub struct LockGuard {
    marker: PathBuf,
    released: bool,
}

impl LockGuard {
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        remove_marker(&self.marker)?;
        tracing::debug!(marker = %self.marker.display(), "lock released");
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = remove_marker(&self.marker);
        }
    }
}

fn remove_marker(marker: &Path) -> Result<()> {
    match fs::remove_dir(marker) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
