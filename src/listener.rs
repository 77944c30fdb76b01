use std::fs;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use nix::sys::socket::{setsockopt, sockopt};
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};

/// Filesystem-addressed stream listener for local clients.
///
/// Owns the socket file: it is replaced on bind and removed on close.
pub struct Listener {
    inner: Option<UnixListener>,
    path: PathBuf,
    buffer_size: usize,
}

impl Listener {
    /// Binds a non-blocking listener at `path`, removing any stale socket
    /// file first, and sets the file's permission bits to `mode`.
    pub fn bind(path: impl AsRef<Path>, mode: u32, buffer_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let bind_failed = |source: io::Error| BridgeError::ChannelBindFailure {
            path: path.clone(),
            source,
        };

        match fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_failed(e)),
        }

        let inner = UnixListener::bind(&path).map_err(bind_failed)?;
        inner.set_nonblocking(true).map_err(bind_failed)?;
        enlarge_buffers(&inner, buffer_size);

        if let Err(e) = fs::set_permissions(&path, fs::Permissions::from_mode(mode)) {
            warn!("Failed to set permissions on {}: {}", path.display(), e);
        }

        info!("Listening on {}", path.display());
        Ok(Self {
            inner: Some(inner),
            path,
            buffer_size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accepts one pending connection, or `None` if there is none right now.
    pub fn accept(&self) -> io::Result<Option<UnixStream>> {
        let Some(inner) = &self.inner else {
            return Ok(None);
        };
        loop {
            match inner.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(true)?;
                    enlarge_buffers(&stream, self.buffer_size);
                    return Ok(Some(stream));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Closes the socket and removes its file. Safe to call more than once.
    pub fn close(&mut self) {
        if self.inner.take().is_none() {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed socket {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.path.display(), e),
        }
    }

    /// Borrowed descriptor for polling; `None` once closed.
    pub fn poll_fd(&self) -> Option<BorrowedFd<'_>> {
        self.inner.as_ref().map(|l| l.as_fd())
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Best-effort enlargement of both socket buffers. Failure only costs
/// burst tolerance, so it is logged and ignored.
pub(crate) fn enlarge_buffers(fd: &impl AsFd, size: usize) {
    if let Err(e) = setsockopt(fd, sockopt::RcvBuf, &size) {
        debug!("Could not set SO_RCVBUF to {}: {}", size, e);
    }
    if let Err(e) = setsockopt(fd, sockopt::SndBuf, &size) {
        debug!("Could not set SO_SNDBUF to {}: {}", size, e);
    }
}
