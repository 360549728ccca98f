//! Raw-fd duplex endpoint.
//!
//! Wraps a connected stream socket fd (vsock, Hyper-V service, Unix domain)
//! in a shared [`AsyncFd`] and exposes split read/write halves. Half-close is
//! real `shutdown(2)` in each direction, so the peer observes EOF on our
//! write-close while our read direction stays usable.

use crate::{DuplexEndpoint, EndpointReader, EndpointWriter};
use async_trait::async_trait;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Duplex endpoint over a raw stream-socket file descriptor.
pub struct FdEndpoint {
    fd: Arc<AsyncFd<OwnedFd>>,
}

impl FdEndpoint {
    /// Wraps a connected socket fd, switching it to non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the fd cannot be made non-blocking or registered
    /// with the reactor.
    pub fn from_owned_fd(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            fd: Arc::new(AsyncFd::new(fd)?),
        })
    }

    /// Wraps a connected tokio Unix stream.
    ///
    /// The stream is deregistered from tokio's own reactor and re-registered
    /// as a raw fd so both directions get true `shutdown(2)` half-close.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream cannot be converted or re-registered.
    pub fn from_unix_stream(stream: tokio::net::UnixStream) -> io::Result<Self> {
        let std_stream = stream.into_std()?;
        std_stream.set_nonblocking(true)?;
        Ok(Self {
            fd: Arc::new(AsyncFd::new(OwnedFd::from(std_stream))?),
        })
    }

    /// Returns the underlying raw fd.
    #[must_use]
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}

impl DuplexEndpoint for FdEndpoint {
    fn split(self: Box<Self>) -> (Box<dyn EndpointReader>, Box<dyn EndpointWriter>) {
        (
            Box::new(FdReadHalf {
                fd: Arc::clone(&self.fd),
            }),
            Box::new(FdWriteHalf { fd: self.fd }),
        )
    }
}

/// Read half of an [`FdEndpoint`].
pub struct FdReadHalf {
    fd: Arc<AsyncFd<OwnedFd>>,
}

/// Write half of an [`FdEndpoint`].
pub struct FdWriteHalf {
    fd: Arc<AsyncFd<OwnedFd>>,
}

impl AsyncRead for FdReadHalf {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let slice = buf.initialize_unfilled();
                // SAFETY: slice stays borrowed for the duration of the call
                // and the guard holds the fd open.
                let n = unsafe { libc::read(fd, slice.as_mut_ptr().cast(), slice.len()) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    // Non-negative after the check.
                    #[allow(clippy::cast_sign_loss)]
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => {}
            }
        }
    }
}

#[async_trait]
impl EndpointReader for FdReadHalf {
    async fn close_read(&mut self) -> io::Result<()> {
        shutdown_fd(self.fd.get_ref().as_raw_fd(), libc::SHUT_RD)
    }
}

impl AsyncWrite for FdWriteHalf {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                // SAFETY: buf outlives the call; the guard holds the fd open.
                let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    // Non-negative after the check.
                    #[allow(clippy::cast_sign_loss)]
                    Ok(n as usize)
                }
            }) {
                Ok(Ok(n)) => return Poll::Ready(Ok(n)),
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => {}
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(shutdown_fd(self.fd.get_ref().as_raw_fd(), libc::SHUT_WR))
    }
}

#[async_trait]
impl EndpointWriter for FdWriteHalf {
    async fn close_write(&mut self) -> io::Result<()> {
        shutdown_fd(self.fd.get_ref().as_raw_fd(), libc::SHUT_WR)
    }
}

/// Half-closes one direction of a socket, tolerating an already-gone peer.
fn shutdown_fd(fd: RawFd, how: libc::c_int) -> io::Result<()> {
    // SAFETY: fd refers to a live socket owned by the caller.
    let result = unsafe { libc::shutdown(fd, how) };
    if result == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ENOTCONN) {
        tracing::trace!(fd, "shutdown skipped; socket no longer connected");
        return Ok(());
    }
    Err(err)
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl flag manipulation on a fd we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
