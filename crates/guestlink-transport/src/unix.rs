//! Unix domain socket transport (host side).

use crate::fd::FdEndpoint;
use std::io;
use std::path::Path;
use tokio::net::{UnixListener, UnixStream};

/// Dials a Unix domain stream socket, returning a duplex endpoint.
///
/// A single attempt; retrying belongs to the caller's dial policy.
///
/// # Errors
///
/// Returns an error if the socket does not exist, refuses the connection, or
/// the stream cannot be wrapped.
pub async fn dial(path: &Path) -> io::Result<FdEndpoint> {
    let stream = UnixStream::connect(path).await?;
    FdEndpoint::from_unix_stream(stream)
}

/// Unix socket listener yielding duplex endpoints.
///
/// Not a guest-facing transport; used by tests and local tooling to stand in
/// for a stream listener.
pub struct UnixEndpointListener {
    listener: UnixListener,
}

impl UnixEndpointListener {
    /// Binds at the given path, replacing a stale socket file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be bound.
    pub fn bind(path: &Path) -> io::Result<Self> {
        let _ = std::fs::remove_file(path);
        Ok(Self {
            listener: UnixListener::bind(path)?,
        })
    }

    /// Accepts the next incoming connection.
    ///
    /// # Errors
    ///
    /// Returns an error when accept fails.
    pub async fn accept(&self) -> io::Result<FdEndpoint> {
        let (stream, _) = self.listener.accept().await?;
        FdEndpoint::from_unix_stream(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DuplexEndpoint;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_reaches_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.sock");
        let listener = UnixEndpointListener::bind(&path).unwrap();

        let (dialed, accepted) = tokio::join!(dial(&path), listener.accept());
        let (_r, mut w) = Box::new(dialed.unwrap()).split();
        let (mut r, _w) = Box::new(accepted.unwrap()).split();

        w.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        r.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn dial_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(dial(&dir.path().join("absent.sock")).await.is_err());
    }
}
