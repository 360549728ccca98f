//! 9P-backed channel transport.
//!
//! A channel server exports a directory tree over 9P:
//!
//! ```text
//! <base>/events                   newline-delimited new-connection ids
//! <base>/connections/<id>/read    guest-bound byte stream
//! <base>/connections/<id>/write   host-bound byte stream
//! ```
//!
//! The file pair emulates a duplex stream. Write-close is simulated with an
//! explicit zero-length `write(2)`; the server relays the empty chunk to the
//! remote peer as end-of-stream. Read-close (and full teardown) is simulated
//! by deleting the `read` file, which the server surfaces to the remote peer
//! as closure. A zero-length read from the `read` file is treated as
//! end-of-stream for the whole direction.

use crate::error::{Result, TransportError};
use crate::{DuplexEndpoint, EndpointReader, EndpointWriter};
use async_trait::async_trait;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Handle to a 9P channel directory.
#[derive(Debug, Clone)]
pub struct NinepChannel {
    base: PathBuf,
}

impl NinepChannel {
    /// Creates a handle for the given base directory.
    #[must_use]
    pub fn new(base: impl AsRef<Path>) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    /// Returns the base directory.
    #[must_use]
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Path of the `events` stream.
    #[must_use]
    pub fn events_path(&self) -> PathBuf {
        self.base.join("events")
    }

    fn read_path(&self, id: &str) -> PathBuf {
        self.base.join("connections").join(id).join("read")
    }

    fn write_path(&self, id: &str) -> PathBuf {
        self.base.join("connections").join(id).join("write")
    }

    /// Opens the `events` stream announcing new connection ids.
    ///
    /// # Errors
    ///
    /// A missing `events` file means the channel server never set up the
    /// directory; callers treat this as fatal.
    pub async fn open_events(&self) -> Result<File> {
        let path = self.events_path();
        File::open(&path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                TransportError::ChannelMissing(path.display().to_string())
            } else {
                TransportError::Io(e)
            }
        })
    }

    /// Opens the read/write file pair for one announced connection.
    ///
    /// The open blocks until the server makes the files available; a missing
    /// file is a server-side invariant violation and reported as
    /// [`TransportError::ChannelMissing`], never retried.
    ///
    /// # Errors
    ///
    /// Returns an error if either file cannot be opened.
    pub async fn open_connection(&self, id: &str) -> Result<NinepEndpoint> {
        let read_path = self.read_path(id);
        let read = File::open(&read_path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                TransportError::ChannelMissing(read_path.display().to_string())
            } else {
                TransportError::Io(e)
            }
        })?;

        let write_path = self.write_path(id);
        let write = File::options()
            .write(true)
            .open(&write_path)
            .await
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    TransportError::ChannelMissing(write_path.display().to_string())
                } else {
                    TransportError::Io(e)
                }
            })?;

        Ok(NinepEndpoint {
            read,
            write,
            read_path,
        })
    }

    /// Deletes a connection's `read` file so the remote peer observes
    /// closure. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure other than the file already being
    /// gone.
    pub async fn remove_read(&self, id: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.read_path(id)).await {
            Ok(()) => {
                tracing::debug!(id, "connection read file removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Duplex endpoint over a 9P read/write file pair.
pub struct NinepEndpoint {
    read: File,
    write: File,
    read_path: PathBuf,
}

impl DuplexEndpoint for NinepEndpoint {
    fn split(self: Box<Self>) -> (Box<dyn EndpointReader>, Box<dyn EndpointWriter>) {
        (
            Box::new(NinepReadHalf {
                file: self.read,
                path: self.read_path,
            }),
            Box::new(NinepWriteHalf { file: self.write }),
        )
    }
}

/// Read half of a [`NinepEndpoint`].
pub struct NinepReadHalf {
    file: File,
    path: PathBuf,
}

impl AsyncRead for NinepReadHalf {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_read(cx, buf)
    }
}

#[async_trait]
impl EndpointReader for NinepReadHalf {
    async fn close_read(&mut self) -> io::Result<()> {
        // Deleting the read file is the close signal the channel server
        // relays to the remote peer.
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Write half of a [`NinepEndpoint`].
pub struct NinepWriteHalf {
    file: File,
}

impl AsyncWrite for NinepWriteHalf {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.file).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }
}

#[async_trait]
impl EndpointWriter for NinepWriteHalf {
    async fn close_write(&mut self) -> io::Result<()> {
        // Drain any buffered writes first, then emit the explicit empty
        // chunk the peer interprets as end-of-stream.
        self.file.flush().await?;

        let fd = self.file.as_raw_fd();
        let empty: [u8; 0] = [];
        // SAFETY: zero-length write from a valid (dangling-ok) pointer.
        let n = unsafe { libc::write(fd, empty.as_ptr().cast(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn channel_fixture(id: &str, read_content: &[u8]) -> (tempfile::TempDir, NinepChannel) {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn_dir = dir.path().join("connections").join(id);
        std::fs::create_dir_all(&conn_dir).unwrap();
        std::fs::write(dir.path().join("events"), format!("{id}\n")).unwrap();
        std::fs::write(conn_dir.join("read"), read_content).unwrap();
        std::fs::write(conn_dir.join("write"), b"").unwrap();
        let channel = NinepChannel::new(dir.path());
        (dir, channel)
    }

    #[tokio::test]
    async fn reads_guest_bytes_until_end_of_stream() {
        let (_dir, channel) = channel_fixture("c1", b"payload from peer").await;
        let endpoint = channel.open_connection("c1").await.unwrap();
        let (mut reader, _writer) = Box::new(endpoint).split();

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"payload from peer");
    }

    #[tokio::test]
    async fn writes_land_in_write_file() {
        let (dir, channel) = channel_fixture("c1", b"").await;
        let endpoint = channel.open_connection("c1").await.unwrap();
        let (_reader, mut writer) = Box::new(endpoint).split();

        writer.write_all(b"towards the host").await.unwrap();
        writer.flush().await.unwrap();
        writer.close_write().await.unwrap();

        let written =
            std::fs::read(dir.path().join("connections").join("c1").join("write")).unwrap();
        assert_eq!(written, b"towards the host");
    }

    #[tokio::test]
    async fn close_read_deletes_backing_file() {
        let (dir, channel) = channel_fixture("c1", b"x").await;
        let endpoint = channel.open_connection("c1").await.unwrap();
        let (mut reader, _writer) = Box::new(endpoint).split();

        reader.close_read().await.unwrap();
        assert!(!dir
            .path()
            .join("connections")
            .join("c1")
            .join("read")
            .exists());

        // Second close is a no-op.
        reader.close_read().await.unwrap();
    }

    #[tokio::test]
    async fn remove_read_is_idempotent() {
        let (_dir, channel) = channel_fixture("c1", b"").await;
        channel.remove_read("c1").await.unwrap();
        channel.remove_read("c1").await.unwrap();
    }

    #[tokio::test]
    async fn missing_connection_files_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let channel = NinepChannel::new(dir.path());

        let err = channel
            .open_connection("ghost")
            .await
            .err()
            .expect("open must fail");
        match err {
            TransportError::ChannelMissing(path) => assert!(path.contains("ghost")),
            other => panic!("expected ChannelMissing, got {other:?}"),
        }

        let err = channel.open_events().await.err().expect("open must fail");
        match err {
            TransportError::ChannelMissing(path) => assert!(path.contains("events")),
            other => panic!("expected ChannelMissing, got {other:?}"),
        }
    }
}
