//! # guestlink-transport
//!
//! Duplex endpoint abstractions for guestlink.
//!
//! A [`DuplexEndpoint`] is any connection that supports independent read-close
//! and write-close in addition to ordinary read/write. Two implementations
//! cover the supported transports:
//!
//! - [`FdEndpoint`]: raw-fd sockets (AF_VSOCK, Hyper-V services on a Linux
//!   guest, Unix domain sockets), half-closed via `shutdown(2)`
//! - [`NinepEndpoint`]: a 9P-backed file pair, where write-close is an
//!   explicit zero-length write and read-close deletes the backing file
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │              guestlink-transport                 │
//! │                                                  │
//! │  ┌──────────┐  ┌──────────┐  ┌───────────────┐  │
//! │  │  vsock   │  │  hvsock  │  │  9P channel   │  │
//! │  │ (cid,port)│ │ svc GUID │  │ events + r/w  │  │
//! │  └────┬─────┘  └────┬─────┘  └───────┬───────┘  │
//! │       └─────────────┴────────────────┘          │
//! │                     ▼                            │
//! │        DuplexEndpoint (split halves)             │
//! └──────────────────────────────────────────────────┘
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod addr;
pub mod error;
pub mod fd;
pub mod hvsock;
pub mod ninep;
pub mod unix;
pub mod vsock;

pub use addr::GuestAddr;
pub use error::{Result, TransportError};
pub use fd::FdEndpoint;
pub use ninep::{NinepChannel, NinepEndpoint};
pub use vsock::VsockAddr;

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Read side of a duplex endpoint.
///
/// Beyond plain reads, the half can close its own direction without touching
/// the peer's ability to receive data written by our write half.
#[async_trait]
pub trait EndpointReader: AsyncRead + Send + Unpin {
    /// Closes only the inbound direction.
    async fn close_read(&mut self) -> io::Result<()>;
}

/// Write side of a duplex endpoint.
#[async_trait]
pub trait EndpointWriter: AsyncWrite + Send + Unpin {
    /// Closes only the outbound direction, signalling end-of-stream to the
    /// peer while leaving the read direction open.
    async fn close_write(&mut self) -> io::Result<()>;
}

/// A connection supporting independent half-close of each direction.
///
/// Splitting consumes the endpoint and yields one exclusively-owned half per
/// direction, so the two copy tasks of a relay never share mutable state.
pub trait DuplexEndpoint: Send {
    /// Splits the endpoint into its read and write halves.
    fn split(self: Box<Self>) -> (Box<dyn EndpointReader>, Box<dyn EndpointWriter>);
}
