//! Relay engine: accept loops, bidirectional stream copying, dial retry,
//! and at-least-once datagram forwarding.
//!
//! The transport crate provides the endpoints; this crate provides the
//! plumbing between them. A stream acceptor takes connections from a guest
//! listener and relays each to a host-side unix socket; the datagram
//! forwarder pushes framed messages over one persistent channel.
//!
//! ```text
//!  guest listener          per-connection session            host
//!  (vsock / 9p)  --accept-->  relay a<->b copy   --dial-->  unix socket
//!
//!  caller  --send-->  DatagramForwarder  --"<len> <payload>"-->  channel
//! ```
//!
//! Shutdown is cooperative throughout: acceptors and sessions watch a
//! [`CancellationToken`](tokio_util::sync::CancellationToken) and wind down
//! without tearing mid-copy state.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod acceptor;
pub mod datagram;
pub mod dial;
pub mod error;
pub mod relay;

pub use acceptor::{run_ninep_acceptor, run_stream_acceptor, EndpointListener};
pub use datagram::{DatagramForwarder, Dialer, UnixDialer};
pub use dial::{dial_with_retry, RetryPolicy};
pub use error::{RelayError, Result};
pub use relay::{relay, RelayOutcome};

#[cfg(target_os = "linux")]
pub use datagram::VsockDialer;
