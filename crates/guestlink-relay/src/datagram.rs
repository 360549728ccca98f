//! Datagram forwarding over one persistent channel.
//!
//! Messages are framed as `"<decimal-length> " + payload` and written to a
//! single long-lived endpoint. Delivery is at-least-once: on a write error
//! the connection is dropped, the message is retained as the pending
//! message, and after a reconnect the pending message is replayed before
//! anything newer. No acknowledgement is expected from the receiver, so
//! duplicates are possible and consumers must tolerate them; silent loss is
//! not, within the dial and reconnect budgets.

use crate::dial::{dial_with_retry, RetryPolicy};
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use guestlink_transport::{DuplexEndpoint, EndpointReader, EndpointWriter};
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Wall-clock cap per framed write, so a wedged channel surfaces as an error
/// instead of hanging the caller.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Write attempts per message: one on the current connection plus one after
/// a reconnect.
const WRITE_CYCLES: u32 = 2;

/// Opens the forwarder's outbound channel.
///
/// A single attempt; the forwarder wraps it in its retry policy.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dials one new endpoint.
    async fn dial(&self) -> io::Result<Box<dyn DuplexEndpoint>>;
}

/// Unix-socket dialer for the host-side receiver.
pub struct UnixDialer {
    path: std::path::PathBuf,
}

impl UnixDialer {
    /// Creates a dialer for the given socket path.
    #[must_use]
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Dialer for UnixDialer {
    async fn dial(&self) -> io::Result<Box<dyn DuplexEndpoint>> {
        Ok(Box::new(guestlink_transport::unix::dial(&self.path).await?))
    }
}

/// Vsock dialer for a host-side service (Linux guests).
#[cfg(target_os = "linux")]
pub struct VsockDialer {
    addr: guestlink_transport::VsockAddr,
}

#[cfg(target_os = "linux")]
impl VsockDialer {
    /// Creates a dialer for the given vsock address.
    #[must_use]
    pub fn new(addr: guestlink_transport::VsockAddr) -> Self {
        Self { addr }
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl Dialer for VsockDialer {
    async fn dial(&self) -> io::Result<Box<dyn DuplexEndpoint>> {
        Ok(Box::new(guestlink_transport::vsock::connect(self.addr)?))
    }
}

/// The live connection. The read half is never polled; it is kept so the fd
/// stays open for the write half's lifetime.
struct Channel {
    _read: Box<dyn EndpointReader>,
    write: Box<dyn EndpointWriter>,
}

struct ForwarderState {
    channel: Option<Channel>,
    /// At most one buffered copy of the last attempted message. Re-armed
    /// before every write attempt, cleared the instant a write succeeds.
    pending: Option<Bytes>,
}

/// Forwards framed datagrams over one shared outbound channel.
///
/// The connection handle and pending buffer are shared mutable state across
/// calls; a single async mutex serializes senders, so at most one send is in
/// flight at a time.
pub struct DatagramForwarder {
    dialer: Box<dyn Dialer>,
    policy: RetryPolicy,
    state: Mutex<ForwarderState>,
}

impl DatagramForwarder {
    /// Creates a forwarder; the channel is dialed lazily on first send.
    #[must_use]
    pub fn new(dialer: Box<dyn Dialer>, policy: RetryPolicy) -> Self {
        Self {
            dialer,
            policy,
            state: Mutex::new(ForwarderState {
                channel: None,
                pending: None,
            }),
        }
    }

    /// Sends one message, replaying an unflushed predecessor first.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DialExhausted`] when no connection could be
    /// established within the dial budget and [`RelayError::SendFailed`]
    /// when writes kept failing across a reconnect. Either way the message
    /// last attempted stays pending and is replayed before the next send;
    /// the caller re-queues its own copy.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut state = self.state.lock().await;

        let mut queue = Vec::with_capacity(2);
        if let Some(prev) = state.pending.take() {
            queue.push(prev);
        }
        queue.push(Bytes::copy_from_slice(payload));

        for message in queue {
            self.deliver(&mut state, message).await?;
        }
        Ok(())
    }

    /// Returns true when a message is still awaiting replay.
    pub async fn has_pending(&self) -> bool {
        self.state.lock().await.pending.is_some()
    }

    /// Delivers one message, reconnecting at most once.
    async fn deliver(&self, state: &mut ForwarderState, message: Bytes) -> Result<()> {
        // Armed before any write attempt; on failure the message survives
        // into the next call.
        state.pending = Some(message.clone());

        let mut last_err = None;
        for cycle in 0..WRITE_CYCLES {
            if state.channel.is_none() {
                let endpoint = dial_with_retry(&self.policy, || self.dialer.dial()).await?;
                let (read, write) = endpoint.split();
                state.channel = Some(Channel { _read: read, write });
                tracing::debug!("datagram channel established");
            }

            let Some(channel) = state.channel.as_mut() else {
                continue;
            };
            match write_frame(&mut channel.write, &message).await {
                Ok(()) => {
                    state.pending = None;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(cycle, error = %e, "datagram write failed; dropping channel");
                    state.channel = None;
                    last_err = Some(e);
                }
            }
        }

        Err(RelayError::SendFailed(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "no write attempts made")
        })))
    }
}

/// Writes one `"<len> " + payload` frame: two writes, prefix then payload.
async fn write_frame(writer: &mut Box<dyn EndpointWriter>, payload: &[u8]) -> io::Result<()> {
    let prefix = format!("{} ", payload.len());
    timeout(WRITE_TIMEOUT, async {
        writer.write_all(prefix.as_bytes()).await?;
        writer.write_all(payload).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "datagram write timed out"))?
}
