//! Connection acceptance and session lifecycle.
//!
//! One independent relay session per incoming connection. Accept-loop
//! failures are fatal (the daemon stops listening); per-session failures
//! (dial exhaustion, mid-stream I/O errors) are confined to the session and
//! logged with the connection id and byte counters.

use crate::dial::{dial_with_retry, RetryPolicy};
use crate::error::{RelayError, Result};
use crate::relay::relay;
use async_trait::async_trait;
use guestlink_transport::{unix, DuplexEndpoint, NinepChannel};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// A guest-side listener yielding duplex endpoints.
#[async_trait]
pub trait EndpointListener: Send {
    /// Accepts the next incoming connection.
    ///
    /// An error here is fatal to the acceptor: no further connections can
    /// ever be accepted from this listener.
    async fn accept(&mut self) -> io::Result<Box<dyn DuplexEndpoint>>;
}

#[cfg(target_os = "linux")]
#[async_trait]
impl EndpointListener for guestlink_transport::vsock::VsockListener {
    async fn accept(&mut self) -> io::Result<Box<dyn DuplexEndpoint>> {
        let (endpoint, peer) = Self::accept(self).await?;
        tracing::debug!(peer = %peer, "vsock connection accepted");
        Ok(Box::new(endpoint))
    }
}

#[async_trait]
impl EndpointListener for unix::UnixEndpointListener {
    async fn accept(&mut self) -> io::Result<Box<dyn DuplexEndpoint>> {
        Ok(Box::new(Self::accept(self).await?))
    }
}

/// Accepts stream-socket connections and relays each to the host socket.
///
/// Runs until the listener fails or `shutdown` is cancelled. Connection ids
/// are a process-local monotonic sequence.
///
/// # Errors
///
/// Returns [`RelayError::Accept`] when the listener breaks; per-session
/// errors never propagate here.
pub async fn run_stream_acceptor<L: EndpointListener>(
    mut listener: L,
    target: PathBuf,
    policy: RetryPolicy,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut next_id: u64 = 0;

    loop {
        let guest = tokio::select! {
            () = shutdown.cancelled() => {
                tracing::info!("acceptor shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted.map_err(RelayError::Accept)?,
        };

        let id = next_id;
        next_id += 1;

        let target = target.clone();
        let session_shutdown = shutdown.clone();
        tokio::spawn(async move {
            run_session(id, guest, &target, policy, session_shutdown).await;
        });
    }
}

/// Relays one accepted guest connection to the host socket.
async fn run_session(
    id: u64,
    guest: Box<dyn DuplexEndpoint>,
    target: &Path,
    policy: RetryPolicy,
    shutdown: CancellationToken,
) {
    tracing::debug!(id, target = %target.display(), "session starting");

    let dialed = tokio::select! {
        () = shutdown.cancelled() => {
            tracing::debug!(id, "session aborted before host dial completed");
            return;
        }
        dialed = dial_host(target, &policy) => dialed,
    };
    let host = match dialed {
        Ok(endpoint) => endpoint,
        Err(e) => {
            tracing::warn!(id, error = %e, "abandoning connection: host dial failed");
            return;
        }
    };

    // The relay observes the token itself and tears both directions down.
    let outcome = relay(guest, Box::new(host), shutdown).await;

    match outcome.error {
        None => tracing::info!(
            id,
            guest_to_host = outcome.a_to_b,
            host_to_guest = outcome.b_to_a,
            "session closed"
        ),
        Some(e) => tracing::warn!(
            id,
            guest_to_host = outcome.a_to_b,
            host_to_guest = outcome.b_to_a,
            error = %e,
            "session closed after error"
        ),
    }
}

async fn dial_host(
    target: &Path,
    policy: &RetryPolicy,
) -> Result<guestlink_transport::FdEndpoint> {
    dial_with_retry(policy, || {
        let target = target.to_path_buf();
        async move { unix::dial(&target).await }
    })
    .await
}

/// Accepts 9P-channel connections announced on the `events` stream and
/// relays each to the host socket.
///
/// Per announced id the channel's `read` file is opened (blocking until the
/// server provides it; a missing file is a fatal misconfiguration) together
/// with the `write` file. Teardown always deletes the `read` file so the
/// remote peer can detect closure, regardless of which direction initiated
/// it; dial failure deletes it too, as a courtesy close.
///
/// # Errors
///
/// Returns [`RelayError::Transport`] on channel misconfiguration and
/// [`RelayError::Accept`] if the events stream breaks. End-of-stream on
/// `events` is an orderly shutdown of the channel server and terminates the
/// acceptor cleanly.
pub async fn run_ninep_acceptor(
    channel: NinepChannel,
    target: PathBuf,
    policy: RetryPolicy,
    shutdown: CancellationToken,
) -> Result<()> {
    let events = channel.open_events().await?;
    let mut lines = BufReader::new(events).lines();

    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => {
                tracing::info!("9p acceptor shutting down");
                return Ok(());
            }
            line = lines.next_line() => line.map_err(RelayError::Accept)?,
        };

        let Some(line) = line else {
            tracing::info!("events stream closed by channel server");
            return Ok(());
        };
        let id = line.trim();
        if id.is_empty() {
            continue;
        }

        // A connection id the server never backed with files is a bug on the
        // counterpart side; stop the daemon rather than limp along.
        let guest = Box::new(channel.open_connection(id).await?);

        let id = id.to_string();
        let channel = channel.clone();
        let target = target.clone();
        let session_shutdown = shutdown.clone();
        tokio::spawn(async move {
            run_ninep_session(&channel, &id, guest, &target, policy, session_shutdown).await;
        });
    }
}

async fn run_ninep_session(
    channel: &NinepChannel,
    id: &str,
    guest: Box<dyn DuplexEndpoint>,
    target: &Path,
    policy: RetryPolicy,
    shutdown: CancellationToken,
) {
    tracing::debug!(id, "9p session starting");

    let dialed = tokio::select! {
        () = shutdown.cancelled() => {
            tracing::debug!(id, "9p session aborted before host dial completed");
            let _ = channel.remove_read(id).await;
            return;
        }
        dialed = dial_host(target, &policy) => dialed,
    };
    let host = match dialed {
        Ok(endpoint) => endpoint,
        Err(e) => {
            tracing::warn!(id, error = %e, "abandoning connection: host dial failed");
            // Courtesy close signal towards the remote peer.
            if let Err(e) = channel.remove_read(id).await {
                tracing::debug!(id, error = %e, "courtesy close failed");
            }
            return;
        }
    };

    // The relay observes the token itself and tears both directions down.
    let outcome = relay(guest, Box::new(host), shutdown).await;

    // The relay's read-close already deletes the file; this covers sessions
    // torn down from the host side.
    if let Err(e) = channel.remove_read(id).await {
        tracing::debug!(id, error = %e, "teardown close signal failed");
    }

    match outcome.error {
        None => tracing::info!(
            id,
            guest_to_host = outcome.a_to_b,
            host_to_guest = outcome.b_to_a,
            "9p session closed"
        ),
        Some(e) => tracing::warn!(
            id,
            guest_to_host = outcome.a_to_b,
            host_to_guest = outcome.b_to_a,
            error = %e,
            "9p session closed after error"
        ),
    }
}
