//! Bidirectional stream relay.
//!
//! One task per copy direction; each direction finishes independently and
//! propagates half-close so the peer on the far side observes EOF while the
//! opposite direction keeps flowing. The aggregate outcome is reported only
//! after both directions have naturally terminated. Cancellation is observed
//! inside each copy task, so shutdown stops in-flight transfers and still
//! runs the close-propagation teardown.

use guestlink_transport::{DuplexEndpoint, EndpointReader, EndpointWriter};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Result of a completed relay session.
#[derive(Debug)]
pub struct RelayOutcome {
    /// Bytes copied from endpoint A to endpoint B.
    pub a_to_b: u64,
    /// Bytes copied from endpoint B to endpoint A.
    pub b_to_a: u64,
    /// First directional I/O error, if any. Errors end one direction without
    /// aborting the other.
    pub error: Option<io::Error>,
}

/// Copies bytes between two endpoints in both directions concurrently.
///
/// Each direction runs until EOF, an I/O error, or `shutdown` is cancelled,
/// then write-closes its destination and read-closes its source. Completion
/// waits for both directions; one side reaching EOF while the other still
/// transfers is normal. Cancellation stops both directions at the next copy
/// boundary and both peers observe EOF through the teardown.
pub async fn relay(
    a: Box<dyn DuplexEndpoint>,
    b: Box<dyn DuplexEndpoint>,
    shutdown: CancellationToken,
) -> RelayOutcome {
    let (a_read, a_write) = a.split();
    let (b_read, b_write) = b.split();

    let forward = tokio::spawn(copy_direction(a_read, b_write, "a->b", shutdown.clone()));
    let reverse = tokio::spawn(copy_direction(b_read, a_write, "b->a", shutdown));

    let (a_to_b, err_fwd) = join_direction(forward.await, "a->b");
    let (b_to_a, err_rev) = join_direction(reverse.await, "b->a");

    RelayOutcome {
        a_to_b,
        b_to_a,
        error: err_fwd.or(err_rev),
    }
}

fn join_direction(
    result: Result<(u64, Option<io::Error>), tokio::task::JoinError>,
    direction: &str,
) -> (u64, Option<io::Error>) {
    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(direction, error = %e, "relay copy task panicked");
            (0, Some(io::Error::new(io::ErrorKind::Other, e)))
        }
    }
}

/// Copies one direction until end-of-stream or cancellation, then propagates
/// half-close.
async fn copy_direction(
    mut src: Box<dyn EndpointReader>,
    mut dst: Box<dyn EndpointWriter>,
    direction: &'static str,
    shutdown: CancellationToken,
) -> (u64, Option<io::Error>) {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total: u64 = 0;
    let mut first_err = None;

    loop {
        let read = tokio::select! {
            () = shutdown.cancelled() => {
                tracing::debug!(direction, "copy stopped by shutdown");
                break;
            }
            read = src.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = dst.write_all(&buf[..n]).await {
                    if !is_benign_disconnect(&e) {
                        tracing::warn!(direction, error = %e, "relay write failed");
                    }
                    first_err = Some(e);
                    break;
                }
                total += n as u64;
            }
            Err(e) => {
                if !is_benign_disconnect(&e) {
                    tracing::warn!(direction, error = %e, "relay read failed");
                }
                first_err = Some(e);
                break;
            }
        }
    }

    if let Err(e) = dst.flush().await {
        tracing::debug!(direction, error = %e, "flush on close failed");
    }
    if let Err(e) = dst.close_write().await {
        tracing::debug!(direction, error = %e, "write-close propagation failed");
    }
    if let Err(e) = src.close_read().await {
        tracing::debug!(direction, error = %e, "read-close failed");
    }

    (total, first_err)
}

/// Disconnects that are part of normal teardown, not worth a warning.
fn is_benign_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestlink_transport::FdEndpoint;
    use tokio::net::UnixStream;

    fn pair() -> (FdEndpoint, FdEndpoint) {
        let (a, b) = UnixStream::pair().expect("socketpair");
        (
            FdEndpoint::from_unix_stream(a).unwrap(),
            FdEndpoint::from_unix_stream(b).unwrap(),
        )
    }

    /// "hello" in, "hello" + EOF out, count == 5.
    #[tokio::test]
    async fn delivers_bytes_in_order_with_count() {
        let (client, relay_a) = pair();
        let (relay_b, server) = pair();

        let session = tokio::spawn(relay(
            Box::new(relay_a) as Box<dyn DuplexEndpoint>,
            Box::new(relay_b) as Box<dyn DuplexEndpoint>,
            CancellationToken::new(),
        ));

        let (_cr, mut cw) = (Box::new(client) as Box<dyn DuplexEndpoint>).split();
        let (mut sr, mut sw) = (Box::new(server) as Box<dyn DuplexEndpoint>).split();

        cw.write_all(b"hello").await.unwrap();
        cw.close_write().await.unwrap();

        let mut buf = Vec::new();
        sr.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");

        // Other direction has no data; half-close it so the session completes.
        sw.close_write().await.unwrap();

        let outcome = session.await.unwrap();
        assert_eq!(outcome.a_to_b, 5);
        assert_eq!(outcome.b_to_a, 0);
    }

    /// EOF in one direction must not stall traffic in the other.
    #[tokio::test]
    async fn half_close_does_not_block_reverse_traffic() {
        let (client, relay_a) = pair();
        let (relay_b, server) = pair();

        let session = tokio::spawn(relay(
            Box::new(relay_a) as Box<dyn DuplexEndpoint>,
            Box::new(relay_b) as Box<dyn DuplexEndpoint>,
            CancellationToken::new(),
        ));

        let (mut cr, mut cw) = (Box::new(client) as Box<dyn DuplexEndpoint>).split();
        let (mut sr, mut sw) = (Box::new(server) as Box<dyn DuplexEndpoint>).split();

        // Client sends its request and immediately half-closes.
        cw.write_all(b"request").await.unwrap();
        cw.close_write().await.unwrap();

        let mut buf = vec![0u8; 7];
        sr.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, b"request");
        assert_eq!(sr.read(&mut [0u8; 1]).await.unwrap(), 0);

        // Server still answers on the open direction.
        sw.write_all(b"response").await.unwrap();
        sw.close_write().await.unwrap();

        let mut answer = Vec::new();
        cr.read_to_end(&mut answer).await.unwrap();
        assert_eq!(answer, b"response");

        let outcome = session.await.unwrap();
        assert_eq!(outcome.a_to_b, 7);
        assert_eq!(outcome.b_to_a, 8);
        assert!(outcome.error.is_none());
    }

    /// 1 MiB of pseudo-random data in 4 KiB chunks round-trips intact.
    #[tokio::test]
    async fn large_payload_round_trips() {
        let (client, relay_a) = pair();
        let (relay_b, server) = pair();

        let session = tokio::spawn(relay(
            Box::new(relay_a) as Box<dyn DuplexEndpoint>,
            Box::new(relay_b) as Box<dyn DuplexEndpoint>,
            CancellationToken::new(),
        ));

        let payload = pseudo_random_bytes(1024 * 1024);
        let expected = payload.clone();

        let (_cr, mut cw) = (Box::new(client) as Box<dyn DuplexEndpoint>).split();
        let writer = tokio::spawn(async move {
            for chunk in payload.chunks(4096) {
                cw.write_all(chunk).await.unwrap();
            }
            cw.close_write().await.unwrap();
        });

        let (mut sr, mut sw) = (Box::new(server) as Box<dyn DuplexEndpoint>).split();
        let mut received = Vec::with_capacity(expected.len());
        sr.read_to_end(&mut received).await.unwrap();

        writer.await.unwrap();
        assert_eq!(received.len(), expected.len());
        assert_eq!(received, expected);

        sw.close_write().await.unwrap();
        let outcome = session.await.unwrap();
        assert_eq!(outcome.a_to_b, expected.len() as u64);
    }

    /// After cancellation nothing written on one side may reach the other;
    /// both peers see EOF instead.
    #[tokio::test]
    async fn cancellation_stops_in_flight_copies() {
        let (client, relay_a) = pair();
        let (relay_b, server) = pair();

        let shutdown = CancellationToken::new();
        let session = tokio::spawn(relay(
            Box::new(relay_a) as Box<dyn DuplexEndpoint>,
            Box::new(relay_b) as Box<dyn DuplexEndpoint>,
            shutdown.clone(),
        ));

        let (_cr, mut cw) = (Box::new(client) as Box<dyn DuplexEndpoint>).split();
        let (mut sr, _sw) = (Box::new(server) as Box<dyn DuplexEndpoint>).split();

        // Prove the path is live first.
        cw.write_all(b"before").await.unwrap();
        let mut buf = [0u8; 6];
        sr.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"before");

        shutdown.cancel();
        let outcome = session.await.unwrap();
        assert_eq!(outcome.a_to_b, 6);

        // Teardown has completed; bytes written now must never be relayed.
        let _ = cw.write_all(b"after!").await;
        let mut rest = Vec::new();
        sr.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty(), "relayed {rest:?} after cancellation");
    }

    fn pseudo_random_bytes(len: usize) -> Vec<u8> {
        // Deterministic LCG; good enough to catch reordering or truncation.
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            out.extend_from_slice(&state.to_le_bytes());
        }
        out.truncate(len);
        out
    }
}
