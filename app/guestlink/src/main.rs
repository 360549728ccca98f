use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use guestlink_relay::{DatagramForwarder, Dialer, RetryPolicy, UnixDialer};
use guestlink_transport::{GuestAddr, NinepChannel};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "guestlink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Fork into the background before serving.
    #[arg(long)]
    detach: bool,

    /// Append logs to a file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Relay guest connections from a listen address to a host unix socket.
    Stream {
        /// Listen address: vsock:<cid>:<port>, hvsock:<guid>, or 9p:<dir>.
        #[arg(long)]
        listen: String,

        /// Host-side unix socket each connection is relayed to.
        #[arg(long)]
        target: PathBuf,
    },
    /// Forward stdin lines as framed datagrams over one persistent channel.
    Logs {
        /// Destination: vsock:<cid>:<port> or unix:<path>.
        #[arg(long)]
        target: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Detach before the runtime exists; forking a live tokio runtime is not
    // supported.
    if args.detach {
        nix::unistd::daemon(false, false).context("failed to detach")?;
    }

    init_tracing(args.log_file.as_deref())?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?
        .block_on(run(args.command))
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "guestlink=info,guestlink_relay=info,guestlink_transport=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(Arc::new(file)),
                )
                .init();
        }
        None => {
            registry
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .init();
        }
    }
    Ok(())
}

async fn run(command: Command) -> Result<()> {
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    match command {
        Command::Stream { listen, target } => run_stream(&listen, target, shutdown).await,
        Command::Logs { target } => run_logs(&target, shutdown).await,
    }
}

async fn run_stream(listen: &str, target: PathBuf, shutdown: CancellationToken) -> Result<()> {
    let addr: GuestAddr = listen.parse()?;
    let policy = RetryPolicy::default();

    match addr {
        #[cfg(target_os = "linux")]
        GuestAddr::Vsock(addr) => {
            let listener = guestlink_transport::vsock::VsockListener::bind(addr)
                .with_context(|| format!("failed to listen on {addr}"))?;
            info!(listen = %addr, target = %target.display(), "stream relay listening");
            guestlink_relay::run_stream_acceptor(listener, target, policy, shutdown).await?;
        }
        #[cfg(target_os = "linux")]
        GuestAddr::Hvsock(service) => {
            // Hyper-V socket services surface inside a Linux guest as vsock
            // with the port taken from the service GUID.
            if !service.is_vsock_template() {
                warn!("service id does not use the vsock template suffix");
            }
            let addr = service.listen_addr();
            let listener = guestlink_transport::vsock::VsockListener::bind(addr)
                .with_context(|| format!("failed to listen on {addr}"))?;
            info!(listen = %addr, target = %target.display(), "stream relay listening");
            guestlink_relay::run_stream_acceptor(listener, target, policy, shutdown).await?;
        }
        #[cfg(not(target_os = "linux"))]
        GuestAddr::Vsock(_) | GuestAddr::Hvsock(_) => {
            bail!("vsock listeners are only supported on linux guests")
        }
        GuestAddr::Ninep(base) => {
            info!(channel = %base.display(), target = %target.display(), "9p relay starting");
            guestlink_relay::run_ninep_acceptor(NinepChannel::new(base), target, policy, shutdown)
                .await?;
        }
    }
    Ok(())
}

async fn run_logs(target: &str, shutdown: CancellationToken) -> Result<()> {
    let dialer = parse_log_target(target)?;
    let forwarder = DatagramForwarder::new(dialer, RetryPolicy::default());

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => {
                info!("log forwarder shutting down");
                return Ok(());
            }
            line = lines.next_line() => line.context("failed to read stdin")?,
        };
        let Some(line) = line else {
            info!("stdin closed; log forwarder exiting");
            return Ok(());
        };

        // A failed line stays pending inside the forwarder and is replayed
        // ahead of the next one; delivery is at-least-once, so keep going.
        if let Err(e) = forwarder.send(line.as_bytes()).await {
            warn!(error = %e, "log message delivery deferred");
        }
    }
}

fn parse_log_target(target: &str) -> Result<Box<dyn Dialer>> {
    if let Some(path) = target.strip_prefix("unix:") {
        return Ok(Box::new(UnixDialer::new(path)));
    }

    #[cfg(target_os = "linux")]
    if let Some(rest) = target.strip_prefix("vsock:") {
        let addr = guestlink_transport::VsockAddr::parse(rest)?;
        return Ok(Box::new(guestlink_relay::VsockDialer::new(addr)));
    }
    #[cfg(not(target_os = "linux"))]
    if target.starts_with("vsock:") {
        bail!("vsock log targets are only supported on linux guests");
    }

    bail!("unsupported log target {target:?}; expected unix:<path> or vsock:<cid>:<port>")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        () = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_target_accepts_unix_prefix() {
        assert!(parse_log_target("unix:/run/logs.sock").is_ok());
    }

    #[test]
    fn log_target_rejects_unknown_scheme() {
        assert!(parse_log_target("tcp:127.0.0.1:80").is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn log_target_accepts_vsock() {
        assert!(parse_log_target("vsock:host:5000").is_ok());
    }
}
