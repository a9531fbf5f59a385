use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{Signal, kill};
use sandbridge::{
    AttachOptions, Boundary, Channel, ChildTask, ForkBoundary, Pid, TcpConnector, TunnelClient,
    TunnelServer,
};
use std::{
    net::{SocketAddr, TcpListener},
    os::fd::RawFd,
    time::Duration,
};
use tracing::{debug, error, info, warn};

/// CLI arguments for the tunnel
#[derive(Parser, Debug)]
#[command(name = "sbt")]
#[command(
    about = "Forward a TCP port inside a forked child to an upstream reachable from the host",
    long_about = None
)]
#[command(version)]
struct Args {
    /// Address the child listens on
    #[arg(short, long, env = "SBT_LISTEN", default_value = "127.0.0.1:5559")]
    listen: SocketAddr,

    /// Upstream the host connects to for every forwarded connection
    #[arg(short, long, env = "SBT_UPSTREAM")]
    upstream: SocketAddr,

    /// Upstream connect timeout in seconds
    #[arg(long, default_value = "10")]
    connect_timeout: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Configuration for the tunnel
#[derive(Debug, Clone)]
pub struct Config {
    /// Listening address inside the child
    pub listen: SocketAddr,

    /// Where forwarded connections end up
    pub upstream: SocketAddr,

    /// Timeout for each upstream connect
    pub connect_timeout: Duration,
}

impl Config {
    fn from_args(args: Args) -> Self {
        Self {
            listen: args.listen,
            upstream: args.upstream,
            connect_timeout: Duration::from_secs(args.connect_timeout),
        }
    }

    fn connector(&self) -> TcpConnector {
        TcpConnector::new(self.upstream).with_timeout(self.connect_timeout)
    }
}

/// Runs the client side of the tunnel inside the child.
///
/// `host_fds` are the host view's descriptors the child inherits across the
/// fork; they are closed first so the child sees the host go away.
fn client_task(channel: Channel, listener: TcpListener, host_fds: Vec<RawFd>) -> ChildTask {
    Box::new(move || {
        for fd in host_fds {
            if let Err(e) = nix::unistd::close(fd) {
                debug!(fd, "Failed to close inherited descriptor: {}", e);
            }
        }
        let mut client = match TunnelClient::new(channel, listener) {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to set up tunnel client: {}", e);
                return;
            }
        };
        if let Err(e) = client.start() {
            error!("Tunnel client exited: {}", e);
        }
    })
}

/// Relay on the host until the child goes away or Ctrl-C
async fn run_host(config: Config, channel: Channel, child: Pid) -> Result<()> {
    let mut server = TunnelServer::new(channel, config.connector())?;
    let stop = server.stop_handle();
    let mut relay = tokio::task::spawn_blocking(move || server.start());

    let result = tokio::select! {
        joined = &mut relay => joined.context("Tunnel server task failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C, shutting down gracefully...");
            stop.stop()?;
            relay.await.context("Tunnel server task failed")?
        }
    };

    // The child may already be on its way out after a stop
    if let Err(e) = kill(child, Signal::SIGTERM) {
        debug!(pid = child.as_raw(), "Could not signal child: {}", e);
    }
    let status = tokio::task::spawn_blocking(move || ForkBoundary.wait(child))
        .await
        .context("Reaping child failed")??;
    if !status.success() {
        warn!(?status, "Child did not exit cleanly");
    }

    result.map_err(Into::into)
}

fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("Sandbridge Tunnel v{}", env!("CARGO_PKG_VERSION"));
    info!("Child listens on: {}", args.listen);
    info!("Upstream: {}", args.upstream);

    // Build configuration
    let config = Config::from_args(args);

    // Bind before forking so address errors surface here
    let listener = TcpListener::bind(config.listen)
        .with_context(|| format!("Failed to listen on {}", config.listen))?;
    let (host, peer) = Channel::open()?;

    // Fork before any runtime threads exist
    let attached = ForkBoundary.attach(
        client_task(peer, listener, host.raw_fds()),
        &AttachOptions::detached(),
    )?;
    let child = attached
        .pid()
        .context("Child finished before the tunnel started")?;
    info!(pid = child.as_raw(), "Tunnel client started in child");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_host(config, host, child))
}
