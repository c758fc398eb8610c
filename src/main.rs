use std::net::SocketAddr;
use std::sync::Arc;
use clap::Parser;
use clap_derive::{Parser, ValueEnum};
use tracing::Level;

use nstunnel::config::TunnelConfig;
use nstunnel::host::{Role, Tunnel};

#[derive(Clone, Copy, ValueEnum)]
enum Side {
    /// accept local connections and tunnel them to the server
    Client,
    /// connect a local stream to the target address for every tunneled connection
    Server,
}

#[derive(Parser)]
struct Args {
    side: Side,
    /// local address of the UDP socket
    udp_bind: SocketAddr,
    /// address of the other end of the tunnel
    udp_remote: SocketAddr,
    /// the client listens on this address, the server connects to it
    tcp_address: SocketAddr,

    /// pre-shared secret, must be identical on both sides
    #[clap(long)]
    secret: Option<String>,

    /// datagrams per second
    #[clap(long)]
    send_frequency: Option<u32>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let mut config = TunnelConfig::default();
    if let Some(secret) = args.secret {
        config.shared_secret = secret.into_bytes();
    }
    if let Some(send_frequency) = args.send_frequency {
        config.send_frequency = send_frequency;
        config.reset_after_ticks = send_frequency.saturating_mul(60);
    }

    let role = match args.side {
        Side::Client => Role::Client { listen: args.tcp_address },
        Side::Server => Role::Server { connect: args.tcp_address },
    };

    let tunnel = Tunnel::bind(Arc::new(config), role, args.udp_bind, args.udp_remote).await?;
    tunnel.run().await
}
