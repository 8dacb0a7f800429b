use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use kadroute::{Dht, DhtConfig, Keypair, MemoryDatastore, PeerId, PeerInfo, QuicHost};

#[derive(Clone, Debug)]
struct BootstrapPeer {
    addr: SocketAddr,
    peer: PeerId,
}

impl FromStr for BootstrapPeer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr_part, id_part) = s
            .rsplit_once('/')
            .context("bootstrap peer must include a PeerId (format: IP:PORT/PEERID)")?;
        let addr: SocketAddr = addr_part.parse().context("invalid socket address")?;
        let peer = PeerId::from_hex(id_part).context("PeerId must be 64 hex characters")?;
        Ok(BootstrapPeer { addr, peer })
    }
}

#[derive(Parser, Debug)]
#[command(name = "kadroute")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    #[arg(short = 'B', long = "bootstrap", value_name = "PEER")]
    bootstrap: Vec<BootstrapPeer>,

    #[arg(short = 'k', long, default_value_t = kadroute::DEFAULT_BUCKET_SIZE)]
    bucket_size: usize,

    #[arg(short, long, default_value_t = kadroute::DEFAULT_ALPHA)]
    alpha: usize,

    /// Seconds between routing table reports.
    #[arg(short, long, default_value = "60")]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let host = QuicHost::bind(Keypair::generate(), args.bind)?;
    let local_addr = host.local_addr()?;
    info!("Node: {}/{}", local_addr, host.info().id);

    let seeds: Vec<PeerInfo> = args
        .bootstrap
        .iter()
        .map(|b| PeerInfo::new(b.peer, vec![b.addr.to_string()]))
        .collect();
    let config = DhtConfig {
        bucket_size: args.bucket_size,
        alpha: args.alpha,
        ..DhtConfig::default()
    }
    .with_seed_peers(seeds);

    let dht = Dht::new(host.clone(), Arc::new(MemoryDatastore::new()), config).await?;
    let size = dht.routing_table_size().await;
    if !args.bootstrap.is_empty() && size == 0 {
        warn!("bootstrap left the routing table empty");
    }
    info!(routing_size = size, "DHT ready");

    let mut interval = time::interval(Duration::from_secs(args.stats_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let stats = dht.routing_stats().await;
                info!(
                    peers = stats.size,
                    depth = stats.depth,
                    buckets = ?stats.bucket_sizes,
                    "routing table"
                );
            }
        }
    }

    dht.close().await;
    host.close();
    Ok(())
}
