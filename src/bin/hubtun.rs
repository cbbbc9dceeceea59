//! hubtun daemon binary.
//!
//! One binary, two modes: the hub server, or a client session with an
//! optional domain route refresher.

use clap::Parser;
use hubtun::config::{parse_endpoint, parse_network, ClientConfig, ServerConfig};
use hubtun::domains::{keep_routes_to_domains, read_domains};
use hubtun::netmon::NetMonitor;
use hubtun::{run_client, run_server, TunDevice};
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Point-to-multipoint userspace VPN over a single UDP socket
#[derive(Parser, Debug)]
#[command(name = "hubtun", version, about)]
struct Args {
    /// Run as the hub server
    #[arg(long)]
    server: bool,

    /// Tunnel device number (tun<N>)
    #[arg(long, default_value_t = 5)]
    tun_number: u32,

    /// Local UDP port of the client socket
    #[arg(short = 'c', long, alias = "cp", default_value_t = 1200)]
    client_port: u16,

    /// Overlay address and network in CIDR form
    #[arg(short = 'n', long, default_value = "192.168.50.1/24")]
    network_cidr: String,

    /// Server endpoint as host:port
    #[arg(short = 'p', long, default_value = ":1300")]
    peer_endpoint: String,

    /// CSV file of domains to force through the tunnel
    #[arg(short = 'f', long)]
    force_route_domains: Option<PathBuf>,

    /// DNS server for pinned-domain lookups
    #[arg(long, default_value = "8.8.8.8")]
    dns_server: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    fmt().with_env_filter(filter).with_target(true).init();

    info!("hubtun starting");

    let network = match parse_network(&args.network_cidr) {
        Ok(network) => network,
        Err(e) => {
            error!("invalid network: {}", e);
            std::process::exit(1);
        }
    };

    let (peer_host, peer_port) = match parse_endpoint(&args.peer_endpoint) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!("invalid peer endpoint: {}", e);
            std::process::exit(1);
        }
    };

    let tun = match TunDevice::open(args.tun_number) {
        Ok(tun) => tun,
        Err(e) => {
            error!("failed to open TUN device: {}", e);
            std::process::exit(1);
        }
    };

    let monitor = match NetMonitor::spawn() {
        Ok(monitor) => monitor,
        Err(e) => {
            error!("failed to start network monitor: {}", e);
            std::process::exit(1);
        }
    };

    if args.server {
        let config = ServerConfig {
            network,
            server_port: peer_port,
        };

        let handle = match run_server(tun, config, &monitor).await {
            Ok(handle) => handle,
            Err(e) => {
                error!("failed to start server: {}", e);
                std::process::exit(1);
            }
        };

        info!(port = peer_port, "hub running, press Ctrl+C to exit");
        let _ = tokio::signal::ctrl_c().await;

        info!("shutdown");
        handle.stop();
        monitor.stop();
        return;
    }

    let Some(server_addr) = peer_host else {
        error!("client mode needs a server address in --peer-endpoint");
        std::process::exit(1);
    };

    let config = ClientConfig {
        network,
        client_port: args.client_port,
        server_addr,
        server_port: peer_port,
    };

    let tun = Arc::new(tun);
    let handle = match run_client(tun.clone(), config, &monitor).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("failed to start client: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(path) = &args.force_route_domains {
        // Lookups follow the system resolver configuration.
        debug!(dns_server = %args.dns_server, "domain routing enabled");

        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) => {
                error!("failed to open {}: {}", path.display(), e);
                std::process::exit(1);
            }
        };

        let domains = match read_domains(BufReader::new(file)) {
            Ok(domains) => domains,
            Err(e) => {
                error!("failed to read domains: {}", e);
                std::process::exit(1);
            }
        };

        if let Err(e) = keep_routes_to_domains(tun.clone(), monitor.subscribe(), domains) {
            error!("failed to start domain routing: {}", e);
            std::process::exit(1);
        }
    }

    info!("client running, press Ctrl+C to exit");
    let _ = tokio::signal::ctrl_c().await;

    info!("shutdown");
    handle.stop();
    monitor.stop();
}
