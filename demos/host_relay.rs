use std::sync::Arc;

use anyhow::anyhow;
use clap::Parser;
use clap_derive::Parser;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{info, Level};

use zephyr_bus::host_relay::host_relay::HostRelay;
use zephyr_bus::host_relay::relay_config::{RelayConfig, RELAY_PORT};
use zephyr_bus::host_relay::relay_loop::run_relay;
use zephyr_bus::realm::realm_config::{parse_realm_list, parse_server_addr};

/// The per-host relay: local clients send their notices here, and the relay delivers them
///  reliably to one of the realm's servers.
#[derive(Parser)]
struct Args {
    /// upstream servers, the port defaults to 2103
    server: Vec<String>,

    /// take the upstream servers from a realm list instead, using the servers listed for this realm
    #[clap(long)]
    realm: Option<String>,

    #[clap(long)]
    realm_list: Option<String>,

    #[clap(long, default_value_t = RELAY_PORT)]
    port: u16,

    /// ignore flush requests from local clients
    #[clap(long, default_value_t = false)]
    no_flush: bool,

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

    let mut servers = Vec::new();
    for s in &args.server {
        servers.push(parse_server_addr(s)?);
    }
    if let (Some(realm), Some(path)) = (&args.realm, &args.realm_list) {
        let realms = parse_realm_list(&std::fs::read_to_string(path)?)?;
        let listed = realms.into_iter()
            .find(|r| r.name.eq_ignore_ascii_case(realm))
            .ok_or_else(|| anyhow!("realm {} is not in {}", realm, path))?;
        servers.extend(listed.servers);
    }
    if servers.is_empty() {
        return Err(anyhow!("no upstream servers"));
    }

    let mut config = RelayConfig::new(([0, 0, 0, 0], args.port).into(), servers);
    config.no_flush = args.no_flush;

    let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
    let relay = HostRelay::new(Arc::new(config), socket.clone(), Instant::now())?;

    run_relay(socket, relay, async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    }).await?;

    info!("host relay terminated");
    Ok(())
}
