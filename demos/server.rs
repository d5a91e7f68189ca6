use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use clap_derive::Parser;
use tokio::net::UdpSocket;
use tracing::{info, warn, Level};

use zephyr_bus::auth::ticket::SealedTickets;
use zephyr_bus::realm::access::AccessControl;
use zephyr_bus::realm::credentials::LocalTicketIssuer;
use zephyr_bus::realm::realm_config::{parse_realm_list, parse_server_addr, server_principal, ServerConfig};
use zephyr_bus::realm::realm_dispatcher::RealmDispatcher;
use zephyr_bus::realm::server_loop::run_server;

/// A realm server: delivers notices to local subscribers and hands notices for other realms'
///  recipients to those realms' servers.
#[derive(Parser)]
struct Args {
    /// the local realm, e.g. LOCAL.ORG
    realm: String,
    /// address to listen on, the port defaults to 2103
    server_address: String,

    /// file with `REALM server` lines naming the foreign realms' servers
    #[clap(long)]
    realm_list: Option<String>,

    /// file containing the 32 byte service key tickets for this realm are sealed with
    #[clap(long)]
    service_key: String,

    /// `REALM=file`: the service key of a foreign realm, for issuing tickets to talk to it
    #[clap(long)]
    realm_key: Vec<String>,

    #[clap(long, default_value_t = false)]
    allow_unauthenticated_subscriptions: bool,

    /// directory with the class registry and the restricted classes' principal lists
    #[clap(long)]
    acl_dir: Option<String>,

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

    let mut config = ServerConfig::new(&args.realm, parse_server_addr(&args.server_address)?);
    if let Some(path) = &args.realm_list {
        config.realms = parse_realm_list(&std::fs::read_to_string(path)?)?;
        // a shared realm list names the local realm, too
        config.realms.retain(|r| !r.name.eq_ignore_ascii_case(&args.realm));
    }
    config.require_authenticated_subscriptions = !args.allow_unauthenticated_subscriptions;
    if let Some(dir) = &args.acl_dir {
        config.access = AccessControl::load_dir(std::path::Path::new(dir))?;
        info!(num_restricted=config.access.num_restricted(), "loaded access control lists");
    }

    let mut issuer = LocalTicketIssuer::new(&server_principal(&args.realm), Duration::from_secs(8 * 3600));
    for realm_key in &args.realm_key {
        let (realm, path) = realm_key.split_once('=')
            .ok_or_else(|| anyhow!("expected REALM=file, was {}", realm_key))?;
        issuer.add_realm(realm, &std::fs::read(path)?)?;
    }
    for realm in &config.realms {
        if !args.realm_key.iter().any(|k| k.to_ascii_uppercase().starts_with(&format!("{}=", realm.name.to_ascii_uppercase()))) {
            warn!(realm=%realm.name, "no service key for realm - authenticated handoffs to it will go out unauthenticated");
        }
    }

    let tickets = Arc::new(SealedTickets::new(&std::fs::read(&args.service_key)?)?);

    let config = Arc::new(config);
    let socket = Arc::new(UdpSocket::bind(config.server_addr).await?);
    let dispatcher = RealmDispatcher::new(config.clone(), socket.clone(), tickets)?;

    run_server(socket, dispatcher, Arc::new(issuer), async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    }).await?;

    info!("server terminated");
    Ok(())
}
