use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;

use crate::delivery::delivery_config::{DeadPeerPolicy, DeliveryConfig};

/// the peer name of the upstream server in the relay's delivery queue
pub const UPSTREAM: &str = "upstream";

pub const RELAY_PORT: u16 = 2104;

#[derive(Debug)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// candidate upstream servers
    pub servers: Vec<SocketAddr>,
    /// ignore flush requests from local clients
    pub no_flush: bool,
    /// how long to wait before probing again once all servers were found dead
    pub dead_retry_interval: Duration,
    /// how long a newly chosen server has to acknowledge the boot / attach announcement
    pub boot_timeout: Duration,
    pub delivery: Arc<DeliveryConfig>,
}

impl RelayConfig {
    pub fn new(bind_addr: SocketAddr, servers: Vec<SocketAddr>) -> RelayConfig {
        RelayConfig {
            bind_addr,
            servers,
            no_flush: false,
            dead_retry_interval: Duration::from_secs(120),
            boot_timeout: Duration::from_secs(60),
            delivery: Arc::new(DeliveryConfig::new(DeadPeerPolicy::Hold)),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.servers.is_empty() {
            bail!("at least one upstream server is required");
        }
        if self.servers.contains(&self.bind_addr) {
            bail!("the relay's own address {:?} must not be an upstream server", self.bind_addr);
        }
        if self.boot_timeout.is_zero() || self.dead_retry_interval.is_zero() {
            bail!("timeouts must be positive");
        }
        self.delivery.validate()
    }
}
