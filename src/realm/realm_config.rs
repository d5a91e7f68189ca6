use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail};

use crate::auth::auth_verifier::AuthConfig;
use crate::delivery::delivery_config::{DeadPeerPolicy, DeliveryConfig};
use crate::realm::access::AccessControl;

pub const SERVER_PORT: u16 = 2103;
pub const MAX_PACKET_LEN: usize = 1024;
/// safety margin when computing how much body fits into a fragment
pub const FRAGMENT_FUDGE: usize = 13;

/// The principal a realm's servers authenticate as when talking to other realms
pub fn server_principal(realm: &str) -> String {
    format!("zephyr.zephyr@{}", realm)
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RealmConfig {
    pub name: String,
    pub servers: Vec<SocketAddr>,
}

/// a subscription a local client declares through configuration rather than by notice
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LocalSubscription {
    pub class: String,
    pub instance: String,
    pub recipient: String,
    pub client: SocketAddr,
}

#[derive(Debug)]
pub struct ServerConfig {
    /// the local realm's name
    pub realm: String,
    pub server_addr: SocketAddr,
    /// foreign realms, in the order of the realm list
    pub realms: Vec<RealmConfig>,
    pub subscriptions: Vec<LocalSubscription>,
    pub max_packet_len: usize,
    pub fragment_fudge: usize,
    pub require_authenticated_subscriptions: bool,
    /// restricted classes; all other classes are open to everybody
    pub access: AccessControl,
    pub delivery: Arc<DeliveryConfig>,
    pub auth: Arc<AuthConfig>,
}

impl ServerConfig {
    pub fn new(realm: &str, server_addr: SocketAddr) -> ServerConfig {
        ServerConfig {
            realm: realm.to_string(),
            server_addr,
            realms: Vec::new(),
            subscriptions: Vec::new(),
            max_packet_len: MAX_PACKET_LEN,
            fragment_fudge: FRAGMENT_FUDGE,
            require_authenticated_subscriptions: true,
            access: AccessControl::new(),
            delivery: Arc::new(DeliveryConfig::new(DeadPeerPolicy::Retire)),
            auth: Arc::new(AuthConfig::new()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.realm.is_empty() {
            bail!("local realm name must not be empty");
        }
        for r in &self.realms {
            if r.name.eq_ignore_ascii_case(&self.realm) {
                bail!("the local realm {} must not be in the list of foreign realms", self.realm);
            }
            if r.servers.is_empty() {
                bail!("realm {} has no servers", r.name);
            }
        }
        if self.max_packet_len <= self.fragment_fudge {
            bail!("max packet length {} leaves no room for data", self.max_packet_len);
        }
        self.delivery.validate()?;
        self.auth.validate()?;
        Ok(())
    }
}

/// Parses a realm list: one `REALM server` pair per line, where server is an ip address with an
///  optional port. Servers of the same realm are grouped in order of appearance. Empty lines and
///  lines starting with `#` are ignored.
pub fn parse_realm_list(text: &str) -> anyhow::Result<Vec<RealmConfig>> {
    let mut result: Vec<RealmConfig> = Vec::new();

    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(name), Some(server), None) = (parts.next(), parts.next(), parts.next()) else {
            bail!("line {}: expected 'REALM server', was '{}'", line_no + 1, line);
        };
        let addr = parse_server_addr(server)
            .map_err(|e| anyhow!("line {}: {}", line_no + 1, e))?;

        match result.iter_mut().find(|r| r.name == name) {
            Some(realm) => realm.servers.push(addr),
            None => result.push(RealmConfig {
                name: name.to_string(),
                servers: vec![addr],
            }),
        }
    }
    Ok(result)
}

pub fn parse_server_addr(s: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = SocketAddr::from_str(s) {
        return Ok(addr);
    }
    IpAddr::from_str(s)
        .map(|ip| SocketAddr::new(ip, SERVER_PORT))
        .map_err(|_| anyhow!("invalid server address '{}'", s))
}
