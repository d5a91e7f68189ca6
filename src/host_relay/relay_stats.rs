use std::net::SocketAddr;
use std::time::Duration;

use anyhow::anyhow;

use crate::notice::notice::Notice;

pub const RELAY_VERSION: &str = concat!("zephyr-bus ", env!("CARGO_PKG_VERSION"));

/// Operational counters of a host relay, as returned for a stats query
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RelayStats {
    pub current_server: Option<SocketAddr>,
    pub queue_len: usize,
    pub client_packets: u64,
    pub server_packets: u64,
    pub server_changes: u64,
    pub version: String,
    pub uptime: Duration,
}

impl RelayStats {
    /// The body fields of the stats reply: server, queue length, client packets, server packets,
    ///  server changes, version, whether there is no server, uptime in seconds
    pub fn to_fields(&self) -> Vec<String> {
        vec![
            self.current_server.map(|a| a.to_string()).unwrap_or_default(),
            self.queue_len.to_string(),
            self.client_packets.to_string(),
            self.server_packets.to_string(),
            self.server_changes.to_string(),
            self.version.clone(),
            if self.current_server.is_none() { "yes" } else { "no" }.to_string(),
            self.uptime.as_secs().to_string(),
        ]
    }

    pub fn try_from_notice(notice: &Notice) -> anyhow::Result<RelayStats> {
        let field = |idx: usize| notice.field_str(idx)
            .ok_or_else(|| anyhow!("stats reply without field #{}", idx));

        let server = field(0)?;
        Ok(RelayStats {
            current_server: if server.is_empty() { None } else { Some(server.parse()?) },
            queue_len: field(1)?.parse()?,
            client_packets: field(2)?.parse()?,
            server_packets: field(3)?.parse()?,
            server_changes: field(4)?.parse()?,
            version: field(5)?,
            uptime: Duration::from_secs(field(7)?.parse()?),
        })
    }
}
