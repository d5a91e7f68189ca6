use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::{trace, warn};

use crate::notice::notice::Notice;

/// Non-blocking datagram send. The event loops never wait for a send: a socket that is not
///  writable is a send error, and senders treat that like any other transport error.
#[cfg_attr(test, mockall::automock)]
pub trait PacketSender: Send + Sync {
    fn send_packet(&self, to: SocketAddr, packet: &[u8]) -> anyhow::Result<()>;
}

impl PacketSender for UdpSocket {
    fn send_packet(&self, to: SocketAddr, packet: &[u8]) -> anyhow::Result<()> {
        trace!(?to, len=packet.len(), "sending packet");
        let sent = self.try_send_to(packet, to)?;
        if sent != packet.len() {
            anyhow::bail!("sent only {} of {} bytes to {:?}", sent, packet.len(), to);
        }
        Ok(())
    }
}

/// Fire-and-forget send of a notice that is not tracked for retransmission (acks, replies):
///  errors are logged and otherwise ignored.
pub fn send_unreliable(sender: &dyn PacketSender, to: SocketAddr, notice: &Notice) {
    if let Err(e) = sender.send_packet(to, &notice.to_bytes()) {
        warn!(?to, uid=?notice.uid, "error sending notice: {}", e);
    }
}
