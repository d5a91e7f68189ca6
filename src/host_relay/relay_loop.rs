use std::future::Future;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::select;
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

use crate::host_relay::host_relay::HostRelay;
use crate::util::random::Random;

pub const MAX_RECV_LEN: usize = 64 * 1024;

/// The host relay's event loop, handling packets from local clients and from upstream servers
///  as well as the relay's timers. On `shutdown`, the relay detaches from its server and the
///  loop terminates.
pub async fn run_relay<R: Random>(
    socket: Arc<UdpSocket>,
    mut relay: HostRelay<R>,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; MAX_RECV_LEN];
    tokio::pin!(shutdown);

    info!(addr=?socket.local_addr()?, "starting host relay");
    // sends never wait, so the socket must be known to be writable before announcing
    socket.writable().await?;
    relay.start(Instant::now())?;

    loop {
        let deadline = relay.next_deadline();

        select! {
            r = socket.recv_from(&mut buf) => {
                match r {
                    Ok((len, from)) => relay.handle_packet(&buf[..len], from, Instant::now()),
                    Err(e) => warn!("error receiving from socket: {}", e),
                }
            }
            _ = sleep_until_deadline(deadline) => {
                relay.tick(Instant::now());
            }
            _ = &mut shutdown => {
                info!("shutting down host relay");
                relay.detach();
                break;
            }
        }
    }
    Ok(())
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration;
    use bytes::Bytes;
    use tokio::sync::oneshot;
    use tokio::time::timeout;
    use crate::host_relay::relay_config::RelayConfig;
    use crate::notice::control::{HM_BOOT, HM_DETACH};
    use crate::notice::notice::{Notice, NoticeKind};
    use crate::test_util::notice::test_notice;

    async fn recv_notice(socket: &UdpSocket) -> (SocketAddr, Notice) {
        let mut buf = vec![0u8; MAX_RECV_LEN];
        let (len, from) = timeout(Duration::from_secs(5), socket.recv_from(&mut buf)).await
            .expect("timed out waiting for a notice")
            .unwrap();
        (from, Notice::try_deser(&buf[..len]).unwrap())
    }

    #[tokio::test]
    async fn test_relay_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let relay_addr = socket.local_addr().unwrap();
        let config = RelayConfig::new(relay_addr, vec![server.local_addr().unwrap()]);
        let relay = HostRelay::new(Arc::new(config), socket.clone(), Instant::now()).unwrap();

        let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();
        let handle = tokio::spawn(run_relay(socket, relay, async move {
            let _ = shutdown_receiver.await;
        }));

        let (from, boot) = recv_notice(&server).await;
        assert_eq!(from, relay_addr);
        assert_eq!(boot.opcode, HM_BOOT);
        server.send_to(&boot.reply(NoticeKind::ServAck, Bytes::new()).to_bytes(), relay_addr).await.unwrap();

        let notice = test_notice(NoticeKind::Acked, "MESSAGE", "PERSONAL", "bob");
        client.send_to(&notice.to_bytes(), relay_addr).await.unwrap();

        let (_, hm_ack) = recv_notice(&client).await;
        assert_eq!(hm_ack.kind, NoticeKind::HmAck);
        assert_eq!(hm_ack.uid, notice.uid);

        let (_, forwarded) = recv_notice(&server).await;
        assert_eq!(forwarded, notice);
        let serv_ack = notice.reply(NoticeKind::ServAck, Bytes::new());
        server.send_to(&serv_ack.to_bytes(), relay_addr).await.unwrap();

        let (_, relayed) = recv_notice(&client).await;
        assert_eq!(relayed, serv_ack);

        shutdown_sender.send(()).unwrap();
        handle.await.unwrap().unwrap();

        let (_, detach) = recv_notice(&server).await;
        assert_eq!(detach.opcode, HM_DETACH);
    }
}
