use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::delivery::delivery_queue::{AckMatch, DeliveryEvent, DeliveryOutcome, DeliveryQueue};
use crate::host_relay::relay_config::{RelayConfig, UPSTREAM};
use crate::host_relay::relay_stats::{RelayStats, RELAY_VERSION};
use crate::notice::control::*;
use crate::notice::notice::{body_from_fields, Notice, NoticeKind};
use crate::notice::uid::UidMinter;
use crate::peer::peer_failover::{Liveness, PeerTransition};
use crate::transport::{send_unreliable, PacketSender};
use crate::util::random::{Random, RngRandom};

/// Presents a single reliable endpoint to the clients on a host: notices from clients are acked
///  right away and then delivered upstream through the delivery queue, which keeps them across
///  server failover and while no server is reachable.
pub struct HostRelay<R: Random = RngRandom> {
    config: Arc<RelayConfig>,
    sender: Arc<dyn PacketSender>,
    queue: DeliveryQueue<R>,
    uids: UidMinter,
    started: Instant,
    client_packets: u64,
    server_packets: u64,
    server_changes: u64,
    /// when to give up on a server that did not acknowledge our announcement, or to try it again
    ///  after all servers were dead
    recovery_deadline: Option<Instant>,
}

impl HostRelay<RngRandom> {
    pub fn new(config: Arc<RelayConfig>, sender: Arc<dyn PacketSender>, now: Instant) -> anyhow::Result<HostRelay<RngRandom>> {
        HostRelay::new_with_random(config, sender, now)
    }
}

impl<R: Random> HostRelay<R> {
    pub fn new_with_random(config: Arc<RelayConfig>, sender: Arc<dyn PacketSender>, now: Instant) -> anyhow::Result<HostRelay<R>> {
        config.validate()?;
        let mut queue = DeliveryQueue::new_with_random(config.delivery.clone(), sender.clone());
        queue.add_peer(UPSTREAM, config.servers.clone())?;

        Ok(HostRelay {
            uids: UidMinter::new(config.bind_addr.ip()),
            config,
            sender,
            queue,
            started: now,
            client_packets: 0,
            server_packets: 0,
            server_changes: 0,
            recovery_deadline: None,
        })
    }

    /// chooses an upstream server and announces this relay to it
    pub fn start(&mut self, now: Instant) -> anyhow::Result<()> {
        let server = self.queue.ensure_destination(UPSTREAM, now)?;
        info!(?server, "host relay starting");
        self.process_transitions(now);
        Ok(())
    }

    pub fn queue(&self) -> &DeliveryQueue<R> {
        &self.queue
    }

    pub fn current_server(&self) -> Option<SocketAddr> {
        self.queue.peers().get(UPSTREAM)
            .and_then(|p| p.current_addr())
    }

    pub fn liveness(&self) -> Liveness {
        self.queue.peers().get(UPSTREAM)
            .map(|p| p.liveness())
            .unwrap_or(Liveness::NeedServer)
    }

    pub fn is_upstream(&self, addr: &SocketAddr) -> bool {
        self.queue.peers().get(UPSTREAM)
            .map(|p| p.is_candidate(addr))
            .unwrap_or(false)
    }

    pub fn stats(&self, now: Instant) -> RelayStats {
        RelayStats {
            current_server: self.current_server(),
            queue_len: self.queue.len(),
            client_packets: self.client_packets,
            server_packets: self.server_packets,
            server_changes: self.server_changes,
            version: RELAY_VERSION.to_string(),
            uptime: now.saturating_duration_since(self.started),
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.queue.next_deadline(), self.recovery_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Decodes a received datagram and dispatches it by where it came from. Malformed packets are
    ///  logged and dropped.
    pub fn handle_packet(&mut self, packet: &[u8], from: SocketAddr, now: Instant) {
        let notice = match Notice::try_deser(packet) {
            Ok(notice) => notice,
            Err(e) => {
                warn!(?from, "dropping malformed packet: {}", e);
                return;
            }
        };
        if self.is_upstream(&from) {
            self.on_upstream(notice, from, now);
        }
        else {
            self.accept(notice, from, now);
        }
    }

    fn reply(&self, notice: &Notice, to: SocketAddr, kind: NoticeKind, body: Bytes) {
        send_unreliable(self.sender.as_ref(), to, &notice.reply(kind, body));
    }

    //------------------------------ local clients

    /// A notice from a local client
    pub fn accept(&mut self, notice: Notice, from: SocketAddr, now: Instant) {
        trace!(?from, uid=?notice.uid, kind=?notice.kind, "notice from client");
        self.client_packets += 1;

        match notice.kind {
            NoticeKind::HmCtl => self.on_client_control(&notice, from, now),
            NoticeKind::Stat if opcode_is(&notice, GIMMESTATS) => {
                let fields = self.stats(now).to_fields();
                let body = body_from_fields(&fields.iter().map(|f| f.as_str()).collect::<Vec<_>>());
                self.reply(&notice, from, NoticeKind::HmAck, body);
            }
            NoticeKind::Stat => {
                warn!(?from, opcode=%notice.opcode, "unknown stats query - ignoring");
            }
            NoticeKind::Acked | NoticeKind::Unacked => {
                self.reply(&notice, from, NoticeKind::HmAck, Bytes::new());
                if self.queue.contains(&notice.uid) {
                    debug!(uid=?notice.uid, "retransmission of a notice that is still pending - not queueing it again");
                    return;
                }
                if let Err(e) = self.queue.send(UPSTREAM, &notice, Some(from), now) {
                    error!(uid=?notice.uid, "error queueing notice: {}", e);
                    self.reply(&notice, from, NoticeKind::ServNak, body_from_fields(&[ACK_LOST]));
                }
            }
            NoticeKind::Unsafe | NoticeKind::ClientAck | NoticeKind::HmAck | NoticeKind::ServAck | NoticeKind::ServNak => {
                // no feedback wanted: forwarded once, not tracked
                match self.queue.ensure_destination(UPSTREAM, now) {
                    Ok(server) => send_unreliable(self.sender.as_ref(), server, &notice),
                    Err(e) => warn!(uid=?notice.uid, "no upstream server: {}", e),
                }
            }
        }
        self.process_transitions(now);
    }

    fn on_client_control(&mut self, notice: &Notice, from: SocketAddr, now: Instant) {
        if opcode_is(notice, HM_FLUSH) {
            if self.config.no_flush {
                info!(?from, "ignoring flush request");
            }
            else {
                info!(?from, "flush requested by client");
                self.flush(now);
            }
        }
        else if opcode_is(notice, HM_NEWSERV) {
            info!(?from, "client requested a new server");
            if let Err(e) = self.queue.force_switch(UPSTREAM, now) {
                error!("error switching server: {}", e);
            }
        }
        else {
            warn!(?from, opcode=%notice.opcode, "unknown host manager control opcode");
            return;
        }
        self.reply(notice, from, NoticeKind::HmAck, Bytes::new());
    }

    /// Drops everything that is queued and starts over with a freshly chosen server
    pub fn flush(&mut self, now: Instant) {
        let num_dropped = self.queue.clear();
        info!(num_dropped, "flushing");
        self.recovery_deadline = None;
        if let Err(e) = self.queue.reset_peer(UPSTREAM, now) {
            error!("error resetting upstream: {}", e);
        }
        if let Err(e) = self.queue.ensure_destination(UPSTREAM, now) {
            error!("error choosing upstream server: {}", e);
        }
        self.process_transitions(now);
    }

    //------------------------------ upstream server

    pub fn on_upstream(&mut self, notice: Notice, from: SocketAddr, now: Instant) {
        trace!(?from, uid=?notice.uid, kind=?notice.kind, "notice from server");
        self.server_packets += 1;
        self.queue.peer_contact(UPSTREAM, from, now);

        match notice.kind {
            NoticeKind::HmCtl => self.on_server_control(&notice, from, now),
            NoticeKind::ServAck | NoticeKind::ServNak => {
                if notice.class.eq_ignore_ascii_case(ZEPHYR_CTL_CLASS) && notice.instance.eq_ignore_ascii_case(CTL_HM) {
                    trace!(opcode=%notice.opcode, "server acknowledged announcement");
                }
                else {
                    let positive = notice.kind == NoticeKind::ServAck;
                    if let AckMatch::Complete(event) = self.queue.on_ack(&notice.uid, positive) {
                        self.relay_ack(event, &notice);
                    }
                }
            }
            _ => {
                debug!(?from, kind=?notice.kind, "unexpected notice from server - dropping");
            }
        }
        self.process_transitions(now);
    }

    fn on_server_control(&mut self, notice: &Notice, from: SocketAddr, now: Instant) {
        if opcode_is(notice, SERVER_SHUTDOWN) {
            let hint = notice.field_str(0)
                .and_then(|s| SocketAddr::from_str(&s).ok());
            info!(?from, ?hint, "server is shutting down");
            if let Err(e) = self.queue.shutdown_hint(UPSTREAM, hint, now) {
                error!("error switching server: {}", e);
            }
        }
        else if opcode_is(notice, SERVER_PING) {
            self.reply(notice, from, NoticeKind::HmAck, Bytes::new());
        }
        else {
            debug!(?from, opcode=%notice.opcode, "unknown server control opcode");
        }
    }

    /// passes the server's verdict on to the client if it asked for one
    fn relay_ack(&self, event: DeliveryEvent, ack: &Notice) {
        let Some(to) = event.relay_to else {
            return;
        };
        if event.original.kind == NoticeKind::Acked {
            send_unreliable(self.sender.as_ref(), to, ack);
        }
    }

    //------------------------------ timers and transitions

    pub fn tick(&mut self, now: Instant) {
        for event in self.queue.tick(now) {
            // only happens if notices are not held for a dead server
            if let (DeliveryOutcome::Failed, Some(to)) = (event.outcome, event.relay_to) {
                if event.original.kind == NoticeKind::Acked {
                    self.reply(&event.original, to, NoticeKind::ServNak, body_from_fields(&[ACK_LOST]));
                }
            }
        }

        if self.recovery_deadline.map(|d| d <= now).unwrap_or(false) {
            self.recovery_deadline = None;
            match self.liveness() {
                Liveness::Booting | Liveness::Attaching => {
                    warn!(server=?self.current_server(), "server did not answer - switching");
                    self.force_switch(now);
                }
                Liveness::Dead => {
                    info!("probing servers again");
                    self.force_switch(now);
                }
                _ => {}
            }
        }
        self.process_transitions(now);
    }

    fn force_switch(&mut self, now: Instant) {
        if let Err(e) = self.queue.force_switch(UPSTREAM, now) {
            error!("error switching server: {}", e);
        }
    }

    fn process_transitions(&mut self, now: Instant) {
        for t in self.queue.take_transitions() {
            // the initial choice of a server is not a change
            if t.is_switch() && t.old_addr.is_some() {
                self.server_changes += 1;
            }
            match t.to {
                Liveness::Booting | Liveness::Attaching => {
                    self.announce(&t);
                    self.recovery_deadline = Some(now + self.config.boot_timeout);
                }
                Liveness::Attached => {
                    info!(server=?t.new_addr, "attached to server");
                    self.recovery_deadline = None;
                }
                Liveness::Dead => {
                    warn!(retry_in=?self.config.dead_retry_interval, "no server is reachable - holding notices");
                    self.recovery_deadline = Some(now + self.config.dead_retry_interval);
                }
                Liveness::Tardy | Liveness::NeedServer => {}
            }
        }
    }

    /// leaves the previous server and announces this relay to the new one
    fn announce(&mut self, t: &PeerTransition) {
        let Some(new_addr) = t.new_addr else {
            return;
        };
        if let Some(old_addr) = t.old_addr.filter(|&a| a != new_addr) {
            let detach = self.announcement(HM_DETACH);
            send_unreliable(self.sender.as_ref(), old_addr, &detach);
        }
        let opcode = if t.to == Liveness::Booting { HM_BOOT } else { HM_ATTACH };
        debug!(server=?new_addr, opcode, "announcing host relay");
        let announcement = self.announcement(opcode);
        send_unreliable(self.sender.as_ref(), new_addr, &announcement);
    }

    /// tells the current server that this relay goes away
    pub fn detach(&mut self) {
        let Some(server) = self.current_server() else {
            return;
        };
        info!(?server, "detaching from server");
        let detach = self.announcement(HM_DETACH);
        send_unreliable(self.sender.as_ref(), server, &detach);
    }

    fn announcement(&mut self, opcode: &str) -> Notice {
        let mut notice = Notice::new(NoticeKind::HmCtl, self.uids.next_uid(), ZEPHYR_CTL_CLASS, CTL_HM, opcode);
        notice.port = self.config.bind_addr.port();
        notice
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;
    use crate::test_util::notice::{test_addr, test_notice, test_uid};
    use crate::test_util::sender::RecordingSender;
    use crate::util::random::{MockRandom, MOCK_RANDOM_MUTEX};
    use rstest::rstest;

    fn server(n: u8) -> SocketAddr {
        test_addr(n, 2103)
    }
    fn client() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }
    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn relay_with(config: RelayConfig, now: Instant) -> (HostRelay, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::new());
        let mut relay = HostRelay::new(Arc::new(config), sender.clone(), now).unwrap();
        relay.start(now).unwrap();
        (relay, sender)
    }

    /// a started relay with a single upstream server, attached
    fn attached_relay(now: Instant) -> (HostRelay, Arc<RecordingSender>) {
        let (mut relay, sender) = relay_with(RelayConfig::new(SocketAddr::from(([127, 0, 0, 1], 2104)), vec![server(1)]), now);
        let boot = sender.take().remove(0).1;
        relay.on_upstream(boot.reply(NoticeKind::ServAck, Bytes::new()), server(1), now);
        assert_eq!(relay.liveness(), Liveness::Attached);
        (relay, sender)
    }

    fn notices_to(sender: &RecordingSender, to: SocketAddr) -> Vec<Notice> {
        sender.take().into_iter()
            .filter(|(addr, _)| *addr == to)
            .map(|(_, n)| n)
            .collect()
    }

    #[test]
    fn test_start_announces_boot() {
        let now = Instant::now();
        let (relay, sender) = relay_with(RelayConfig::new(SocketAddr::from(([127, 0, 0, 1], 2104)), vec![server(1)]), now);
        let sent = sender.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, server(1));
        assert_eq!(sent[0].1.kind, NoticeKind::HmCtl);
        assert_eq!(sent[0].1.opcode, HM_BOOT);
        assert_eq!(relay.liveness(), Liveness::Booting);
        assert_eq!(relay.next_deadline(), Some(now + secs(60)));
    }

    #[test]
    fn test_accept_and_relay_ack() {
        let now = Instant::now();
        let (mut relay, sender) = attached_relay(now);

        let notice = test_notice(NoticeKind::Acked, "MESSAGE", "PERSONAL", "bob");
        relay.accept(notice.clone(), client(), now);

        let sent = sender.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, client());
        assert_eq!(sent[0].1.kind, NoticeKind::HmAck);
        assert_eq!(sent[0].1.uid, notice.uid);
        assert_eq!(sent[1], (server(1), notice.clone()));
        assert_eq!(relay.queue().len(), 1);

        // a retransmission by the client is acked again but not queued twice
        relay.accept(notice.clone(), client(), now);
        assert_eq!(notices_to(&sender, client()).len(), 1);
        assert_eq!(relay.queue().len(), 1);

        let ack = notice.reply(NoticeKind::ServAck, body_from_fields(&[ACK_SENT]));
        relay.on_upstream(ack.clone(), server(1), now + Duration::from_millis(200));
        assert_eq!(sender.take(), vec![(client(), ack.clone())]);
        assert!(relay.queue().is_empty());

        relay.on_upstream(ack, server(1), now + Duration::from_millis(300));
        sender.assert_no_remaining_notices();
    }

    #[rstest]
    #[case::acked(NoticeKind::Acked, true, 1)]
    #[case::unacked(NoticeKind::Unacked, true, 0)]
    #[case::unsafe_(NoticeKind::Unsafe, false, 0)]
    fn test_ack_policy(#[case] kind: NoticeKind, #[case] expect_hmack: bool, #[case] expect_server_acks: usize) {
        let now = Instant::now();
        let (mut relay, sender) = attached_relay(now);

        let notice = test_notice(kind, "MESSAGE", "PERSONAL", "bob");
        relay.accept(notice.clone(), client(), now);
        let hmacks = notices_to(&sender, client());
        assert_eq!(hmacks.len(), if expect_hmack { 1 } else { 0 });

        relay.on_upstream(notice.reply(NoticeKind::ServAck, Bytes::new()), server(1), now);
        assert_eq!(notices_to(&sender, client()).len(), expect_server_acks);
        assert!(relay.queue().is_empty());
    }

    #[test]
    fn test_unsafe_is_not_tracked() {
        let now = Instant::now();
        let (mut relay, sender) = attached_relay(now);
        let notice = test_notice(NoticeKind::Unsafe, "MESSAGE", "PERSONAL", "bob");
        relay.accept(notice.clone(), client(), now);

        assert_eq!(sender.take(), vec![(server(1), notice)]);
        assert!(relay.queue().is_empty());
        assert_eq!(relay.next_deadline(), None);
    }

    #[test]
    fn test_dead_server_holds_notices() {
        let start = Instant::now();
        let (mut relay, sender) = attached_relay(start);
        let notice = test_notice(NoticeKind::Acked, "MESSAGE", "PERSONAL", "bob");
        relay.accept(notice.clone(), client(), start);
        sender.take();

        for t in [2, 4, 8, 12, 20] {
            relay.tick(start + secs(t));
        }
        assert_eq!(relay.liveness(), Liveness::Dead);
        assert_eq!(relay.queue().len(), 1, "held, not dropped");
        assert_eq!(notices_to(&sender, server(1)).len(), 4);
        assert_eq!(relay.next_deadline(), Some(start + secs(20) + secs(120)));

        // any packet from the server revives it and resends what was held
        let ping = Notice { opcode: SERVER_PING.to_string(), ..test_notice(NoticeKind::HmCtl, HM_CTL_CLASS, "", "") };
        relay.on_upstream(ping.clone(), server(1), start + secs(30));
        assert_eq!(relay.liveness(), Liveness::Attached);
        let sent = sender.take();
        assert!(sent.contains(&(server(1), notice.clone())));
        assert!(sent.iter().any(|(to, n)| *to == server(1) && n.kind == NoticeKind::HmAck && n.uid == ping.uid));

        relay.on_upstream(notice.reply(NoticeKind::ServAck, Bytes::new()), server(1), start + secs(31));
        assert_eq!(notices_to(&sender, client()).len(), 1);
    }

    #[test]
    fn test_dead_server_is_tried_again() {
        let start = Instant::now();
        let (mut relay, sender) = attached_relay(start);
        relay.accept(test_notice(NoticeKind::Acked, "MESSAGE", "PERSONAL", "bob"), client(), start);
        for t in [2, 4, 8, 12, 20] {
            relay.tick(start + secs(t));
        }
        assert_eq!(relay.liveness(), Liveness::Dead);
        sender.take();

        relay.tick(start + secs(140));
        assert_eq!(relay.liveness(), Liveness::Attaching);
        let sent = notices_to(&sender, server(1));
        assert!(sent.iter().any(|n| n.opcode == HM_ATTACH));
        assert!(sent.iter().any(|n| n.kind == NoticeKind::Acked));
    }

    #[test]
    fn test_failover_announcements() {
        let _lock = MOCK_RANDOM_MUTEX.lock();
        let ctx = MockRandom::gen_usize_range_context();
        ctx.expect().returning(|_| 0);

        let start = Instant::now();
        let config = RelayConfig::new(SocketAddr::from(([127, 0, 0, 1], 2104)), vec![server(1), server(2)]);
        let sender = Arc::new(RecordingSender::new());
        let mut relay = HostRelay::<MockRandom>::new_with_random(Arc::new(config), sender.clone(), start).unwrap();
        relay.start(start).unwrap();
        assert_eq!(relay.current_server(), Some(server(1)));
        let boot = sender.take().remove(0).1;
        relay.on_upstream(boot.reply(NoticeKind::ServAck, Bytes::new()), server(1), start);

        let notice = test_notice(NoticeKind::Acked, "MESSAGE", "PERSONAL", "bob");
        relay.accept(notice.clone(), client(), start);
        sender.take();

        for t in [2, 4, 8, 12, 20] {
            relay.tick(start + secs(t));
        }
        assert_eq!(relay.current_server(), Some(server(2)));
        assert_eq!(relay.liveness(), Liveness::Attaching);

        let sent = sender.take();
        let detach = sent.iter().find(|(_, n)| n.opcode == HM_DETACH).unwrap();
        assert_eq!(detach.0, server(1));
        let attach = sent.iter().find(|(_, n)| n.opcode == HM_ATTACH).unwrap();
        assert_eq!(attach.0, server(2));
        assert!(sent.contains(&(server(2), notice.clone())));
        assert_eq!(relay.stats(start + secs(20)).server_changes, 1);

        // the new server does not answer the announcement in time
        relay.tick(start + secs(20) + secs(60));
        assert_eq!(relay.current_server(), Some(server(1)));
    }

    #[test]
    fn test_server_shutdown_hint() {
        let start = Instant::now();
        let config = RelayConfig::new(SocketAddr::from(([127, 0, 0, 1], 2104)), vec![server(1), server(2), server(3)]);
        let (mut relay, sender) = relay_with(config, start);
        let current = relay.current_server().unwrap();
        let hint = [server(1), server(2), server(3)].into_iter().find(|s| *s != current).unwrap();
        sender.take();

        let hint_field = hint.to_string();
        let shutdown = Notice { opcode: SERVER_SHUTDOWN.to_string(), ..test_notice(NoticeKind::HmCtl, HM_CTL_CLASS, "", "") }
            .with_fields(&[hint_field.as_str()]);
        relay.on_upstream(shutdown, current, start);
        assert_eq!(relay.current_server(), Some(hint));
        assert!(notices_to(&sender, hint).iter().any(|n| n.opcode == HM_ATTACH));
    }

    #[rstest]
    #[case::flush(false, true)]
    #[case::no_flush(true, false)]
    fn test_flush(#[case] no_flush: bool, #[case] expect_flushed: bool) {
        let now = Instant::now();
        let mut config = RelayConfig::new(SocketAddr::from(([127, 0, 0, 1], 2104)), vec![server(1)]);
        config.no_flush = no_flush;
        let (mut relay, sender) = relay_with(config, now);
        relay.accept(test_notice(NoticeKind::Acked, "MESSAGE", "PERSONAL", "bob"), client(), now);
        sender.take();

        let flush = Notice { opcode: HM_FLUSH.to_string(), uid: test_uid(9), ..test_notice(NoticeKind::HmCtl, HM_CTL_CLASS, HM_CTL_CLASS, "") };
        relay.accept(flush, client(), now);

        assert_eq!(relay.queue().is_empty(), expect_flushed);
        let sent = sender.take();
        assert!(sent.iter().any(|(to, n)| *to == client() && n.kind == NoticeKind::HmAck && n.uid == test_uid(9)));
        assert_eq!(sent.iter().any(|(to, n)| *to == server(1) && n.opcode == HM_BOOT), expect_flushed);
    }

    #[test]
    fn test_stats() {
        let now = Instant::now();
        let (mut relay, sender) = attached_relay(now);
        relay.accept(test_notice(NoticeKind::Acked, "MESSAGE", "PERSONAL", "bob"), client(), now);
        sender.take();

        let query = Notice { opcode: GIMMESTATS.to_string(), ..test_notice(NoticeKind::Stat, HM_STAT_CLASS, HM_STAT_CLIENT, "") };
        relay.accept(query, client(), now + secs(42));
        let reply = notices_to(&sender, client()).remove(0);
        assert_eq!(reply.kind, NoticeKind::HmAck);

        let stats = RelayStats::try_from_notice(&reply).unwrap();
        assert_eq!(stats.current_server, Some(server(1)));
        assert_eq!(stats.queue_len, 1);
        assert_eq!(stats.client_packets, 2);
        assert_eq!(stats.server_packets, 1);
        assert_eq!(stats.uptime, secs(42));
    }

    #[test]
    fn test_unknown_stats_query() {
        let now = Instant::now();
        let (mut relay, sender) = attached_relay(now);
        let query = Notice { opcode: "GIMMEMORE".to_string(), ..test_notice(NoticeKind::Stat, HM_STAT_CLASS, HM_STAT_CLIENT, "") };
        relay.accept(query, client(), now);
        sender.assert_no_remaining_notices();
    }

    #[test]
    fn test_transport_errors_are_retried() {
        let now = Instant::now();
        let (mut relay, sender) = attached_relay(now);
        sender.set_failing(true);

        let notice = test_notice(NoticeKind::Acked, "MESSAGE", "PERSONAL", "bob");
        relay.accept(notice.clone(), client(), now);
        assert!(sender.take().is_empty());
        assert!(relay.queue().contains(&notice.uid));
        assert_eq!(relay.next_deadline(), Some(now));

        sender.set_failing(false);
        relay.tick(now);
        assert_eq!(notices_to(&sender, server(1)), vec![notice.clone()]);
        assert!(relay.queue().contains(&notice.uid));
    }

    #[test]
    fn test_malformed_packet() {
        let now = Instant::now();
        let (mut relay, sender) = attached_relay(now);
        relay.handle_packet(&[0xff; 5], client(), now);
        sender.assert_no_remaining_notices();
    }
}
