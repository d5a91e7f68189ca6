use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::delivery::delivery_config::{DeadPeerPolicy, DeliveryConfig};
use crate::notice::notice::Notice;
use crate::notice::uid::Uid;
use crate::peer::peer_failover::{ExhaustionDecision, Liveness, PeerTable, PeerTransition};
use crate::transport::PacketSender;
use crate::util::random::{Random, RngRandom};
use crate::util::timer_heap::{TimerHeap, TimerId};

/// Identifies one logical send, which may consist of several fragments
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct DeliveryHandle(u64);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeliveryOutcome {
    /// every fragment was acked
    Acked,
    /// the peer explicitly refused (part of) the notice
    Nacked,
    /// retries and failover were exhausted without an ack
    Failed,
}

/// The final result of a logical send. `original` is the notice as it was handed to the queue
///  before fragmentation, so that the caller can synthesize an ack to `relay_to`.
#[derive(Debug, Clone)]
pub struct DeliveryEvent {
    pub handle: DeliveryHandle,
    pub peer: String,
    pub relay_to: Option<SocketAddr>,
    pub original: Notice,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug)]
pub enum AckMatch {
    /// no pending delivery for this uid (never sent, or acked before) - a no-op
    Unknown,
    /// a fragment was acked, but other fragments of the same send are still pending
    Partial,
    Complete(DeliveryEvent),
}
impl AckMatch {
    pub fn is_match(&self) -> bool {
        !matches!(self, AckMatch::Unknown)
    }
}

struct PendingDelivery {
    packet: Bytes,
    peer: String,
    group: DeliveryHandle,
    /// the address the packet was last sent to
    destination: Option<SocketAddr>,
    /// sends since the retry counter was last reset
    retries: usize,
    /// the peer's failover epoch the retry counter belongs to
    epoch: u64,
    /// `None` while parked for a dead peer
    timer: Option<TimerId>,
}

struct DeliveryGroup {
    peer: String,
    relay_to: Option<SocketAddr>,
    original: Notice,
    outstanding: FxHashSet<Uid>,
}

pub struct DeliveryQueue<R: Random = RngRandom> {
    config: Arc<DeliveryConfig>,
    sender: Arc<dyn PacketSender>,
    peers: PeerTable<R>,
    pending: FxHashMap<Uid, PendingDelivery>,
    groups: FxHashMap<DeliveryHandle, DeliveryGroup>,
    timers: TimerHeap<Uid>,
    transitions: Vec<PeerTransition>,
    next_handle: u64,
}

impl DeliveryQueue<RngRandom> {
    pub fn new(config: Arc<DeliveryConfig>, sender: Arc<dyn PacketSender>) -> DeliveryQueue<RngRandom> {
        DeliveryQueue::new_with_random(config, sender)
    }
}

impl<R: Random> DeliveryQueue<R> {
    pub fn new_with_random(config: Arc<DeliveryConfig>, sender: Arc<dyn PacketSender>) -> DeliveryQueue<R> {
        let peers = PeerTable::new_with_random(config.failover_cycles);
        DeliveryQueue {
            config,
            sender,
            peers,
            pending: Default::default(),
            groups: Default::default(),
            timers: Default::default(),
            transitions: Vec::new(),
            next_handle: 0,
        }
    }

    pub fn add_peer(&mut self, name: &str, candidates: Vec<SocketAddr>) -> anyhow::Result<()> {
        self.peers.add_peer(name, candidates)
    }

    pub fn peers(&self) -> &PeerTable<R> {
        &self.peers
    }

    /// Peer transitions that happened since the last call. The embedding component uses them
    ///  to emit its announcements.
    pub fn take_transitions(&mut self) -> Vec<PeerTransition> {
        std::mem::take(&mut self.transitions)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, uid: &Uid) -> bool {
        self.pending.contains_key(uid)
    }

    /// the address a pending notice was last sent to
    pub fn destination_of(&self, uid: &Uid) -> Option<SocketAddr> {
        self.pending.get(uid)
            .and_then(|e| e.destination)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// The peer's current candidate, choosing one if there is none yet
    pub fn ensure_destination(&mut self, peer: &str, now: Instant) -> anyhow::Result<SocketAddr> {
        let (dest, transition) = self.peers.destination(peer, now)?;
        self.transitions.extend(transition);
        Ok(dest)
    }

    /// Sends a reliable notice to `peer`, tracking it until it is acked or fails terminally.
    pub fn send(&mut self, peer: &str, notice: &Notice, relay_to: Option<SocketAddr>, now: Instant) -> anyhow::Result<DeliveryHandle> {
        self.send_group(peer, vec![notice.clone()], notice.clone(), relay_to, now)
    }

    /// Sends the fragments of one logical send. Each fragment is tracked (and retried) on its
    ///  own, but there is only one outcome for the whole group: acked once all fragments are
    ///  acked, nacked / failed as soon as one fragment is.
    pub fn send_group(&mut self, peer: &str, fragments: Vec<Notice>, original: Notice, relay_to: Option<SocketAddr>, now: Instant) -> anyhow::Result<DeliveryHandle> {
        if fragments.is_empty() {
            bail!("nothing to send");
        }
        if self.peers.get(peer).is_none() {
            bail!("unknown peer {}", peer);
        }
        if self.pending.len() + fragments.len() > self.config.max_pending {
            bail!("delivery queue is full ({} pending)", self.pending.len());
        }
        let mut uids = FxHashSet::default();
        for f in &fragments {
            if self.pending.contains_key(&f.uid) || !uids.insert(f.uid) {
                bail!("a delivery for uid {:?} is already pending", f.uid);
            }
        }

        let handle = DeliveryHandle(self.next_handle);
        self.next_handle += 1;

        self.groups.insert(handle, DeliveryGroup {
            peer: peer.to_string(),
            relay_to,
            original,
            outstanding: uids,
        });

        for f in fragments {
            trace!(uid=?f.uid, peer, "enqueueing notice");
            self.pending.insert(f.uid, PendingDelivery {
                packet: f.to_bytes(),
                peer: peer.to_string(),
                group: handle,
                destination: None,
                retries: 0,
                epoch: 0,
                timer: None,
            });
            self.transmit(&f.uid, now);
        }
        Ok(handle)
    }

    /// Sends (or resends) a pending notice to its peer's current candidate and arms its timer.
    ///  Notices for a dead peer are parked instead if the policy is to hold them.
    fn transmit(&mut self, uid: &Uid, now: Instant) {
        let Some(entry) = self.pending.get_mut(uid) else {
            return;
        };

        let is_dead = self.peers.get(&entry.peer)
            .map(|p| p.liveness() == Liveness::Dead)
            .unwrap_or(false);
        if is_dead && self.config.dead_peer_policy == DeadPeerPolicy::Hold {
            debug!(?uid, peer=%entry.peer, "peer is dead - holding notice");
            entry.timer = None;
            entry.retries = 0;
            return;
        }

        let dest = match self.peers.destination(&entry.peer, now) {
            Ok((dest, transition)) => {
                self.transitions.extend(transition);
                dest
            }
            Err(e) => {
                error!(?uid, "no destination for pending notice: {}", e);
                return;
            }
        };

        if entry.retries == 0 {
            entry.epoch = self.peers.get(&entry.peer)
                .map(|p| p.epoch())
                .unwrap_or_default();
        }
        entry.destination = Some(dest);
        entry.retries += 1;
        self.peers.on_sent(&entry.peer);

        let delay = match self.sender.send_packet(dest, &entry.packet) {
            Ok(()) => self.config.backoff.delay_after(entry.retries)
                .unwrap_or(Duration::ZERO),
            Err(e) => {
                // a failed send counts as an attempt and is retried right away
                warn!(?uid, ?dest, "error sending notice: {}", e);
                Duration::ZERO
            }
        };
        entry.timer = Some(self.timers.schedule(now + delay, *uid));
    }

    /// Looks up and removes the pending delivery for an ack's uid. `positive` is false for a
    ///  negative ack from the peer, which completes the whole group as [DeliveryOutcome::Nacked].
    pub fn on_ack(&mut self, uid: &Uid, positive: bool) -> AckMatch {
        let Some(entry) = self.pending.remove(uid) else {
            trace!(?uid, "ack for unknown uid - ignoring");
            return AckMatch::Unknown;
        };

        let group_done = match self.groups.get_mut(&entry.group) {
            Some(group) => {
                group.outstanding.remove(uid);
                group.outstanding.is_empty()
            }
            None => true,
        };

        if !positive {
            return self.complete_group(entry.group, DeliveryOutcome::Nacked)
                .map(AckMatch::Complete)
                .unwrap_or(AckMatch::Partial);
        }
        if group_done {
            if let Some(event) = self.complete_group(entry.group, DeliveryOutcome::Acked) {
                return AckMatch::Complete(event);
            }
        }
        AckMatch::Partial
    }

    fn complete_group(&mut self, handle: DeliveryHandle, outcome: DeliveryOutcome) -> Option<DeliveryEvent> {
        let group = self.groups.remove(&handle)?;
        for uid in &group.outstanding {
            self.pending.remove(uid);
        }
        debug!(?handle, peer=%group.peer, ?outcome, "delivery complete");
        Some(DeliveryEvent {
            handle,
            peer: group.peer,
            relay_to: group.relay_to,
            original: group.original,
            outcome,
        })
    }

    /// Cancels a send with all its fragments. Returns false if it was no longer pending.
    pub fn cancel(&mut self, handle: DeliveryHandle) -> bool {
        self.complete_group(handle, DeliveryOutcome::Failed).is_some()
    }

    /// Drops everything. Returns the number of pending notices that were dropped.
    pub fn clear(&mut self) -> usize {
        let num_dropped = self.pending.len();
        self.pending.clear();
        self.groups.clear();
        self.timers.clear();
        info!(num_dropped, "cleared delivery queue");
        num_dropped
    }

    /// Handles all timers that are due: retransmission, failover on exhausted schedules, and
    ///  terminal failure. Returns the deliveries that failed terminally.
    pub fn tick(&mut self, now: Instant) -> Vec<DeliveryEvent> {
        let mut due = Vec::new();
        while let Some((timer, uid)) = self.timers.pop_due(now) {
            due.push((timer, uid));
        }

        let mut events = Vec::new();
        for (timer, uid) in due {
            // entries may have been removed or re-armed while handling earlier timers
            let Some(entry) = self.pending.get_mut(&uid) else {
                continue;
            };
            if entry.timer != Some(timer) {
                continue;
            }
            entry.timer = None;

            if entry.retries < self.config.backoff.max_sends() {
                debug!(?uid, retries=entry.retries, "retransmitting");
                self.transitions.extend(self.peers.on_timeout(&entry.peer, now));
                self.transmit(&uid, now);
            }
            else {
                self.on_exhausted(&uid, now, &mut events);
            }
        }
        events
    }

    fn on_exhausted(&mut self, uid: &Uid, now: Instant, events: &mut Vec<DeliveryEvent>) {
        let Some(entry) = self.pending.get_mut(uid) else {
            return;
        };
        let peer_name = entry.peer.clone();
        let Some(peer) = self.peers.get(&peer_name) else {
            return;
        };

        if peer.liveness() == Liveness::Dead {
            self.on_dead_peer(uid, events);
            return;
        }
        if entry.epoch != peer.epoch() {
            // the peer failed over since this notice's schedule started: give the new candidate
            //  a full schedule rather than failing over again
            entry.retries = 0;
            self.transmit(uid, now);
            return;
        }

        match self.peers.on_exhausted(&peer_name, now) {
            Ok((ExhaustionDecision::Switched(addr), transition)) => {
                debug!(?uid, peer=%peer_name, ?addr, "failing over");
                self.transitions.push(transition);
                if let Some(entry) = self.pending.get_mut(uid) {
                    entry.retries = 0;
                }
                self.transmit(uid, now);
            }
            Ok((ExhaustionDecision::Dead, transition)) => {
                warn!(peer=%peer_name, "peer is dead");
                self.transitions.push(transition);
                self.on_dead_peer(uid, events);
            }
            Err(e) => {
                error!(?uid, "error failing over: {}", e);
                self.on_dead_peer(uid, events);
            }
        }
    }

    fn on_dead_peer(&mut self, uid: &Uid, events: &mut Vec<DeliveryEvent>) {
        match self.config.dead_peer_policy {
            DeadPeerPolicy::Retire => {
                let Some(group) = self.pending.get(uid).map(|e| e.group) else {
                    return;
                };
                events.extend(self.complete_group(group, DeliveryOutcome::Failed));
            }
            DeadPeerPolicy::Hold => {
                if let Some(entry) = self.pending.get_mut(uid) {
                    entry.retries = 0;
                    entry.timer = None;
                }
            }
        }
    }

    /// Resends every pending notice of a peer to its current candidate with a fresh schedule
    pub fn retransmit_peer(&mut self, peer: &str, now: Instant) {
        let uids = self.pending.iter()
            .filter(|(_, e)| e.peer == peer)
            .map(|(uid, _)| *uid)
            .collect::<Vec<_>>();
        if !uids.is_empty() {
            debug!(peer, num=uids.len(), "retransmitting all pending notices");
        }
        for uid in uids {
            if let Some(entry) = self.pending.get_mut(&uid) {
                entry.retries = 0;
            }
            self.transmit(&uid, now);
        }
    }

    /// Any packet from a candidate of the peer: proof of life. Notices held for a dead peer are
    ///  sent again when it revives.
    pub fn peer_contact(&mut self, peer: &str, from: SocketAddr, now: Instant) {
        if let Some(transition) = self.peers.on_contact(peer, from, now) {
            let revived = transition.from == Liveness::Dead;
            self.transitions.push(transition);
            if revived {
                self.retransmit_peer(peer, now);
            }
        }
    }

    /// Moves the peer to another candidate and resends everything pending for it there
    pub fn force_switch(&mut self, peer: &str, now: Instant) -> anyhow::Result<()> {
        let transition = self.peers.force_switch(peer, now)?;
        self.transitions.push(transition);
        self.retransmit_peer(peer, now);
        Ok(())
    }

    pub fn shutdown_hint(&mut self, peer: &str, hint: Option<SocketAddr>, now: Instant) -> anyhow::Result<()> {
        let transition = self.peers.on_shutdown_hint(peer, hint, now)?;
        self.transitions.push(transition);
        self.retransmit_peer(peer, now);
        Ok(())
    }

    pub fn set_server(&mut self, peer: &str, addr: SocketAddr, now: Instant) -> anyhow::Result<()> {
        let transition = self.peers.set_server(peer, addr, now)?;
        self.transitions.push(transition);
        self.retransmit_peer(peer, now);
        Ok(())
    }

    /// forgets the peer's current candidate; the next send chooses a new one
    pub fn reset_peer(&mut self, peer: &str, now: Instant) -> anyhow::Result<()> {
        let transition = self.peers.reset(peer, now)?;
        self.transitions.push(transition);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::notice::notice::NoticeKind;
    use crate::test_util::notice::{test_addr, test_notice, test_uid};
    use crate::test_util::sender::RecordingSender;
    use crate::transport::MockPacketSender;
    use rstest::rstest;

    const PEER: &str = "ATHENA.MIT.EDU";

    fn queue(policy: DeadPeerPolicy, num_candidates: u8) -> (DeliveryQueue, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::new());
        let mut queue = DeliveryQueue::new(Arc::new(DeliveryConfig::new(policy)), sender.clone());
        queue.add_peer(PEER, (1..=num_candidates).map(|n| test_addr(n, 2103)).collect()).unwrap();
        (queue, sender)
    }

    fn notice(n: u32) -> Notice {
        let mut notice = test_notice(NoticeKind::Acked, "MESSAGE", "PERSONAL", "bob");
        notice.uid = test_uid(n);
        notice
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_send_and_ack() {
        let now = Instant::now();
        let (mut queue, sender) = queue(DeadPeerPolicy::Retire, 1);
        let relay_to = test_addr(99, 40000);

        let handle = queue.send(PEER, &notice(1), Some(relay_to), now).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(sender.take(), vec![(test_addr(1, 2103), notice(1))]);
        assert_eq!(queue.next_deadline(), Some(now + secs(2)));

        match queue.on_ack(&test_uid(1), true) {
            AckMatch::Complete(event) => {
                assert_eq!(event.handle, handle);
                assert_eq!(event.relay_to, Some(relay_to));
                assert_eq!(event.outcome, DeliveryOutcome::Acked);
                assert_eq!(event.original, notice(1));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(queue.is_empty());

        // idempotent
        assert!(!queue.on_ack(&test_uid(1), true).is_match());
        assert!(queue.tick(now + secs(100)).is_empty());
        sender.assert_no_remaining_notices();
    }

    #[test]
    fn test_duplicate_uid_rejected() {
        let now = Instant::now();
        let (mut queue, _sender) = queue(DeadPeerPolicy::Retire, 1);
        queue.send(PEER, &notice(1), None, now).unwrap();
        assert!(queue.send(PEER, &notice(1), None, now).is_err());
        assert!(queue.send_group(PEER, vec![notice(2), notice(2)], notice(2), None, now).is_err());
        assert!(queue.send("UNKNOWN", &notice(3), None, now).is_err());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_queue_full() {
        let now = Instant::now();
        let sender = Arc::new(RecordingSender::new());
        let mut config = DeliveryConfig::new(DeadPeerPolicy::Retire);
        config.max_pending = 2;
        let mut queue = DeliveryQueue::new(Arc::new(config), sender);
        queue.add_peer(PEER, vec![test_addr(1, 2103)]).unwrap();

        queue.send(PEER, &notice(1), None, now).unwrap();
        assert!(queue.send_group(PEER, vec![notice(2), notice(3)], notice(2), None, now).is_err());
        queue.send(PEER, &notice(2), None, now).unwrap();
        assert!(queue.send(PEER, &notice(3), None, now).is_err());
    }

    #[rstest]
    #[case::one_candidate(1)]
    #[case::two_candidates(2)]
    #[case::three_candidates(3)]
    fn test_attempts_until_dead(#[case] num_candidates: u8) {
        let start = Instant::now();
        let (mut queue, sender) = queue(DeadPeerPolicy::Retire, num_candidates);
        let relay_to = test_addr(99, 40000);
        queue.send(PEER, &notice(1), Some(relay_to), start).unwrap();

        let mut events = Vec::new();
        let mut now = start;
        while let Some(deadline) = queue.next_deadline() {
            now = deadline;
            events.extend(queue.tick(now));
        }

        let sent = sender.take();
        assert_eq!(sent.len(), 5 * num_candidates as usize);
        // each candidate gets its full schedule
        for chunk in sent.chunks(5) {
            assert!(chunk.iter().all(|(addr, _)| addr == &chunk[0].0));
        }
        assert_eq!(now, start + secs(20 * num_candidates as u64));

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, DeliveryOutcome::Failed);
        assert_eq!(events[0].relay_to, Some(relay_to));
        assert_eq!(queue.peers().get(PEER).unwrap().liveness(), Liveness::Dead);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_backoff_schedule_single_candidate() {
        let start = Instant::now();
        let (mut queue, sender) = queue(DeadPeerPolicy::Retire, 1);
        queue.send(PEER, &notice(1), None, start).unwrap();
        assert_eq!(sender.take().len(), 1);

        for (at, expected_sends) in [(1, 0), (2, 1), (3, 0), (4, 1), (8, 1), (12, 1), (19, 0)] {
            assert!(queue.tick(start + secs(at)).is_empty());
            assert_eq!(sender.take().len(), expected_sends, "at {}s", at);
        }
        let events = queue.tick(start + secs(20));
        assert_eq!(events.len(), 1);
        sender.assert_no_remaining_notices();
    }

    #[test]
    fn test_failover_resets_retries_and_boots() {
        let start = Instant::now();
        let (mut queue, sender) = queue(DeadPeerPolicy::Retire, 2);
        queue.send(PEER, &notice(1), None, start).unwrap();
        let first = sender.take()[0].0;

        for at in [2, 4, 8, 12] {
            queue.tick(start + secs(at));
        }
        assert_eq!(sender.take().len(), 4);
        queue.take_transitions();

        assert!(queue.tick(start + secs(20)).is_empty());
        let sent = sender.take();
        assert_eq!(sent.len(), 1);
        assert_ne!(sent[0].0, first);
        assert_eq!(queue.destination_of(&test_uid(1)), Some(sent[0].0));
        assert_eq!(queue.next_deadline(), Some(start + secs(22)));

        let transitions = queue.take_transitions();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, Liveness::Booting);
        assert_eq!(transitions[0].new_addr, Some(sent[0].0));
    }

    #[test]
    fn test_entries_share_failover_but_keep_their_retries() {
        let start = Instant::now();
        let (mut queue, sender) = queue(DeadPeerPolicy::Retire, 2);
        queue.send(PEER, &notice(1), None, start).unwrap();
        queue.send(PEER, &notice(2), None, start + secs(10)).unwrap();
        let first = sender.take()[0].0;

        // notice 1 exhausts at 20s and fails over; notice 2 is in the middle of its schedule
        for at in [2, 4, 8, 12, 14, 18, 20] {
            queue.tick(start + secs(at));
        }
        let second = queue.destination_of(&test_uid(1)).unwrap();
        assert_ne!(first, second);
        sender.take();

        // both retransmit to the new candidate, each on its own schedule
        queue.tick(start + secs(22));
        let sent = sender.take();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(addr, _)| addr == &second));

        // notice 2 exhausts under the old epoch: a fresh schedule at the second candidate
        //  rather than another failover
        let events = queue.tick(start + secs(30));
        assert!(events.is_empty());
        let sent = sender.take();
        assert!(sent.contains(&(second, notice(2))));
        assert!(sent.iter().all(|(addr, _)| addr == &second));
        assert_eq!(queue.peers().get(PEER).unwrap().counters.failovers, 1);
        assert_eq!(queue.peers().get(PEER).unwrap().liveness(), Liveness::Booting);
        assert!(queue.contains(&test_uid(2)));
    }

    #[test]
    fn test_fragments_are_tracked_individually() {
        let start = Instant::now();
        let (mut queue, sender) = queue(DeadPeerPolicy::Retire, 1);
        let relay_to = test_addr(99, 40000);
        queue.send_group(PEER, vec![notice(1), notice(2)], notice(7), Some(relay_to), start).unwrap();
        assert_eq!(sender.take().len(), 2);

        assert!(matches!(queue.on_ack(&test_uid(2), true), AckMatch::Partial));
        assert!(queue.contains(&test_uid(1)));

        queue.tick(start + secs(2));
        let sent = sender.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.uid, test_uid(1));

        match queue.on_ack(&test_uid(1), true) {
            AckMatch::Complete(event) => {
                assert_eq!(event.outcome, DeliveryOutcome::Acked);
                assert_eq!(event.original, notice(7));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_nack_completes_group() {
        let start = Instant::now();
        let (mut queue, _sender) = queue(DeadPeerPolicy::Retire, 1);
        queue.send_group(PEER, vec![notice(1), notice(2)], notice(7), None, start).unwrap();

        match queue.on_ack(&test_uid(1), false) {
            AckMatch::Complete(event) => assert_eq!(event.outcome, DeliveryOutcome::Nacked),
            other => panic!("unexpected {:?}", other),
        }
        assert!(queue.is_empty());
        assert!(!queue.on_ack(&test_uid(2), true).is_match());
    }

    #[test]
    fn test_cancel_cancels_all_fragments() {
        let start = Instant::now();
        let (mut queue, sender) = queue(DeadPeerPolicy::Retire, 1);
        let handle = queue.send_group(PEER, vec![notice(1), notice(2)], notice(7), None, start).unwrap();
        queue.send(PEER, &notice(3), None, start).unwrap();
        sender.take();

        assert!(queue.cancel(handle));
        assert!(!queue.cancel(handle));
        assert_eq!(queue.len(), 1);

        queue.tick(start + secs(2));
        let sent = sender.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.uid, test_uid(3));
    }

    #[test]
    fn test_clear() {
        let start = Instant::now();
        let (mut queue, sender) = queue(DeadPeerPolicy::Hold, 1);
        queue.send(PEER, &notice(1), None, start).unwrap();
        queue.send(PEER, &notice(2), None, start).unwrap();
        sender.take();

        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.next_deadline(), None);
        assert!(queue.tick(start + secs(100)).is_empty());
        sender.assert_no_remaining_notices();
    }

    #[test]
    fn test_hold_policy_keeps_notices_for_dead_peer() {
        let start = Instant::now();
        let (mut queue, sender) = queue(DeadPeerPolicy::Hold, 1);
        let peer_addr = test_addr(1, 2103);
        queue.send(PEER, &notice(1), None, start).unwrap();

        let mut now = start;
        while let Some(deadline) = queue.next_deadline() {
            now = deadline;
            assert!(queue.tick(now).is_empty());
        }
        assert_eq!(sender.take().len(), 5);
        assert_eq!(queue.peers().get(PEER).unwrap().liveness(), Liveness::Dead);
        assert!(queue.contains(&test_uid(1)));

        // new notices are held as well
        queue.send(PEER, &notice(2), None, now).unwrap();
        sender.assert_no_remaining_notices();
        assert_eq!(queue.next_deadline(), None);

        // revival sends everything
        queue.peer_contact(PEER, peer_addr, now + secs(60));
        let mut sent = sender.take().into_iter().map(|(_, n)| n.uid.micros).collect::<Vec<_>>();
        sent.sort();
        assert_eq!(sent, vec![1, 2]);
        assert_eq!(queue.peers().get(PEER).unwrap().liveness(), Liveness::Attached);
        assert_eq!(queue.next_deadline(), Some(now + secs(62)));
    }

    #[test]
    fn test_retire_policy_retries_dead_peer() {
        let start = Instant::now();
        let (mut queue, sender) = queue(DeadPeerPolicy::Retire, 1);
        queue.send(PEER, &notice(1), None, start).unwrap();
        let mut now = start;
        while let Some(deadline) = queue.next_deadline() {
            now = deadline;
            queue.tick(now);
        }
        sender.take();

        // a dead peer still gets one schedule's worth of attempts for a new notice
        queue.send(PEER, &notice(2), None, now).unwrap();
        let mut events = Vec::new();
        while let Some(deadline) = queue.next_deadline() {
            now = deadline;
            events.extend(queue.tick(now));
        }
        assert_eq!(sender.take().len(), 5);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, DeliveryOutcome::Failed);
    }

    #[test]
    fn test_tardy_on_retransmission() {
        let start = Instant::now();
        let (mut queue, _sender) = queue(DeadPeerPolicy::Hold, 1);
        queue.peer_contact(PEER, test_addr(1, 2103), start);
        queue.send(PEER, &notice(1), None, start).unwrap();
        queue.take_transitions();

        queue.tick(start + secs(2));
        let transitions = queue.take_transitions();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, Liveness::Tardy);
    }

    #[test]
    fn test_attached_peer_gets_a_single_schedule() {
        let start = Instant::now();
        let (mut queue, sender) = queue(DeadPeerPolicy::Hold, 1);
        queue.peer_contact(PEER, test_addr(1, 2103), start);
        queue.send(PEER, &notice(1), None, start).unwrap();

        let mut now = start;
        while let Some(deadline) = queue.next_deadline() {
            now = deadline;
            queue.tick(now);
        }
        assert_eq!(now, start + secs(20));
        assert_eq!(sender.take().len(), 5);
        assert_eq!(queue.peers().get(PEER).unwrap().liveness(), Liveness::Dead);
    }

    #[test]
    fn test_force_switch_resends_pending() {
        let start = Instant::now();
        let (mut queue, sender) = queue(DeadPeerPolicy::Hold, 2);
        queue.send(PEER, &notice(1), None, start).unwrap();
        let first = sender.take()[0].0;

        queue.force_switch(PEER, start + secs(1)).unwrap();
        let sent = sender.take();
        assert_eq!(sent.len(), 1);
        assert_ne!(sent[0].0, first);

        // the schedule restarted with the switch
        queue.tick(start + secs(2));
        sender.assert_no_remaining_notices();
        queue.tick(start + secs(3));
        assert_eq!(sender.take(), vec![(sent[0].0, notice(1))]);
    }

    #[test]
    fn test_send_error_triggers_immediate_retry() {
        let start = Instant::now();
        let mut sender = MockPacketSender::new();
        let mut seq = mockall::Sequence::new();
        sender.expect_send_packet()
            .once()
            .in_sequence(&mut seq)
            .returning(|_, _| Err(anyhow::anyhow!("no buffer space")));
        sender.expect_send_packet()
            .once()
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let mut queue = DeliveryQueue::new(Arc::new(DeliveryConfig::new(DeadPeerPolicy::Retire)), Arc::new(sender));
        queue.add_peer(PEER, vec![test_addr(1, 2103)]).unwrap();
        queue.send(PEER, &notice(1), None, start).unwrap();
        assert_eq!(queue.next_deadline(), Some(start));

        assert!(queue.tick(start).is_empty());
        // the failed send counted as the first attempt
        assert_eq!(queue.next_deadline(), Some(start + secs(2)));
    }
}
