use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::net::SocketAddr;

use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::util::random::{Random, RngRandom};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Liveness {
    /// no candidate was tried yet
    NeedServer,
    /// switched to a candidate of a peer that never answered so far
    Booting,
    /// switched to a candidate of a peer that was attached at some point
    Attaching,
    Attached,
    /// attached, but a send to it timed out
    Tardy,
    /// all candidates were exhausted - only an inbound packet from a candidate revives the peer
    Dead,
}

/// A peer's liveness changed. Reported to the embedding component so it can emit the protocol's
///  control notices; PeerFailover does not send anything itself.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PeerTransition {
    pub peer: String,
    pub from: Liveness,
    pub to: Liveness,
    pub old_addr: Option<SocketAddr>,
    pub new_addr: Option<SocketAddr>,
}
impl PeerTransition {
    pub fn is_switch(&self) -> bool {
        self.new_addr.is_some() && self.old_addr != self.new_addr
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct PeerCounters {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub failovers: u64,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExhaustionDecision {
    Switched(SocketAddr),
    Dead,
}

pub struct PeerState {
    name: String,
    candidates: Vec<SocketAddr>,
    current: Option<usize>,
    liveness: Liveness,
    /// incremented whenever the current candidate changes or the peer dies / revives, but not on
    ///  Attached / Tardy flapping - retry counters of pending deliveries belong to an epoch
    epoch: u64,
    /// exhausted schedules since the peer was last heard from
    exhaustions: usize,
    ever_attached: bool,
    last_change: Option<Instant>,
    pub counters: PeerCounters,
}
impl Debug for PeerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Peer{{{}:{:?}@{:?}}}", self.name, self.liveness, self.current_addr())
    }
}

impl PeerState {
    fn new(name: &str, candidates: Vec<SocketAddr>) -> PeerState {
        PeerState {
            name: name.to_string(),
            candidates,
            current: None,
            liveness: Liveness::NeedServer,
            epoch: 0,
            exhaustions: 0,
            ever_attached: false,
            last_change: None,
            counters: Default::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn candidates(&self) -> &[SocketAddr] {
        &self.candidates
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn current_addr(&self) -> Option<SocketAddr> {
        self.current.map(|idx| self.candidates[idx])
    }

    pub fn is_candidate(&self, addr: &SocketAddr) -> bool {
        self.candidates.contains(addr)
    }

    fn switched_liveness(&self) -> Liveness {
        if self.ever_attached {
            Liveness::Attaching
        }
        else {
            Liveness::Booting
        }
    }

    fn change(&mut self, new_idx: Option<usize>, liveness: Liveness, now: Instant) -> PeerTransition {
        let transition = PeerTransition {
            peer: self.name.clone(),
            from: self.liveness,
            to: liveness,
            old_addr: self.current_addr(),
            new_addr: new_idx.map(|idx| self.candidates[idx]),
        };
        if new_idx != self.current && self.current.is_some() && new_idx.is_some() {
            self.counters.failovers += 1;
        }
        if new_idx != self.current || liveness == Liveness::Dead || self.liveness == Liveness::Dead {
            self.epoch += 1;
        }
        let in_state_for = self.last_change.map(|t| now.saturating_duration_since(t));
        self.current = new_idx;
        self.liveness = liveness;
        self.last_change = Some(now);
        info!(peer=%self.name, from=?transition.from, to=?transition.to, addr=?transition.new_addr, ?in_state_for, "peer transition");
        transition
    }
}

/// All peers (foreign realms, or the upstream server of a host relay) with their candidate
///  addresses, and the failover logic choosing between them.
pub struct PeerTable<R: Random = RngRandom> {
    peers: FxHashMap<String, PeerState>,
    /// how often all candidates are cycled through before a peer is declared dead
    failover_cycles: usize,
    pd: PhantomData<R>,
}

impl PeerTable<RngRandom> {
    pub fn new(failover_cycles: usize) -> PeerTable<RngRandom> {
        PeerTable::new_with_random(failover_cycles)
    }
}

impl<R: Random> PeerTable<R> {
    pub fn new_with_random(failover_cycles: usize) -> PeerTable<R> {
        PeerTable {
            peers: Default::default(),
            failover_cycles: failover_cycles.max(1),
            pd: Default::default(),
        }
    }

    pub fn add_peer(&mut self, name: &str, candidates: Vec<SocketAddr>) -> anyhow::Result<()> {
        if candidates.is_empty() {
            bail!("peer {} has no candidate addresses", name);
        }
        if self.peers.contains_key(name) {
            bail!("duplicate peer {}", name);
        }
        self.peers.insert(name.to_string(), PeerState::new(name, candidates));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PeerState> {
        self.peers.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerState> {
        self.peers.values()
    }

    fn peer_mut(&mut self, name: &str) -> anyhow::Result<&mut PeerState> {
        self.peers.get_mut(name)
            .ok_or_else(|| anyhow!("unknown peer {}", name))
    }

    /// the peer that has `addr` among its candidates
    pub fn peer_for_addr(&self, addr: &SocketAddr) -> Option<&str> {
        self.peers.values()
            .find(|p| p.is_candidate(addr))
            .map(|p| p.name.as_str())
    }

    /// Picks the candidate to use after the current one. A single candidate stays pinned, and
    ///  the current candidate is never chosen again if there is an alternative.
    fn choose_next(peer: &PeerState) -> usize {
        let n = peer.candidates.len();
        match peer.current {
            _ if n == 1 => 0,
            None => R::gen_usize_range(0..n),
            Some(current) => {
                let others = (0..n)
                    .filter(|&idx| idx != current)
                    .collect::<Vec<_>>();
                if others.len() == 1 {
                    others[0]
                }
                else {
                    others[R::gen_usize_range(0..others.len())]
                }
            }
        }
    }

    /// The address to send to, choosing an initial candidate if none was chosen yet
    pub fn destination(&mut self, name: &str, now: Instant) -> anyhow::Result<(SocketAddr, Option<PeerTransition>)> {
        let peer = self.peer_mut(name)?;
        if let Some(addr) = peer.current_addr() {
            return Ok((addr, None));
        }
        let idx = Self::choose_next(peer);
        let liveness = peer.switched_liveness();
        let transition = peer.change(Some(idx), liveness, now);
        Ok((peer.candidates[idx], Some(transition)))
    }

    pub fn on_sent(&mut self, name: &str) {
        if let Some(peer) = self.peers.get_mut(name) {
            peer.counters.packets_sent += 1;
        }
    }

    /// Any packet from the current candidate is proof of life. Packets from other candidates
    ///  (e.g. late acks from a server we switched away from) only count if the peer is dead or
    ///  has no current candidate - then that candidate becomes current.
    pub fn on_contact(&mut self, name: &str, from: SocketAddr, now: Instant) -> Option<PeerTransition> {
        let peer = self.peers.get_mut(name)?;
        let idx = match peer.candidates.iter().position(|c| c == &from) {
            Some(idx) => idx,
            None => {
                warn!(peer=name, ?from, "contact from an address that is not a candidate - ignoring");
                return None;
            }
        };
        peer.counters.packets_received += 1;

        if peer.current.is_some() && peer.current != Some(idx) && peer.liveness != Liveness::Dead {
            debug!(peer=name, ?from, "packet from a candidate other than the current one");
            return None;
        }
        peer.exhaustions = 0;
        peer.ever_attached = true;

        if peer.liveness == Liveness::Attached && peer.current == Some(idx) {
            return None;
        }
        Some(peer.change(Some(idx), Liveness::Attached, now))
    }

    /// a send timed out and is retransmitted
    pub fn on_timeout(&mut self, name: &str, now: Instant) -> Option<PeerTransition> {
        let peer = self.peers.get_mut(name)?;
        if peer.liveness != Liveness::Attached {
            return None;
        }
        let current = peer.current;
        Some(peer.change(current, Liveness::Tardy, now))
    }

    /// A delivery exhausted its retry schedule against the current candidate: switch to another
    ///  candidate, or declare the peer dead once all candidates were cycled through often enough.
    pub fn on_exhausted(&mut self, name: &str, now: Instant) -> anyhow::Result<(ExhaustionDecision, PeerTransition)> {
        let failover_cycles = self.failover_cycles;
        let peer = self.peer_mut(name)?;
        peer.exhaustions += 1;

        if peer.exhaustions >= peer.candidates.len() * failover_cycles {
            debug!(peer=name, "all candidates exhausted");
            peer.exhaustions = 0;
            let current = peer.current;
            let transition = peer.change(current, Liveness::Dead, now);
            return Ok((ExhaustionDecision::Dead, transition));
        }

        let idx = Self::choose_next(peer);
        let liveness = peer.switched_liveness();
        let transition = peer.change(Some(idx), liveness, now);
        Ok((ExhaustionDecision::Switched(peer.candidates[idx]), transition))
    }

    /// Moves on to another candidate on request (e.g. a local client asking for a different
    ///  server, or a timeout waiting for a boot to be acknowledged). A dead peer is tried again later.
    pub fn force_switch(&mut self, name: &str, now: Instant) -> anyhow::Result<PeerTransition> {
        let peer = self.peer_mut(name)?;
        let idx = Self::choose_next(peer);
        let liveness = peer.switched_liveness();
        Ok(peer.change(Some(idx), liveness, now))
    }

    /// The current server announced it is shutting down, possibly suggesting a successor. The
    ///  hint is followed if it is a known candidate, otherwise this is a regular switch.
    pub fn on_shutdown_hint(&mut self, name: &str, hint: Option<SocketAddr>, now: Instant) -> anyhow::Result<PeerTransition> {
        let peer = self.peer_mut(name)?;
        let hinted = hint
            .and_then(|h| peer.candidates.iter().position(|c| c == &h))
            .filter(|&idx| Some(idx) != peer.current || peer.candidates.len() == 1);

        let idx = match hinted {
            Some(idx) => idx,
            None => {
                if hint.is_some() {
                    debug!(peer=name, ?hint, "shutdown hint is not a usable candidate");
                }
                Self::choose_next(peer)
            }
        };
        let liveness = peer.switched_liveness();
        Ok(peer.change(Some(idx), liveness, now))
    }

    /// Makes a known candidate current, e.g. because that server announced its boot to us
    pub fn set_server(&mut self, name: &str, addr: SocketAddr, now: Instant) -> anyhow::Result<PeerTransition> {
        let peer = self.peer_mut(name)?;
        let idx = peer.candidates.iter().position(|c| c == &addr)
            .ok_or_else(|| anyhow!("{:?} is not a candidate of peer {}", addr, name))?;
        peer.ever_attached = true;
        peer.exhaustions = 0;
        Ok(peer.change(Some(idx), Liveness::Attached, now))
    }

    /// back to square one, e.g. after a flush
    pub fn reset(&mut self, name: &str, now: Instant) -> anyhow::Result<PeerTransition> {
        let peer = self.peer_mut(name)?;
        peer.exhaustions = 0;
        Ok(peer.change(None, Liveness::NeedServer, now))
    }
}
