use anyhow::bail;

use crate::delivery::backoff::BackoffSchedule;

/// What happens to pending deliveries once their peer is declared dead
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeadPeerPolicy {
    /// give up: the delivery is retired and its sender gets a negative ack
    Retire,
    /// keep the delivery queued (without retransmitting) until the peer becomes reachable again
    ///  or the queue is cleared
    Hold,
}

#[derive(Debug)]
pub struct DeliveryConfig {
    pub backoff: BackoffSchedule,
    /// how often all of a peer's candidates are tried before the peer is declared dead
    pub failover_cycles: usize,
    /// upper bound for the number of pending deliveries (counting each fragment)
    pub max_pending: usize,
    pub dead_peer_policy: DeadPeerPolicy,
}

impl DeliveryConfig {
    pub fn new(dead_peer_policy: DeadPeerPolicy) -> DeliveryConfig {
        DeliveryConfig {
            backoff: BackoffSchedule::standard(),
            failover_cycles: 1,
            max_pending: 4096,
            dead_peer_policy,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.failover_cycles == 0 {
            bail!("failover cycles must be at least 1");
        }
        if self.max_pending == 0 {
            bail!("max pending must be at least 1");
        }
        Ok(())
    }
}
