//! At-least-once delivery over UDP: pending notices are retransmitted on a backoff schedule until
//!  they are acked, failing over between a peer's candidate addresses along the way.

pub mod backoff;
pub mod delivery_config;
pub mod delivery_queue;
