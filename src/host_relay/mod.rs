//! The per-host relay: local clients talk to it, and it talks to one upstream server on their
//!  behalf, failing over between the servers it knows.

pub mod host_relay;
pub mod relay_config;
pub mod relay_loop;
pub mod relay_stats;
