pub mod peer_failover;
