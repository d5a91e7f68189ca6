pub mod auth;
pub mod delivery;
pub mod host_relay;
pub mod notice;
pub mod peer;
pub mod realm;
pub mod transport;
pub mod util;
pub mod test_util;
