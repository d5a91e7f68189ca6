//! The server side: routing of incoming notices to local subscribers, and federation with
//!  foreign realms.

pub mod access;
pub mod credentials;
pub mod locations;
pub mod realm_config;
pub mod realm_dispatcher;
pub mod server_loop;
pub mod subscriptions;
