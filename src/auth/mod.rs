//! Authentication of notices: a sender that asks for authentication presents a ticket (which
//!  yields a session key and the sender's principal) and a checksum keyed with that session key.

pub mod auth_verifier;
pub mod checksum;
pub mod session_key_cache;
pub mod ticket;
