//! This module contains utilities that are useful for testing code based on the notification
//!  bus. They are used for testing the bus itself, but they are also exported for integration
//!  tests and application testing, which is why they are part of the crate's regular code.

pub mod notice;
pub mod sender;
