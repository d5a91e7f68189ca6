//! The wire notice: one datagram per notice (or per fragment of a notice), addressed by its
//!  `(class, instance, recipient)` triple and identified by its [uid::Uid] for acking.

pub mod control;
pub mod fragment;
pub mod notice;
pub mod uid;
