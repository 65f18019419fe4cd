//! Helpers for testing code on top of the transport, both this crate's own tests and
//!  downstream crates'.

pub mod message;
pub mod net;
