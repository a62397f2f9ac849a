//! Authoritative DNS responder
//!
//! `handler` turns a parsed query into an answer packet; `listener` owns the
//! UDP socket and the length-prefixed TCP accept loop.

pub mod handler;
pub mod listener;

pub use handler::DnsHandler;
pub use listener::{run_tcp, run_udp};
