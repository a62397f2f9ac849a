//! PendingDNS core server
//!
//! Three tightly coupled subsystems over one shared zone store:
//!
//! * `dns` — the authoritative UDP/TCP responder
//! * `health` — the background endpoint prober
//! * `acme` + `public` — on-demand certificates and the redirect/proxy
//!   front end that consumes them
//!
//! The binary in `main.rs` wires the enabled roles into one process; in
//! production a supervisor forks one process per role.

pub mod acme;
pub mod dns;
pub mod health;
pub mod public;
