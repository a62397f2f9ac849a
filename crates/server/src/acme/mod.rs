//! ACME certificate management
//!
//! Certificates are issued on demand through dns-01: the challenge TXT is
//! published into our own zone store, verified against our own nameserver
//! addresses (never the host's recursive resolver), and the resulting
//! certificate is cached in the key store with a TTL matching its validity.
//!
//! # Issuance flow
//!
//! 1. [`CertManager`] checks admissibility (each domain must fall in a
//!    stored zone whose public NS delegation matches the configured set)
//! 2. Cache hit under the md5-of-sorted-domains key short-circuits
//! 3. A distributed lock serializes issuance per domain set cluster-wide
//! 4. [`AcmeClient`] drives the order; [`ChallengePublisher`] writes the
//!    `_acme-challenge` TXT through the zone store with a bounded TTL
//! 5. [`PropagationChecker`] polls our own NS IPs until the record is live
//! 6. The finalized certificate is parsed, persisted and returned; a cert
//!    inside its renewal window is served stale while a background task
//!    renews it

mod client;
mod dns01;
mod error;
mod manager;
mod propagation;

pub use client::AcmeClient;
pub use dns01::{ChallengePublisher, ACME_CHALLENGE_LABEL, CHALLENGE_TTL_SECS};
pub use error::AcmeError;
pub use manager::{CertData, CertManager};
pub use propagation::{PropagationChecker, PropagationConfig};
