//! Shared building blocks for the PendingDNS platform
//!
//! This crate carries the pieces every other workspace member needs:
//! the common error taxonomy, small domain primitives, and the
//! tracing/metrics bootstrap.

pub mod errors;
pub mod observability;
pub mod types;

pub use errors::{PendingError, PendingResult};

/// Product name advertised in HTTP `Server` and `X-CDN-Loop` headers.
pub const PRODUCT_NAME: &str = "PendingDNS";
