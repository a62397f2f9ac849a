//! Tracing and metrics bootstrap
//!
//! Structured logging goes through `tracing`; the output format is selected
//! with `PENDINGDNS_LOG_FORMAT` (`json`, the default, or `pretty` for
//! development). Metrics are a small prometheus registry covering the hot
//! paths only.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use prometheus::{
    register_int_counter_vec, register_int_gauge, IntCounterVec, IntGauge,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing/logging subsystem.
///
/// Respects `RUST_LOG` for filtering and `PENDINGDNS_LOG_FORMAT` for the
/// output format. Safe to call exactly once per process.
pub fn init_tracing() -> Result<()> {
    let format = std::env::var("PENDINGDNS_LOG_FORMAT").unwrap_or_else(|_| "json".to_string());

    let json_layer = if format == "json" {
        Some(fmt::layer().json().with_target(true))
    } else {
        None
    };

    let pretty_layer = if format == "pretty" {
        Some(fmt::layer().pretty().with_target(true))
    } else {
        None
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .init();

    tracing::info!("tracing initialized");
    Ok(())
}

/// Process-wide metrics handle.
///
/// Registration happens once on first access; the metric names are unique
/// within the process so this cannot fail after startup.
pub fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(|| Metrics::new().expect("metrics registration"))
}

/// Counters for the serving paths.
pub struct Metrics {
    /// DNS queries by protocol, query type and outcome (answered, refused,
    /// empty, dropped).
    pub dns_queries: IntCounterVec,
    /// Health probe outcomes by scheme and result.
    pub health_probes: IntCounterVec,
    /// Health status transitions (up→down, down→up).
    pub health_transitions: IntCounterVec,
    /// Certificate operations by outcome (cache_hit, issued, renewed, failed).
    pub certificates: IntCounterVec,
    /// Public server requests by kind (redirect, proxy, not_found, loop).
    pub public_requests: IntCounterVec,
    /// Currently running health worker loops.
    pub health_workers: IntGauge,
}

impl Metrics {
    /// Create and register the metric families with the default registry.
    pub fn new() -> Result<Self> {
        let dns_queries = register_int_counter_vec!(
            "pendingdns_dns_queries_total",
            "DNS queries processed",
            &["proto", "qtype", "outcome"]
        )
        .context("registering dns query counter")?;

        let health_probes = register_int_counter_vec!(
            "pendingdns_health_probes_total",
            "Health probes performed",
            &["scheme", "result"]
        )
        .context("registering health probe counter")?;

        let health_transitions = register_int_counter_vec!(
            "pendingdns_health_transitions_total",
            "Health status transitions persisted",
            &["to"]
        )
        .context("registering health transition counter")?;

        let certificates = register_int_counter_vec!(
            "pendingdns_certificates_total",
            "Certificate manager operations",
            &["outcome"]
        )
        .context("registering certificate counter")?;

        let public_requests = register_int_counter_vec!(
            "pendingdns_public_requests_total",
            "Public HTTP/HTTPS requests",
            &["kind"]
        )
        .context("registering public request counter")?;

        let health_workers = register_int_gauge!(
            "pendingdns_health_workers",
            "Running health worker loops"
        )
        .context("registering health worker gauge")?;

        Ok(Self {
            dns_queries,
            health_probes,
            health_transitions,
            certificates,
            public_requests,
            health_workers,
        })
    }
}
