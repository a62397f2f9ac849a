//! Challenge propagation checking
//!
//! Verifies that a challenge TXT record is actually being served before the
//! CA is told to validate. The resolver here is pinned to the system's own
//! nameserver addresses: asking the host's recursive resolver would race
//! its caches and validate the wrong thing.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Resolver, TokioResolver};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::error::AcmeError;

/// Configuration for propagation checking
#[derive(Debug, Clone)]
pub struct PropagationConfig {
    /// Settle delay before the first check; also advertised to the ACME
    /// client as the expected propagation delay.
    pub initial_delay: Duration,
    /// Interval between checks
    pub check_interval: Duration,
    /// Maximum time to wait for propagation
    pub timeout: Duration,
    /// Our authoritative nameserver addresses
    pub nameservers: Vec<IpAddr>,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            check_interval: Duration::from_secs(2),
            timeout: Duration::from_secs(120),
            nameservers: Vec::new(),
        }
    }
}

/// Polls our own nameservers for a challenge TXT record.
#[derive(Debug)]
pub struct PropagationChecker {
    config: PropagationConfig,
    resolver: TokioResolver,
}

impl PropagationChecker {
    pub fn new(config: PropagationConfig) -> Self {
        let resolver = Self::create_resolver(&config);
        Self { config, resolver }
    }

    fn create_resolver(config: &PropagationConfig) -> TokioResolver {
        let mut resolver_config = ResolverConfig::new();
        for ip in &config.nameservers {
            resolver_config.add_name_server(NameServerConfig::new(
                SocketAddr::new(*ip, 53),
                Protocol::Udp,
            ));
        }

        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 2;
        // Propagation checks must see the live zone, not a cache.
        opts.cache_size = 0;

        Resolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
            .with_options(opts)
            .build()
    }

    /// Wait until `record_name` serves a TXT record equal to
    /// `expected_value`, or time out.
    pub async fn wait_for_txt(
        &self,
        record_name: &str,
        expected_value: &str,
    ) -> Result<(), AcmeError> {
        let start = Instant::now();
        let deadline = start + self.config.timeout;

        debug!(
            record = %record_name,
            timeout_secs = self.config.timeout.as_secs(),
            "waiting for challenge propagation"
        );

        tokio::time::sleep(self.config.initial_delay).await;

        loop {
            match self.check_record(record_name, expected_value).await {
                Ok(true) => {
                    debug!(
                        record = %record_name,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "challenge record visible"
                    );
                    return Ok(());
                }
                Ok(false) => {
                    trace!(record = %record_name, "challenge record not yet visible");
                }
                Err(e) => {
                    warn!(record = %record_name, error = %e, "propagation lookup error");
                }
            }

            if Instant::now() > deadline {
                return Err(AcmeError::Propagation {
                    domain: record_name.to_string(),
                    elapsed_secs: self.config.timeout.as_secs(),
                });
            }

            tokio::time::sleep(self.config.check_interval).await;
        }
    }

    async fn check_record(
        &self,
        record_name: &str,
        expected_value: &str,
    ) -> Result<bool, String> {
        match self.resolver.txt_lookup(record_name).await {
            Ok(records) => {
                for record in records.iter() {
                    let value: String = record
                        .txt_data()
                        .iter()
                        .map(|part| String::from_utf8_lossy(part))
                        .collect();
                    if value == expected_value {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Err(e) => {
                // Misses are expected until the write lands.
                let message = e.to_string().to_lowercase();
                if message.contains("no records found")
                    || message.contains("nxdomain")
                    || message.contains("record not found")
                {
                    Ok(false)
                } else {
                    Err(e.to_string())
                }
            }
        }
    }

    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_default_config() {
        let config = PropagationConfig::default();
        assert_eq!(config.initial_delay, Duration::from_millis(500));
        assert_eq!(config.check_interval, Duration::from_secs(2));
        assert_eq!(config.timeout, Duration::from_secs(120));
        assert!(config.nameservers.is_empty());
    }

    #[tokio::test]
    async fn test_checker_creation_with_nameservers() {
        let checker = PropagationChecker::new(PropagationConfig {
            nameservers: vec![IpAddr::V4(Ipv4Addr::new(198, 51, 100, 53))],
            ..PropagationConfig::default()
        });
        assert_eq!(checker.config().nameservers.len(), 1);
    }
}
