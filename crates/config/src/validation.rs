//! Configuration validation
//!
//! Validation failures carry the exit code the supervisor contract assigns
//! to them: an invalid ACME email is code 51, everything else is a generic
//! startup failure (code 3).

use thiserror::Error;
use validator::{Validate, ValidateEmail};

use pendingdns_common::errors::exit_codes;

use crate::types::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("acme.email {0:?} is not a valid email address")]
    InvalidAcmeEmail(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Process exit code mandated for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::InvalidAcmeEmail(_) => exit_codes::INVALID_ACME_EMAIL,
            _ => exit_codes::STARTUP_FAILURE,
        }
    }
}

impl Config {
    /// Validate the whole configuration tree.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.acme.email.validate_email() {
            return Err(ConfigError::InvalidAcmeEmail(self.acme.email.clone()));
        }

        Validate::validate(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.ns.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one nameserver (ns) must be configured".to_string(),
            ));
        }

        for ns in &self.ns {
            if ns.ip.parse::<std::net::IpAddr>().is_err() {
                return Err(ConfigError::Invalid(format!(
                    "ns entry {:?} has an unparseable ip {:?}",
                    ns.domain, ns.ip
                )));
            }
        }

        for upstream in &self.resolver.ns {
            if upstream.parse::<std::net::IpAddr>().is_err() {
                return Err(ConfigError::Invalid(format!(
                    "resolver.ns entry {:?} is not an ip address",
                    upstream
                )));
            }
        }

        for addr in self.public.hosts.a.iter() {
            if addr.parse::<std::net::Ipv4Addr>().is_err() {
                return Err(ConfigError::Invalid(format!(
                    "public.hosts.A entry {:?} is not an IPv4 address",
                    addr
                )));
            }
        }

        for addr in self.public.hosts.aaaa.iter() {
            if addr.parse::<std::net::Ipv6Addr>().is_err() {
                return Err(ConfigError::Invalid(format!(
                    "public.hosts.AAAA entry {:?} is not an IPv6 address",
                    addr
                )));
            }
        }

        Ok(())
    }
}
