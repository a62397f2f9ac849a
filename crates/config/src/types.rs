//! Configuration types
//!
//! Field names follow the operator-facing key names; dotted keys from the
//! original configuration language map onto nested tables here.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::defaults;

/// Top-level configuration consumed by the core.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct Config {
    pub dns: DnsConfig,
    pub api: ApiConfig,
    pub public: PublicConfig,
    /// Authoritative nameservers this deployment answers as. The first entry
    /// is the SOA primary.
    pub ns: Vec<NsConfig>,
    pub soa: SoaConfig,
    #[validate(nested)]
    pub acme: AcmeConfig,
    pub resolver: ResolverConfig,
    pub chaos: ChaosConfig,
    pub health: HealthConfig,
    pub store: StoreConfig,
}

/// DNS responder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Bind address for both UDP and TCP listeners.
    pub host: String,
    pub port: u16,
    /// TTL stamped on every answer.
    pub ttl: u32,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            host: defaults::any_host(),
            port: 53,
            ttl: defaults::dns_ttl(),
        }
    }
}

/// Management API endpoint (the REST layer itself is a collaborator; the
/// core only honors `enabled` and worker count at startup).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub enabled: bool,
    pub workers: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: defaults::local_host(),
            port: 5380,
            enabled: true,
            workers: 1,
        }
    }
}

/// Public HTTP/HTTPS server settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PublicConfig {
    pub http: ListenConfig,
    pub https: HttpsConfig,
    /// Addresses answered for A/AAAA queries on names carrying URL records.
    pub hosts: PublicHosts,
    pub errors: ErrorPages,
    /// Override for the `Server` response header; the default is
    /// `PendingDNS/<version>`.
    pub server: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: defaults::any_host(),
            port: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpsConfig {
    pub host: String,
    pub port: u16,
    /// Fallback PEM key/cert served when no certificate can be produced for
    /// an SNI name. When unset a self-signed pair is generated at startup.
    pub key: Option<String>,
    pub cert: Option<String>,
    /// Accepted for compatibility; the rustls stack has no DHE suites, so
    /// custom DH parameters have no effect.
    pub dh_param: Option<String>,
    /// Cipher suite names; empty means library defaults.
    pub ciphers: Vec<String>,
}

impl Default for HttpsConfig {
    fn default() -> Self {
        Self {
            host: defaults::any_host(),
            port: 443,
            key: None,
            cert: None,
            dh_param: None,
            ciphers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PublicHosts {
    #[serde(rename = "A")]
    pub a: Vec<String>,
    #[serde(rename = "AAAA")]
    pub aaaa: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ErrorPages {
    /// Path to an HTML template served on unknown hosts.
    pub error404: Option<String>,
    /// Path to an HTML template served on handler failures.
    pub error500: Option<String>,
}

/// One authoritative nameserver identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NsConfig {
    pub domain: String,
    pub ip: String,
}

/// SOA fields; the primary nameserver is `ns[0].domain`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoaConfig {
    pub admin: String,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expiration: u32,
    pub minimum: u32,
}

impl Default for SoaConfig {
    fn default() -> Self {
        Self {
            admin: "hostmaster.invalid".to_string(),
            serial: 1,
            refresh: 7200,
            retry: 3600,
            expiration: 1_209_600,
            minimum: 300,
        }
    }
}

/// ACME account and directory settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AcmeConfig {
    /// Account storage key; lets one store host several ACME identities.
    pub key: String,
    pub directory_url: String,
    /// Contact address registered with the CA. Must be a valid email;
    /// startup refuses to continue otherwise (exit code 51).
    #[validate(email)]
    pub email: String,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            key: "default".to_string(),
            directory_url: defaults::acme_directory(),
            email: String::new(),
        }
    }
}

/// Upstream resolvers used for ANAME targets and NS delegation checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub ns: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            ns: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
        }
    }
}

/// Chaos-class (CH TXT) identity answers. A query for one of these names is
/// answered iff the operator configured a non-empty value, refused otherwise.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChaosConfig {
    #[serde(rename = "version.bind")]
    pub version_bind: Option<String>,
    #[serde(rename = "hostname.bind")]
    pub hostname_bind: Option<String>,
    #[serde(rename = "id.server")]
    pub id_server: Option<String>,
    #[serde(rename = "authors.bind")]
    pub authors_bind: Option<String>,
}

impl ChaosConfig {
    /// Configured value for a chaos name, if any.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        let value = match name {
            "version.bind" => &self.version_bind,
            "hostname.bind" => &self.hostname_bind,
            "id.server" => &self.id_server,
            "authors.bind" => &self.authors_bind,
            _ => &None,
        };
        value.as_deref().filter(|v| !v.is_empty())
    }
}

/// Health checker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    /// Worker processes the supervisor forks for the health role.
    pub workers: usize,
    /// Probe loops per process.
    pub handlers: usize,
    /// Probe timeout in seconds.
    pub ttl: u64,
    /// Re-enqueue delay in seconds: the earliest the same target is probed
    /// again.
    pub delay: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 1,
            handlers: 2,
            ttl: 30,
            delay: 60,
        }
    }
}

/// Key store endpoints. Reads may go to a follower when configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    pub read_url: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            read_url: None,
        }
    }
}
