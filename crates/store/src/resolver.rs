//! Cached external resolver
//!
//! Resolves foreign names (ANAME targets, NS delegation checks) through the
//! configured upstream resolvers and caches the outcome in the key store.
//! Hits are served from the cache while their logical TTL holds; the key
//! itself lives longer so a stale answer can paper over a flaky upstream.
//! Failures are cached too, briefly, so a dead target does not hammer the
//! upstreams on every query.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hickory_resolver::config::{NameServerConfig, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::{Resolver, TokioResolver};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{StoreError, StoreResult};
use crate::keystore::KeyStore;
use crate::names::normalize_name;

/// Query kinds the external resolver understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupKind {
    A,
    Aaaa,
    Ptr,
    Ns,
    Txt,
}

impl LookupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupKind::A => "A",
            LookupKind::Aaaa => "AAAA",
            LookupKind::Ptr => "PTR",
            LookupKind::Ns => "NS",
            LookupKind::Txt => "TXT",
        }
    }
}

/// Cache windows. The entry goes stale after `min_ttl`, the key survives
/// until `max_ttl` for stale fallback, failures persist for `err_ttl`.
#[derive(Debug, Clone, Copy)]
pub struct ResolveOpts {
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    pub err_ttl: Duration,
}

impl Default for ResolveOpts {
    fn default() -> Self {
        Self {
            min_ttl: Duration::from_secs(10 * 60),
            max_ttl: Duration::from_secs(8 * 3600),
            err_ttl: Duration::from_secs(60),
        }
    }
}

/// Seam for query-time external resolution; the DNS handler and the
/// certificate manager consume this, tests mock it.
#[async_trait]
pub trait ExternalResolver: Send + Sync {
    async fn resolve(&self, target: &str, kind: LookupKind) -> StoreResult<Vec<String>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    expires: i64,
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl CacheEntry {
    fn is_failure(&self) -> bool {
        self.data == Value::Bool(false)
    }

    fn strings(&self) -> Option<Vec<String>> {
        let array = self.data.as_array()?;
        Some(
            array
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
        )
    }
}

/// External resolver with a key-store cache in front.
pub struct CachedResolver {
    ks: KeyStore,
    resolver: TokioResolver,
    opts: ResolveOpts,
}

impl CachedResolver {
    /// Build against explicit upstream resolver addresses.
    pub fn new(ks: KeyStore, upstreams: &[IpAddr], opts: ResolveOpts) -> Self {
        let mut config = ResolverConfig::new();
        for ip in upstreams {
            config.add_name_server(NameServerConfig::new(
                SocketAddr::new(*ip, 53),
                Protocol::Udp,
            ));
        }

        let mut resolver_opts = ResolverOpts::default();
        resolver_opts.timeout = Duration::from_secs(5);
        resolver_opts.attempts = 2;

        let resolver =
            Resolver::builder_with_config(config, TokioConnectionProvider::default())
                .with_options(resolver_opts)
                .build();

        Self { ks, resolver, opts }
    }

    pub async fn resolve_with_opts(
        &self,
        target: &str,
        kind: LookupKind,
        opts: ResolveOpts,
    ) -> StoreResult<Vec<String>> {
        let target = match normalize_name(target) {
            Some(target) => target,
            None => return Ok(Vec::new()),
        };
        let key = format!("d:cache:{}:{}", target, kind.as_str());
        let now = Utc::now().timestamp_millis();

        let cached: Option<CacheEntry> = match self.ks.get(&key).await? {
            Some(raw) => serde_json::from_str(&raw).ok(),
            None => None,
        };

        if let Some(entry) = &cached {
            if entry.expires > now {
                if entry.is_failure() {
                    return Err(StoreError::upstream(
                        &target,
                        entry.error.clone().unwrap_or_else(|| "cached failure".into()),
                    ));
                }
                if let Some(data) = entry.strings() {
                    debug!(target = %target, kind = kind.as_str(), "external cache hit");
                    return Ok(data);
                }
            }
        }

        match self.query_upstream(&target, kind).await {
            Ok(data) => {
                let entry = CacheEntry {
                    expires: now + opts.min_ttl.as_millis() as i64,
                    data: Value::from(data.clone()),
                    error: None,
                    code: None,
                };
                self.ks
                    .set_ex(&key, &serde_json::to_string(&entry)?, opts.max_ttl.as_secs())
                    .await?;
                Ok(data)
            }
            Err(message) => {
                warn!(target = %target, kind = kind.as_str(), error = %message, "upstream resolution failed");
                let entry = CacheEntry {
                    expires: now + opts.err_ttl.as_millis() as i64,
                    data: Value::Bool(false),
                    error: Some(message.clone()),
                    code: None,
                };
                self.ks
                    .set_ex(&key, &serde_json::to_string(&entry)?, opts.err_ttl.as_secs())
                    .await?;

                // A stale positive answer beats an error.
                if let Some(stale) = cached.as_ref().filter(|e| !e.is_failure()) {
                    if let Some(data) = stale.strings() {
                        debug!(target = %target, "serving stale entry after upstream failure");
                        return Ok(data);
                    }
                }
                Err(StoreError::upstream(&target, message))
            }
        }
    }

    async fn query_upstream(&self, target: &str, kind: LookupKind) -> Result<Vec<String>, String> {
        match kind {
            LookupKind::A => self
                .resolver
                .ipv4_lookup(target)
                .await
                .map(|lookup| lookup.iter().map(|a| a.to_string()).collect())
                .map_err(|e| e.to_string()),
            LookupKind::Aaaa => self
                .resolver
                .ipv6_lookup(target)
                .await
                .map(|lookup| lookup.iter().map(|a| a.to_string()).collect())
                .map_err(|e| e.to_string()),
            LookupKind::Ptr => {
                let ip: IpAddr = target.parse().map_err(|_| "not an ip address".to_string())?;
                self.resolver
                    .reverse_lookup(ip)
                    .await
                    .map(|lookup| {
                        lookup
                            .iter()
                            .map(|ptr| ptr.0.to_utf8().trim_end_matches('.').to_string())
                            .collect()
                    })
                    .map_err(|e| e.to_string())
            }
            LookupKind::Ns => self
                .resolver
                .ns_lookup(target)
                .await
                .map(|lookup| {
                    lookup
                        .iter()
                        .map(|ns| ns.0.to_utf8().trim_end_matches('.').to_string())
                        .collect()
                })
                .map_err(|e| e.to_string()),
            LookupKind::Txt => self
                .resolver
                .txt_lookup(target)
                .await
                .map(|lookup| {
                    lookup
                        .iter()
                        .map(|txt| {
                            txt.txt_data()
                                .iter()
                                .map(|part| String::from_utf8_lossy(part).into_owned())
                                .collect::<String>()
                        })
                        .collect()
                })
                .map_err(|e| e.to_string()),
        }
    }
}

#[async_trait]
impl ExternalResolver for CachedResolver {
    async fn resolve(&self, target: &str, kind: LookupKind) -> StoreResult<Vec<String>> {
        self.resolve_with_opts(target, kind, self.opts).await
    }
}
