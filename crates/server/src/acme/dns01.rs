//! dns-01 challenge publication through the zone store
//!
//! The authoritative server publishes its own challenges: `set` writes the
//! `_acme-challenge` TXT straight into the zone store with a bounded TTL,
//! so stale challenges garbage-collect themselves, and `remove` cleans up
//! eagerly after validation.

use serde_json::json;
use tracing::debug;

use pendingdns_store::{names, RecordSource, RecordType, RecordValue, StoreResult, ZoneStore};

/// Label prefixed to a domain to form its challenge record name.
pub const ACME_CHALLENGE_LABEL: &str = "_acme-challenge";

/// Expire-on-write TTL for challenge records.
pub const CHALLENGE_TTL_SECS: u64 = 3600;

/// Zone-store-backed challenge publication. Injected into the certificate
/// manager at construction time; this is the only path from the ACME side
/// into the zone store.
#[derive(Clone)]
pub struct ChallengePublisher {
    zone: ZoneStore,
}

impl ChallengePublisher {
    pub fn new(zone: ZoneStore) -> Self {
        Self { zone }
    }

    /// Unique set of zones the given hosts resolve into, in input order.
    /// Hosts outside every stored zone are skipped.
    pub async fn zones(&self, hosts: &[String]) -> StoreResult<Vec<String>> {
        let mut zones = Vec::new();
        for host in hosts {
            let bare = host.strip_prefix("*.").unwrap_or(host);
            if let Some(zone) = self.zone.resolve_zone(bare).await? {
                if !zones.contains(&zone) {
                    zones.push(zone);
                }
            }
        }
        Ok(zones)
    }

    /// Publish a challenge TXT under `dns_prefix` within `dns_zone`.
    pub async fn set(
        &self,
        dns_zone: &str,
        dns_prefix: &str,
        dns_authorization: &str,
    ) -> StoreResult<bool> {
        debug!(zone = %dns_zone, prefix = %dns_prefix, "publishing dns-01 challenge record");
        let id = self
            .zone
            .add(
                dns_zone,
                dns_prefix,
                RecordType::Txt,
                &json!([dns_authorization]),
                Some(CHALLENGE_TTL_SECS),
            )
            .await?;
        Ok(id.is_some())
    }

    /// First challenge value currently published at `dns_host`. Challenge
    /// values are base64url text, so non-UTF-8 TXT data is never a match.
    pub async fn get(&self, dns_host: &str) -> StoreResult<Option<String>> {
        let rows = self.zone.resolve(dns_host, RecordType::Txt, true).await?;
        Ok(rows.into_iter().find_map(|row| match row.value {
            RecordValue::Txt { data } => String::from_utf8(data).ok(),
            _ => None,
        }))
    }

    /// Drop every challenge record at `dns_host`.
    pub async fn remove(&self, dns_host: &str) -> StoreResult<usize> {
        debug!(host = %dns_host, "removing dns-01 challenge records");
        self.zone
            .delete_by_domain(dns_host, RecordType::Txt, None)
            .await
    }

    /// Challenge record prefix for `domain` relative to `zone`:
    /// `_acme-challenge` at the apex, `_acme-challenge.<sub>` below it.
    pub fn challenge_prefix(domain: &str, zone: &str) -> String {
        let bare = domain.strip_prefix("*.").unwrap_or(domain);
        match names::subdomain_of(bare, zone) {
            Some("") | None => ACME_CHALLENGE_LABEL.to_string(),
            Some(sub) => format!("{}.{}", ACME_CHALLENGE_LABEL, sub),
        }
    }

    /// Full challenge record name for a domain.
    pub fn challenge_fqdn(domain: &str) -> String {
        let bare = domain.strip_prefix("*.").unwrap_or(domain);
        format!("{}.{}", ACME_CHALLENGE_LABEL, bare)
    }
}
