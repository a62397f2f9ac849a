//! Certificate manager
//!
//! `get_certificate` is the only entry point the public server and the REST
//! collaborator see. It folds together admissibility checking, the cache,
//! cluster-wide mutual exclusion, issuance and background renewal. All
//! durable state lives in the key store; this type only holds collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use md5::{Digest, Md5};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use pendingdns_common::observability::metrics;
use pendingdns_config::Config;
use pendingdns_store::certs::{CertStorage, LockGuard, StoredCert};
use pendingdns_store::{names, ExternalResolver, LookupKind, RecordSource, ZoneStore};

use super::client::AcmeClient;
use super::dns01::ChallengePublisher;
use super::error::AcmeError;
use super::propagation::{PropagationChecker, PropagationConfig};

/// Certificates inside this window are served stale and renewed in the
/// background.
const RENEW_WINDOW_DAYS: i64 = 30;
/// Wait budget for the per-domain-set issuance lock.
const LOCK_WAIT: Duration = Duration::from_secs(180);
/// Lease on the issuance lock.
const LOCK_LEASE: Duration = Duration::from_secs(180);
/// Failure cooldown before issuance is retried for a domain set.
const FAILURE_COOLDOWN: Duration = Duration::from_secs(3600);
/// Cadence of the background renewal sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Certificate material handed to callers.
#[derive(Debug, Clone)]
pub struct CertData {
    pub dns_names: Vec<String>,
    pub key: String,
    pub cert: String,
    pub chain: String,
    pub valid_from: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

impl From<StoredCert> for CertData {
    fn from(stored: StoredCert) -> Self {
        Self {
            dns_names: stored.dns_names,
            key: stored.key,
            cert: stored.cert,
            chain: stored.chain,
            valid_from: stored.valid_from,
            expires: stored.expires,
        }
    }
}

/// Issues and caches certificates via ACME dns-01.
pub struct CertManager {
    zone: ZoneStore,
    external: Arc<dyn ExternalResolver>,
    storage: CertStorage,
    client: AcmeClient,
    publisher: ChallengePublisher,
    propagation: PropagationChecker,
    ns_domains: Vec<String>,
}

impl CertManager {
    /// Wire the manager from its collaborators. The zone store is injected
    /// here, never reached through a global, so the ACME→store edge stays a
    /// one-way construction-time dependency.
    pub fn new(
        zone: ZoneStore,
        external: Arc<dyn ExternalResolver>,
        config: &Config,
    ) -> Arc<Self> {
        let storage = CertStorage::new(zone.keystore().clone());
        let client = AcmeClient::new(config.acme.clone(), storage.clone());
        let publisher = ChallengePublisher::new(zone.clone());
        let nameservers = config
            .ns
            .iter()
            .filter_map(|ns| ns.ip.parse().ok())
            .collect();
        let propagation = PropagationChecker::new(PropagationConfig {
            nameservers,
            ..PropagationConfig::default()
        });
        let ns_domains = config
            .ns
            .iter()
            .map(|ns| ns.domain.to_ascii_lowercase())
            .collect();

        Arc::new(Self {
            zone,
            external,
            storage,
            client,
            publisher,
            propagation,
            ns_domains,
        })
    }

    /// Obtain a certificate for the given domains, from cache or by
    /// issuance. See the module docs for the full contract.
    pub async fn get_certificate(
        self: &Arc<Self>,
        domains: &[String],
        force: bool,
    ) -> Result<CertData, AcmeError> {
        let mut admissible = self.admissible_domains(domains).await;
        if admissible.is_empty() {
            return Err(AcmeError::NoValidDomains);
        }
        admissible.sort();
        admissible.dedup();
        let hash = cache_hash(&admissible);

        if !force {
            if let Some(stored) = self.storage.load(&hash).await? {
                if !within_renew_window(&stored) {
                    metrics().certificates.with_label_values(&["cache_hit"]).inc();
                    return Ok(stored.into());
                }
                // Still valid but close to expiry: hand out the stale cert
                // and renew behind the caller's back.
                debug!(hash = %hash, "certificate in renewal window; renewing in background");
                self.spawn_background_renewal(admissible.clone());
                metrics().certificates.with_label_values(&["renewing"]).inc();
                return Ok(stored.into());
            }
        }

        let lock_key = format!("d:lock:{}", hash);
        let guard = match LockGuard::acquire(
            self.zone.keystore(),
            &lock_key,
            LOCK_WAIT,
            LOCK_LEASE,
        )
        .await?
        {
            Some(guard) => guard,
            None => {
                // Another worker held the lock for the whole wait window;
                // whatever it produced is the best we have.
                if let Some(stored) = self.storage.load(&hash).await? {
                    return Ok(stored.into());
                }
                return Err(AcmeError::Timeout("issuance lock".to_string()));
            }
        };

        if !force {
            if let Some(stored) = self.storage.load(&hash).await? {
                if !within_renew_window(&stored) {
                    let _ = guard.release().await;
                    return Ok(stored.into());
                }
            }
        }

        if self.storage.cooldown_active(&hash).await? {
            let _ = guard.release().await;
            if let Some(stored) = self.storage.load(&hash).await? {
                return Ok(stored.into());
            }
            return Err(AcmeError::Cooldown);
        }

        let result = self.issue(&admissible, &hash).await;
        let _ = guard.release().await;

        match result {
            Ok(stored) => {
                metrics().certificates.with_label_values(&["issued"]).inc();
                self.storage.index_add(&admissible.join(":")).await.ok();
                Ok(stored.into())
            }
            Err(e) => {
                metrics().certificates.with_label_values(&["failed"]).inc();
                warn!(domains = ?admissible, error = %e, "certificate issuance failed");
                self.storage.set_cooldown(&hash, FAILURE_COOLDOWN).await.ok();
                if let Some(stored) = self.storage.load(&hash).await? {
                    return Ok(stored.into());
                }
                Err(e)
            }
        }
    }

    /// Certificate for an SNI name: the zone-or-parent pair
    /// `[base, *.base]`, from cache or by issuance.
    pub async fn load_certificate(self: &Arc<Self>, domain: &str) -> Option<CertData> {
        let norm = names::normalize_name(domain)?;
        let zone = self.zone.resolve_zone(&norm).await.ok().flatten()?;
        let domains = wildcard_domain_set(&norm, &zone)?;
        match self.get_certificate(&domains, false).await {
            Ok(cert) => Some(cert),
            Err(e) => {
                debug!(domain = %domain, error = %e, "no certificate available");
                None
            }
        }
    }

    /// Periodically re-examine every cached certificate and renew the ones
    /// inside the renewal window.
    pub fn spawn_renewal_sweep(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(60)).await;
            loop {
                if let Err(e) = manager.sweep_once().await {
                    warn!(error = %e, "certificate renewal sweep failed");
                }
                sleep(SWEEP_INTERVAL).await;
            }
        });
    }

    async fn sweep_once(self: &Arc<Self>) -> Result<(), AcmeError> {
        let members = self.storage.index_members().await?;
        debug!(count = members.len(), "running certificate renewal sweep");

        for member in members {
            let domains: Vec<String> = member.split(':').map(str::to_string).collect();
            let hash = cache_hash(&domains);
            match self.storage.load(&hash).await? {
                None => {
                    // The cache entry expired with its certificate.
                    self.storage.index_remove(&member).await.ok();
                }
                Some(stored) if within_renew_window(&stored) => {
                    info!(domains = ?domains, expires = %stored.expires, "renewing certificate from sweep");
                    if let Err(e) = self.get_certificate(&domains, true).await {
                        warn!(domains = ?domains, error = %e, "sweep renewal failed");
                    }
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn spawn_background_renewal(self: &Arc<Self>, domains: Vec<String>) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.get_certificate(&domains, true).await {
                warn!(domains = ?domains, error = %e, "background renewal failed");
            }
        });
    }

    /// Domains that survive normalization, zone resolution and the NS
    /// delegation check. Inadmissible names are dropped with a warning.
    async fn admissible_domains(&self, domains: &[String]) -> Vec<String> {
        let mut admissible = Vec::new();
        let mut zone_status: HashMap<String, bool> = HashMap::new();

        for domain in domains {
            let Some(norm) = names::normalize_name(domain) else {
                warn!(domain = %domain, "dropping unparseable domain");
                continue;
            };
            let bare = norm.strip_prefix("*.").unwrap_or(&norm).to_string();
            let zone = match self.zone.resolve_zone(&bare).await {
                Ok(Some(zone)) => zone,
                _ => {
                    warn!(domain = %norm, "dropping domain outside every stored zone");
                    continue;
                }
            };
            let delegated = match zone_status.get(&zone) {
                Some(ok) => *ok,
                None => {
                    let ok = self.check_ns_status(&zone).await;
                    zone_status.insert(zone.clone(), ok);
                    ok
                }
            };
            if delegated {
                admissible.push(norm);
            } else {
                warn!(domain = %norm, zone = %zone, "dropping domain; NS delegation does not match");
            }
        }
        admissible
    }

    /// The zone's public NS delegation must consist of our configured
    /// nameservers: no unknowns, at least one known.
    async fn check_ns_status(&self, zone: &str) -> bool {
        match self.external.resolve(zone, LookupKind::Ns).await {
            Ok(ns_names) => ns_delegation_ok(&ns_names, &self.ns_domains),
            Err(e) => {
                warn!(zone = %zone, error = %e, "NS delegation lookup failed");
                false
            }
        }
    }

    async fn issue(&self, domains: &[String], hash: &str) -> Result<StoredCert, AcmeError> {
        let key_pem = match self.storage.stored_key(hash).await? {
            Some(pem) => pem,
            None => {
                debug!(hash = %hash, "generating new RSA key");
                let pem = tokio::task::spawn_blocking(generate_rsa_key_pem)
                    .await
                    .map_err(|e| AcmeError::KeyGeneration(e.to_string()))??;
                self.storage.save_key(hash, &pem).await?;
                pem
            }
        };

        let (mut order, challenges) = self.client.create_order(domains).await?;

        let mut published = Vec::new();
        let validation = self
            .publish_and_validate(&mut order, &challenges, &mut published)
            .await;
        for fqdn in &published {
            if let Err(e) = self.publisher.remove(fqdn).await {
                warn!(record = %fqdn, error = %e, "challenge cleanup failed");
            }
        }
        validation?;

        let chain_pem = self.client.finalize(&mut order, domains, &key_pem).await?;
        let meta = parse_certificate(&chain_pem)?;
        let (leaf, rest) = split_chain(&chain_pem);

        let stored = StoredCert {
            key: key_pem,
            cert: leaf,
            chain: rest,
            valid_from: meta.valid_from,
            expires: meta.expires,
            dns_names: meta.dns_names,
            issuer: meta.issuer,
            created: Utc::now(),
            status: "valid".to_string(),
        };
        self.storage.save(hash, &stored).await?;
        info!(domains = ?domains, expires = %stored.expires, "certificate issued");
        Ok(stored)
    }

    async fn publish_and_validate(
        &self,
        order: &mut instant_acme::Order,
        challenges: &[super::client::DnsChallenge],
        published: &mut Vec<String>,
    ) -> Result<(), AcmeError> {
        for challenge in challenges {
            let bare = challenge.domain.strip_prefix("*.").unwrap_or(&challenge.domain);
            let zone = self
                .zone
                .resolve_zone(bare)
                .await?
                .ok_or_else(|| AcmeError::ChallengeValidation {
                    domain: challenge.domain.clone(),
                    message: "no stored zone".to_string(),
                })?;
            let prefix = ChallengePublisher::challenge_prefix(&challenge.domain, &zone);
            if !self
                .publisher
                .set(&zone, &prefix, &challenge.record_value)
                .await?
            {
                return Err(AcmeError::ChallengeValidation {
                    domain: challenge.domain.clone(),
                    message: "challenge record rejected by zone store".to_string(),
                });
            }
            let fqdn = ChallengePublisher::challenge_fqdn(&challenge.domain);
            published.push(fqdn.clone());

            self.propagation
                .wait_for_txt(&fqdn, &challenge.record_value)
                .await?;
            self.client.set_challenge_ready(order, &challenge.url).await?;
        }

        self.client.wait_for_order_ready(order).await
    }
}

/// md5 over the sorted domain list joined with `:`, hex-encoded.
fn cache_hash(sorted_domains: &[String]) -> String {
    hex::encode(Md5::digest(sorted_domains.join(":").as_bytes()))
}

fn within_renew_window(stored: &StoredCert) -> bool {
    stored.expires <= Utc::now() + ChronoDuration::days(RENEW_WINDOW_DAYS)
}

/// The domain pair issued for an SNI name: the zone (or the name's parent
/// below the zone) plus its wildcard.
fn wildcard_domain_set(domain: &str, zone: &str) -> Option<Vec<String>> {
    let base = if domain == zone {
        domain.to_string()
    } else {
        domain.split_once('.')?.1.to_string()
    };
    Some(vec![base.clone(), format!("*.{}", base)])
}

/// Delegation is acceptable when every advertised NS is one of ours and at
/// least one is present.
fn ns_delegation_ok(advertised: &[String], configured: &[String]) -> bool {
    if advertised.is_empty() {
        return false;
    }
    let mut valid = 0;
    for ns in advertised {
        let lowered = ns.trim_end_matches('.').to_ascii_lowercase();
        if configured.contains(&lowered) {
            valid += 1;
        } else {
            return false;
        }
    }
    valid >= 1
}

fn generate_rsa_key_pem() -> Result<String, AcmeError> {
    let rsa = openssl::rsa::Rsa::generate(2048)
        .map_err(|e| AcmeError::KeyGeneration(e.to_string()))?;
    let pkey = openssl::pkey::PKey::from_rsa(rsa)
        .map_err(|e| AcmeError::KeyGeneration(e.to_string()))?;
    let pem = pkey
        .private_key_to_pem_pkcs8()
        .map_err(|e| AcmeError::KeyGeneration(e.to_string()))?;
    String::from_utf8(pem).map_err(|e| AcmeError::KeyGeneration(e.to_string()))
}

struct CertMeta {
    valid_from: DateTime<Utc>,
    expires: DateTime<Utc>,
    issuer: String,
    dns_names: Vec<String>,
}

/// Extract metadata from the leaf (first PEM block) of an issued chain.
fn parse_certificate(chain_pem: &str) -> Result<CertMeta, AcmeError> {
    use x509_parser::prelude::*;

    let (_, pem) = parse_x509_pem(chain_pem.as_bytes())
        .map_err(|e| AcmeError::CertificateParse(format!("pem: {}", e)))?;
    let (_, cert) = X509Certificate::from_der(&pem.contents)
        .map_err(|e| AcmeError::CertificateParse(format!("der: {}", e)))?;

    let valid_from = DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
        .ok_or_else(|| AcmeError::CertificateParse("invalid notBefore".to_string()))?;
    let expires = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| AcmeError::CertificateParse("invalid notAfter".to_string()))?;

    let mut dns_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                dns_names.push(dns.to_string());
            }
        }
    }

    Ok(CertMeta {
        valid_from,
        expires,
        issuer: cert.issuer().to_string(),
        dns_names,
    })
}

/// Split an issued chain into the leaf PEM and the remaining chain PEM.
fn split_chain(full: &str) -> (String, String) {
    const MARKER: &str = "-----BEGIN CERTIFICATE-----";
    match full.match_indices(MARKER).nth(1) {
        Some((idx, _)) => (
            full[..idx].trim_end().to_string(),
            full[idx..].trim_end().to_string(),
        ),
        None => (full.trim_end().to_string(), String::new()),
    }
}
