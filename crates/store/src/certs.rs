//! Certificate cache, ACME account material and distributed locks
//!
//! Certificates are cached per sorted-domain-set under
//! `d:acme:keys:<md5>` with a TTL equal to the certificate's remaining
//! validity, so an expired certificate garbage-collects itself. Issuance is
//! serialized cluster-wide with a `d:lock:` lease, and repeated failures are
//! damped with a short-lived cooldown key next to the cache entry.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::errors::StoreResult;
use crate::keystore::KeyStore;

/// Set of sorted-domain-set members with cached certificates, used by the
/// renewal sweep.
const CERT_INDEX_KEY: &str = "d:acme:index";

/// Poll interval while waiting on a lock.
const LOCK_RETRY: Duration = Duration::from_millis(500);

/// Cached certificate material and metadata.
#[derive(Debug, Clone)]
pub struct StoredCert {
    /// Private key PEM.
    pub key: String,
    /// Leaf certificate PEM.
    pub cert: String,
    /// Issuer chain PEM (may be empty).
    pub chain: String,
    pub valid_from: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub dns_names: Vec<String>,
    pub issuer: String,
    pub created: DateTime<Utc>,
    pub status: String,
}

/// Key-store backed certificate persistence.
#[derive(Clone)]
pub struct CertStorage {
    ks: KeyStore,
}

impl CertStorage {
    pub fn new(ks: KeyStore) -> Self {
        Self { ks }
    }

    fn cert_key(hash: &str) -> String {
        format!("d:acme:keys:{}", hash)
    }

    fn cooldown_key(hash: &str) -> String {
        format!("d:acme:keys:{}:lock", hash)
    }

    fn account_key(name: &str) -> String {
        format!("d:acme:account:{}", name)
    }

    /// Load a cached certificate; `None` when absent or incomplete.
    pub async fn load(&self, hash: &str) -> StoreResult<Option<StoredCert>> {
        let fields = self.ks.hgetall(&Self::cert_key(hash)).await?;
        Ok(Self::from_fields(fields))
    }

    fn from_fields(fields: HashMap<String, String>) -> Option<StoredCert> {
        let parse_time = |name: &str| {
            fields
                .get(name)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|t| t.with_timezone(&Utc))
        };
        let cert = fields.get("cert")?.clone();
        if cert.is_empty() {
            return None;
        }
        Some(StoredCert {
            key: fields.get("key").cloned().unwrap_or_default(),
            cert,
            chain: fields.get("chain").cloned().unwrap_or_default(),
            valid_from: parse_time("validFrom")?,
            expires: parse_time("expires")?,
            dns_names: fields
                .get("dnsNames")
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default(),
            issuer: fields.get("issuer").cloned().unwrap_or_default(),
            created: parse_time("created").unwrap_or_else(Utc::now),
            status: fields.get("status").cloned().unwrap_or_default(),
        })
    }

    /// Persist a certificate. The hash key expires with the certificate.
    pub async fn save(&self, hash: &str, cert: &StoredCert) -> StoreResult<()> {
        let key = Self::cert_key(hash);
        let dns_names = serde_json::to_string(&cert.dns_names)?;
        self.ks
            .hset_map(
                &key,
                &[
                    ("key", cert.key.clone()),
                    ("cert", cert.cert.clone()),
                    ("chain", cert.chain.clone()),
                    ("validFrom", cert.valid_from.to_rfc3339()),
                    ("expires", cert.expires.to_rfc3339()),
                    ("dnsNames", dns_names),
                    ("issuer", cert.issuer.clone()),
                    ("lastCheck", Utc::now().to_rfc3339()),
                    ("created", cert.created.to_rfc3339()),
                    ("status", cert.status.clone()),
                ],
            )
            .await?;

        let remaining = (cert.expires - Utc::now()).num_seconds();
        if remaining > 0 {
            self.ks.expire(&key, remaining).await?;
        }
        Ok(())
    }

    /// Reusable private key stored for this domain set, if any.
    pub async fn stored_key(&self, hash: &str) -> StoreResult<Option<String>> {
        Ok(self
            .ks
            .hget(&Self::cert_key(hash), "key")
            .await?
            .filter(|pem| !pem.is_empty()))
    }

    /// Persist a freshly generated private key ahead of issuance.
    pub async fn save_key(&self, hash: &str, pem: &str) -> StoreResult<()> {
        self.ks.hset(&Self::cert_key(hash), "key", pem).await
    }

    /// Stored ACME account credentials (JSON), if registered before.
    pub async fn account(&self, name: &str) -> StoreResult<Option<String>> {
        self.ks.hget(&Self::account_key(name), "account").await
    }

    /// Persist ACME account credentials.
    pub async fn save_account(&self, name: &str, credentials_json: &str) -> StoreResult<()> {
        self.ks
            .hset_map(
                &Self::account_key(name),
                &[
                    ("account", credentials_json.to_string()),
                    ("created", Utc::now().to_rfc3339()),
                ],
            )
            .await
    }

    /// Whether the failure cooldown for this domain set is still running.
    pub async fn cooldown_active(&self, hash: &str) -> StoreResult<bool> {
        self.ks.exists(&Self::cooldown_key(hash)).await
    }

    /// Start the failure cooldown.
    pub async fn set_cooldown(&self, hash: &str, ttl: Duration) -> StoreResult<()> {
        self.ks
            .set_ex(&Self::cooldown_key(hash), "1", ttl.as_secs())
            .await
    }

    /// Track a domain set for the background renewal sweep.
    pub async fn index_add(&self, member: &str) -> StoreResult<()> {
        self.ks.sadd(CERT_INDEX_KEY, member).await
    }

    pub async fn index_remove(&self, member: &str) -> StoreResult<()> {
        self.ks.srem(CERT_INDEX_KEY, member).await
    }

    pub async fn index_members(&self) -> StoreResult<Vec<String>> {
        self.ks.smembers(CERT_INDEX_KEY).await
    }
}

/// Holder of a distributed lease. Release explicitly; dropping without
/// releasing leaves the lease to expire on its own (and logs).
pub struct LockGuard {
    ks: KeyStore,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    /// Acquire `d:lock:<name>`-style lease, waiting up to `wait` and holding
    /// it for at most `lease`. `None` when the wait window closes first.
    pub async fn acquire(
        ks: &KeyStore,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> StoreResult<Option<LockGuard>> {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        let deadline = Instant::now() + wait;

        loop {
            if ks.set_nx_px(key, &token, lease.as_millis() as u64).await? {
                debug!(key = %key, "acquired lock");
                return Ok(Some(LockGuard {
                    ks: ks.clone(),
                    key: key.to_string(),
                    token,
                    released: false,
                }));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(LOCK_RETRY).await;
        }
    }

    /// Release the lease if we still own it.
    pub async fn release(mut self) -> StoreResult<()> {
        self.released = true;
        self.ks.del_if_equals(&self.key, &self.token).await?;
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            warn!(key = %self.key, "lock dropped without release; lease will expire on its own");
        }
    }
}
