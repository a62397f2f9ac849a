//! Zone store: record lifecycle, lookup and wildcard fallback
//!
//! Records live in hashes keyed by reversed name and type; each zone keeps a
//! set of its record keys so `list` can enumerate without scanning. The
//! wildcard fallback swaps the query's left-most label for `*` and retries —
//! exact matches always win. Address records with a health-check URI are
//! mirrored into the probe schedule on every write.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use futures::future;
use serde_json::Value;
use tracing::{debug, warn};

use pendingdns_common::types::HealthState;

use crate::errors::StoreResult;
use crate::keystore::KeyStore;
use crate::names::{
    build_id, join_name, normalize_name, normalize_subdomain, parse_id, parse_record_key,
    record_key, reverse_name, subdomain_of, unreverse_name, wildcard_name, zone_index_key,
};
use crate::record::{RecordType, RecordValue, StoredRecord};

/// Sorted set scheduling health probes; score is the next-due epoch-ms.
pub const HEALTH_QUEUE_KEY: &str = "d:health:z";
/// Hash of probe results keyed by `<reversed-zone>:<record-id>`.
pub const HEALTH_RESULT_KEY: &str = "d:health:r";

/// How many fresh hids to try before giving up on an add.
const HID_ATTEMPTS: usize = 3;

/// Read-only record lookup, the seam between the query path and storage.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Two-stage lookup (exact, then wildcard) for one name and type.
    /// An empty vector means no record exists.
    async fn resolve(
        &self,
        domain: &str,
        rtype: RecordType,
        short: bool,
    ) -> StoreResult<Vec<StoredRecord>>;

    /// Longest stored zone the name falls under.
    async fn resolve_zone(&self, name: &str) -> StoreResult<Option<String>>;
}

/// All record lifecycle and lookup logic on top of the key store.
#[derive(Clone)]
pub struct ZoneStore {
    ks: KeyStore,
}

impl ZoneStore {
    pub fn new(ks: KeyStore) -> Self {
        Self { ks }
    }

    pub fn keystore(&self) -> &KeyStore {
        &self.ks
    }

    /// Every record of a zone, ordered by type rank then reversed-name.
    ///
    /// Record keys whose hash has disappeared are swept out of the index as
    /// a side effect. Health status is attached to address records that
    /// carry a check URI.
    pub async fn list(&self, zone: &str) -> StoreResult<Vec<StoredRecord>> {
        let zone = match normalize_name(zone) {
            Some(zone) => zone,
            None => return Ok(Vec::new()),
        };
        let rev_zone = reverse_name(&zone);
        let index_key = zone_index_key(&rev_zone);

        let keys = self.ks.smembers(&index_key).await?;
        let fetches = keys.iter().map(|key| self.ks.hgetall(key));
        let hashes = future::try_join_all(fetches).await?;

        let mut records = Vec::new();
        for (key, hash) in keys.iter().zip(hashes) {
            if hash.is_empty() {
                debug!(key = %key, zone = %zone, "sweeping empty record key from zone index");
                self.ks.srem(&index_key, key).await?;
                continue;
            }
            let (rev_name, rtype) = match parse_record_key(key) {
                Some(parsed) => parsed,
                None => {
                    warn!(key = %key, "unparseable record key in zone index");
                    continue;
                }
            };
            records.extend(rows_from_hash(&rev_name, rtype, &hash, &zone, false, None));
        }

        records.sort_by(|a, b| {
            a.rtype
                .sort_rank()
                .cmp(&b.rtype.sort_rank())
                .then_with(|| reverse_name(&a.name).cmp(&reverse_name(&b.name)))
                .then_with(|| mx_priority(a).cmp(&mx_priority(b)))
        });

        self.attach_health(&rev_zone, &mut records).await?;
        Ok(records)
    }

    /// Store a new record. Returns the new id, or `None` when the input is
    /// rejected (bad name, malformed value, wildcard in the wrong place).
    pub async fn add(
        &self,
        zone: &str,
        subdomain: &str,
        rtype: RecordType,
        value: &Value,
        expire: Option<u64>,
    ) -> StoreResult<Option<String>> {
        let zone = match normalize_name(zone) {
            Some(zone) => zone,
            None => return Ok(None),
        };
        let subdomain = match normalize_subdomain(subdomain) {
            Some(subdomain) => subdomain,
            None => return Ok(None),
        };
        let value = match RecordValue::from_json(rtype, value) {
            Some(value) => value,
            None => return Ok(None),
        };

        let name = join_name(&subdomain, &zone);
        if !wildcard_position_ok(&name) {
            return Ok(None);
        }

        let rev_name = reverse_name(&name);
        let rev_zone = reverse_name(&zone);
        let key = record_key(&rev_name, rtype);
        let index_key = zone_index_key(&rev_zone);
        let encoded = value.to_json().to_string();

        let mut stored_hid = None;
        for _ in 0..HID_ATTEMPTS {
            let hid = crate::names::fresh_hid();
            if self
                .ks
                .hset_nx_indexed(&key, &hid, &encoded, &index_key)
                .await?
            {
                stored_hid = Some(hid);
                break;
            }
        }
        let hid = match stored_hid {
            Some(hid) => hid,
            // Astronomically unlikely; treat as rejected rather than erroring.
            None => return Ok(None),
        };

        if let Some(secs) = expire {
            self.ks.expire(&key, secs as i64).await?;
        }

        let id = build_id(&rev_name, rtype, &hid);
        self.sync_health_queue(&rev_zone, &id, &value).await?;

        Ok(Some(id))
    }

    /// Overwrite a record in place, or move it when the name or type
    /// changed (the id changes in that case). Returns the current id.
    pub async fn update(
        &self,
        zone: &str,
        id: &str,
        subdomain: &str,
        rtype: RecordType,
        value: &Value,
    ) -> StoreResult<Option<String>> {
        let (old_rev_name, old_rtype, hid) = match parse_id(id) {
            Some(parsed) => parsed,
            None => return Ok(None),
        };
        let zone_norm = match normalize_name(zone) {
            Some(zone) => zone,
            None => return Ok(None),
        };
        let subdomain = match normalize_subdomain(subdomain) {
            Some(subdomain) => subdomain,
            None => return Ok(None),
        };
        let typed = match RecordValue::from_json(rtype, value) {
            Some(typed) => typed,
            None => return Ok(None),
        };

        let name = join_name(&subdomain, &zone_norm);
        let rev_name = reverse_name(&name);

        if rev_name != old_rev_name || rtype != old_rtype {
            // Name or type moved: delete then re-add under a fresh id.
            self.delete(zone, id).await?;
            return self.add(zone, &subdomain, rtype, value, None).await;
        }

        let rev_zone = reverse_name(&zone_norm);
        let key = record_key(&rev_name, rtype);
        let index_key = zone_index_key(&rev_zone);
        self.ks
            .hset_indexed(&key, &hid, &typed.to_json().to_string(), &index_key)
            .await?;
        self.sync_health_queue(&rev_zone, id, &typed).await?;

        Ok(Some(id.to_string()))
    }

    /// Delete by id. True iff the record field existed.
    pub async fn delete(&self, zone: &str, id: &str) -> StoreResult<bool> {
        let (rev_name, rtype, hid) = match parse_id(id) {
            Some(parsed) => parsed,
            None => return Ok(false),
        };
        let key = record_key(&rev_name, rtype);
        let existed = self.ks.hdel(&key, &hid).await?;

        if !self.ks.exists(&key).await? {
            if let Some(zone) = normalize_name(zone) {
                let index_key = zone_index_key(&reverse_name(&zone));
                self.ks.srem(&index_key, &key).await?;
            }
        }

        if let Some(zone) = normalize_name(zone) {
            let member = format!("{}:{}", reverse_name(&zone), id);
            self.ks.zrem(HEALTH_QUEUE_KEY, &member).await?;
            self.ks.hdel(HEALTH_RESULT_KEY, &member).await?;
        }

        Ok(existed)
    }

    /// Delete every record at an exact name and type, optionally filtered by
    /// JSON-equal value. Returns the number of fields that existed.
    pub async fn delete_by_domain(
        &self,
        domain: &str,
        rtype: RecordType,
        value_match: Option<&Value>,
    ) -> StoreResult<usize> {
        let name = match normalize_name(domain) {
            Some(name) => name,
            None => return Ok(0),
        };
        let rev_name = reverse_name(&name);
        let key = record_key(&rev_name, rtype);

        let hash = self.ks.hgetall(&key).await?;
        if hash.is_empty() {
            return Ok(0);
        }

        let zone = self.resolve_zone_inner(&name).await?;
        let mut removed = 0;
        for (hid, raw) in &hash {
            if let Some(expected) = value_match {
                let stored: Value = match serde_json::from_str(raw) {
                    Ok(stored) => stored,
                    Err(_) => continue,
                };
                if &stored != expected {
                    continue;
                }
            }
            if self.ks.hdel(&key, hid).await? {
                removed += 1;
            }
            if let Some(zone) = &zone {
                let rev_zone = reverse_name(zone);
                let member = format!("{}:{}", rev_zone, build_id(&rev_name, rtype, hid));
                self.ks.zrem(HEALTH_QUEUE_KEY, &member).await?;
                self.ks.hdel(HEALTH_RESULT_KEY, &member).await?;
            }
        }

        if removed > 0 && !self.ks.exists(&key).await? {
            if let Some(zone) = &zone {
                let index_key = zone_index_key(&reverse_name(zone));
                self.ks.srem(&index_key, &key).await?;
            }
        }

        Ok(removed)
    }

    /// Fetch one record hash field, as the health checker sees it.
    pub async fn fetch_value(
        &self,
        rev_name: &str,
        rtype: RecordType,
        hid: &str,
    ) -> StoreResult<Option<RecordValue>> {
        let key = record_key(rev_name, rtype);
        let raw = match self.ks.hget(&key, hid).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let json: Value = serde_json::from_str(&raw)?;
        Ok(RecordValue::from_json(rtype, &json))
    }

    async fn resolve_inner(
        &self,
        domain: &str,
        rtype: RecordType,
        short: bool,
    ) -> StoreResult<Vec<StoredRecord>> {
        let name = match normalize_name(domain) {
            Some(name) => name,
            None => return Ok(Vec::new()),
        };
        let rev_name = reverse_name(&name);

        let exact_key = record_key(&rev_name, rtype);
        let mut hash = self.ks.hgetall(&exact_key).await?;
        let mut stored_rev = rev_name.clone();
        let mut wildcard = None;

        if hash.is_empty() {
            if let Some(wname) = wildcard_name(&name) {
                let wrev = reverse_name(&wname);
                let whash = self.ks.hgetall(&record_key(&wrev, rtype)).await?;
                if !whash.is_empty() {
                    hash = whash;
                    stored_rev = wrev;
                    wildcard = Some(wname);
                }
            }
        }

        if hash.is_empty() {
            return Ok(Vec::new());
        }

        let zone = self.resolve_zone_inner(&name).await?;
        let mut records = rows_from_hash(
            &stored_rev,
            rtype,
            &hash,
            zone.as_deref().unwrap_or_default(),
            short,
            wildcard.as_deref(),
        );
        for record in &mut records {
            record.name = name.clone();
        }

        if let Some(zone) = &zone {
            self.attach_health(&reverse_name(zone), &mut records).await?;
        }

        Ok(records)
    }

    async fn resolve_zone_inner(&self, name: &str) -> StoreResult<Option<String>> {
        let labels: Vec<&str> = name.split('.').collect();
        if labels.len() < 2 {
            return Ok(None);
        }
        // Walk suffixes longest-first. The two rightmost labels are treated
        // as one unit, so a bare TLD is never probed as a zone; see
        // DESIGN.md for the public-suffix trade-off this inherits.
        for start in 0..=labels.len() - 2 {
            let candidate = labels[start..].join(".");
            let key = zone_index_key(&reverse_name(&candidate));
            if self.ks.exists(&key).await? {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    async fn attach_health(
        &self,
        rev_zone: &str,
        records: &mut [StoredRecord],
    ) -> StoreResult<()> {
        for record in records.iter_mut() {
            if !record.rtype.is_address() || record.value.health_check_uri().is_none() {
                continue;
            }
            let member = format!("{}:{}", rev_zone, record.stored_id());
            if let Some(raw) = self.ks.hget(HEALTH_RESULT_KEY, &member).await? {
                match serde_json::from_str::<HealthState>(&raw) {
                    Ok(state) => record.health = Some(state),
                    Err(_) => warn!(member = %member, "unreadable health result dropped"),
                }
            }
        }
        Ok(())
    }

    async fn sync_health_queue(
        &self,
        rev_zone: &str,
        id: &str,
        value: &RecordValue,
    ) -> StoreResult<()> {
        let member = format!("{}:{}", rev_zone, id);
        if value.health_check_uri().is_some() {
            self.ks
                .zadd(HEALTH_QUEUE_KEY, &member, Utc::now().timestamp_millis())
                .await?;
        } else {
            self.ks.zrem(HEALTH_QUEUE_KEY, &member).await?;
            self.ks.hdel(HEALTH_RESULT_KEY, &member).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RecordSource for ZoneStore {
    async fn resolve(
        &self,
        domain: &str,
        rtype: RecordType,
        short: bool,
    ) -> StoreResult<Vec<StoredRecord>> {
        self.resolve_inner(domain, rtype, short).await
    }

    async fn resolve_zone(&self, name: &str) -> StoreResult<Option<String>> {
        let name = match normalize_name(name) {
            Some(name) => name,
            None => return Ok(None),
        };
        self.resolve_zone_inner(&name).await
    }
}

impl StoredRecord {
    /// Identifier of the stored row, independent of short mode. For
    /// wildcard matches this is the id of the wildcard record itself.
    fn stored_id(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => {
                let stored_name = self.wildcard.as_deref().unwrap_or(&self.name);
                build_id(&reverse_name(stored_name), self.rtype, &self.hid)
            }
        }
    }
}

/// Priority tiebreak so same-name MX entries list in delivery order.
fn mx_priority(record: &StoredRecord) -> u16 {
    match &record.value {
        RecordValue::Mx { priority, .. } => *priority,
        _ => 0,
    }
}

/// A `*` label is only permitted at the left-most position of a name.
fn wildcard_position_ok(name: &str) -> bool {
    match name.find('*') {
        None => true,
        Some(_) => {
            let mut labels = name.split('.');
            let first = labels.next().unwrap_or_default();
            (first == "*") && !labels.any(|label| label.contains('*'))
        }
    }
}

/// Decode every parseable field of a record hash into rows.
fn rows_from_hash(
    rev_name: &str,
    rtype: RecordType,
    hash: &HashMap<String, String>,
    zone: &str,
    short: bool,
    wildcard: Option<&str>,
) -> Vec<StoredRecord> {
    let name = unreverse_name(rev_name);
    let mut rows = Vec::with_capacity(hash.len());
    for (hid, raw) in hash {
        let json: Value = match serde_json::from_str(raw) {
            Ok(json) => json,
            Err(_) => {
                warn!(name = %name, rtype = %rtype, hid = %hid, "unparseable record value skipped");
                continue;
            }
        };
        let value = match RecordValue::from_json(rtype, &json) {
            Some(value) => value,
            None => {
                warn!(name = %name, rtype = %rtype, hid = %hid, "malformed record tuple skipped");
                continue;
            }
        };
        let (id, zone_field, subdomain) = if short {
            (None, None, None)
        } else {
            (
                Some(build_id(rev_name, rtype, hid)),
                (!zone.is_empty()).then(|| zone.to_string()),
                subdomain_of(&name, zone).map(str::to_string),
            )
        };
        rows.push(StoredRecord {
            name: name.clone(),
            rtype,
            value,
            hid: hid.clone(),
            id,
            zone: zone_field,
            subdomain,
            wildcard: wildcard.map(str::to_string),
            health: None,
        });
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wildcard_position() {
        assert!(wildcard_position_ok("www.example.com"));
        assert!(wildcard_position_ok("*.example.com"));
        assert!(wildcard_position_ok("*.test.example.com"));
        assert!(!wildcard_position_ok("www.*.example.com"));
        assert!(!wildcard_position_ok("w*w.example.com"));
        assert!(!wildcard_position_ok("*.*.example.com"));
    }

    #[test]
    fn test_rows_from_hash_builds_ids() {
        let mut hash = HashMap::new();
        hash.insert("abc123".to_string(), json!(["192.0.2.1"]).to_string());
        let rows = rows_from_hash(
            "com.example.www",
            RecordType::A,
            &hash,
            "example.com",
            false,
            None,
        );
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.name, "www.example.com");
        assert_eq!(row.subdomain.as_deref(), Some("www"));
        assert_eq!(row.zone.as_deref(), Some("example.com"));
        let (rev, rtype, hid) = parse_id(row.id.as_ref().unwrap()).unwrap();
        assert_eq!(rev, "com.example.www");
        assert_eq!(rtype, RecordType::A);
        assert_eq!(hid, "abc123");
    }

    #[test]
    fn test_rows_from_hash_short_mode() {
        let mut hash = HashMap::new();
        hash.insert("abc123".to_string(), json!(["192.0.2.1"]).to_string());
        let rows = rows_from_hash(
            "com.example",
            RecordType::A,
            &hash,
            "example.com",
            true,
            None,
        );
        assert!(rows[0].id.is_none());
        assert!(rows[0].zone.is_none());
        assert!(rows[0].subdomain.is_none());
    }

    #[test]
    fn test_rows_from_hash_skips_garbage() {
        let mut hash = HashMap::new();
        hash.insert("ok".to_string(), json!(["192.0.2.1"]).to_string());
        hash.insert("broken".to_string(), "not json".to_string());
        hash.insert("wrong-shape".to_string(), json!({"a": 1}).to_string());
        let rows = rows_from_hash("com.example", RecordType::A, &hash, "example.com", true, None);
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_stored_id_uses_wildcard_name() {
        let record = StoredRecord {
            name: "sub.test.example.com".to_string(),
            rtype: RecordType::Cname,
            value: RecordValue::Cname {
                target: "example.com".to_string(),
            },
            hid: "h1".to_string(),
            id: None,
            zone: None,
            subdomain: None,
            wildcard: Some("*.test.example.com".to_string()),
            health: None,
        };
        let (rev, _, _) = parse_id(&record.stored_id()).unwrap();
        assert_eq!(rev, "com.example.test.*");
    }
}
