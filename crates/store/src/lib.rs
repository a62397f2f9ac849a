//! Redis-backed persistence for PendingDNS
//!
//! Everything durable lives behind the [`KeyStore`]: resource records and
//! the per-zone index, health scheduling state, the external-resolution
//! cache, certificate material and the cluster-wide TLS session tickets.
//! The higher layers (DNS handler, health checker, certificate manager,
//! public server) keep no durable state of their own.
//!
//! Key layout, all under the `d:` prefix:
//!
//! * `d:<reversed-name>:r:<TYPE>` — hash of `hid` → JSON value tuple
//! * `d:<reversed-zone>:z` — set of record keys belonging to the zone
//! * `d:health:z` / `d:health:r` — probe schedule (sorted set) and results
//! * `d:cache:<target>:<TYPE>` — external resolver cache
//! * `d:acme:account:<key>`, `d:acme:keys:<md5>` — ACME material
//! * `d:lock:*` — distributed locks
//! * `d:tls:<hex>` — TLS session tickets

pub mod certs;
pub mod errors;
pub mod keystore;
pub mod names;
pub mod record;
pub mod resolver;
pub mod tickets;
pub mod zone;

pub use errors::{StoreError, StoreResult};
pub use keystore::KeyStore;
pub use record::{CaaTag, RecordType, RecordValue, StoredRecord};
pub use resolver::{CachedResolver, ExternalResolver, LookupKind, ResolveOpts};
pub use zone::{RecordSource, ZoneStore};
