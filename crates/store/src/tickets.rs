//! Cluster-wide TLS session cache
//!
//! Worker processes on one host share TLS session state through the key
//! store: a session created by one worker resumes against any other. The
//! rustls session-store trait is synchronous, so this store keeps a
//! dedicated blocking connection; a handshake pays one store round-trip,
//! and any store hiccup just degrades to a full handshake.

use std::fmt;

use parking_lot::Mutex;
use redis::{Commands, Connection};
use rustls::server::StoresServerSessions;
use tracing::{debug, warn};

/// TTL for a freshly created session.
const CREATE_TTL_SECS: u64 = 30 * 60;
/// TTL refreshed onto a session when it resumes.
const RESUME_TTL_SECS: i64 = 5 * 60;

/// Session cache backed by the key store at `d:tls:<hex-id>`.
pub struct TicketStore {
    client: redis::Client,
    conn: Mutex<Option<Connection>>,
}

impl TicketStore {
    pub fn new(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    fn ticket_key(id: &[u8]) -> String {
        format!("d:tls:{}", hex::encode(id))
    }

    /// Run `op` on the cached blocking connection, reconnecting once on
    /// failure. Errors degrade to `None`.
    fn with_conn<T>(&self, op: impl Fn(&mut Connection) -> redis::RedisResult<T>) -> Option<T> {
        let mut guard = self.conn.lock();
        if guard.is_none() {
            match self.client.get_connection() {
                Ok(conn) => *guard = Some(conn),
                Err(e) => {
                    warn!(error = %e, "session store unavailable");
                    return None;
                }
            }
        }
        let conn = guard.as_mut().expect("connection present");
        match op(conn) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "session store operation failed; dropping connection");
                *guard = None;
                None
            }
        }
    }
}

impl StoresServerSessions for TicketStore {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        let redis_key = Self::ticket_key(&key);
        self.with_conn(|conn| conn.set_ex::<_, _, ()>(&redis_key, value.as_slice(), CREATE_TTL_SECS))
            .is_some()
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let redis_key = Self::ticket_key(key);
        let value: Option<Vec<u8>> =
            self.with_conn(|conn| conn.get(&redis_key)).flatten();
        if value.is_some() {
            debug!(key = %redis_key, "TLS session resumed from store");
            self.with_conn(|conn| conn.expire::<_, ()>(&redis_key, RESUME_TTL_SECS));
        }
        value
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        let redis_key = Self::ticket_key(key);
        self.with_conn(|conn| conn.get_del(&redis_key)).flatten()
    }

    fn can_cache(&self) -> bool {
        true
    }
}

impl fmt::Debug for TicketStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketStore")
            .field("connected", &self.conn.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_key_format() {
        assert_eq!(TicketStore::ticket_key(&[0xde, 0xad]), "d:tls:dead");
        assert_eq!(TicketStore::ticket_key(&[]), "d:tls:");
    }
}
