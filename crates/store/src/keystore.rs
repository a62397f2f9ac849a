//! Key store abstraction
//!
//! A thin, typed layer over redis. Writes always hit the primary endpoint;
//! reads go to the follower when one is configured. Compound writes that
//! must be atomic use MULTI/EXEC pipelines, and the health scheduler's
//! pop-and-reschedule runs as a server-side script so at most one worker
//! claims a target per cycle, across processes.

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::errors::StoreResult;

/// Pop the lowest-scored member at or below `ARGV[1]` and reinsert it at
/// score `ARGV[2]`, atomically.
const NEXT_DUE_SCRIPT: &str = r#"
local members = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #members == 0 then
    return false
end
redis.call('ZADD', KEYS[1], ARGV[2], members[1])
return members[1]
"#;

/// Handle to the persistent map. Cheap to clone.
#[derive(Clone)]
pub struct KeyStore {
    write: ConnectionManager,
    read: Option<ConnectionManager>,
}

impl KeyStore {
    /// Connect to the primary endpoint and, optionally, a read follower.
    pub async fn connect(url: &str, read_url: Option<&str>) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let write = ConnectionManager::new(client).await?;

        let read = match read_url {
            Some(read_url) if read_url != url => {
                let client = redis::Client::open(read_url)?;
                Some(ConnectionManager::new(client).await?)
            }
            _ => None,
        };

        Ok(Self { write, read })
    }

    fn writer(&self) -> ConnectionManager {
        self.write.clone()
    }

    fn reader(&self) -> ConnectionManager {
        self.read.as_ref().unwrap_or(&self.write).clone()
    }

    // ---- strings ----

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.reader();
        Ok(conn.get(key).await?)
    }

    pub async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.writer();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    /// SET with a TTL in seconds.
    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        let mut conn = self.writer();
        conn.set_ex::<_, _, ()>(key, value, ttl_secs).await?;
        Ok(())
    }

    /// SET NX with a TTL in milliseconds; true when the key was created.
    pub async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> StoreResult<bool> {
        let mut conn = self.writer();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    pub async fn del(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.writer();
        let removed: usize = conn.del(key).await?;
        Ok(removed > 0)
    }

    /// Delete `key` only while it still holds `expected`; used to release
    /// locks without clobbering a successor's lease.
    pub async fn del_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        const SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;
        let mut conn = self.writer();
        let removed: i64 = Script::new(SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    pub async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.reader();
        Ok(conn.exists(key).await?)
    }

    /// TTL on any key type, in seconds.
    pub async fn expire(&self, key: &str, ttl_secs: i64) -> StoreResult<()> {
        let mut conn = self.writer();
        conn.expire::<_, ()>(key, ttl_secs).await?;
        Ok(())
    }

    // ---- hashes ----

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.writer();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    pub async fn hset_nx(&self, key: &str, field: &str, value: &str) -> StoreResult<bool> {
        let mut conn = self.writer();
        Ok(conn.hset_nx(key, field, value).await?)
    }

    /// HSETNX plus SADD of the key into an index set, in one transaction.
    /// Returns true when the field was created.
    pub async fn hset_nx_indexed(
        &self,
        key: &str,
        field: &str,
        value: &str,
        index_key: &str,
    ) -> StoreResult<bool> {
        let mut conn = self.writer();
        let (created, _): (bool, i64) = redis::pipe()
            .atomic()
            .hset_nx(key, field, value)
            .sadd(index_key, key)
            .query_async(&mut conn)
            .await?;
        Ok(created)
    }

    /// HSET plus SADD of the key into an index set, in one transaction.
    pub async fn hset_indexed(
        &self,
        key: &str,
        field: &str,
        value: &str,
        index_key: &str,
    ) -> StoreResult<()> {
        let mut conn = self.writer();
        let _: (i64, i64) = redis::pipe()
            .atomic()
            .hset(key, field, value)
            .sadd(index_key, key)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.reader();
        Ok(conn.hget(key, field).await?)
    }

    pub async fn hgetall(
        &self,
        key: &str,
    ) -> StoreResult<std::collections::HashMap<String, String>> {
        let mut conn = self.reader();
        Ok(conn.hgetall(key).await?)
    }

    /// True when the field existed.
    pub async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut conn = self.writer();
        let removed: usize = conn.hdel(key, field).await?;
        Ok(removed > 0)
    }

    pub async fn hset_map(
        &self,
        key: &str,
        fields: &[(&str, String)],
    ) -> StoreResult<()> {
        let mut conn = self.writer();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (field, value) in fields {
            pipe.hset(key, *field, value).ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    // ---- sets ----

    pub async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.writer();
        conn.sadd::<_, _, ()>(key, member).await?;
        Ok(())
    }

    pub async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.writer();
        conn.srem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    pub async fn sismember(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.reader();
        Ok(conn.sismember(key, member).await?)
    }

    pub async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.reader();
        Ok(conn.smembers(key).await?)
    }

    // ---- sorted sets ----

    pub async fn zadd(&self, key: &str, member: &str, score: i64) -> StoreResult<()> {
        let mut conn = self.writer();
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    pub async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        let mut conn = self.reader();
        Ok(conn.zscore(key, member).await?)
    }

    pub async fn zrem(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.writer();
        conn.zrem::<_, _, ()>(key, member).await?;
        Ok(())
    }

    /// Claim the next due member of a schedule: pop the lowest-scored member
    /// with score ≤ `max_score` and reinsert it at `new_score`. Atomic, so
    /// concurrent workers never claim the same member.
    pub async fn next_due(
        &self,
        key: &str,
        max_score: i64,
        new_score: i64,
    ) -> StoreResult<Option<String>> {
        let mut conn = self.writer();
        let member: Option<String> = Script::new(NEXT_DUE_SCRIPT)
            .key(key)
            .arg(max_score)
            .arg(new_score)
            .invoke_async(&mut conn)
            .await?;
        Ok(member)
    }
}
