use super::{scripts, AccountLoad, KvStore, SessionAcquire};
use crate::error::{CoreError, CoreResult};
use crate::ids::AccountId;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::time::Duration;

fn script_err(op: &str, e: redis::RedisError) -> CoreError {
    CoreError::Internal(format!("kvstore: {op} failed: {e}"))
}

/// Production `KvStore` backed by Redis. Cheaply cloneable — `ConnectionManager`
/// reconnects transparently and multiplexes over a single connection, mirroring
/// how the gateway's other infrastructure clients (e.g. an etcd/consul client)
/// are thin `Clone` wrappers around a pooled transport.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    acquire_slot: Script,
    release_slot: Script,
    acquire_slot_in_range: Script,
    acquire_slot_with_session: Script,
    release_slot_with_session: Script,
    acquire_session_mutex: Script,
    release_session_mutex: Script,
    increment_wait: Script,
    decrement_wait: Script,
    record_sliding_window: Script,
    sliding_window_count: Script,
    sliding_window_oldest_score: Script,
    prune_key: Script,
    mark_timestamp: Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> CoreResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CoreError::Internal(format!("kvstore: invalid redis url: {e}")))?;
        let mut conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CoreError::Internal(format!("kvstore: connect failed: {e}")))?;

        // Preload every script so the batched `load_batch` pipeline can call
        // EVALSHA directly instead of falling back to EVAL per account.
        for body in [
            scripts::ACQUIRE_SLOT,
            scripts::ACQUIRE_SLOT_IN_RANGE,
            scripts::ACQUIRE_SLOT_WITH_SESSION,
            scripts::RELEASE_SLOT_WITH_SESSION,
            scripts::ACQUIRE_SESSION_MUTEX,
            scripts::RELEASE_SESSION_MUTEX,
            scripts::INCREMENT_WAIT,
            scripts::DECREMENT_WAIT,
            scripts::RECORD_SLIDING_WINDOW,
            scripts::SLIDING_WINDOW_COUNT,
            scripts::SLIDING_WINDOW_OLDEST_SCORE,
            scripts::PRUNE_KEY,
            scripts::MARK_TIMESTAMP,
        ] {
            redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(body)
                .query_async::<String>(&mut conn)
                .await
                .map_err(|e| CoreError::Internal(format!("kvstore: script load failed: {e}")))?;
        }

        Ok(Self {
            conn,
            acquire_slot: Script::new(scripts::ACQUIRE_SLOT),
            release_slot: Script::new(scripts::RELEASE_SLOT),
            acquire_slot_in_range: Script::new(scripts::ACQUIRE_SLOT_IN_RANGE),
            acquire_slot_with_session: Script::new(scripts::ACQUIRE_SLOT_WITH_SESSION),
            release_slot_with_session: Script::new(scripts::RELEASE_SLOT_WITH_SESSION),
            acquire_session_mutex: Script::new(scripts::ACQUIRE_SESSION_MUTEX),
            release_session_mutex: Script::new(scripts::RELEASE_SESSION_MUTEX),
            increment_wait: Script::new(scripts::INCREMENT_WAIT),
            decrement_wait: Script::new(scripts::DECREMENT_WAIT),
            record_sliding_window: Script::new(scripts::RECORD_SLIDING_WINDOW),
            sliding_window_count: Script::new(scripts::SLIDING_WINDOW_COUNT),
            sliding_window_oldest_score: Script::new(scripts::SLIDING_WINDOW_OLDEST_SCORE),
            prune_key: Script::new(scripts::PRUNE_KEY),
            mark_timestamp: Script::new(scripts::MARK_TIMESTAMP),
        })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn acquire_slot(
        &self,
        key: &str,
        max_conc: u32,
        ttl: Duration,
        member_id: &str,
    ) -> CoreResult<bool> {
        let mut conn = self.conn.clone();
        let acquired: i64 = self
            .acquire_slot
            .key(key)
            .arg(max_conc)
            .arg(ttl.as_secs())
            .arg(member_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| script_err("acquire_slot", e))?;
        Ok(acquired == 1)
    }

    async fn release_slot(&self, key: &str, member_id: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        self.release_slot
            .key(key)
            .arg(member_id)
            .invoke_async::<i64>(&mut conn)
            .await
            .map_err(|e| script_err("release_slot", e))?;
        Ok(())
    }

    async fn acquire_slot_in_range(
        &self,
        key: &str,
        ttl: Duration,
        target: u32,
        range_start: u32,
        range_end: u32,
    ) -> CoreResult<Option<u32>> {
        let mut conn = self.conn.clone();
        let claimed: i64 = self
            .acquire_slot_in_range
            .key(key)
            .arg(ttl.as_secs())
            .arg(target)
            .arg(range_start)
            .arg(range_end)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| script_err("acquire_slot_in_range", e))?;
        Ok(if claimed < 0 { None } else { Some(claimed as u32) })
    }

    async fn acquire_slot_with_session(
        &self,
        owner_key: &str,
        slot_key: &str,
        ttl: Duration,
        slot: u32,
        session: &str,
        max_parallel: u32,
    ) -> CoreResult<SessionAcquire> {
        let mut conn = self.conn.clone();
        let ok: i64 = self
            .acquire_slot_with_session
            .key(owner_key)
            .key(slot_key)
            .arg(ttl.as_secs())
            .arg(slot)
            .arg(session)
            .arg(max_parallel)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| script_err("acquire_slot_with_session", e))?;
        Ok(if ok == 1 {
            SessionAcquire::Acquired
        } else {
            SessionAcquire::Full
        })
    }

    async fn release_slot_with_session(
        &self,
        owner_key: &str,
        slot_key: &str,
        slot: u32,
        session: &str,
    ) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        self.release_slot_with_session
            .key(owner_key)
            .key(slot_key)
            .arg(slot)
            .arg(session)
            .invoke_async::<i64>(&mut conn)
            .await
            .map_err(|e| script_err("release_slot_with_session", e))?;
        Ok(())
    }

    async fn acquire_session_mutex(
        &self,
        key: &str,
        ttl: Duration,
        member_id: &str,
    ) -> CoreResult<bool> {
        let mut conn = self.conn.clone();
        let acquired: i64 = self
            .acquire_session_mutex
            .key(key)
            .arg(ttl.as_secs())
            .arg(member_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| script_err("acquire_session_mutex", e))?;
        Ok(acquired == 1)
    }

    async fn release_session_mutex(&self, key: &str, member_id: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        self.release_session_mutex
            .key(key)
            .arg(member_id)
            .invoke_async::<i64>(&mut conn)
            .await
            .map_err(|e| script_err("release_session_mutex", e))?;
        Ok(())
    }

    async fn increment_wait(&self, key: &str, max_wait: u32, ttl: Duration) -> CoreResult<bool> {
        let mut conn = self.conn.clone();
        let ok: i64 = self
            .increment_wait
            .key(key)
            .arg(max_wait)
            .arg(ttl.as_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| script_err("increment_wait", e))?;
        Ok(ok == 1)
    }

    async fn decrement_wait(&self, key: &str) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        self.decrement_wait
            .key(key)
            .invoke_async::<i64>(&mut conn)
            .await
            .map_err(|e| script_err("decrement_wait", e))?;
        Ok(())
    }

    async fn record_sliding_window(
        &self,
        key: &str,
        window: Duration,
        ttl: Duration,
        member_id: &str,
    ) -> CoreResult<u64> {
        let mut conn = self.conn.clone();
        let count: i64 = self
            .record_sliding_window
            .key(key)
            .arg(window.as_millis() as i64)
            .arg(ttl.as_secs())
            .arg(member_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| script_err("record_sliding_window", e))?;
        Ok(count.max(0) as u64)
    }

    async fn sliding_window_count(&self, key: &str, window: Duration) -> CoreResult<u64> {
        let mut conn = self.conn.clone();
        let count: i64 = self
            .sliding_window_count
            .key(key)
            .arg(window.as_millis() as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| script_err("sliding_window_count", e))?;
        Ok(count.max(0) as u64)
    }

    async fn sliding_window_oldest_expiry(
        &self,
        key: &str,
        window: Duration,
    ) -> CoreResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        let oldest_ms: i64 = self
            .sliding_window_oldest_score
            .key(key)
            .arg(window.as_millis() as i64)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| script_err("sliding_window_oldest_expiry", e))?;
        if oldest_ms < 0 {
            return Ok(None);
        }
        let now_ms = now_millis(&mut self.conn.clone()).await?;
        let expires_at = oldest_ms + window.as_millis() as i64;
        let remaining = (expires_at - now_ms).max(0);
        Ok(Some(Duration::from_millis(remaining as u64)))
    }

    async fn load_batch(
        &self,
        ttl: Duration,
        load_window: Duration,
        accounts: &[(AccountId, u32)],
    ) -> CoreResult<HashMap<AccountId, AccountLoad>> {
        // Single round trip: pipeline a prune+read per candidate account.
        // Pipelining (rather than one giant script) keeps this query cheap
        // to extend per-account without hand-rolling variadic Lua.
        let mut conn = self.conn.clone();
        let now_ms = now_millis(&mut conn).await?;
        let cutoff = now_ms - ttl.as_millis() as i64;

        let mut pipe = redis::pipe();
        for (account, _) in accounts {
            let conc_key = super::keys::concurrency_account(account);
            let wait_key = super::keys::wait_account(account);
            let load_key = super::keys::load_window(account);
            pipe.cmd("ZREMRANGEBYSCORE")
                .arg(&conc_key)
                .arg("-inf")
                .arg(cutoff)
                .ignore();
            pipe.zcard(&conc_key);
            pipe.get(&wait_key);
            pipe.cmd("EVALSHA")
                .arg(self.sliding_window_count.get_hash())
                .arg(1)
                .arg(&load_key)
                .arg(load_window.as_millis() as i64);
        }

        let replies: Vec<redis::Value> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| script_err("load_batch", e))?;

        let mut out = HashMap::with_capacity(accounts.len());
        let mut idx = 0;
        for (account, max_conc) in accounts {
            let concurrency: u32 = redis::from_redis_value(&replies[idx]).unwrap_or(0);
            idx += 1;
            let waiting: u32 = match &replies[idx] {
                redis::Value::Nil => 0,
                v => redis::from_redis_value::<String>(v)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
            };
            idx += 1;
            let request_count: i64 = redis::from_redis_value(&replies[idx]).unwrap_or(0);
            idx += 1;

            let load_percent = if *max_conc > 0 {
                concurrency as f64 / *max_conc as f64 * 100.0
            } else {
                0.0
            };

            out.insert(
                account.clone(),
                AccountLoad {
                    current_concurrency: concurrency,
                    waiting_count: waiting,
                    load_percent,
                    request_count: request_count.max(0) as u64,
                },
            );
        }
        Ok(out)
    }

    async fn set_account_paused(&self, account: &AccountId, ttl: Duration) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        let key = super::keys::account_paused(account);
        conn.set_ex::<_, _, ()>(&key, "1", ttl.as_secs())
            .await
            .map_err(|e| script_err("set_account_paused", e))
    }

    async fn is_account_paused(&self, account: &AccountId) -> CoreResult<bool> {
        let mut conn = self.conn.clone();
        let key = super::keys::account_paused(account);
        conn.exists(&key)
            .await
            .map_err(|e| script_err("is_account_paused", e))
    }

    async fn get_session_binding(&self, key: &str) -> CoreResult<Option<u32>> {
        let mut conn = self.conn.clone();
        let v: Option<u32> = conn
            .get(key)
            .await
            .map_err(|e| script_err("get_session_binding", e))?;
        Ok(v)
    }

    async fn set_session_binding(&self, key: &str, slot: u32, ttl: Duration) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, slot, ttl.as_secs())
            .await
            .map_err(|e| script_err("set_session_binding", e))
    }

    async fn mark_timestamp(&self, key: &str, ttl: Duration) -> CoreResult<()> {
        let mut conn = self.conn.clone();
        self.mark_timestamp
            .key(key)
            .arg(ttl.as_secs())
            .invoke_async::<i64>(&mut conn)
            .await
            .map_err(|e| script_err("mark_timestamp", e))?;
        Ok(())
    }

    async fn time_since_marked(&self, key: &str) -> CoreResult<Option<Duration>> {
        let mut conn = self.conn.clone();
        let marked_ms: Option<i64> = conn
            .get(key)
            .await
            .map_err(|e| script_err("time_since_marked", e))?;
        let Some(marked_ms) = marked_ms else {
            return Ok(None);
        };
        let now_ms = now_millis(&mut conn).await?;
        Ok(Some(Duration::from_millis((now_ms - marked_ms).max(0) as u64)))
    }

    async fn cleanup_all(&self, pattern: &str, ttl: Duration) -> CoreResult<u64> {
        let mut conn = self.conn.clone();
        let cutoff_ms = now_millis(&mut conn).await? - ttl.as_millis() as i64;

        let mut removed = 0u64;
        let mut iter: redis::AsyncIter<String> = conn
            .scan_match(pattern)
            .await
            .map_err(|e| script_err("cleanup_all scan", e))?;
        let mut matched_keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            matched_keys.push(key);
        }
        drop(iter);

        for key in matched_keys {
            let mut conn = self.conn.clone();
            let n: i64 = self
                .prune_key
                .key(&key)
                .arg(cutoff_ms)
                .invoke_async(&mut conn)
                .await
                .unwrap_or(0);
            removed += n.max(0) as u64;
        }
        Ok(removed)
    }

    async fn clear_all(&self) -> CoreResult<()> {
        for pattern in super::keys::ALL_RUNTIME_PATTERNS {
            let mut conn = self.conn.clone();
            let mut iter: redis::AsyncIter<String> = conn
                .scan_match(*pattern)
                .await
                .map_err(|e| script_err("clear_all scan", e))?;
            let mut matched_keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                matched_keys.push(key);
            }
            drop(iter);
            if matched_keys.is_empty() {
                continue;
            }
            let mut conn = self.conn.clone();
            conn.del::<_, ()>(matched_keys)
                .await
                .map_err(|e| script_err("clear_all del", e))?;
        }
        Ok(())
    }
}

async fn now_millis(conn: &mut ConnectionManager) -> CoreResult<i64> {
    let (secs, micros): (i64, i64) = redis::cmd("TIME")
        .query_async(conn)
        .await
        .map_err(|e| script_err("time", e))?;
    Ok(secs * 1000 + micros / 1000)
}
