//! In-process `KvStore` used by unit tests. Mirrors the Redis scripts'
//! semantics exactly (same prune-before-act ordering, same TTL rules) so a
//! test written against `MemoryStore` exercises the same contract `RedisStore`
//! does, without a live Redis.

use super::{AccountLoad, KvStore, SessionAcquire};
use crate::error::CoreResult;
use crate::ids::AccountId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Default)]
struct SessionOwner {
    owner: String,
    count: u32,
}

#[derive(Default)]
struct Inner {
    /// zset emulation: key -> member -> score (ms epoch).
    zsets: HashMap<String, HashMap<String, i64>>,
    owners: HashMap<String, SessionOwner>,
    mutexes: HashMap<String, String>,
    counters: HashMap<String, u32>,
    strings: HashMap<String, String>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

fn prune(zset: &mut HashMap<String, i64>, cutoff: i64) {
    zset.retain(|_, score| *score > cutoff);
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn acquire_slot(
        &self,
        key: &str,
        max_conc: u32,
        ttl: Duration,
        member_id: &str,
    ) -> CoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let now = now_ms();
        let cutoff = now - ttl.as_millis() as i64;
        let zset = inner.zsets.entry(key.to_string()).or_default();
        prune(zset, cutoff);

        if zset.contains_key(member_id) {
            zset.insert(member_id.to_string(), now);
            return Ok(true);
        }
        if (zset.len() as u32) < max_conc {
            zset.insert(member_id.to_string(), now);
            return Ok(true);
        }
        Ok(false)
    }

    async fn release_slot(&self, key: &str, member_id: &str) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(zset) = inner.zsets.get_mut(key) {
            zset.remove(member_id);
        }
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
        let mut inner = self.inner.lock().unwrap();
        let now = now_ms();
        let cutoff = now - ttl.as_millis() as i64;
        let zset = inner.zsets.entry(key.to_string()).or_default();
        prune(zset, cutoff);

        if target >= range_start && target < range_end && !zset.contains_key(&target.to_string())
        {
            zset.insert(target.to_string(), now);
            return Ok(Some(target));
        }
        for slot in range_start..range_end {
            if slot != target && !zset.contains_key(&slot.to_string()) {
                zset.insert(slot.to_string(), now);
                return Ok(Some(slot));
            }
        }
        Ok(None)
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
        let mut inner = self.inner.lock().unwrap();
        let now = now_ms();
        let cutoff = now - ttl.as_millis() as i64;
        {
            let zset = inner.zsets.entry(slot_key.to_string()).or_default();
            prune(zset, cutoff);
        }

        let slot_str = slot.to_string();
        let has_owner = inner.owners.contains_key(owner_key);

        if !has_owner {
            let occupied = inner
                .zsets
                .get(slot_key)
                .is_some_and(|z| z.contains_key(&slot_str));
            if occupied {
                return Ok(SessionAcquire::Full);
            }
            inner.owners.insert(
                owner_key.to_string(),
                SessionOwner {
                    owner: session.to_string(),
                    count: 1,
                },
            );
            inner
                .zsets
                .entry(slot_key.to_string())
                .or_default()
                .insert(slot_str, now);
            return Ok(SessionAcquire::Acquired);
        }

        let owner = inner.owners.get_mut(owner_key).unwrap();
        if owner.owner == session && owner.count < max_parallel {
            owner.count += 1;
            inner
                .zsets
                .entry(slot_key.to_string())
                .or_default()
                .insert(slot_str, now);
            return Ok(SessionAcquire::Acquired);
        }
        Ok(SessionAcquire::Full)
    }

    async fn release_slot_with_session(
        &self,
        owner_key: &str,
        slot_key: &str,
        slot: u32,
        session: &str,
    ) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let done = match inner.owners.get_mut(owner_key) {
            Some(owner) if owner.owner == session => {
                if owner.count <= 1 {
                    true
                } else {
                    owner.count -= 1;
                    false
                }
            }
            _ => return Ok(()),
        };
        if done {
            inner.owners.remove(owner_key);
            if let Some(zset) = inner.zsets.get_mut(slot_key) {
                zset.remove(&slot.to_string());
            }
        }
        Ok(())
    }

    async fn acquire_session_mutex(
        &self,
        key: &str,
        _ttl: Duration,
        member_id: &str,
    ) -> CoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.mutexes.contains_key(key) {
            return Ok(false);
        }
        inner.mutexes.insert(key.to_string(), member_id.to_string());
        Ok(true)
    }

    async fn release_session_mutex(&self, key: &str, member_id: &str) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.mutexes.get(key).map(|v| v.as_str()) == Some(member_id) {
            inner.mutexes.remove(key);
        }
        Ok(())
    }

    async fn increment_wait(&self, key: &str, max_wait: u32, _ttl: Duration) -> CoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let cur = *inner.counters.get(key).unwrap_or(&0);
        if cur >= max_wait {
            return Ok(false);
        }
        inner.counters.insert(key.to_string(), cur + 1);
        Ok(true)
    }

    async fn decrement_wait(&self, key: &str) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cur) = inner.counters.get_mut(key) {
            if *cur > 0 {
                *cur -= 1;
            }
        }
        Ok(())
    }

    async fn record_sliding_window(
        &self,
        key: &str,
        window: Duration,
        _ttl: Duration,
        member_id: &str,
    ) -> CoreResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let now = now_ms();
        let cutoff = now - window.as_millis() as i64;
        let zset = inner.zsets.entry(key.to_string()).or_default();
        prune(zset, cutoff);
        zset.insert(member_id.to_string(), now);
        Ok(zset.len() as u64)
    }

    async fn sliding_window_count(&self, key: &str, window: Duration) -> CoreResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let now = now_ms();
        let cutoff = now - window.as_millis() as i64;
        let zset = inner.zsets.entry(key.to_string()).or_default();
        prune(zset, cutoff);
        Ok(zset.len() as u64)
    }

    async fn sliding_window_oldest_expiry(
        &self,
        key: &str,
        window: Duration,
    ) -> CoreResult<Option<Duration>> {
        let mut inner = self.inner.lock().unwrap();
        let now = now_ms();
        let cutoff = now - window.as_millis() as i64;
        let zset = inner.zsets.entry(key.to_string()).or_default();
        prune(zset, cutoff);
        let oldest = zset.values().min().copied();
        Ok(oldest.map(|score| {
            let expires_at = score + window.as_millis() as i64;
            Duration::from_millis((expires_at - now).max(0) as u64)
        }))
    }

    async fn load_batch(
        &self,
        ttl: Duration,
        load_window: Duration,
        accounts: &[(AccountId, u32)],
    ) -> CoreResult<HashMap<AccountId, AccountLoad>> {
        let mut inner = self.inner.lock().unwrap();
        let now = now_ms();
        let conc_cutoff = now - ttl.as_millis() as i64;
        let load_cutoff = now - load_window.as_millis() as i64;

        let mut out = HashMap::with_capacity(accounts.len());
        for (account, max_conc) in accounts {
            let conc_key = super::keys::concurrency_account(account);
            let wait_key = super::keys::wait_account(account);
            let load_key = super::keys::load_window(account);

            let concurrency = {
                let zset = inner.zsets.entry(conc_key).or_default();
                prune(zset, conc_cutoff);
                zset.len() as u32
            };
            let waiting = *inner.counters.get(&wait_key).unwrap_or(&0);
            let request_count = {
                let zset = inner.zsets.entry(load_key).or_default();
                prune(zset, load_cutoff);
                zset.len() as u64
            };

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
                    request_count,
                },
            );
        }
        Ok(out)
    }

    async fn set_account_paused(&self, account: &AccountId, _ttl: Duration) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .strings
            .insert(super::keys::account_paused(account), "1".to_string());
        Ok(())
    }

    async fn is_account_paused(&self, account: &AccountId) -> CoreResult<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.strings.contains_key(&super::keys::account_paused(account)))
    }

    async fn get_session_binding(&self, key: &str) -> CoreResult<Option<u32>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.strings.get(key).and_then(|v| v.parse().ok()))
    }

    async fn set_session_binding(&self, key: &str, slot: u32, _ttl: Duration) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.insert(key.to_string(), slot.to_string());
        Ok(())
    }

    async fn mark_timestamp(&self, key: &str, _ttl: Duration) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.insert(key.to_string(), now_ms().to_string());
        Ok(())
    }

    async fn time_since_marked(&self, key: &str) -> CoreResult<Option<Duration>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .strings
            .get(key)
            .and_then(|v| v.parse::<i64>().ok())
            .map(|marked_ms| Duration::from_millis((now_ms() - marked_ms).max(0) as u64)))
    }

    async fn cleanup_all(&self, pattern: &str, ttl: Duration) -> CoreResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let cutoff = now_ms() - ttl.as_millis() as i64;
        let re = glob_to_prefix(pattern);
        let mut removed = 0u64;
        for (key, zset) in inner.zsets.iter_mut() {
            if key.starts_with(&re) {
                let before = zset.len();
                prune(zset, cutoff);
                removed += (before - zset.len()) as u64;
            }
        }
        Ok(removed)
    }

    async fn clear_all(&self) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.zsets.clear();
        inner.owners.clear();
        inner.mutexes.clear();
        inner.counters.clear();
        inner.strings.clear();
        Ok(())
    }
}

/// `MemoryStore` only needs prefix matching since every pattern in
/// `ALL_RUNTIME_PATTERNS` is `family:*`.
fn glob_to_prefix(pattern: &str) -> String {
    pattern.trim_end_matches('*').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(n: &str) -> AccountId {
        AccountId::from(n.to_string())
    }

    #[tokio::test]
    async fn acquire_slot_respects_capacity() {
        let store = MemoryStore::new();
        let key = "concurrency:account:a1";
        assert!(store.acquire_slot(key, 2, Duration::from_secs(60), "r1").await.unwrap());
        assert!(store.acquire_slot(key, 2, Duration::from_secs(60), "r2").await.unwrap());
        assert!(!store.acquire_slot(key, 2, Duration::from_secs(60), "r3").await.unwrap());
        store.release_slot(key, "r1").await.unwrap();
        assert!(store.acquire_slot(key, 2, Duration::from_secs(60), "r3").await.unwrap());
    }

    #[tokio::test]
    async fn acquire_slot_in_range_never_crosses_boundary() {
        let store = MemoryStore::new();
        let key = "slot_owner_range";
        for _ in 0..3 {
            let got = store
                .acquire_slot_in_range(key, Duration::from_secs(60), 10, 3, 6)
                .await
                .unwrap();
            assert!(got.is_some());
            assert!((3..6).contains(&got.unwrap()));
        }
        let full = store
            .acquire_slot_in_range(key, Duration::from_secs(60), 10, 3, 6)
            .await
            .unwrap();
        assert_eq!(full, None);
    }

    #[tokio::test]
    async fn session_slot_sharing_respects_max_parallel() {
        let store = MemoryStore::new();
        let owner_key = "owner:a1:2";
        let slot_key = "slot:a1";
        let first = store
            .acquire_slot_with_session(owner_key, slot_key, Duration::from_secs(60), 2, "sess-a", 2)
            .await
            .unwrap();
        assert_eq!(first, SessionAcquire::Acquired);
        let second = store
            .acquire_slot_with_session(owner_key, slot_key, Duration::from_secs(60), 2, "sess-a", 2)
            .await
            .unwrap();
        assert_eq!(second, SessionAcquire::Acquired);
        let other_session = store
            .acquire_slot_with_session(owner_key, slot_key, Duration::from_secs(60), 2, "sess-b", 2)
            .await
            .unwrap();
        assert_eq!(other_session, SessionAcquire::Full);
    }

    #[tokio::test]
    async fn load_batch_reports_per_account_snapshot() {
        let store = MemoryStore::new();
        let a = account("acc-1");
        store
            .acquire_slot(&super::super::keys::concurrency_account(&a), 5, Duration::from_secs(60), "r1")
            .await
            .unwrap();
        let loads = store
            .load_batch(Duration::from_secs(60), Duration::from_secs(600), &[(a.clone(), 5)])
            .await
            .unwrap();
        let load = loads.get(&a).unwrap();
        assert_eq!(load.current_concurrency, 1);
        assert_eq!(load.load_percent, 20.0);
    }
}
