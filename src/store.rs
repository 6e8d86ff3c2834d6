//! Durable keyed storage over sled.
//!
//! Four trees:
//! - `objects` — per-key single-writer object state (drops, participants,
//!   ledgers, queues), bincode encoded. Callers serialize writers through
//!   [`crate::actor::ObjectLocks`]; the tree itself only promises atomic
//!   single-key operations.
//! - `kv` — TTL'd entries (PoW challenges, queue tokens, fingerprint/IP
//!   counts). Expiry is enforced on read and by a periodic sweep.
//! - `counters` — atomic i64 counters (queue positions, ready counts,
//!   rate-limit buckets).
//! - `index` — the global set of initialized drop ids.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::types::Millis;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// TTL'd KV envelope. bincode is local-storage-only by convention.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct TtlEntry {
    expires_at: Millis,
    data: Vec<u8>,
}

#[derive(Clone)]
pub struct Store {
    db: sled::Db,
    objects: sled::Tree,
    kv: sled::Tree,
    counters: sled::Tree,
    index: sled::Tree,
    journal: sled::Tree,
}

impl Store {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory store for tests.
    pub fn temp() -> Self {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("temporary sled db");
        Self::from_db(db).expect("temporary trees")
    }

    fn from_db(db: sled::Db) -> StoreResult<Self> {
        Ok(Self {
            objects: db.open_tree("objects")?,
            kv: db.open_tree("kv")?,
            counters: db.open_tree("counters")?,
            index: db.open_tree("index")?,
            journal: db.open_tree("journal")?,
            db,
        })
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush()?;
        Ok(())
    }

    pub(crate) fn journal_tree(&self) -> &sled::Tree {
        &self.journal
    }

    // =========================================================================
    // OBJECT STATE
    // =========================================================================

    pub fn get_object<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.objects.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_object<T: Serialize>(&self, key: &str, value: &T) -> StoreResult<()> {
        let bytes = bincode::serialize(value)?;
        self.objects.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    // =========================================================================
    // TTL'D KV
    // =========================================================================

    pub fn kv_put<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl_ms: i64,
        now: Millis,
    ) -> StoreResult<()> {
        let entry = TtlEntry {
            expires_at: now + ttl_ms,
            data: bincode::serialize(value)?,
        };
        self.kv.insert(key.as_bytes(), bincode::serialize(&entry)?)?;
        Ok(())
    }

    pub fn kv_get<T: DeserializeOwned>(&self, key: &str, now: Millis) -> StoreResult<Option<T>> {
        match self.kv.get(key.as_bytes())? {
            Some(bytes) => {
                let entry: TtlEntry = bincode::deserialize(&bytes)?;
                if entry.expires_at <= now {
                    self.kv.remove(key.as_bytes())?;
                    return Ok(None);
                }
                Ok(Some(bincode::deserialize(&entry.data)?))
            }
            None => Ok(None),
        }
    }

    /// Atomic get-and-delete. The backbone of one-time PoW challenges:
    /// two concurrent verifies cannot both observe the entry.
    pub fn kv_take<T: DeserializeOwned>(&self, key: &str, now: Millis) -> StoreResult<Option<T>> {
        match self.kv.remove(key.as_bytes())? {
            Some(bytes) => {
                let entry: TtlEntry = bincode::deserialize(&bytes)?;
                if entry.expires_at <= now {
                    return Ok(None);
                }
                Ok(Some(bincode::deserialize(&entry.data)?))
            }
            None => Ok(None),
        }
    }

    pub fn kv_delete(&self, key: &str) -> StoreResult<()> {
        self.kv.remove(key.as_bytes())?;
        Ok(())
    }

    /// Atomic increment of a TTL'd count. Expired entries restart at 1
    /// with a fresh TTL. Returns the post-increment count.
    pub fn kv_incr(&self, key: &str, ttl_ms: i64, now: Millis) -> StoreResult<i64> {
        let updated = self.kv.update_and_fetch(key.as_bytes(), |old| {
            let count = old
                .and_then(|bytes| bincode::deserialize::<TtlEntry>(bytes).ok())
                .filter(|e| e.expires_at > now)
                .and_then(|e| bincode::deserialize::<i64>(&e.data).ok())
                .unwrap_or(0);
            let entry = TtlEntry {
                expires_at: now + ttl_ms,
                data: bincode::serialize(&(count + 1)).expect("i64 encodes"),
            };
            Some(bincode::serialize(&entry).expect("entry encodes"))
        })?;
        let entry: TtlEntry = bincode::deserialize(&updated.expect("update always writes"))?;
        Ok(bincode::deserialize(&entry.data)?)
    }

    /// Delete every expired KV entry. Called from the sweep task.
    pub fn sweep_expired(&self, now: Millis) -> StoreResult<usize> {
        let mut removed = 0;
        for item in self.kv.iter() {
            let (key, bytes) = item?;
            let expired = bincode::deserialize::<TtlEntry>(&bytes)
                .map(|e| e.expires_at <= now)
                .unwrap_or(true);
            if expired {
                self.kv.remove(&key)?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("kv sweep removed {removed} expired entries");
        }
        Ok(removed)
    }

    // =========================================================================
    // COUNTERS
    // =========================================================================

    /// Atomic add; returns the new value.
    pub fn incr(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let updated = self.counters.update_and_fetch(key.as_bytes(), |old| {
            let current = old
                .map(|b| {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(b);
                    i64::from_be_bytes(buf)
                })
                .unwrap_or(0);
            Some((current + delta).to_be_bytes().to_vec())
        })?;
        let bytes = updated.expect("update always writes");
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Ok(i64::from_be_bytes(buf))
    }

    pub fn counter(&self, key: &str) -> StoreResult<i64> {
        Ok(self
            .counters
            .get(key.as_bytes())?
            .map(|b| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&b);
                i64::from_be_bytes(buf)
            })
            .unwrap_or(0))
    }

    /// Windowed rate limit: bucket counter keyed by window index.
    /// Returns Ok(()) when under `max`, Err(retry_after_secs) otherwise.
    /// The previous bucket is dropped opportunistically, keeping the
    /// counters tree from accumulating dead windows.
    pub fn rate_limit(
        &self,
        scope: &str,
        window_ms: i64,
        max: i64,
        now: Millis,
    ) -> StoreResult<Result<(), u64>> {
        let bucket = now / window_ms;
        let count = self.incr(&format!("rate:{scope}:{bucket}"), 1)?;
        let _ = self.counters.remove(format!("rate:{scope}:{}", bucket - 1).as_bytes());
        if count <= max {
            Ok(Ok(()))
        } else {
            let window_end = (bucket + 1) * window_ms;
            let retry_after = ((window_end - now) as f64 / 1000.0).ceil() as u64;
            Ok(Err(retry_after.max(1)))
        }
    }

    // =========================================================================
    // DROP INDEX
    // =========================================================================

    pub fn index_drop(&self, drop_id: &str) -> StoreResult<()> {
        self.index.insert(drop_id.as_bytes(), &[])?;
        Ok(())
    }

    pub fn list_drops(&self) -> StoreResult<Vec<String>> {
        let mut out = Vec::new();
        for item in self.index.iter() {
            let (key, _) = item?;
            out.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_round_trip() {
        let store = Store::temp();
        store.put_object("k", &("hello".to_string(), 7u32)).unwrap();
        let got: Option<(String, u32)> = store.get_object("k").unwrap();
        assert_eq!(got, Some(("hello".to_string(), 7)));
        let missing: Option<u32> = store.get_object("nope").unwrap();
        assert_eq!(missing, None);
    }

    #[test]
    fn test_kv_ttl_expiry_on_read() {
        let store = Store::temp();
        store.kv_put("k", &42u32, 1_000, 0).unwrap();
        assert_eq!(store.kv_get::<u32>("k", 500).unwrap(), Some(42));
        assert_eq!(store.kv_get::<u32>("k", 1_000).unwrap(), None);
        // expired entry was removed on read
        assert_eq!(store.kv_get::<u32>("k", 0).unwrap(), None);
    }

    #[test]
    fn test_kv_take_is_one_shot() {
        let store = Store::temp();
        store.kv_put("k", &1u8, 10_000, 0).unwrap();
        assert_eq!(store.kv_take::<u8>("k", 1).unwrap(), Some(1));
        assert_eq!(store.kv_take::<u8>("k", 1).unwrap(), None);
    }

    #[test]
    fn test_kv_take_expired_is_none() {
        let store = Store::temp();
        store.kv_put("k", &1u8, 1_000, 0).unwrap();
        assert_eq!(store.kv_take::<u8>("k", 2_000).unwrap(), None);
    }

    #[test]
    fn test_kv_incr_resets_after_expiry() {
        let store = Store::temp();
        assert_eq!(store.kv_incr("c", 1_000, 0).unwrap(), 1);
        assert_eq!(store.kv_incr("c", 1_000, 100).unwrap(), 2);
        // window lapsed: restart at 1
        assert_eq!(store.kv_incr("c", 1_000, 5_000).unwrap(), 1);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let store = Store::temp();
        store.kv_put("old", &1u8, 100, 0).unwrap();
        store.kv_put("new", &2u8, 100_000, 0).unwrap();
        let removed = store.sweep_expired(50_000).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.kv_get::<u8>("new", 50_000).unwrap(), Some(2));
    }

    #[test]
    fn test_counters() {
        let store = Store::temp();
        assert_eq!(store.incr("c", 5).unwrap(), 5);
        assert_eq!(store.incr("c", -2).unwrap(), 3);
        assert_eq!(store.counter("c").unwrap(), 3);
        assert_eq!(store.counter("missing").unwrap(), 0);
    }

    #[test]
    fn test_rate_limit_window() {
        let store = Store::temp();
        for _ in 0..3 {
            assert!(store.rate_limit("ip1", 60_000, 3, 0).unwrap().is_ok());
        }
        let retry = store.rate_limit("ip1", 60_000, 3, 0).unwrap().unwrap_err();
        assert!(retry >= 1 && retry <= 60);
        // new window resets
        assert!(store.rate_limit("ip1", 60_000, 3, 61_000).unwrap().is_ok());
        // other scopes unaffected
        assert!(store.rate_limit("ip2", 60_000, 3, 0).unwrap().is_ok());
    }

    #[test]
    fn test_drop_index() {
        let store = Store::temp();
        store.index_drop("d2").unwrap();
        store.index_drop("d1").unwrap();
        store.index_drop("d1").unwrap();
        let mut drops = store.list_drops().unwrap();
        drops.sort();
        assert_eq!(drops, vec!["d1", "d2"]);
    }
}
