//! Single-writer serialization per object key.
//!
//! Every stateful object (drop, participant, ledger, queue) is keyed by
//! its identity. All handler invocations for one key run strictly
//! sequentially; different keys progress in parallel. Handlers may
//! suspend on storage or bus work while holding their key.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};

const SHARDS: usize = 64;

pub struct ObjectLocks {
    shards: Vec<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ObjectLocks {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| StdMutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &str) -> &StdMutex<HashMap<String, Arc<Mutex<()>>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Acquire the key's writer slot. Queued acquirers are served in
    /// FIFO order by the tokio mutex, which gives per-key handler FIFO.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut shard = self.shard(key).lock().expect("lock table");
            shard
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }
}

impl Default for ObjectLocks {
    fn default() -> Self {
        Self::new()
    }
}
