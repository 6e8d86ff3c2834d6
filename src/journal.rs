//! Named side-effect capture for deterministic replay.
//!
//! Non-deterministic steps inside object handlers — timestamps and
//! random draws — are recorded under `{scope}:{name}` on first
//! execution. A crashed handler that re-runs gets the recorded value
//! back and therefore reconstructs the exact same decision sequence.
//! Records are written with compare-and-swap, so two racing executions
//! of the same step agree on one value.

use crate::crypto::random_bytes;
use crate::store::{Store, StoreError, StoreResult};
use crate::types::{Millis, now_ms};

#[derive(Clone)]
pub struct Journal {
    tree: sled::Tree,
}

impl Journal {
    pub fn new(store: &Store) -> Self {
        Self {
            tree: store.journal_tree().clone(),
        }
    }

    /// Record-once raw bytes: first caller's `produce()` wins, every
    /// later call returns the recorded bytes.
    fn once_bytes(
        &self,
        scope: &str,
        name: &str,
        produce: impl FnOnce() -> Vec<u8>,
    ) -> StoreResult<Vec<u8>> {
        let key = format!("{scope}:{name}");
        if let Some(existing) = self.tree.get(key.as_bytes()).map_err(StoreError::Sled)? {
            return Ok(existing.to_vec());
        }
        let fresh = produce();
        match self
            .tree
            .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(fresh.clone()))
            .map_err(StoreError::Sled)?
        {
            Ok(()) => Ok(fresh),
            // lost the race: the recorded value is authoritative
            Err(cas) => Ok(cas.current.expect("cas failure carries current").to_vec()),
        }
    }

    /// Wall-clock capture. Replay returns the first-run timestamp.
    pub fn once_now_ms(&self, scope: &str, name: &str) -> StoreResult<Millis> {
        let bytes = self.once_bytes(scope, name, || now_ms().to_be_bytes().to_vec())?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Ok(Millis::from_be_bytes(buf))
    }

    /// CSPRNG capture, hex encoded. Replay returns the first-run draw.
    pub fn once_random_hex(&self, scope: &str, name: &str, n: usize) -> StoreResult<String> {
        let bytes = self.once_bytes(scope, name, || {
            hex::encode(random_bytes(n)).into_bytes()
        })?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_recorded_once() {
        let store = Store::temp();
        let journal = Journal::new(&store);
        let first = journal.once_now_ms("drop:d1", "lottery_at").unwrap();
        let second = journal.once_now_ms("drop:d1", "lottery_at").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_random_recorded_once() {
        let store = Store::temp();
        let journal = Journal::new(&store);
        let first = journal.once_random_hex("drop:d1", "secret", 32).unwrap();
        let second = journal.once_random_hex("drop:d1", "secret", 32).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[test]
    fn test_scopes_isolated() {
        let store = Store::temp();
        let journal = Journal::new(&store);
        let a = journal.once_random_hex("drop:d1", "secret", 16).unwrap();
        let b = journal.once_random_hex("drop:d2", "secret", 16).unwrap();
        assert_ne!(a, b);
    }
}
