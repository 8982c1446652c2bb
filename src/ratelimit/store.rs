//! In-memory state store shared by the limiter strategies.

use dashmap::DashMap;

/// A sharded, concurrent map from limiter key to per-key state.
///
/// Every mutation of an entry happens under that entry's shard write lock,
/// so a check's read-then-update is atomic with respect to other checks on
/// the same key and to cleanup sweeps.
pub struct MemoryStore<S> {
    entries: DashMap<String, S>,
}

impl<S> MemoryStore<S> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Run `f` against the entry for `key`, creating it with `init` if absent.
    pub fn update<R>(
        &self,
        key: &str,
        init: impl FnOnce() -> S,
        f: impl FnOnce(&mut S) -> R,
    ) -> R {
        let mut entry = match self.entries.get_mut(key) {
            Some(entry) => entry,
            None => self.entries.entry(key.to_string()).or_insert_with(init),
        };
        f(entry.value_mut())
    }

    /// Read the entry for `key` without mutating it.
    pub fn read<R>(&self, key: &str, f: impl FnOnce(Option<&S>) -> R) -> R {
        match self.entries.get(key) {
            Some(entry) => f(Some(entry.value())),
            None => f(None),
        }
    }

    /// Keep only entries for which `keep` returns `true`.
    ///
    /// Returns the number of entries removed.
    pub fn retain(&self, mut keep: impl FnMut(&str, &S) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, state| keep(key, state));
        before.saturating_sub(self.entries.len())
    }

    /// Remove the entry for `key`.
    pub fn remove(&self, key: &str) -> Option<S> {
        self.entries.remove(key).map(|(_, state)| state)
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all state.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl<S> Default for MemoryStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_update_creates_then_mutates() {
        let store: MemoryStore<u64> = MemoryStore::new();

        let v = store.update("a", || 10, |v| {
            *v += 1;
            *v
        });
        assert_eq!(v, 11);

        let v = store.update("a", || 0, |v| {
            *v += 1;
            *v
        });
        assert_eq!(v, 12);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_read_does_not_create() {
        let store: MemoryStore<u64> = MemoryStore::new();
        assert_eq!(store.read("missing", |v| v.copied()), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_retain_reports_removed() {
        let store: MemoryStore<u64> = MemoryStore::new();
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            store.update(key, || i as u64, |_| ());
        }

        let removed = store.retain(|_, v| *v != 1);
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 2);
        assert_eq!(store.read("b", |v| v.copied()), None);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let store: Arc<MemoryStore<u64>> = Arc::new(MemoryStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        store.update("shared", || 0, |v| *v += 1);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.read("shared", |v| v.copied()), Some(8000));
    }
}
