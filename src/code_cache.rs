//! Code cache: a concurrent map from kernel shape to published entry point
//! with an at-most-once producer guarantee.
//!
//! Entries are immutable once published and live for the process lifetime;
//! the cache never evicts. A failed producer is not memoized, so a later call
//! with the same key retries compilation.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// Address of a published kernel entry point.
///
/// Stored as a plain address so cache entries stay `Send + Sync`; the typed
/// function pointer is recovered at the factory boundary, which guarantees
/// the address was published for the matching signature and index width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodePtr(pub(crate) usize);

impl CodePtr {
    #[inline]
    pub fn addr(self) -> usize {
        self.0
    }
}

/// Concurrent shape-to-code map.
///
/// One mutex guards the whole map and the producer runs while it is held, so
/// two threads racing on the same key observe exactly one compilation.
/// Distinct keys serialize on the same lock; compilation is a once-per-shape
/// cost, so contention here is bounded by the number of distinct shapes.
pub struct CodeCache<K, V> {
    entries: Mutex<HashMap<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Copy> CodeCache<K, V> {
    pub fn new() -> Self {
        CodeCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Look up `key`, invoking `producer` on a miss and publishing its result.
    ///
    /// Returns `None` only when the producer fails; the failure is not
    /// recorded and subsequent calls run the producer again.
    pub fn get_or_create<F>(&self, key: K, producer: F) -> Option<V>
    where
        F: FnOnce() -> Option<V>,
    {
        let mut entries = self.entries.lock().unwrap();
        if let Some(v) = entries.get(&key) {
            return Some(*v);
        }
        let value = producer()?;
        entries.insert(key, value);
        Some(value)
    }

    /// Number of published entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone, V: Copy> Default for CodeCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn producer_runs_once_per_key() {
        let cache: CodeCache<u32, usize> = CodeCache::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..10 {
            let v = cache.get_or_create(7, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Some(42)
            });
            assert_eq!(v, Some(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failure_is_not_memoized() {
        let cache: CodeCache<u32, usize> = CodeCache::new();
        assert_eq!(cache.get_or_create(1, || None), None);
        assert!(cache.is_empty());
        // The retry succeeds and is published.
        assert_eq!(cache.get_or_create(1, || Some(5)), Some(5));
        assert_eq!(cache.get_or_create(1, || panic!("must not rerun")), Some(5));
    }

    #[test]
    fn concurrent_same_key_single_producer() {
        let cache: Arc<CodeCache<u32, usize>> = Arc::new(CodeCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(std::thread::spawn(move || {
                cache.get_or_create(99, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Some(13)
                })
            }));
        }
        for h in handles {
            assert_eq!(h.join().unwrap(), Some(13));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
