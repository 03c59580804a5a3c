//! Bounded single-flight memoisation.
//!
//! [MemoCache] stores computed values keyed by value, evicting the least recently used
//! entry once `capacity` is exceeded. Lookups for a key that is currently being computed
//! block until the computing caller publishes the result, so each key is computed at most
//! once while it stays cached.
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

/// Whether a lookup was served from the cache
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    Hit,
    Computed,
}

enum Slot<V> {
    Pending,
    Ready { value: Arc<V>, last_used: u64 },
}

struct Entries<K, V> {
    slots: HashMap<K, Slot<V>>,
    clock: u64,
}

pub struct MemoCache<K, V> {
    capacity: usize,
    entries: Mutex<Entries<K, V>>,
    published: Condvar,
}

impl<K: Eq + Hash + Clone, V> MemoCache<K, V> {
    /// Empty cache retaining at most `capacity` computed values
    pub fn new(capacity: usize) -> Self {
        MemoCache {
            capacity,
            entries: Mutex::new(Entries {
                slots: HashMap::new(),
                clock: 0,
            }),
            published: Condvar::new(),
        }
    }
    pub fn capacity(&self) -> usize {
        self.capacity
    }
    /// Number of computed entries currently retained
    pub fn len(&self) -> usize {
        self.lock()
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready { .. }))
            .count()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn contains(&self, key: &K) -> bool {
        matches!(self.lock().slots.get(key), Some(Slot::Ready { .. }))
    }
    pub fn clear(&self) {
        self.lock()
            .slots
            .retain(|_, slot| matches!(slot, Slot::Pending));
    }

    /// Return the cached value for `key`, computing it with `compute` on a miss.
    ///
    /// If another caller is already computing `key`, this call blocks until that value is
    /// published and then returns it as a hit. If that computation panics, one of the
    /// waiters takes over and computes the value itself.
    ///
    /// # Arguments
    /// * `key` - Value key. It is cloned into the cache on a miss.
    /// * `compute` - Runs without the cache lock held, at most once per call.
    ///
    /// # Returns
    /// The shared value and whether it came from the cache. With a capacity of zero every
    /// call computes and nothing is retained.
    pub fn get_or_compute<F>(&self, key: K, compute: F) -> (Arc<V>, Lookup)
    where
        F: FnOnce() -> V,
    {
        if self.capacity == 0 {
            return (Arc::new(compute()), Lookup::Computed);
        }
        let mut entries = self.lock();
        loop {
            entries.clock += 1;
            let now = entries.clock;
            let in_flight = match entries.slots.get_mut(&key) {
                Some(Slot::Ready { value, last_used }) => {
                    *last_used = now;
                    return (Arc::clone(value), Lookup::Hit);
                }
                Some(Slot::Pending) => true,
                None => false,
            };
            if !in_flight {
                entries.slots.insert(key.clone(), Slot::Pending);
                break;
            }
            entries = self
                .published
                .wait(entries)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(entries);

        let mut pending = PendingGuard {
            cache: self,
            key: Some(key),
        };
        let value = Arc::new(compute());
        if let Some(key) = pending.key.take() {
            self.publish(key, Arc::clone(&value));
        }
        (value, Lookup::Computed)
    }

    fn publish(&self, key: K, value: Arc<V>) {
        let mut entries = self.lock();
        entries.clock += 1;
        let now = entries.clock;
        entries.slots.insert(
            key,
            Slot::Ready {
                value,
                last_used: now,
            },
        );
        evict_to_capacity(&mut entries, self.capacity);
        drop(entries);
        self.published.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, Entries<K, V>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn evict_to_capacity<K: Eq + Hash + Clone, V>(entries: &mut Entries<K, V>, capacity: usize) {
    loop {
        let ready = entries
            .slots
            .iter()
            .filter_map(|(k, slot)| match slot {
                Slot::Ready { last_used, .. } => Some((k, *last_used)),
                Slot::Pending => None,
            });
        let mut count = 0;
        let mut oldest: Option<(&K, u64)> = None;
        for (k, used) in ready {
            count += 1;
            if oldest.is_none_or(|(_, t)| used < t) {
                oldest = Some((k, used));
            }
        }
        if count <= capacity {
            return;
        }
        let Some((victim, _)) = oldest else { return };
        let victim = victim.clone();
        entries.slots.remove(&victim);
    }
}

/// Clears a pending slot if the computation unwinds, releasing any waiters.
struct PendingGuard<'a, K: Eq + Hash + Clone, V> {
    cache: &'a MemoCache<K, V>,
    key: Option<K>,
}
impl<K: Eq + Hash + Clone, V> Drop for PendingGuard<'_, K, V> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.cache.lock().slots.remove(&key);
            self.cache.published.notify_all();
        }
    }
}
