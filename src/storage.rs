//! Bounded local key/value store with per-value TTLs.

use std::num::NonZeroUsize;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use lru::LruCache;
use tracing::debug;

use crate::common::Id;

/// Default maximum number of keys held locally.
pub const MAX_STORED_KEYS: usize = 10_000;

/// Hard cap on a requested TTL.
pub const MAX_STORE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A value held under a key, together with the publisher that stored it
/// and its expiry time.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredValue {
    pub value: Bytes,
    /// Public key of the node that sent the STORE.
    pub publisher: [u8; 32],
    pub expires_at: SystemTime,
    /// True when this node is the original publisher and is responsible
    /// for republishing before expiry.
    pub local: bool,
}

impl StoredValue {
    /// The reference used to address this value in a DELETE: the hash of
    /// the value bytes.
    pub fn value_ref(&self) -> Id {
        Id::hash_of(&self.value)
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at <= now
    }
}

/// In-memory storage, keyed by [Id], holding multiple values per key.
///
/// Keys are bounded by an LRU cap; values expire individually by TTL.
#[derive(Debug)]
pub struct LocalStorage {
    records: LruCache<Id, Vec<StoredValue>>,
}

impl LocalStorage {
    pub fn new(max_keys: usize) -> Self {
        let cap = NonZeroUsize::new(max_keys.max(1)).unwrap_or(NonZeroUsize::MIN);

        LocalStorage {
            records: LruCache::new(cap),
        }
    }

    // === Public Methods ===

    /// Store a value under a key.
    ///
    /// If the same publisher already stored the same value bytes, the
    /// existing entry's expiry is extended instead of appending a
    /// duplicate. Distinct values, or the same value from a different
    /// publisher, accumulate under the key.
    pub fn put(
        &mut self,
        key: Id,
        value: Bytes,
        publisher: [u8; 32],
        ttl: Duration,
        local: bool,
        now: SystemTime,
    ) {
        let ttl = ttl.min(MAX_STORE_TTL);
        let expires_at = now + ttl;

        let values = self.records.get_or_insert_mut(key, Vec::new);

        if let Some(existing) = values
            .iter_mut()
            .find(|stored| stored.publisher == publisher && stored.value == value)
        {
            existing.expires_at = expires_at;
            existing.local = existing.local || local;

            return;
        }

        values.push(StoredValue {
            value,
            publisher,
            expires_at,
            local,
        });
    }

    /// Return all unexpired values under a key, without refreshing its
    /// LRU position.
    pub fn get(&self, key: &Id, now: SystemTime) -> Vec<Bytes> {
        self.records
            .peek(key)
            .map(|values| {
                values
                    .iter()
                    .filter(|stored| !stored.is_expired(now))
                    .map(|stored| stored.value.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove the value addressed by `value_ref` under `key`, but only if
    /// `requester` is the publisher that stored it.
    ///
    /// Returns true if a value was actually removed.
    pub fn delete(&mut self, key: &Id, value_ref: &Id, requester: &[u8; 32]) -> bool {
        let Some(values) = self.records.peek_mut(key) else {
            return false;
        };

        let before = values.len();
        values.retain(|stored| {
            !(stored.publisher == *requester && stored.value_ref() == *value_ref)
        });
        let removed = values.len() < before;

        if values.is_empty() {
            self.records.pop(key);
        }

        removed
    }

    /// Drop every expired value, and every key left without values.
    pub fn sweep(&mut self, now: SystemTime) {
        let mut emptied = vec![];

        for (key, values) in self.records.iter_mut() {
            values.retain(|stored| !stored.is_expired(now));

            if values.is_empty() {
                emptied.push(*key);
            }
        }

        for key in &emptied {
            self.records.pop(key);
        }

        if !emptied.is_empty() {
            debug!(keys = emptied.len(), "Swept expired storage keys");
        }
    }

    /// Locally published entries expiring within `lead` of `now`; these
    /// should be re-stored on the network before their remote copies
    /// lapse.
    pub fn due_for_republish(&self, now: SystemTime, lead: Duration) -> Vec<(Id, Bytes, Duration)> {
        let horizon = now + lead;

        self.records
            .iter()
            .flat_map(|(key, values)| {
                values.iter().filter_map(move |stored| {
                    if stored.local && !stored.is_expired(now) && stored.expires_at <= horizon {
                        let remaining = stored
                            .expires_at
                            .duration_since(now)
                            .unwrap_or(Duration::ZERO);

                        Some((*key, stored.value.clone(), remaining))
                    } else {
                        None
                    }
                })
            })
            .collect()
    }

    /// Snapshot every unexpired record.
    pub fn export(&self, now: SystemTime) -> Vec<(Id, StoredValue)> {
        self.records
            .iter()
            .flat_map(|(key, values)| {
                values
                    .iter()
                    .filter(|stored| !stored.is_expired(now))
                    .map(move |stored| (*key, stored.clone()))
            })
            .collect()
    }

    /// Reload records from a snapshot, skipping anything already expired.
    pub fn restore(&mut self, records: Vec<(Id, StoredValue)>, now: SystemTime) {
        for (key, stored) in records {
            if stored.is_expired(now) {
                continue;
            }

            self.records.get_or_insert_mut(key, Vec::new).push(stored);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    fn key() -> Id {
        Id::random()
    }

    #[test]
    fn put_then_get() {
        let mut storage = LocalStorage::new(16);
        let now = SystemTime::now();
        let key = key();

        storage.put(key, Bytes::from_static(b"hello"), [1; 32], HOUR, false, now);

        assert_eq!(storage.get(&key, now), vec![Bytes::from_static(b"hello")]);
        assert!(storage.get(&Id::random(), now).is_empty());
    }

    #[test]
    fn same_publisher_same_value_refreshes() {
        let mut storage = LocalStorage::new(16);
        let now = SystemTime::now();
        let key = key();

        storage.put(key, Bytes::from_static(b"v"), [1; 32], HOUR, false, now);
        storage.put(key, Bytes::from_static(b"v"), [1; 32], 2 * HOUR, false, now);

        assert_eq!(storage.get(&key, now).len(), 1);

        // Alive past the first TTL.
        assert_eq!(storage.get(&key, now + HOUR + Duration::from_secs(1)).len(), 1);
    }

    #[test]
    fn distinct_publishers_accumulate() {
        let mut storage = LocalStorage::new(16);
        let now = SystemTime::now();
        let key = key();

        storage.put(key, Bytes::from_static(b"v"), [1; 32], HOUR, false, now);
        storage.put(key, Bytes::from_static(b"v"), [2; 32], HOUR, false, now);
        storage.put(key, Bytes::from_static(b"w"), [1; 32], HOUR, false, now);

        assert_eq!(storage.get(&key, now).len(), 3);
    }

    #[test]
    fn values_expire_at_deadline() {
        let mut storage = LocalStorage::new(16);
        let now = SystemTime::now();
        let key = key();

        storage.put(key, Bytes::from_static(b"v"), [1; 32], HOUR, false, now);

        assert_eq!(storage.get(&key, now + HOUR - Duration::from_secs(1)).len(), 1);
        assert!(storage.get(&key, now + HOUR).is_empty());
    }

    #[test]
    fn ttl_is_capped() {
        let mut storage = LocalStorage::new(16);
        let now = SystemTime::now();
        let key = key();

        storage.put(key, Bytes::from_static(b"v"), [1; 32], MAX_STORE_TTL * 10, false, now);

        assert!(storage
            .get(&key, now + MAX_STORE_TTL + Duration::from_secs(1))
            .is_empty());
    }

    #[test]
    fn delete_requires_matching_publisher() {
        let mut storage = LocalStorage::new(16);
        let now = SystemTime::now();
        let key = key();
        let value = Bytes::from_static(b"v");
        let value_ref = Id::hash_of(&value);

        storage.put(key, value.clone(), [1; 32], HOUR, false, now);

        assert!(!storage.delete(&key, &value_ref, &[2; 32]));
        assert_eq!(storage.get(&key, now).len(), 1);

        assert!(storage.delete(&key, &value_ref, &[1; 32]));
        assert!(storage.get(&key, now).is_empty());

        // Second delete finds nothing.
        assert!(!storage.delete(&key, &value_ref, &[1; 32]));
    }

    #[test]
    fn sweep_drops_expired() {
        let mut storage = LocalStorage::new(16);
        let now = SystemTime::now();
        let key = key();

        storage.put(key, Bytes::from_static(b"v"), [1; 32], HOUR, false, now);
        storage.sweep(now + 2 * HOUR);

        assert!(storage.is_empty());
    }

    #[test]
    fn republish_covers_only_local_entries_near_expiry() {
        let mut storage = LocalStorage::new(16);
        let now = SystemTime::now();

        let near = key();
        let far = key();
        let remote = key();

        storage.put(near, Bytes::from_static(b"a"), [1; 32], HOUR, true, now);
        storage.put(far, Bytes::from_static(b"b"), [1; 32], 10 * HOUR, true, now);
        storage.put(remote, Bytes::from_static(b"c"), [2; 32], HOUR, false, now);

        let due = storage.due_for_republish(now, 2 * HOUR);

        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, near);
        assert_eq!(due[0].1, Bytes::from_static(b"a"));
    }

    #[test]
    fn export_restore_roundtrip_skips_expired() {
        let mut storage = LocalStorage::new(16);
        let now = SystemTime::now();

        let live = key();
        let dead = key();

        storage.put(live, Bytes::from_static(b"a"), [1; 32], 10 * HOUR, true, now);
        storage.put(dead, Bytes::from_static(b"b"), [1; 32], HOUR, false, now);

        let exported = storage.export(now);
        assert_eq!(exported.len(), 2);

        let mut restored = LocalStorage::new(16);
        restored.restore(exported, now + 2 * HOUR);

        assert_eq!(restored.len(), 1);
        assert_eq!(
            restored.get(&live, now + 2 * HOUR),
            vec![Bytes::from_static(b"a")]
        );
    }

    #[test]
    fn key_count_is_bounded() {
        let mut storage = LocalStorage::new(4);
        let now = SystemTime::now();

        for i in 0..10u8 {
            storage.put(key(), Bytes::copy_from_slice(&[i]), [1; 32], HOUR, false, now);
        }

        assert_eq!(storage.len(), 4);
    }
}
