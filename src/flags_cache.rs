//! A bounded cache of remote flag evaluation results.
//!
//! Entries are evicted least-recently-used first once the cache holds `max_size` entries, and
//! expire `max_age` after insertion. Expiry is checked lazily on read, so [`LruTtlCache::len`]
//! only reflects removals triggered by access.
use std::{
    collections::{BTreeMap, HashMap},
    hash::Hash,
    num::NonZeroUsize,
    sync::Mutex,
    time::{Duration, Instant},
};

use lru::LruCache;

use crate::{
    context::EvaluationContext,
    models::{AttributeValue, FlagValue, Properties, RemoteFlagsResponse},
};

/// Flags and payloads returned by one remote evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedFlags {
    /// Flag key to value.
    pub flags: HashMap<String, FlagValue>,
    /// Flag key to payload.
    pub payloads: HashMap<String, serde_json::Value>,
}

impl From<&RemoteFlagsResponse> for CachedFlags {
    fn from(response: &RemoteFlagsResponse) -> Self {
        CachedFlags {
            flags: response.flags.clone(),
            payloads: response.payloads.clone(),
        }
    }
}

/// Structural key over a whole [`EvaluationContext`].
///
/// Property maps are stored as canonical (key-sorted) JSON since property values may be floats.
/// `None` and an empty map produce different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlagsCacheKey {
    distinct_id: String,
    groups: Option<BTreeMap<String, String>>,
    person_properties: Option<String>,
    group_properties: Option<String>,
}

impl From<&EvaluationContext> for FlagsCacheKey {
    fn from(context: &EvaluationContext) -> Self {
        FlagsCacheKey {
            distinct_id: context.distinct_id.clone(),
            groups: context
                .groups
                .as_ref()
                .map(|groups| groups.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
            person_properties: context.person_properties.as_ref().map(canonical_json),
            group_properties: context.group_properties.as_ref().map(|groups| {
                let sorted: BTreeMap<_, _> = groups
                    .iter()
                    .map(|(group_type, properties)| (group_type, sorted_properties(properties)))
                    .collect();
                serde_json::to_string(&sorted).unwrap_or_default()
            }),
        }
    }
}

fn sorted_properties(properties: &Properties) -> BTreeMap<&String, &AttributeValue> {
    properties.iter().collect()
}

fn canonical_json(properties: &Properties) -> String {
    // Serializing plain maps of scalars can't fail.
    serde_json::to_string(&sorted_properties(properties)).unwrap_or_default()
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// Thread-safe LRU cache with optional time-based expiry.
pub struct LruTtlCache<K: Hash + Eq, V> {
    /// `None` when the cache can't hold anything (`max_size` is zero).
    entries: Mutex<Option<LruCache<K, Entry<V>>>>,
    max_age: Option<Duration>,
}

/// Cache of remote flag results keyed by evaluation context.
pub type FlagsCache = LruTtlCache<FlagsCacheKey, CachedFlags>;

impl<K: Hash + Eq, V: Clone> LruTtlCache<K, V> {
    /// Create a cache holding at most `max_size` entries, each for at most `max_age`. `None` means
    /// entries never expire.
    pub fn new(max_size: usize, max_age: Option<Duration>) -> Self {
        LruTtlCache {
            entries: Mutex::new(NonZeroUsize::new(max_size).map(LruCache::new)),
            max_age,
        }
    }

    /// Get a copy of the value for `key` and mark it as recently used. Expired entries are
    /// removed and reported as missing.
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub(crate) fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let mut entries = self.lock();
        let entries = entries.as_mut()?;

        let entry = entries.get(key)?;
        if self.is_expired(entry, now) {
            entries.pop(key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Insert `value` for `key`, evicting the least recently used entry if the cache is full.
    pub fn put(&self, key: K, value: V) {
        self.put_at(key, value, Instant::now());
    }

    pub(crate) fn put_at(&self, key: K, value: V, now: Instant) {
        if let Some(entries) = self.lock().as_mut() {
            entries.put(
                key,
                Entry {
                    value,
                    inserted_at: now,
                },
            );
        }
    }

    /// Number of entries currently held, including expired entries that haven't been read yet.
    pub fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, LruCache::len)
    }

    /// Returns `true` if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all entries.
    pub fn clear(&self) {
        if let Some(entries) = self.lock().as_mut() {
            entries.clear();
        }
    }

    fn is_expired(&self, entry: &Entry<V>, now: Instant) -> bool {
        self.max_age
            .is_some_and(|max_age| now.saturating_duration_since(entry.inserted_at) >= max_age)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<LruCache<K, Entry<V>>>> {
        self.entries
            .lock()
            .expect("thread holding cache lock should not panic")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(value: bool) -> CachedFlags {
        CachedFlags {
            flags: HashMap::from([("beta".to_owned(), FlagValue::Boolean(value))]),
            payloads: HashMap::new(),
        }
    }

    #[test]
    fn get_returns_put_value() {
        let cache = FlagsCache::new(10, Some(Duration::from_secs(60)));
        let key = FlagsCacheKey::from(&EvaluationContext::new("user"));

        assert_eq!(cache.get(&key), None);
        cache.put(key.clone(), flags(true));
        assert_eq!(cache.get(&key), Some(flags(true)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = LruTtlCache::new(2, None);
        cache.put("a", 1);
        cache.put("b", 2);
        // Touch "a" so "b" becomes the least recently used.
        assert_eq!(cache.get(&"a"), Some(1));
        cache.put("c", 3);

        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn expired_entries_are_evicted_on_read() {
        let cache = LruTtlCache::new(10, Some(Duration::from_secs(60)));
        let start = Instant::now();
        cache.put_at("a", 1, start);
        cache.put_at("b", 2, start);

        assert_eq!(cache.get_at(&"a", start + Duration::from_secs(59)), Some(1));
        assert_eq!(cache.get_at(&"a", start + Duration::from_secs(60)), None);

        // Only the entry that was read got removed.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn zero_max_size_holds_nothing() {
        let cache = LruTtlCache::new(0, Some(Duration::from_secs(60)));
        cache.put("a", 1);
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn zero_max_age_expires_immediately() {
        let cache = LruTtlCache::new(10, Some(Duration::ZERO));
        cache.put("a", 1);
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn clear_removes_everything() {
        let cache = LruTtlCache::new(10, None);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn key_distinguishes_none_from_empty() {
        let none = EvaluationContext::new("user");
        let empty = EvaluationContext::new("user").with_person_properties(HashMap::new());
        assert_ne!(FlagsCacheKey::from(&none), FlagsCacheKey::from(&empty));

        let no_groups = EvaluationContext::new("user").with_groups(HashMap::new());
        assert_ne!(FlagsCacheKey::from(&none), FlagsCacheKey::from(&no_groups));
    }

    #[test]
    fn key_is_structural() {
        let a = EvaluationContext::new("user").with_person_properties(HashMap::from([
            ("plan".to_owned(), "pro".into()),
            ("age".to_owned(), 42.0.into()),
        ]));
        let b = EvaluationContext::new("user").with_person_properties(HashMap::from([
            ("age".to_owned(), 42.0.into()),
            ("plan".to_owned(), "pro".into()),
        ]));
        let c = EvaluationContext::new("user").with_person_properties(HashMap::from([(
            "plan".to_owned(),
            "free".into(),
        )]));

        assert_eq!(FlagsCacheKey::from(&a), FlagsCacheKey::from(&b));
        assert_ne!(FlagsCacheKey::from(&a), FlagsCacheKey::from(&c));
        assert_ne!(
            FlagsCacheKey::from(&a),
            FlagsCacheKey::from(&EvaluationContext::new("other"))
        );
    }

    #[test]
    fn concurrent_access() {
        let cache = std::sync::Arc::new(LruTtlCache::new(100, None));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        cache.put(t * 1000 + i, i);
                        cache.get(&(t * 1000 + i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 100);
    }
}
