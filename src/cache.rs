//! Response cache, keyed by `(server_ip, qname, qtype, qclass, bailiwick)` per spec §4.3.
//! Bailiwick is part of the key because the *interpretation* of a response — what counts
//! as in-bailiwick — depends on it; dropping it from the key would let a response cached
//! under a narrow bailiwick answer a lookup made under a wider (or unrelated) one.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use hickory_proto::rr::{DNSClass, Name, RecordType};
use lru::LruCache;
use tracing::instrument;

use crate::query::Bailiwick;
use crate::response::DecodedResponse;

/// A plain LRU cache, generic over key/value, kept from the pattern of bounding memory by
/// eviction rather than by a hand-rolled size check. Process-scoped, populated lazily,
/// never invalidated mid-run: there is no TTL concern here (unlike a long-lived resolver
/// cache) since a single traversal never outlives the responses it collects.
#[derive(Debug)]
pub struct Cache<K: Hash + Eq, V> {
    lru: Mutex<LruCache<K, V>>,
}

impl<K: Hash + Eq + std::fmt::Debug, V: Clone + std::fmt::Debug> Cache<K, V> {
    pub fn new(capacity: NonZeroUsize) -> Cache<K, V> {
        Cache { lru: Mutex::new(LruCache::new(capacity)) }
    }

    #[instrument(name = "cache-store", skip(self, value))]
    pub fn store(&self, key: K, value: V) {
        self.lru.lock().unwrap().put(key, value);
    }

    #[instrument(name = "cache-get", skip(self), fields(hit = false))]
    pub fn get(&self, key: &K) -> Option<V> {
        let mut guard = self.lru.lock().unwrap();
        let hit = guard.get(key).cloned();
        if hit.is_some() {
            tracing::Span::current().record("hit", true);
        }
        hit
    }

    pub fn len(&self) -> usize {
        self.lru.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct ResponseKey {
    pub server_ip: std::net::IpAddr,
    pub qname: Name,
    pub qtype: RecordType,
    pub qclass: DNSClass,
    pub bailiwick: Bailiwick,
}

pub type ResponseCache = Cache<ResponseKey, DecodedResponse>;

/// Default cache capacity: generous enough that a deep, wide traversal in slow mode won't
/// evict entries it will want again, bounded so a pathological run can't grow unbounded.
pub const DEFAULT_CACHE_SIZE: usize = 100_000;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;
    use crate::response::Outcome;
    use anyhow::Result;
    use std::time::Duration;

    fn fake_response(server_ip: &str, qname: &str) -> DecodedResponse {
        DecodedResponse {
            server_ip: server_ip.parse().unwrap(),
            query: Query::new(qname.parse().unwrap(), RecordType::A),
            bailiwick: Bailiwick::root(),
            outcome: Outcome::Answer,
            message: None,
            final_name: None,
            warnings: vec![],
            rtt: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_store_and_get() -> Result<()> {
        let cache: ResponseCache = Cache::new(NonZeroUsize::new(4).unwrap());
        let key = ResponseKey {
            server_ip: "192.0.2.1".parse()?,
            qname: "example.com.".parse()?,
            qtype: RecordType::A,
            qclass: DNSClass::IN,
            bailiwick: Bailiwick::root(),
        };
        assert!(cache.get(&key).is_none());
        cache.store(key.clone(), fake_response("192.0.2.1", "example.com."));
        let hit = cache.get(&key).expect("should hit after store");
        assert_eq!(hit.outcome, Outcome::Answer);
        Ok(())
    }

    #[test]
    fn test_bailiwick_is_part_of_key() -> Result<()> {
        let cache: ResponseCache = Cache::new(NonZeroUsize::new(4).unwrap());
        let key_a = ResponseKey {
            server_ip: "192.0.2.1".parse()?,
            qname: "example.com.".parse()?,
            qtype: RecordType::A,
            qclass: DNSClass::IN,
            bailiwick: Bailiwick::new("example.com.".parse()?),
        };
        let key_b = ResponseKey { bailiwick: Bailiwick::root(), ..key_a.clone() };
        cache.store(key_a.clone(), fake_response("192.0.2.1", "example.com."));
        assert!(cache.get(&key_a).is_some());
        assert!(cache.get(&key_b).is_none());
        Ok(())
    }

    #[test]
    fn test_lru_eviction_bounds_memory() -> Result<()> {
        let cache: ResponseCache = Cache::new(NonZeroUsize::new(1).unwrap());
        let key1 = ResponseKey {
            server_ip: "192.0.2.1".parse()?,
            qname: "a.example.com.".parse()?,
            qtype: RecordType::A,
            qclass: DNSClass::IN,
            bailiwick: Bailiwick::root(),
        };
        let key2 = ResponseKey { qname: "b.example.com.".parse()?, ..key1.clone() };
        cache.store(key1.clone(), fake_response("192.0.2.1", "a.example.com."));
        cache.store(key2.clone(), fake_response("192.0.2.1", "b.example.com."));
        assert!(cache.get(&key1).is_none());
        assert!(cache.get(&key2).is_some());
        Ok(())
    }
}
