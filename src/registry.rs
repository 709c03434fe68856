//! # Candidate Registry
//!
//! Short-lived store of discovery results, keyed by freshly minted
//! unpredictable ids. A responder inserts every candidate it advertises in a
//! `getpeers` reply; a later `relay` request names one of those ids.
//!
//! Entries expire after a fixed TTL measured from insertion. Lookups never
//! renew an entry. Expired entries are unresolvable immediately and are
//! physically dropped by [`CandidateRegistry::purge_expired`], which the
//! owning session calls from its maintenance tick.
//!
//! SECURITY: The store is an [`LruCache`] bounded by `max_entries`, so a
//! remote issuing `getpeers` in a loop cannot grow it without limit. A full
//! registry reclaims expired entries and otherwise refuses the insert: a
//! live id is never evicted before its TTL, since it may already have been
//! advertised.

use std::num::NonZeroUsize;

use lru::LruCache;
use thiserror::Error;
use tokio::time::{Duration, Instant};
use tracing::trace;

/// Default candidate lifetime.
pub const DEFAULT_CANDIDATE_TTL: Duration = Duration::from_millis(15_000);

/// Default upper bound on live candidates per session.
pub const DEFAULT_MAX_CANDIDATES: usize = 10_000;

/// Length of a candidate id before hex encoding.
pub const TOKEN_BYTES: usize = 16;

/// Produce an unpredictable hex token.
pub fn generate_token() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; TOKEN_BYTES];
    getrandom::getrandom(&mut bytes)?;
    Ok(hex::encode(bytes))
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("candidate registry is full ({capacity} live entries)")]
    Full { capacity: usize },

    #[error("CSPRNG unavailable: {0}")]
    Rng(#[from] getrandom::Error),
}

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

pub struct CandidateRegistry<T> {
    entries: LruCache<String, Entry<T>>,
    ttl: Duration,
}

impl<T> std::fmt::Debug for CandidateRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateRegistry")
            .field("len", &self.entries.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl<T> Default for CandidateRegistry<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CANDIDATE_TTL, DEFAULT_MAX_CANDIDATES)
    }
}

impl<T> CandidateRegistry<T> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        let cap = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store `value` under a fresh id and return the id.
    pub fn insert(&mut self, value: T) -> Result<String, RegistryError> {
        if self.entries.len() >= self.entries.cap().get() && self.purge_expired() == 0 {
            return Err(RegistryError::Full {
                capacity: self.entries.cap().get(),
            });
        }
        let mut id = generate_token()?;
        // 128 random bits make a collision practically impossible, but the
        // uniqueness guarantee must not depend on that.
        while self.entries.contains(&id) {
            id = generate_token()?;
        }
        let entry = Entry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.put(id.clone(), entry);
        trace!(candidate = %&id[..8], "candidate registered");
        Ok(id)
    }

    /// Look up a live entry. An expired entry is dropped and reported absent.
    pub fn get(&mut self, id: &str) -> Option<&T> {
        let now = Instant::now();
        let live = self.entries.peek(id).is_some_and(|e| now < e.expires_at);
        if !live {
            self.entries.pop(id);
            return None;
        }
        self.entries.get(id).map(|e| &e.value)
    }

    /// Remove and return a live entry.
    pub fn take(&mut self, id: &str) -> Option<T> {
        let entry = self.entries.pop(id)?;
        (Instant::now() < entry.expires_at).then_some(entry.value)
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.entries.pop(id);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tokens_are_hex_and_unique() {
        let a = generate_token().unwrap();
        let b = generate_token().unwrap();
        assert_eq!(a.len(), TOKEN_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn ids_unique_within_registry() {
        let mut registry = CandidateRegistry::default();
        let ids: HashSet<String> = (0..100).map(|i| registry.insert(i).unwrap()).collect();
        assert_eq!(ids.len(), 100);
        assert_eq!(registry.len(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let mut registry = CandidateRegistry::new(Duration::from_millis(15_000), 16);
        let id = registry.insert("peer").unwrap();

        tokio::time::advance(Duration::from_millis(14_999)).await;
        assert_eq!(registry.get(&id), Some(&"peer"));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(registry.get(&id), None);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_does_not_renew() {
        let mut registry = CandidateRegistry::new(Duration::from_secs(10), 16);
        let id = registry.insert(1u8).unwrap();
        for _ in 0..9 {
            tokio::time::advance(Duration::from_secs(1)).await;
            assert!(registry.get(&id).is_some());
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(registry.get(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn get_leaves_entry_take_removes_it() {
        let mut registry = CandidateRegistry::default();
        let id = registry.insert(7u32).unwrap();
        assert_eq!(registry.get(&id), Some(&7));
        assert_eq!(registry.get(&id), Some(&7));
        assert_eq!(registry.take(&id), Some(7));
        assert_eq!(registry.take(&id), None);
    }

    #[tokio::test(start_paused = true)]
    async fn take_after_expiry_is_none() {
        let mut registry = CandidateRegistry::new(Duration::from_secs(1), 4);
        let id = registry.insert(()).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(registry.take(&id), None);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_drops_only_expired() {
        let mut registry = CandidateRegistry::new(Duration::from_secs(5), 16);
        let old = registry.insert("old").unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        let fresh = registry.insert("fresh").unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(registry.purge_expired(), 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&old).is_none());
        assert_eq!(registry.get(&fresh), Some(&"fresh"));
    }

    #[tokio::test]
    async fn full_registry_refuses_inserts() {
        let mut registry = CandidateRegistry::new(DEFAULT_CANDIDATE_TTL, 2);
        let first = registry.insert(1).unwrap();
        let second = registry.insert(2).unwrap();

        let err = registry.insert(3).unwrap_err();
        assert!(matches!(err, RegistryError::Full { capacity: 2 }));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(&first), Some(&1));
        assert_eq!(registry.get(&second), Some(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn full_registry_reclaims_expired_entries() {
        let mut registry = CandidateRegistry::new(Duration::from_secs(1), 1);
        let old = registry.insert("old").unwrap();
        assert!(registry.insert("refused").is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        let fresh = registry.insert("fresh").unwrap();
        assert!(registry.get(&old).is_none());
        assert_eq!(registry.get(&fresh), Some(&"fresh"));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let registry: CandidateRegistry<()> = CandidateRegistry::new(DEFAULT_CANDIDATE_TTL, 0);
        assert!(registry.is_empty());
    }
}
