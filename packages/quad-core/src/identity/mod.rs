//! # Identity Cache
//!
//! Session-scoped cache of user profiles (`name`, `handle`, `avatar`).
//!
//! The cache is injected into the hydrator and the session explicitly; there
//! is no process-wide instance. Lookups that miss go to a [`ProfileSource`]
//! once per user and the answer is remembered for the rest of the session.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

/// Public profile of a user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Display name
    pub name: String,
    /// Unique handle
    pub handle: String,
    /// Avatar URL
    pub avatar: Option<String>,
}

/// Where profiles come from on a cache miss
#[async_trait]
pub trait ProfileSource: Send + Sync {
    /// Fetch profiles for the given users. Unknown users are omitted.
    async fn profiles(&self, user_ids: &[String]) -> Result<HashMap<String, Profile>>;
}

/// Lookup-or-fetch profile cache
pub struct IdentityCache {
    source: Arc<dyn ProfileSource>,
    entries: RwLock<HashMap<String, Profile>>,
}

impl IdentityCache {
    /// Create an empty cache backed by `source`
    pub fn new(source: Arc<dyn ProfileSource>) -> Self {
        Self {
            source,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cached profile, without fetching
    pub fn get(&self, user_id: &str) -> Option<Profile> {
        self.entries.read().get(user_id).cloned()
    }

    /// Seed or overwrite a cached profile
    pub fn insert(&self, user_id: impl Into<String>, profile: Profile) {
        self.entries.write().insert(user_id.into(), profile);
    }

    /// Number of cached profiles
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Resolve one profile. A failed fetch yields a default profile that is
    /// not cached, so the next lookup tries again.
    pub async fn resolve(&self, user_id: &str) -> Profile {
        let ids = [user_id.to_string()];
        self.resolve_many(&ids)
            .await
            .remove(user_id)
            .unwrap_or_default()
    }

    /// Resolve many profiles with at most one fetch for all misses
    pub async fn resolve_many(&self, user_ids: &[String]) -> HashMap<String, Profile> {
        let mut found = HashMap::with_capacity(user_ids.len());
        let mut missing = Vec::new();
        {
            let entries = self.entries.read();
            for id in user_ids {
                match entries.get(id) {
                    Some(profile) => {
                        found.insert(id.clone(), profile.clone());
                    }
                    None if !missing.contains(id) => missing.push(id.clone()),
                    None => {}
                }
            }
        }

        if missing.is_empty() {
            return found;
        }

        match self.source.profiles(&missing).await {
            Ok(fetched) => {
                let mut entries = self.entries.write();
                for (id, profile) in fetched {
                    entries.insert(id.clone(), profile.clone());
                    found.insert(id, profile);
                }
            }
            Err(e) => {
                tracing::warn!("Profile lookup for {} users failed: {}", missing.len(), e);
            }
        }

        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ProfileSource for CountingSource {
        async fn profiles(&self, user_ids: &[String]) -> Result<HashMap<String, Profile>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::TransientFetch("offline".into()));
            }
            Ok(user_ids
                .iter()
                .map(|id| {
                    (
                        id.clone(),
                        Profile {
                            name: id.to_uppercase(),
                            handle: id.clone(),
                            avatar: None,
                        },
                    )
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_resolve_caches_after_first_fetch() {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0), fail: false });
        let cache = IdentityCache::new(source.clone());

        assert_eq!(cache.resolve("alice").await.name, "ALICE");
        assert_eq!(cache.resolve("alice").await.name, "ALICE");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_many_fetches_misses_once() {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0), fail: false });
        let cache = IdentityCache::new(source.clone());
        cache.insert("alice", Profile::default());

        let ids = vec!["alice".to_string(), "bob".to_string(), "carol".to_string(), "bob".to_string()];
        let resolved = cache.resolve_many(&ids).await;
        assert_eq!(resolved.len(), 3);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_not_cached() {
        let source = Arc::new(CountingSource { calls: AtomicUsize::new(0), fail: true });
        let cache = IdentityCache::new(source.clone());

        assert_eq!(cache.resolve("alice").await, Profile::default());
        assert!(cache.is_empty());
        cache.resolve("alice").await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }
}
