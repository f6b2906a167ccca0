use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use keel_core::Credential;
use rustc_hash::FxHashMap;

/// Last credential that worked for each image.
///
/// Shared by every worker; a stale entry is evicted by the first worker it
/// fails for.
#[derive(Debug, Clone, Default)]
pub struct CredentialCache {
    entries: Arc<Mutex<FxHashMap<String, Credential>>>,
}

impl CredentialCache {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<String, Credential>> { self.entries.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn get(&self, image: &str) -> Option<Credential> { self.lock().get(image).cloned() }

    pub fn put(&self, image: &str, credential: Credential) { self.lock().insert(image.to_string(), credential); }

    pub fn evict(&self, image: &str) -> Option<Credential> { self.lock().remove(image) }

    pub fn len(&self) -> usize { self.lock().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_evict() {
        let cache = CredentialCache::new();
        assert!(cache.get("a:1").is_none());
        cache.put("a:1", Credential::new("docker.io", "u", "p"));
        assert_eq!(cache.get("a:1").map(|c| c.username), Some("u".to_string()));
        assert!(cache.evict("a:1").is_some());
        assert!(cache.is_empty());
    }
}
