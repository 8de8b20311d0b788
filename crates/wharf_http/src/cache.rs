//! Optional response cache for manifest GETs.
//!
//! Keys incorporate the bearer subject so cached bytes can never leak
//! across tenants with different visibility.

use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;

const CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub(crate) struct CachedManifest {
    pub bytes: Bytes,
    pub media_type: String,
    pub digest: String,
    inserted: Instant,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CacheKey {
    repository: String,
    reference: String,
    subject: String,
}

#[derive(Default)]
pub(crate) struct ManifestCache {
    entries: DashMap<CacheKey, CachedManifest>,
}

impl ManifestCache {
    pub fn get(
        &self,
        repository: &str,
        reference: &str,
        subject: Option<&str>,
    ) -> Option<CachedManifest> {
        let key = CacheKey {
            repository: repository.to_string(),
            reference: reference.to_string(),
            subject: subject.unwrap_or_default().to_string(),
        };
        let entry = self.entries.get(&key)?;
        if entry.inserted.elapsed() > CACHE_TTL {
            drop(entry);
            self.entries.remove(&key);
            return None;
        }
        Some(entry.clone())
    }

    pub fn insert(
        &self,
        repository: &str,
        reference: &str,
        subject: Option<&str>,
        bytes: Bytes,
        media_type: String,
        digest: String,
    ) {
        self.entries.insert(
            CacheKey {
                repository: repository.to_string(),
                reference: reference.to_string(),
                subject: subject.unwrap_or_default().to_string(),
            },
            CachedManifest {
                bytes,
                media_type,
                digest,
                inserted: Instant::now(),
            },
        );
    }

    /// Drop every cached entry for a repository; called when its content
    /// changes.
    pub fn invalidate_repository(&self, repository: &str) {
        self.entries.retain(|key, _| key.repository != repository);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scoped_by_subject() {
        let cache = ManifestCache::default();
        cache.insert(
            "alice/app",
            "v1",
            Some("alice"),
            Bytes::from_static(b"{}"),
            "application/vnd.oci.image.manifest.v1+json".to_string(),
            "sha256:abc".to_string(),
        );
        assert!(cache.get("alice/app", "v1", Some("alice")).is_some());
        assert!(cache.get("alice/app", "v1", Some("bob")).is_none());
        assert!(cache.get("alice/app", "v1", None).is_none());
    }

    #[test]
    fn invalidation_clears_repository() {
        let cache = ManifestCache::default();
        cache.insert(
            "alice/app",
            "v1",
            None,
            Bytes::from_static(b"{}"),
            "application/vnd.oci.image.manifest.v1+json".to_string(),
            "sha256:abc".to_string(),
        );
        cache.invalidate_repository("alice/app");
        assert!(cache.get("alice/app", "v1", None).is_none());
    }
}
