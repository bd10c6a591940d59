use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;

use crate::auth::Credential;
use crate::ga4::{AdminApi, ApiError, PropertyRecord};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CacheError {
    #[error("property lookup failed: {0}")]
    Upstream(#[from] ApiError),
}

/// Property id → metadata for every property the user can read.
///
/// Populated lazily from the Admin API. A present id is trusted until the next
/// full listing drops it; an absent id always costs one listing before it is
/// declared invalid, so a negative is never stale.
#[derive(Clone)]
pub struct PropertyCache {
    entries: Arc<DashMap<String, PropertyRecord>>,
    last_refreshed: Arc<RwLock<Option<DateTime<Utc>>>>,
    admin: Arc<dyn AdminApi>,
}

impl PropertyCache {
    pub fn new(admin: Arc<dyn AdminApi>) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            last_refreshed: Arc::new(RwLock::new(None)),
            admin,
        }
    }

    /// Fetch the full listing and make it the cache contents.
    ///
    /// On upstream failure the cache is left untouched.
    pub async fn list_properties(&self, credential: &Credential) -> Result<Vec<PropertyRecord>, CacheError> {
        let properties = self.admin.list_properties(credential).await?;

        for property in &properties {
            self.entries.insert(property.id.clone(), property.clone());
        }
        // Ids the listing no longer returns are gone. Point lookups may insert
        // concurrently, so evictions are counted, not derived from `len()`.
        let listed: HashSet<&str> = properties.iter().map(|p| p.id.as_str()).collect();
        let mut evicted = 0usize;
        self.entries.retain(|id, _| {
            let keep = listed.contains(id.as_str());
            if !keep {
                evicted += 1;
            }
            keep
        });

        if let Ok(mut at) = self.last_refreshed.write() {
            *at = Some(Utc::now());
        }
        tracing::info!(count = properties.len(), evicted, "property cache refreshed");
        Ok(properties)
    }

    /// Cached record, or one point lookup on a miss. `Ok(None)` when the
    /// property does not exist or is not accessible.
    pub async fn get_property(
        &self,
        credential: &Credential,
        property_id: &str,
    ) -> Result<Option<PropertyRecord>, CacheError> {
        if let Some(hit) = self.entries.get(property_id) {
            return Ok(Some(hit.clone()));
        }

        let fetched = self.admin.get_property(credential, property_id).await?;
        if let Some(property) = &fetched {
            self.entries.insert(property.id.clone(), property.clone());
        }
        Ok(fetched)
    }

    /// True if the id is accessible. A miss triggers exactly one listing; an
    /// upstream failure during it is an error, not `false`.
    pub async fn validate(&self, credential: &Credential, property_id: &str) -> Result<bool, CacheError> {
        if self.entries.contains_key(property_id) {
            return Ok(true);
        }

        tracing::debug!(property_id, "property not cached, refreshing listing");
        self.list_properties(credential).await?;
        Ok(self.entries.contains_key(property_id))
    }

    /// Currently cached ids, sorted.
    pub fn known_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn invalidate(&self) {
        self.entries.clear();
        if let Ok(mut at) = self.last_refreshed.write() {
            *at = None;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_refreshed(&self) -> Option<DateTime<Utc>> {
        self.last_refreshed.read().ok().and_then(|at| *at)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted Admin API counting its calls.
    pub(crate) struct FakeAdmin {
        pub(crate) listing: Mutex<Result<Vec<PropertyRecord>, ApiError>>,
        pub(crate) list_calls: AtomicUsize,
        pub(crate) get_calls: AtomicUsize,
    }

    impl FakeAdmin {
        pub(crate) fn new(ids: &[&str]) -> Self {
            Self {
                listing: Mutex::new(Ok(ids.iter().map(|id| record(id)).collect())),
                list_calls: AtomicUsize::new(0),
                get_calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn set_listing(&self, listing: Result<Vec<PropertyRecord>, ApiError>) {
            *self.listing.lock().unwrap() = listing;
        }
    }

    #[async_trait]
    impl AdminApi for FakeAdmin {
        async fn list_properties(&self, _: &Credential) -> Result<Vec<PropertyRecord>, ApiError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            self.listing.lock().unwrap().clone()
        }

        async fn get_property(&self, _: &Credential, id: &str) -> Result<Option<PropertyRecord>, ApiError> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            let listing = self.listing.lock().unwrap().clone()?;
            Ok(listing.into_iter().find(|p| p.id == id))
        }
    }

    pub(crate) fn record(id: &str) -> PropertyRecord {
        PropertyRecord {
            id: id.to_string(),
            display_name: format!("Property {}", id),
            create_time: None,
            update_time: None,
            parent: "accounts/1".into(),
            account_name: Some("Account".into()),
        }
    }

    pub(crate) fn credential() -> Credential {
        Credential {
            access_token: "ya29.t".into(),
            refresh_token: "1//r".into(),
            expiry: Utc::now() + Duration::hours(1),
            scopes: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_validate_hit_needs_no_upstream() {
        let admin = Arc::new(FakeAdmin::new(&["123456"]));
        let cache = PropertyCache::new(admin.clone());
        cache.list_properties(&credential()).await.unwrap();

        assert!(cache.validate(&credential(), "123456").await.unwrap());
        assert_eq!(admin.list_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_validate_miss_lists_exactly_once() {
        let admin = Arc::new(FakeAdmin::new(&["123456", "789012"]));
        let cache = PropertyCache::new(admin.clone());

        assert!(cache.validate(&credential(), "789012").await.unwrap());
        assert_eq!(admin.list_calls.load(Ordering::SeqCst), 1);

        assert!(!cache.validate(&credential(), "999999").await.unwrap());
        assert_eq!(admin.list_calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.known_ids(), vec!["123456", "789012"]);
    }

    #[tokio::test]
    async fn test_negative_is_never_stale() {
        let admin = Arc::new(FakeAdmin::new(&["123456"]));
        let cache = PropertyCache::new(admin.clone());
        assert!(!cache.validate(&credential(), "555").await.unwrap());

        // Access granted upstream after the first miss.
        admin.set_listing(Ok(vec![record("123456"), record("555")]));
        assert!(cache.validate(&credential(), "555").await.unwrap());
    }

    #[tokio::test]
    async fn test_upstream_failure_is_not_false() {
        let admin = Arc::new(FakeAdmin::new(&[]));
        admin.set_listing(Err(ApiError::Unavailable("HTTP 503".into())));
        let cache = PropertyCache::new(admin);

        let err = cache.validate(&credential(), "123456").await.unwrap_err();
        assert_eq!(err, CacheError::Upstream(ApiError::Unavailable("HTTP 503".into())));
    }

    #[tokio::test]
    async fn test_listing_replaces_contents() {
        let admin = Arc::new(FakeAdmin::new(&["1", "2"]));
        let cache = PropertyCache::new(admin.clone());
        cache.list_properties(&credential()).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.last_refreshed().is_some());

        admin.set_listing(Ok(vec![record("2"), record("3")]));
        cache.list_properties(&credential()).await.unwrap();
        assert_eq!(cache.known_ids(), vec!["2", "3"]);

        // A failed listing keeps what we had.
        admin.set_listing(Err(ApiError::Unauthorized));
        assert!(cache.list_properties(&credential()).await.is_err());
        assert_eq!(cache.known_ids(), vec!["2", "3"]);
    }

    #[tokio::test]
    async fn test_get_property_point_lookup_then_hit() {
        let admin = Arc::new(FakeAdmin::new(&["42"]));
        let cache = PropertyCache::new(admin.clone());

        assert_eq!(cache.get_property(&credential(), "42").await.unwrap(), Some(record("42")));
        assert_eq!(cache.get_property(&credential(), "42").await.unwrap(), Some(record("42")));
        assert_eq!(admin.get_calls.load(Ordering::SeqCst), 1);

        assert_eq!(cache.get_property(&credential(), "404").await.unwrap(), None);
        assert_eq!(admin.list_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_listings_and_point_lookups() {
        let first: Vec<String> = (0..1500).map(|i| i.to_string()).collect();
        let second: Vec<String> = (1000..3000).map(|i| i.to_string()).collect();
        let admin = Arc::new(FakeAdmin::new(&[]));
        let cache = PropertyCache::new(admin.clone());

        let mut tasks = Vec::new();
        for round in 0..200 {
            let ids = if round % 2 == 0 { &first } else { &second };
            admin.set_listing(Ok(ids.iter().map(|id| record(id)).collect()));
            let listing_cache = cache.clone();
            tasks.push(tokio::spawn(async move {
                listing_cache.list_properties(&credential()).await.map(|_| ())
            }));
            for i in 0..20 {
                let cache = cache.clone();
                let id = ((round * 20 + i) % 3000).to_string();
                tasks.push(tokio::spawn(async move {
                    cache.get_property(&credential(), &id).await.map(|_| ())
                }));
            }
        }

        for task in futures::future::join_all(tasks).await {
            task.expect("cache task panicked").unwrap();
        }
        assert!(cache.len() <= 3000);
        assert!(cache.last_refreshed().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_clears() {
        let cache = PropertyCache::new(Arc::new(FakeAdmin::new(&["1"])));
        cache.list_properties(&credential()).await.unwrap();
        cache.invalidate();
        assert!(cache.is_empty());
        assert!(cache.last_refreshed().is_none());
    }
}
