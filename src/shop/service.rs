//! Shop Lookup Service
//!
//! Cached reads of shop rows and the shop-type list. Updates write the row
//! first and then delete its cache entry; the next read repopulates it.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::cache::{CacheClient, KeySpace};
use crate::domain::ports::{Shop, ShopRepository, ShopType};
use crate::error::{Error, Result};
use crate::keys;

/// The type list is a single key; its id part is empty.
const SHOP_TYPE_LIST: KeySpace = KeySpace::new(keys::CACHE_SHOP_TYPE_LIST_KEY, keys::LOCK_SHOP_KEY);

/// Read strategy for a shop lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheStrategy {
    /// TTL entries with null caching
    #[default]
    PassThrough,
    /// Single loader per miss, others wait
    Mutex,
    /// Stale-while-rebuilding; the entry must be warmed first
    LogicalExpiry,
}

/// Cached access to shops.
#[derive(Clone)]
pub struct ShopService {
    shops: Arc<dyn ShopRepository>,
    cache: CacheClient,
    shop_ttl: Duration,
    logical_ttl: Duration,
}

impl std::fmt::Debug for ShopService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShopService")
            .field("shop_ttl", &self.shop_ttl)
            .field("logical_ttl", &self.logical_ttl)
            .finish_non_exhaustive()
    }
}

impl ShopService {
    pub fn new(shops: Arc<dyn ShopRepository>, cache: CacheClient) -> Self {
        Self {
            shops,
            cache,
            shop_ttl: keys::CACHE_SHOP_TTL,
            logical_ttl: keys::CACHE_SHOP_TTL,
        }
    }

    /// Override the store TTL and the logical TTL used by rebuilds.
    pub fn with_ttls(mut self, shop_ttl: Duration, logical_ttl: Duration) -> Self {
        self.shop_ttl = shop_ttl;
        self.logical_ttl = logical_ttl;
        self
    }

    #[instrument(skip(self))]
    pub async fn query_by_id(&self, id: u64, strategy: CacheStrategy) -> Result<Option<Shop>> {
        if id == 0 {
            return Err(Error::Validation("shop id must be non-zero".into()));
        }

        let shops = Arc::clone(&self.shops);
        let loader = move |id: u64| async move { shops.get_shop(id).await };

        match strategy {
            CacheStrategy::PassThrough => {
                self.cache
                    .get(&KeySpace::SHOP, id, loader, self.shop_ttl)
                    .await
            }
            CacheStrategy::Mutex => {
                self.cache
                    .get_with_mutex(&KeySpace::SHOP, id, loader, self.shop_ttl)
                    .await
            }
            CacheStrategy::LogicalExpiry => {
                self.cache
                    .get_with_logical_expiry(&KeySpace::SHOP_HOT, id, loader, self.logical_ttl)
                    .await
            }
        }
    }

    /// Write the row, then drop the cached copies.
    #[instrument(skip(self, shop), fields(shop_id = shop.id))]
    pub async fn update_shop(&self, shop: &Shop) -> Result<()> {
        if shop.id == 0 {
            return Err(Error::Validation("shop id must be provided".into()));
        }
        if !self.shops.update_shop(shop).await? {
            return Err(Error::Validation(format!("shop {} does not exist", shop.id)));
        }
        self.cache.invalidate(&keys::shop_cache_key(shop.id)).await?;
        self.cache
            .invalidate(&keys::shop_hot_cache_key(shop.id))
            .await?;
        info!(shop_id = shop.id, "Shop updated; cache entries dropped");
        Ok(())
    }

    /// Load a shop and store it as a logically expiring entry.
    /// Returns false if the shop does not exist.
    #[instrument(skip(self))]
    pub async fn warm_shop(&self, id: u64, logical_ttl: Duration) -> Result<bool> {
        match self.shops.get_shop(id).await? {
            Some(shop) => {
                self.cache
                    .set_with_logical_expiry(&keys::shop_hot_cache_key(id), &shop, logical_ttl)
                    .await?;
                debug!(shop_id = id, "Shop cache warmed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// All shop types ordered by `sort`.
    pub async fn query_type_list(&self) -> Result<Vec<ShopType>> {
        let shops = Arc::clone(&self.shops);
        let loader = move |_: &str| async move {
            let types = shops.list_shop_types().await?;
            Ok::<_, Error>(if types.is_empty() { None } else { Some(types) })
        };

        let types = self
            .cache
            .get(&SHOP_TYPE_LIST, "", loader, self.shop_ttl)
            .await?;
        Ok(types.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryShopRepository, InMemoryStore};
    use crate::domain::ports::KeyValueStore;
    use assert_matches::assert_matches;

    fn shop(id: u64, name: &str) -> Shop {
        Shop {
            id,
            name: name.to_string(),
            type_id: 1,
            area: "Riverside".into(),
            address: format!("{} Harbour Rd", id),
            avg_price: 60,
            score: 47,
        }
    }

    fn service() -> (Arc<InMemoryStore>, Arc<InMemoryShopRepository>, ShopService) {
        let store = Arc::new(InMemoryStore::new());
        let repo = Arc::new(InMemoryShopRepository::new());
        let service = ShopService::new(repo.clone(), CacheClient::new(store.clone()));
        (store, repo, service)
    }

    #[tokio::test]
    async fn test_pass_through_hits_repository_once() {
        let (store, repo, service) = service();
        repo.insert_shop(shop(1, "Noodle Bar"));

        for _ in 0..3 {
            let found = service.query_by_id(1, CacheStrategy::PassThrough).await.unwrap();
            assert_eq!(found.unwrap().name, "Noodle Bar");
        }
        assert_eq!(repo.reads(), 1);
        assert!(store.get("cache:shop:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unknown_shop_is_null_cached() {
        let (_, repo, service) = service();
        for strategy in [CacheStrategy::PassThrough, CacheStrategy::Mutex] {
            assert!(service.query_by_id(404, strategy).await.unwrap().is_none());
        }
        assert_eq!(repo.reads(), 1);
    }

    #[tokio::test]
    async fn test_update_invalidates_cache() {
        let (store, repo, service) = service();
        repo.insert_shop(shop(1, "Old Name"));
        service.query_by_id(1, CacheStrategy::PassThrough).await.unwrap();

        service.update_shop(&shop(1, "New Name")).await.unwrap();
        assert!(store.get("cache:shop:1").await.unwrap().is_none());

        let found = service.query_by_id(1, CacheStrategy::PassThrough).await.unwrap();
        assert_eq!(found.unwrap().name, "New Name");
        assert_eq!(repo.reads(), 2);
    }

    #[tokio::test]
    async fn test_update_validation() {
        let (_, _, service) = service();
        assert_matches!(
            service.update_shop(&shop(0, "nameless")).await,
            Err(Error::Validation(_))
        );
        assert_matches!(
            service.update_shop(&shop(77, "ghost")).await,
            Err(Error::Validation(_))
        );
        assert_matches!(
            service.query_by_id(0, CacheStrategy::Mutex).await,
            Err(Error::Validation(_))
        );
    }

    #[tokio::test]
    async fn test_logical_expiry_needs_warm_entry() {
        let (_, repo, service) = service();
        repo.insert_shop(shop(1, "Bakery"));

        assert!(service
            .query_by_id(1, CacheStrategy::LogicalExpiry)
            .await
            .unwrap()
            .is_none());

        assert!(service.warm_shop(1, Duration::from_secs(60)).await.unwrap());
        assert!(!service.warm_shop(2, Duration::from_secs(60)).await.unwrap());
        let found = service
            .query_by_id(1, CacheStrategy::LogicalExpiry)
            .await
            .unwrap();
        assert_eq!(found.unwrap().name, "Bakery");
    }

    #[tokio::test]
    async fn test_strategies_can_be_mixed_on_one_shop() {
        let (store, repo, service) = service();
        repo.insert_shop(shop(1, "Dumpling Hall"));

        let plain = service.query_by_id(1, CacheStrategy::PassThrough).await.unwrap();
        assert!(service.warm_shop(1, Duration::from_secs(60)).await.unwrap());
        let hot = service.query_by_id(1, CacheStrategy::LogicalExpiry).await.unwrap();
        let guarded = service.query_by_id(1, CacheStrategy::Mutex).await.unwrap();

        assert_eq!(plain.unwrap().name, "Dumpling Hall");
        assert_eq!(hot.unwrap().name, "Dumpling Hall");
        assert_eq!(guarded.unwrap().name, "Dumpling Hall");
        assert!(store.get("cache:shop:1").await.unwrap().is_some());
        assert!(store.get("cache:shop-hot:1").await.unwrap().is_some());

        service.update_shop(&shop(1, "Dumpling Palace")).await.unwrap();
        assert!(store.get("cache:shop:1").await.unwrap().is_none());
        assert!(store.get("cache:shop-hot:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_type_list_cached_sorted() {
        let (store, repo, service) = service();
        for (id, name, sort) in [(1, "Food", 2), (2, "KTV", 1)] {
            repo.insert_shop_type(ShopType {
                id,
                name: name.into(),
                icon: format!("/types/{}.png", id),
                sort,
            });
        }

        let first = service.query_type_list().await.unwrap();
        let second = service.query_type_list().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            vec!["KTV", "Food"]
        );
        assert_eq!(repo.reads(), 1);
        assert!(store
            .get("cache:shop-type:list")
            .await
            .unwrap()
            .is_some());
    }
}
