//! Recipe repository: remote source in front, local cache behind.
//!
//! Read operations serve from the cache and fall back to the source on a miss.
//! They never fail: errors are logged and degrade to empty results. Explicit
//! refreshes bypass the cache and return errors to the caller.

mod cache;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinSet;

pub use cache::{CacheBackend, CacheScope, MemoryCache, RecipeCache};
pub(crate) use cache::title_matches;

use crate::api::RecipeSource;
use crate::error::Result;
use crate::models::{Category, Recipe};

pub struct RecipeRepository<S, C> {
    source: Arc<S>,
    cache: Arc<C>,
    /// Bumped after every cache write; drives the watch streams.
    revision: Arc<watch::Sender<u64>>,
    background: Mutex<JoinSet<()>>,
}

impl<S: RecipeSource, C: RecipeCache> RecipeRepository<S, C> {
    pub fn new(source: S, cache: C) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            source: Arc::new(source),
            cache: Arc::new(cache),
            revision: Arc::new(revision),
            background: Mutex::new(JoinSet::new()),
        }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    /// Cached categories, fetching them on first use. Empty on failure.
    pub async fn get_categories(&self) -> Vec<Category> {
        match self.cache.categories().await {
            Ok(Some(categories)) => {
                tracing::debug!("Using {} cached categories", categories.len());
                return categories;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Failed to read cached categories: {}", e),
        }

        match fetch_categories(&*self.source, &*self.cache, &self.revision).await {
            Ok(categories) => categories,
            Err(e) => {
                tracing::warn!("Failed to load categories: {}", e);
                Vec::new()
            }
        }
    }

    /// Cached recipes of one category, fetching them on first use. Empty on failure.
    pub async fn get_recipes_by_category(&self, category_id: i64) -> Vec<Recipe> {
        match self.cache.recipes_for(category_id).await {
            Ok(Some(recipes)) => {
                tracing::debug!(
                    "Using {} cached recipes for category {}",
                    recipes.len(),
                    category_id
                );
                return recipes;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(
                "Failed to read cached recipes for category {}: {}",
                category_id,
                e
            ),
        }

        match fetch_recipes(&*self.source, &*self.cache, &self.revision, category_id).await {
            Ok(recipes) => recipes,
            Err(e) => {
                tracing::warn!("Failed to load recipes for category {}: {}", category_id, e);
                Vec::new()
            }
        }
    }

    /// A single recipe from the cache, or by scanning every category remotely.
    pub async fn get_recipe(&self, recipe_id: i64) -> Option<Recipe> {
        if let Some(recipe) = self.cached_recipe(recipe_id).await {
            return Some(recipe);
        }

        match self.force_load_recipe(recipe_id).await {
            Ok(recipe) => recipe,
            Err(e) => {
                tracing::warn!("Failed to load recipe {}: {}", recipe_id, e);
                None
            }
        }
    }

    /// Cache-only lookup; never touches the network.
    pub async fn cached_recipe(&self, recipe_id: i64) -> Option<Recipe> {
        match self.cache.find_recipe(recipe_id).await {
            Ok(recipe) => recipe,
            Err(e) => {
                tracing::warn!("Failed to read cached recipe {}: {}", recipe_id, e);
                None
            }
        }
    }

    /// Fetch category lists one by one until `recipe_id` turns up.
    ///
    /// Each fetched list is cached. A category that fails to load is skipped;
    /// failing to list the categories themselves is an error.
    pub async fn force_load_recipe(&self, recipe_id: i64) -> Result<Option<Recipe>> {
        let categories = fetch_categories(&*self.source, &*self.cache, &self.revision).await?;

        for category in categories {
            let recipes =
                match fetch_recipes(&*self.source, &*self.cache, &self.revision, category.id)
                    .await
                {
                    Ok(recipes) => recipes,
                    Err(e) => {
                        tracing::warn!(
                            "Skipping category {} while looking for recipe {}: {}",
                            category.id,
                            recipe_id,
                            e
                        );
                        continue;
                    }
                };

            if let Some(recipe) = recipes.into_iter().find(|r| r.id == recipe_id) {
                tracing::debug!("Found recipe {} in category {}", recipe_id, category.id);
                return Ok(Some(recipe));
            }
        }

        tracing::debug!("Recipe {} not found in any category", recipe_id);
        Ok(None)
    }

    pub async fn refresh_categories(&self) -> Result<Vec<Category>> {
        fetch_categories(&*self.source, &*self.cache, &self.revision).await
    }

    pub async fn refresh_recipes(&self, category_id: i64) -> Result<Vec<Recipe>> {
        fetch_recipes(&*self.source, &*self.cache, &self.revision, category_id).await
    }

    pub async fn invalidate_category(&self, category_id: i64) -> Result<()> {
        self.cache.invalidate(category_id).await?;
        bump(&self.revision);
        tracing::debug!("Invalidated cached recipes for category {}", category_id);
        Ok(())
    }

    pub async fn clear_cache(&self) -> Result<()> {
        self.cache.clear().await?;
        bump(&self.revision);
        tracing::info!("Cleared recipe cache");
        Ok(())
    }

    /// Title search over cached recipes only.
    pub async fn search_recipes(&self, query: &str) -> Vec<Recipe> {
        self.cache.search(query).await.unwrap_or_else(|e| {
            tracing::warn!("Failed to search cached recipes: {}", e);
            Vec::new()
        })
    }

    pub async fn last_fetched(&self, scope: CacheScope) -> Option<DateTime<Utc>> {
        self.cache.last_fetched(scope).await.unwrap_or_else(|e| {
            tracing::warn!("Failed to read fetch time for {}: {}", scope.key(), e);
            None
        })
    }

    /// Resolve many ids with at most `concurrency` lookups in flight.
    ///
    /// Ids that resolve to nothing are dropped. The result is ordered by id.
    pub async fn resolve_recipes<I>(&self, ids: I, concurrency: usize) -> Vec<Recipe>
    where
        I: IntoIterator<Item = i64>,
    {
        let ids: BTreeSet<i64> = ids.into_iter().collect();
        let mut recipes: Vec<Recipe> = stream::iter(ids)
            .map(|id| async move { self.get_recipe(id).await })
            .buffer_unordered(concurrency.max(1))
            .filter_map(|recipe| async move { recipe })
            .collect()
            .await;
        recipes.sort_by_key(|recipe| recipe.id);
        recipes
    }

    /// Cached categories now, then again after every cache write.
    ///
    /// Also starts a background refresh whose failure is only logged.
    pub fn watch_categories(&self) -> impl Stream<Item = Vec<Category>> + Send + 'static {
        let source = Arc::clone(&self.source);
        let cache = Arc::clone(&self.cache);
        let revision = Arc::clone(&self.revision);
        self.spawn_background(async move {
            match fetch_categories(&*source, &*cache, &revision).await {
                Ok(categories) => tracing::debug!(
                    "Background refresh stored {} categories",
                    categories.len()
                ),
                Err(e) => tracing::warn!("Background category refresh failed: {}", e),
            }
        });

        let cache = Arc::clone(&self.cache);
        self.observe(move || {
            let cache = Arc::clone(&cache);
            async move {
                cache
                    .categories()
                    .await
                    .unwrap_or_else(|e| {
                        tracing::warn!("Failed to read cached categories: {}", e);
                        None
                    })
                    .unwrap_or_default()
            }
        })
    }

    /// Cached recipes of one category now, then again after every cache write.
    pub fn watch_recipes(&self, category_id: i64) -> impl Stream<Item = Vec<Recipe>> + Send + 'static {
        let source = Arc::clone(&self.source);
        let cache = Arc::clone(&self.cache);
        let revision = Arc::clone(&self.revision);
        self.spawn_background(async move {
            if let Err(e) = fetch_recipes(&*source, &*cache, &revision, category_id).await {
                tracing::warn!(
                    "Background refresh of category {} failed: {}",
                    category_id,
                    e
                );
            }
        });

        let cache = Arc::clone(&self.cache);
        self.observe(move || {
            let cache = Arc::clone(&cache);
            async move {
                cache
                    .recipes_for(category_id)
                    .await
                    .unwrap_or_else(|e| {
                        tracing::warn!(
                            "Failed to read cached recipes for category {}: {}",
                            category_id,
                            e
                        );
                        None
                    })
                    .unwrap_or_default()
            }
        })
    }

    /// Abort outstanding background refreshes. An in-flight cache write may or may not land.
    pub fn shutdown(&self) {
        self.background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
    }

    fn spawn_background<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut background = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while background.try_join_next().is_some() {}
        background.spawn(task);
    }

    fn observe<T, L, Fut>(&self, load: L) -> impl Stream<Item = T> + Send + 'static
    where
        T: Send + 'static,
        L: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        let rx = self.revision.subscribe();
        stream::unfold((rx, load, true), |(mut rx, load, first)| async move {
            if first {
                rx.borrow_and_update();
            } else if rx.changed().await.is_err() {
                return None;
            }
            let value = load().await;
            Some((value, (rx, load, false)))
        })
    }
}

fn bump(revision: &watch::Sender<u64>) {
    revision.send_modify(|r| *r = r.wrapping_add(1));
}

async fn fetch_categories<S, C>(
    source: &S,
    cache: &C,
    revision: &watch::Sender<u64>,
) -> Result<Vec<Category>>
where
    S: RecipeSource,
    C: RecipeCache,
{
    let categories = source.list_categories().await?;
    cache.put_categories(categories.clone()).await?;
    bump(revision);
    tracing::info!("Fetched {} categories", categories.len());
    Ok(categories)
}

async fn fetch_recipes<S, C>(
    source: &S,
    cache: &C,
    revision: &watch::Sender<u64>,
    category_id: i64,
) -> Result<Vec<Recipe>>
where
    S: RecipeSource,
    C: RecipeCache,
{
    let mut recipes = source.list_recipes_by_category(category_id).await?;
    for recipe in &mut recipes {
        recipe.tag_category(category_id);
    }
    cache.put_recipes(category_id, recipes.clone()).await?;
    bump(revision);
    tracing::info!(
        "Fetched {} recipes for category {}",
        recipes.len(),
        category_id
    );
    Ok(recipes)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::api::mock::{category, recipe, MockSource};
    use crate::db::SqliteCache;
    use tokio_test::{assert_err, assert_ok};

    fn memory_repo(source: &Arc<MockSource>) -> RecipeRepository<Arc<MockSource>, MemoryCache> {
        RecipeRepository::new(Arc::clone(source), MemoryCache::new())
    }

    #[tokio::test]
    async fn recipes_are_fetched_once_per_category() {
        let source = Arc::new(MockSource::two_categories());
        let repo = memory_repo(&source);

        let first = repo.get_recipes_by_category(1).await;
        let second = repo.get_recipes_by_category(1).await;
        let third = repo.get_recipes_by_category(1).await;

        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
        assert_eq!(second, third);
        assert_eq!(source.recipe_calls_for(1), 1);

        repo.get_recipes_by_category(2).await;
        assert_eq!(source.recipe_calls_for(2), 1);
    }

    #[tokio::test]
    async fn categories_are_fetched_once() {
        let source = Arc::new(MockSource::two_categories());
        let repo = memory_repo(&source);

        assert_eq!(repo.get_categories().await, vec![category(1), category(2)]);
        assert_eq!(repo.get_categories().await, vec![category(1), category(2)]);
        assert_eq!(source.category_calls(), 1);
    }

    #[tokio::test]
    async fn clear_cache_forces_refetch() {
        let source = Arc::new(MockSource::two_categories());
        let repo = memory_repo(&source);

        repo.get_categories().await;
        repo.get_recipes_by_category(1).await;
        assert_ok!(repo.clear_cache().await);

        repo.get_categories().await;
        repo.get_recipes_by_category(1).await;
        assert_eq!(source.category_calls(), 2);
        assert_eq!(source.recipe_calls_for(1), 2);
    }

    #[tokio::test]
    async fn invalidate_refetches_only_that_category() {
        let source = Arc::new(MockSource::two_categories());
        let repo = memory_repo(&source);

        repo.get_recipes_by_category(1).await;
        repo.get_recipes_by_category(2).await;
        assert_ok!(repo.invalidate_category(1).await);

        repo.get_recipes_by_category(1).await;
        repo.get_recipes_by_category(2).await;
        assert_eq!(source.recipe_calls_for(1), 2);
        assert_eq!(source.recipe_calls_for(2), 1);
    }

    #[tokio::test]
    async fn get_recipe_scans_categories_in_order() {
        let source = Arc::new(MockSource::two_categories());
        let repo = memory_repo(&source);

        let found = repo.get_recipe(20).await.unwrap();
        assert_eq!(found.id, 20);
        assert_eq!(found.category_ids, vec![2]);
        assert_eq!(source.recipe_calls(), vec![1, 2]);

        let cached = repo.cache().recipes_for(2).await.unwrap().unwrap();
        assert_eq!(cached.iter().map(|r| r.id).collect::<Vec<_>>(), vec![20]);

        // Served from cache now
        assert_eq!(repo.get_recipe(20).await, Some(found));
        assert_eq!(source.recipe_calls(), vec![1, 2]);
    }

    #[tokio::test]
    async fn get_recipe_stops_at_first_hit() {
        let source = Arc::new(MockSource::two_categories());
        let repo = memory_repo(&source);

        assert!(repo.get_recipe(10).await.is_some());
        assert_eq!(source.recipe_calls(), vec![1]);
    }

    #[tokio::test]
    async fn unknown_recipe_is_none() {
        let source = Arc::new(MockSource::two_categories());
        let repo = memory_repo(&source);

        assert_eq!(repo.get_recipe(99).await, None);
        assert_eq!(source.recipe_calls(), vec![1, 2]);
    }

    #[tokio::test]
    async fn scan_skips_failing_category() {
        let source = Arc::new(MockSource::two_categories());
        source.fail_category(1);
        let repo = memory_repo(&source);

        let found = assert_ok!(repo.force_load_recipe(20).await);
        assert_eq!(found.map(|r| r.id), Some(20));
    }

    #[tokio::test]
    async fn read_failures_degrade_to_empty() {
        let source = Arc::new(MockSource::two_categories());
        source.set_failing(true);
        let repo = memory_repo(&source);

        assert!(repo.get_categories().await.is_empty());
        assert!(repo.get_recipes_by_category(1).await.is_empty());
        assert_eq!(repo.get_recipe(10).await, None);
    }

    #[tokio::test]
    async fn refresh_failures_propagate() {
        let source = Arc::new(MockSource::two_categories());
        source.set_failing(true);
        let repo = memory_repo(&source);

        assert_err!(repo.refresh_categories().await);
        assert_err!(repo.refresh_recipes(1).await);
        assert_err!(repo.force_load_recipe(10).await);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let source = Arc::new(MockSource::two_categories());
        source.set_failing(true);
        let repo = memory_repo(&source);

        assert!(repo.get_categories().await.is_empty());
        source.set_failing(false);
        assert_eq!(repo.get_categories().await.len(), 2);
        assert_eq!(source.category_calls(), 2);
    }

    #[tokio::test]
    async fn refresh_overwrites_cache() {
        let source = Arc::new(MockSource::two_categories());
        let repo = memory_repo(&source);

        repo.get_categories().await;
        source.set_categories(vec![category(3)]);

        assert_eq!(assert_ok!(repo.refresh_categories().await), vec![category(3)]);
        assert_eq!(repo.get_categories().await, vec![category(3)]);
        assert_eq!(source.category_calls(), 2);
    }

    #[tokio::test]
    async fn resolve_drops_unknown_ids_and_sorts() {
        let source = Arc::new(MockSource::new(
            vec![category(1), category(2)],
            vec![
                (1, vec![recipe(12), recipe(10)]),
                (2, vec![recipe(20)]),
            ],
        ));
        let repo = memory_repo(&source);

        let resolved = repo.resolve_recipes(vec![20, 99, 10, 12, 10], 2).await;
        assert_eq!(
            resolved.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![10, 12, 20]
        );
    }

    #[tokio::test]
    async fn search_uses_cache_only() {
        let source = Arc::new(MockSource::two_categories());
        let repo = memory_repo(&source);

        assert!(repo.search_recipes("recipe").await.is_empty());
        repo.get_recipes_by_category(1).await;

        let found = repo.search_recipes("recipe").await;
        assert_eq!(found.len(), 1);
        assert_eq!(source.recipe_calls(), vec![1]);
    }

    #[tokio::test]
    async fn watch_categories_emits_cached_then_fresh() {
        let source = Arc::new(MockSource::two_categories());
        let repo = memory_repo(&source);
        let mut updates = Box::pin(repo.watch_categories());

        let fresh = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match updates.next().await {
                    Some(categories) if !categories.is_empty() => return categories,
                    Some(_) => continue,
                    None => panic!("stream ended early"),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(fresh, vec![category(1), category(2)]);
        assert_eq!(source.category_calls(), 1);
    }

    #[tokio::test]
    async fn watch_recipes_sees_background_refresh_and_clear() {
        let source = Arc::new(MockSource::two_categories());
        let repo = memory_repo(&source);
        repo.get_recipes_by_category(1).await;
        let ids = |recipes: Vec<Recipe>| recipes.iter().map(|r| r.id).collect::<Vec<_>>();

        let mut updates = Box::pin(repo.watch_recipes(1));
        assert_eq!(ids(updates.next().await.unwrap()), vec![10]);

        let refreshed = tokio::time::timeout(Duration::from_secs(5), updates.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ids(refreshed), vec![10]);
        assert_eq!(source.recipe_calls_for(1), 2);

        assert_ok!(repo.clear_cache().await);
        let after_clear = tokio::time::timeout(Duration::from_secs(5), updates.next())
            .await
            .unwrap()
            .unwrap();
        assert!(after_clear.is_empty());
    }

    #[tokio::test]
    async fn watch_survives_background_failure() {
        let source = Arc::new(MockSource::two_categories());
        source.set_failing(true);
        let repo = memory_repo(&source);

        let mut updates = Box::pin(repo.watch_categories());
        assert_eq!(updates.next().await, Some(vec![]));

        tokio::time::timeout(Duration::from_secs(5), async {
            while source.category_calls() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        source.set_failing(false);
        assert_ok!(repo.refresh_categories().await);
        let next = tokio::time::timeout(Duration::from_secs(5), updates.next())
            .await
            .unwrap();
        assert_eq!(next, Some(vec![category(1), category(2)]));
    }

    #[tokio::test]
    async fn stream_ends_after_repository_drop() {
        let source = Arc::new(MockSource::two_categories());
        let repo = memory_repo(&source);
        let mut updates = Box::pin(repo.watch_categories());
        updates.next().await;

        repo.shutdown();
        drop(repo);

        let end = tokio::time::timeout(Duration::from_secs(5), async {
            while updates.next().await.is_some() {}
        })
        .await;
        assert!(end.is_ok());
    }

    #[tokio::test]
    async fn sqlite_backed_repository_scans_and_caches() {
        let source = Arc::new(MockSource::two_categories());
        let cache = SqliteCache::open_in_memory().await.unwrap();
        let repo = RecipeRepository::new(Arc::clone(&source), cache);

        let found = repo.get_recipe(20).await.unwrap();
        assert_eq!(found.category_ids, vec![2]);

        assert_eq!(repo.get_recipes_by_category(2).await, vec![found]);
        assert_eq!(source.recipe_calls_for(2), 1);
        assert!(repo.last_fetched(CacheScope::Recipes(2)).await.is_some());
    }
}
