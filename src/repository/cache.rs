use std::collections::{BTreeMap, HashMap};
use std::future::Future;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::db::SqliteCache;
use crate::error::Result;
use crate::models::{Category, Recipe};

/// A unit of cached data that is fetched and invalidated as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheScope {
    Categories,
    Recipes(i64),
}

impl CacheScope {
    pub fn key(&self) -> String {
        match self {
            CacheScope::Categories => "categories".to_string(),
            CacheScope::Recipes(category_id) => format!("recipes:{}", category_id),
        }
    }
}

/// Local storage for fetched categories and recipes.
///
/// `None` from a lookup means the scope was never fetched; an empty list means
/// it was fetched and came back empty.
pub trait RecipeCache: Send + Sync + 'static {
    fn categories(&self) -> impl Future<Output = Result<Option<Vec<Category>>>> + Send;

    fn put_categories(
        &self,
        categories: Vec<Category>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn recipes_for(
        &self,
        category_id: i64,
    ) -> impl Future<Output = Result<Option<Vec<Recipe>>>> + Send;

    fn put_recipes(
        &self,
        category_id: i64,
        recipes: Vec<Recipe>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Look a recipe up across every cached category.
    fn find_recipe(&self, recipe_id: i64) -> impl Future<Output = Result<Option<Recipe>>> + Send;

    /// Case-insensitive title search over cached recipes.
    fn search(&self, query: &str) -> impl Future<Output = Result<Vec<Recipe>>> + Send;

    fn invalidate(&self, category_id: i64) -> impl Future<Output = Result<()>> + Send;

    fn clear(&self) -> impl Future<Output = Result<()>> + Send;

    fn last_fetched(
        &self,
        scope: CacheScope,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send;
}

pub(crate) fn title_matches(recipe: &Recipe, query: &str) -> bool {
    recipe
        .title
        .to_lowercase()
        .contains(&query.trim().to_lowercase())
}

#[derive(Default)]
struct CacheState {
    categories: Option<Vec<Category>>,
    recipes: HashMap<i64, Vec<Recipe>>,
    fetched: HashMap<CacheScope, DateTime<Utc>>,
}

/// Collapse a recipe listed under several categories into one entry
/// carrying every category id, sorted.
fn merge_listings<'a>(listings: impl Iterator<Item = &'a Recipe>) -> BTreeMap<i64, Recipe> {
    let mut merged: BTreeMap<i64, Recipe> = BTreeMap::new();
    for recipe in listings {
        let entry = merged.entry(recipe.id).or_insert_with(|| recipe.clone());
        for &category_id in &recipe.category_ids {
            entry.tag_category(category_id);
        }
    }
    for recipe in merged.values_mut() {
        recipe.category_ids.sort_unstable();
    }
    merged
}

/// In-memory cache; every access goes through one lock.
#[derive(Default)]
pub struct MemoryCache {
    state: Mutex<CacheState>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecipeCache for MemoryCache {
    async fn categories(&self) -> Result<Option<Vec<Category>>> {
        Ok(self.state.lock().await.categories.clone())
    }

    async fn put_categories(&self, categories: Vec<Category>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.categories = Some(categories);
        state.fetched.insert(CacheScope::Categories, Utc::now());
        Ok(())
    }

    async fn recipes_for(&self, category_id: i64) -> Result<Option<Vec<Recipe>>> {
        Ok(self.state.lock().await.recipes.get(&category_id).cloned())
    }

    async fn put_recipes(&self, category_id: i64, recipes: Vec<Recipe>) -> Result<()> {
        let mut state = self.state.lock().await;
        state.recipes.insert(category_id, recipes);
        state
            .fetched
            .insert(CacheScope::Recipes(category_id), Utc::now());
        Ok(())
    }

    async fn find_recipe(&self, recipe_id: i64) -> Result<Option<Recipe>> {
        let state = self.state.lock().await;
        let mut found = merge_listings(
            state
                .recipes
                .values()
                .flatten()
                .filter(|recipe| recipe.id == recipe_id),
        );
        Ok(found.remove(&recipe_id))
    }

    async fn search(&self, query: &str) -> Result<Vec<Recipe>> {
        let state = self.state.lock().await;
        let mut found: Vec<Recipe> = merge_listings(
            state
                .recipes
                .values()
                .flatten()
                .filter(|recipe| title_matches(recipe, query)),
        )
        .into_values()
        .collect();
        found.sort_by_key(|recipe| recipe.title.to_lowercase());
        Ok(found)
    }

    async fn invalidate(&self, category_id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        state.recipes.remove(&category_id);
        state.fetched.remove(&CacheScope::Recipes(category_id));
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.state.lock().await = CacheState::default();
        Ok(())
    }

    async fn last_fetched(&self, scope: CacheScope) -> Result<Option<DateTime<Utc>>> {
        Ok(self.state.lock().await.fetched.get(&scope).copied())
    }
}

/// Cache selected at runtime from configuration.
pub enum CacheBackend {
    Memory(MemoryCache),
    Database(SqliteCache),
}

impl RecipeCache for CacheBackend {
    async fn categories(&self) -> Result<Option<Vec<Category>>> {
        match self {
            CacheBackend::Memory(cache) => cache.categories().await,
            CacheBackend::Database(cache) => cache.categories().await,
        }
    }

    async fn put_categories(&self, categories: Vec<Category>) -> Result<()> {
        match self {
            CacheBackend::Memory(cache) => cache.put_categories(categories).await,
            CacheBackend::Database(cache) => cache.put_categories(categories).await,
        }
    }

    async fn recipes_for(&self, category_id: i64) -> Result<Option<Vec<Recipe>>> {
        match self {
            CacheBackend::Memory(cache) => cache.recipes_for(category_id).await,
            CacheBackend::Database(cache) => cache.recipes_for(category_id).await,
        }
    }

    async fn put_recipes(&self, category_id: i64, recipes: Vec<Recipe>) -> Result<()> {
        match self {
            CacheBackend::Memory(cache) => cache.put_recipes(category_id, recipes).await,
            CacheBackend::Database(cache) => cache.put_recipes(category_id, recipes).await,
        }
    }

    async fn find_recipe(&self, recipe_id: i64) -> Result<Option<Recipe>> {
        match self {
            CacheBackend::Memory(cache) => cache.find_recipe(recipe_id).await,
            CacheBackend::Database(cache) => cache.find_recipe(recipe_id).await,
        }
    }

    async fn search(&self, query: &str) -> Result<Vec<Recipe>> {
        match self {
            CacheBackend::Memory(cache) => cache.search(query).await,
            CacheBackend::Database(cache) => cache.search(query).await,
        }
    }

    async fn invalidate(&self, category_id: i64) -> Result<()> {
        match self {
            CacheBackend::Memory(cache) => cache.invalidate(category_id).await,
            CacheBackend::Database(cache) => cache.invalidate(category_id).await,
        }
    }

    async fn clear(&self) -> Result<()> {
        match self {
            CacheBackend::Memory(cache) => cache.clear().await,
            CacheBackend::Database(cache) => cache.clear().await,
        }
    }

    async fn last_fetched(&self, scope: CacheScope) -> Result<Option<DateTime<Utc>>> {
        match self {
            CacheBackend::Memory(cache) => cache.last_fetched(scope).await,
            CacheBackend::Database(cache) => cache.last_fetched(scope).await,
        }
    }
}
