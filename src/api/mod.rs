//! Remote recipe data source.

mod client;

use std::future::Future;
use std::sync::Arc;

pub use client::RecipesApi;

use crate::error::Result;
use crate::models::{Category, Recipe};

/// A remote source of categories and their recipes.
pub trait RecipeSource: Send + Sync + 'static {
    fn list_categories(&self) -> impl Future<Output = Result<Vec<Category>>> + Send;

    fn list_recipes_by_category(
        &self,
        category_id: i64,
    ) -> impl Future<Output = Result<Vec<Recipe>>> + Send;
}

impl<T: RecipeSource> RecipeSource for Arc<T> {
    fn list_categories(&self) -> impl Future<Output = Result<Vec<Category>>> + Send {
        (**self).list_categories()
    }

    fn list_recipes_by_category(
        &self,
        category_id: i64,
    ) -> impl Future<Output = Result<Vec<Recipe>>> + Send {
        (**self).list_recipes_by_category(category_id)
    }
}
