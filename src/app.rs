use std::io::Write;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};

use crate::api::{RecipeSource, RecipesApi};
use crate::config::{CacheMode, Config};
use crate::db::{PreferenceStore, SqliteCache};
use crate::error::Result;
use crate::favorites::FavoritesStore;
use crate::models::{self, Category, Recipe};
use crate::repository::{CacheBackend, CacheScope, MemoryCache, RecipeCache, RecipeRepository};

pub const USAGE: &str = "\
Usage: recipe-shelf <command>

Commands:
  categories                      List recipe categories
  recipes <category_id>           List recipes of a category
  recipe <id> [--portions N]      Show a recipe, scaled to N portions
  search <query>                  Search cached recipes by title
  refresh [<category_id>]         Refetch categories or one category
  invalidate <category_id>        Drop one category's cached recipes
  clear-cache                     Remove all cached data
  favorites                       List favorite recipes
  favorite add|remove|toggle <id> Change favorites
  share <id>                      Print a shareable link
  status                          Show cache and favorites state
  watch [recipes <category_id>]   Print categories or recipes as they change
  watch favorites                 Print the favorite count as it changes
  watch favorite <id>             Print whether a recipe is a favorite as it changes

Watch commands run until Ctrl-C.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FavoriteAction {
    Add,
    Remove,
    Toggle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    Categories,
    Recipes(i64),
    Favorites,
    Favorite(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Categories,
    Recipes(i64),
    Recipe { id: i64, portions: Option<u32> },
    Search(String),
    Refresh(Option<i64>),
    Invalidate(i64),
    ClearCache,
    Favorites,
    Favorite(FavoriteAction, i64),
    Share(i64),
    Status,
    Watch(WatchTarget),
}

impl Command {
    /// Parse command-line arguments, program name excluded.
    pub fn parse(args: &[String]) -> Result<Self> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let command = match args.as_slice() {
            [] | ["help"] | ["--help"] | ["-h"] => Command::Help,
            ["categories"] => Command::Categories,
            ["recipes", category_id] => Command::Recipes(parse_id(category_id)?),
            ["recipe", id] => Command::Recipe {
                id: parse_id(id)?,
                portions: None,
            },
            ["recipe", id, "--portions", portions] => Command::Recipe {
                id: parse_id(id)?,
                portions: Some(
                    portions
                        .parse::<u32>()
                        .with_context(|| format!("invalid portion count: {}", portions))?,
                ),
            },
            ["search", query @ ..] if !query.is_empty() => Command::Search(query.join(" ")),
            ["refresh"] => Command::Refresh(None),
            ["refresh", category_id] => Command::Refresh(Some(parse_id(category_id)?)),
            ["invalidate", category_id] => Command::Invalidate(parse_id(category_id)?),
            ["clear-cache"] => Command::ClearCache,
            ["favorites"] => Command::Favorites,
            ["favorite", action, id] => {
                let action = match *action {
                    "add" => FavoriteAction::Add,
                    "remove" => FavoriteAction::Remove,
                    "toggle" => FavoriteAction::Toggle,
                    other => return Err(anyhow!("unknown favorite action: {}", other).into()),
                };
                Command::Favorite(action, parse_id(id)?)
            }
            ["share", id] => Command::Share(parse_id(id)?),
            ["status"] => Command::Status,
            ["watch"] => Command::Watch(WatchTarget::Categories),
            ["watch", "recipes", category_id] => {
                Command::Watch(WatchTarget::Recipes(parse_id(category_id)?))
            }
            ["watch", "favorites"] => Command::Watch(WatchTarget::Favorites),
            ["watch", "favorite", id] => Command::Watch(WatchTarget::Favorite(parse_id(id)?)),
            _ => return Err(anyhow!("unrecognized arguments: {}\n\n{}", args.join(" "), USAGE).into()),
        };
        Ok(command)
    }
}

fn parse_id(raw: &str) -> Result<i64> {
    Ok(raw
        .parse::<i64>()
        .with_context(|| format!("invalid id: {}", raw))?)
}

pub struct App<S: RecipeSource> {
    pub repository: RecipeRepository<S, CacheBackend>,
    pub favorites: FavoritesStore,
    images_base_url: String,
    share_base_url: String,
    resolve_concurrency: usize,
}

impl App<RecipesApi> {
    pub async fn new(config: &Config) -> Result<Self> {
        let source = RecipesApi::new(config)?;
        let cache = match config.cache {
            CacheMode::Database => CacheBackend::Database(SqliteCache::open(&config.db_path).await?),
            CacheMode::Memory => CacheBackend::Memory(MemoryCache::new()),
        };
        let prefs = PreferenceStore::open(&config.prefs_path).await?;

        Ok(Self::from_parts(
            RecipeRepository::new(source, cache),
            FavoritesStore::new(prefs.into()),
            config,
        ))
    }
}

impl<S: RecipeSource> App<S> {
    pub fn from_parts(
        repository: RecipeRepository<S, CacheBackend>,
        favorites: FavoritesStore,
        config: &Config,
    ) -> Self {
        Self {
            repository,
            favorites,
            images_base_url: config.images_base_url.clone(),
            share_base_url: config.share_base_url.clone(),
            resolve_concurrency: config.resolve_concurrency,
        }
    }

    pub async fn run<W: Write>(&self, command: Command, out: &mut W) -> Result<()> {
        match command {
            Command::Help => writeln!(out, "{}", USAGE)?,
            Command::Categories => {
                let categories = self.repository.get_categories().await;
                print_categories(&categories, out)?;
            }
            Command::Recipes(category_id) => {
                let recipes = self.repository.get_recipes_by_category(category_id).await;
                print_category_recipes(category_id, &recipes, out)?;
            }
            Command::Recipe { id, portions } => match self.repository.get_recipe(id).await {
                Some(recipe) => self.print_recipe(&recipe, portions, out).await?,
                None => writeln!(out, "Recipe {} not found.", id)?,
            },
            Command::Search(query) => {
                let recipes = self.repository.search_recipes(&query).await;
                if recipes.is_empty() {
                    writeln!(out, "No cached recipes match \"{}\".", query)?;
                }
                print_recipe_list(&recipes, out)?;
            }
            Command::Refresh(None) => {
                let categories = self.repository.refresh_categories().await?;
                writeln!(out, "Refreshed {} categories.", categories.len())?;
            }
            Command::Refresh(Some(category_id)) => {
                let recipes = self.repository.refresh_recipes(category_id).await?;
                writeln!(
                    out,
                    "Refreshed {} recipes in category {}.",
                    recipes.len(),
                    category_id
                )?;
            }
            Command::Invalidate(category_id) => {
                self.repository.invalidate_category(category_id).await?;
                writeln!(out, "Invalidated category {}.", category_id)?;
            }
            Command::ClearCache => {
                self.repository.clear_cache().await?;
                writeln!(out, "Cache cleared.")?;
            }
            Command::Favorites => self.print_favorites(out).await?,
            Command::Favorite(action, id) => {
                let now_favorite = match action {
                    FavoriteAction::Add => {
                        self.favorites.add(id).await?;
                        true
                    }
                    FavoriteAction::Remove => {
                        self.favorites.remove(id).await?;
                        false
                    }
                    FavoriteAction::Toggle => self.favorites.toggle(id).await?,
                };
                print_membership(id, now_favorite, out)?;
            }
            Command::Share(id) => match self.repository.get_recipe(id).await {
                Some(recipe) => writeln!(out, "{}", recipe.share_text(&self.share_base_url))?,
                None => writeln!(out, "Recipe {} not found.", id)?,
            },
            Command::Status => self.print_status(out).await?,
            Command::Watch(WatchTarget::Categories) => {
                watch(self.repository.watch_categories(), out, |out, categories| {
                    print_categories(&categories, out)
                })
                .await?
            }
            Command::Watch(WatchTarget::Recipes(category_id)) => {
                watch(self.repository.watch_recipes(category_id), out, |out, recipes| {
                    print_category_recipes(category_id, &recipes, out)
                })
                .await?
            }
            Command::Watch(WatchTarget::Favorites) => {
                watch(self.favorites.watch_count(), out, |out, count| {
                    writeln!(out, "Favorites: {}", count)?;
                    Ok(())
                })
                .await?
            }
            Command::Watch(WatchTarget::Favorite(id)) => {
                watch(self.favorites.watch_is_favorite(id), out, |out, favorite| {
                    print_membership(id, favorite, out)
                })
                .await?
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.repository.shutdown();
    }

    async fn print_recipe<W: Write>(
        &self,
        recipe: &Recipe,
        portions: Option<u32>,
        out: &mut W,
    ) -> Result<()> {
        let portions = portions.unwrap_or(recipe.servings.max(1));
        let ingredients = recipe.ingredients_for(portions)?;
        let marker = if self.favorites.is_favorite(recipe.id).await? {
            " ★"
        } else {
            ""
        };

        writeln!(out, "{} (#{}){}", recipe.title, recipe.id, marker)?;
        let image = models::image_url(&self.images_base_url, &recipe.image_url);
        if !image.is_empty() {
            writeln!(out, "Image: {}", image)?;
        }

        writeln!(out, "\nIngredients ({} portions):", portions)?;
        for ingredient in &ingredients {
            writeln!(out, "  - {}: {}", ingredient.description, ingredient.amount())?;
        }

        writeln!(out, "\nMethod:")?;
        for (step, text) in recipe.method.iter().enumerate() {
            writeln!(out, "  {}. {}", step + 1, text)?;
        }
        Ok(())
    }

    async fn print_favorites<W: Write>(&self, out: &mut W) -> Result<()> {
        let ids: Vec<i64> = self
            .favorites
            .all()
            .await?
            .iter()
            .filter_map(|id| match id.parse() {
                Ok(id) => Some(id),
                Err(_) => {
                    tracing::warn!("Ignoring malformed favorite id {:?}", id);
                    None
                }
            })
            .collect();

        if ids.is_empty() {
            writeln!(out, "No favorites yet.")?;
            return Ok(());
        }

        let recipes = self
            .repository
            .resolve_recipes(ids.iter().copied(), self.resolve_concurrency)
            .await;
        if recipes.len() < ids.len() {
            tracing::info!(
                "{} of {} favorites could not be resolved",
                ids.len() - recipes.len(),
                ids.len()
            );
        }
        if recipes.is_empty() {
            writeln!(out, "None of your {} favorites could be loaded.", ids.len())?;
        }
        print_recipe_list(&recipes, out)
    }

    async fn print_status<W: Write>(&self, out: &mut W) -> Result<()> {
        let cache = self.repository.cache();
        match cache.categories().await? {
            Some(categories) => {
                writeln!(
                    out,
                    "Categories: {} cached, fetched {}",
                    categories.len(),
                    fetched_label(self.repository.last_fetched(CacheScope::Categories).await)
                )?;
                for category in &categories {
                    let cached = cache.recipes_for(category.id).await?;
                    let label = match cached {
                        Some(recipes) => format!(
                            "{} recipes, fetched {}",
                            recipes.len(),
                            fetched_label(
                                self.repository
                                    .last_fetched(CacheScope::Recipes(category.id))
                                    .await
                            )
                        ),
                        None => "not cached".to_string(),
                    };
                    writeln!(out, "  {:>4}  {}: {}", category.id, category.title, label)?;
                }
            }
            None => writeln!(out, "Categories: not cached")?,
        }
        writeln!(out, "Favorites: {}", self.favorites.count().await?)?;
        Ok(())
    }
}

/// Print every update of `updates` until the stream ends or Ctrl-C is pressed.
async fn watch<W, T, St, F>(updates: St, out: &mut W, mut print: F) -> Result<()>
where
    W: Write,
    St: Stream<Item = T>,
    F: FnMut(&mut W, T) -> Result<()>,
{
    let mut updates = Box::pin(updates);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            update = updates.next() => match update {
                Some(update) => {
                    writeln!(out, "--- {} ---", Utc::now().format("%H:%M:%S"))?;
                    print(out, update)?;
                    out.flush()?;
                }
                None => break,
            },
            _ = &mut ctrl_c => break,
        }
    }
    Ok(())
}

fn print_categories<W: Write>(categories: &[Category], out: &mut W) -> Result<()> {
    if categories.is_empty() {
        writeln!(out, "No categories available.")?;
    }
    for category in categories {
        writeln!(out, "{:>4}  {}", category.id, category.title)?;
        if !category.description.is_empty() {
            writeln!(out, "      {}", category.description)?;
        }
    }
    Ok(())
}

fn print_category_recipes<W: Write>(category_id: i64, recipes: &[Recipe], out: &mut W) -> Result<()> {
    if recipes.is_empty() {
        writeln!(out, "No recipes in category {}.", category_id)?;
    }
    print_recipe_list(recipes, out)
}

fn print_membership<W: Write>(recipe_id: i64, favorite: bool, out: &mut W) -> Result<()> {
    if favorite {
        writeln!(out, "Recipe {} is a favorite.", recipe_id)?;
    } else {
        writeln!(out, "Recipe {} is not a favorite.", recipe_id)?;
    }
    Ok(())
}

fn print_recipe_list<W: Write>(recipes: &[Recipe], out: &mut W) -> Result<()> {
    for recipe in recipes {
        writeln!(out, "{:>4}  {}", recipe.id, recipe.title)?;
    }
    Ok(())
}

fn fetched_label(fetched_at: Option<DateTime<Utc>>) -> String {
    match fetched_at {
        Some(at) => at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => "never".to_string(),
    }
}
