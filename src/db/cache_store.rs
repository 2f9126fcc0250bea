use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};
use tokio_rusqlite::Connection;

use crate::error::Result;
use crate::models::{Category, Ingredient, Recipe};
use crate::repository::{title_matches, CacheScope, RecipeCache};

use super::parse_datetime;
use super::schema::SCHEMA;

const RECIPE_COLUMNS: &str = r#"r.id, r.title, r.image_url, r.ingredients_json, r.method_json, r.servings,
       (SELECT group_concat(cr2.category_id) FROM category_recipes cr2 WHERE cr2.recipe_id = r.id)"#;

/// Recipe row as stored, before the JSON columns are decoded.
struct RecipeRow {
    id: i64,
    title: String,
    image_url: String,
    ingredients_json: String,
    method_json: String,
    servings: u32,
    category_ids: Option<String>,
}

/// SQLite-backed cache of categories and recipes.
pub struct SqliteCache {
    conn: Connection,
}

impl SqliteCache {
    pub async fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;
        Self::with_connection(conn).await
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::with_connection(conn).await
    }

    async fn with_connection(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }
}

impl RecipeCache for SqliteCache {
    async fn categories(&self) -> Result<Option<Vec<Category>>> {
        let categories = self
            .conn
            .call(|conn| {
                if !was_fetched(conn, &CacheScope::Categories.key())? {
                    return Ok(None);
                }
                let mut stmt = conn.prepare(
                    "SELECT id, title, description, image_url FROM categories ORDER BY position",
                )?;
                let categories = stmt
                    .query_map([], category_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(Some(categories))
            })
            .await?;
        Ok(categories)
    }

    async fn put_categories(&self, categories: Vec<Category>) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM categories", [])?;
                for (position, category) in categories.iter().enumerate() {
                    tx.execute(
                        "INSERT OR REPLACE INTO categories (id, title, description, image_url, position) VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![
                            category.id,
                            category.title,
                            category.description,
                            category.image_url,
                            position as i64
                        ],
                    )?;
                }
                mark_fetched(&tx, &CacheScope::Categories.key())?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn recipes_for(&self, category_id: i64) -> Result<Option<Vec<Recipe>>> {
        let rows = self
            .conn
            .call(move |conn| {
                if !was_fetched(conn, &CacheScope::Recipes(category_id).key())? {
                    return Ok(None);
                }
                let sql = format!(
                    r#"SELECT {}
                       FROM recipes r
                       JOIN category_recipes cr ON cr.recipe_id = r.id
                       WHERE cr.category_id = ?1
                       ORDER BY cr.position"#,
                    RECIPE_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![category_id], recipe_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(Some(rows))
            })
            .await?;
        Ok(rows.map(|rows| rows.into_iter().map(decode_recipe).collect()))
    }

    async fn put_recipes(&self, category_id: i64, recipes: Vec<Recipe>) -> Result<()> {
        let encoded = recipes
            .iter()
            .map(|recipe| -> Result<_> {
                Ok((
                    recipe.id,
                    recipe.title.clone(),
                    recipe.image_url.clone(),
                    serde_json::to_string(&recipe.ingredients)?,
                    serde_json::to_string(&recipe.method)?,
                    recipe.servings,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM category_recipes WHERE category_id = ?1",
                    params![category_id],
                )?;
                for (position, (id, title, image_url, ingredients, method, servings)) in
                    encoded.iter().enumerate()
                {
                    tx.execute(
                        r#"INSERT OR REPLACE INTO recipes (id, title, image_url, ingredients_json, method_json, servings)
                           VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
                        params![id, title, image_url, ingredients, method, servings],
                    )?;
                    tx.execute(
                        "INSERT OR REPLACE INTO category_recipes (category_id, recipe_id, position) VALUES (?1, ?2, ?3)",
                        params![category_id, id, position as i64],
                    )?;
                }
                delete_orphaned_recipes(&tx)?;
                mark_fetched(&tx, &CacheScope::Recipes(category_id).key())?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn find_recipe(&self, recipe_id: i64) -> Result<Option<Recipe>> {
        let row = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {} FROM recipes r WHERE r.id = ?1", RECIPE_COLUMNS);
                let mut stmt = conn.prepare(&sql)?;
                let row = stmt
                    .query_row(params![recipe_id], recipe_row)
                    .optional()?;
                Ok(row)
            })
            .await?;
        Ok(row.map(decode_recipe))
    }

    async fn search(&self, query: &str) -> Result<Vec<Recipe>> {
        // SQLite's LIKE only folds ASCII case, so filtering happens after decoding.
        let rows = self
            .conn
            .call(|conn| {
                let sql = format!(
                    "SELECT {} FROM recipes r ORDER BY r.title COLLATE NOCASE",
                    RECIPE_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], recipe_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(decode_recipe)
            .filter(|recipe| title_matches(recipe, query))
            .collect())
    }

    async fn invalidate(&self, category_id: i64) -> Result<()> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM category_recipes WHERE category_id = ?1",
                    params![category_id],
                )?;
                tx.execute(
                    "DELETE FROM fetch_log WHERE scope = ?1",
                    params![CacheScope::Recipes(category_id).key()],
                )?;
                delete_orphaned_recipes(&tx)?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM category_recipes", [])?;
                tx.execute("DELETE FROM recipes", [])?;
                tx.execute("DELETE FROM categories", [])?;
                tx.execute("DELETE FROM fetch_log", [])?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn last_fetched(&self, scope: CacheScope) -> Result<Option<DateTime<Utc>>> {
        let key = scope.key();
        let fetched_at = self
            .conn
            .call(move |conn| {
                let fetched_at: Option<String> = conn
                    .query_row(
                        "SELECT fetched_at FROM fetch_log WHERE scope = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(fetched_at)
            })
            .await?;
        Ok(fetched_at.and_then(|s| parse_datetime(&s)))
    }
}

fn was_fetched(conn: &rusqlite::Connection, scope: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM fetch_log WHERE scope = ?1",
        params![scope],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn mark_fetched(tx: &Transaction, scope: &str) -> rusqlite::Result<()> {
    tx.execute(
        r#"INSERT INTO fetch_log (scope, fetched_at) VALUES (?1, datetime('now'))
           ON CONFLICT(scope) DO UPDATE SET fetched_at = excluded.fetched_at"#,
        params![scope],
    )?;
    Ok(())
}

fn delete_orphaned_recipes(tx: &Transaction) -> rusqlite::Result<()> {
    tx.execute(
        "DELETE FROM recipes WHERE id NOT IN (SELECT recipe_id FROM category_recipes)",
        [],
    )?;
    Ok(())
}

fn category_from_row(row: &Row) -> rusqlite::Result<Category> {
    Ok(Category {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        image_url: row.get(3)?,
    })
}

fn recipe_row(row: &Row) -> rusqlite::Result<RecipeRow> {
    Ok(RecipeRow {
        id: row.get(0)?,
        title: row.get(1)?,
        image_url: row.get(2)?,
        ingredients_json: row.get(3)?,
        method_json: row.get(4)?,
        servings: row.get(5)?,
        category_ids: row.get(6)?,
    })
}

/// Decode the JSON columns. A malformed column decodes as an empty list.
fn decode_recipe(row: RecipeRow) -> Recipe {
    let ingredients: Vec<Ingredient> = serde_json::from_str(&row.ingredients_json)
        .unwrap_or_else(|e| {
            tracing::warn!("Malformed ingredients for recipe {}: {}", row.id, e);
            Vec::new()
        });
    let method: Vec<String> = serde_json::from_str(&row.method_json).unwrap_or_else(|e| {
        tracing::warn!("Malformed method for recipe {}: {}", row.id, e);
        Vec::new()
    });

    let mut category_ids: Vec<i64> = row
        .category_ids
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter_map(|id| id.trim().parse().ok())
        .collect();
    category_ids.sort_unstable();

    Recipe {
        id: row.id,
        title: row.title,
        ingredients,
        method,
        image_url: row.image_url,
        category_ids,
        servings: row.servings,
    }
}
