pub const SCHEMA: &str = r#"
-- categories table
CREATE TABLE IF NOT EXISTS categories (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    image_url TEXT NOT NULL,
    position INTEGER NOT NULL
);

-- recipes table
CREATE TABLE IF NOT EXISTS recipes (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    image_url TEXT NOT NULL,
    ingredients_json TEXT NOT NULL,
    method_json TEXT NOT NULL,
    servings INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_recipes_title ON recipes(title);

-- category_recipes table (ordered recipe list per category)
CREATE TABLE IF NOT EXISTS category_recipes (
    category_id INTEGER NOT NULL,
    recipe_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (category_id, recipe_id)
);

CREATE INDEX IF NOT EXISTS idx_category_recipes_recipe_id ON category_recipes(recipe_id);

-- fetch_log table (which scopes were fetched, and when)
CREATE TABLE IF NOT EXISTS fetch_log (
    scope TEXT PRIMARY KEY,
    fetched_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

pub const PREFERENCES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS preferences (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;
