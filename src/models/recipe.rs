use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::null_as_default;
use crate::error::{AppError, Result};

static QUANTITY_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn quantity_re() -> Option<&'static Regex> {
    QUANTITY_RE
        .get_or_init(|| Regex::new(r"^([\d.,]+)\s*(.*)$").ok())
        .as_ref()
}

fn default_servings() -> u32 {
    1
}

fn servings_or_default<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<u32>::deserialize(deserializer)?.unwrap_or_else(default_servings))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ingredient {
    #[serde(default, deserialize_with = "null_as_default")]
    pub quantity: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub unit_of_measure: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
}

impl Ingredient {
    /// Quantity and unit as one display string, e.g. "200 г".
    pub fn amount(&self) -> String {
        format!("{} {}", self.quantity, self.unit_of_measure)
            .trim()
            .to_string()
    }

    /// Scale a leading numeric quantity. Free-text quantities ("to taste") are kept.
    pub fn scaled(&self, multiplier: f64) -> Ingredient {
        let Some(re) = quantity_re() else {
            return self.clone();
        };
        let trimmed = self.quantity.trim();
        let Some(caps) = re.captures(trimmed) else {
            return self.clone();
        };

        let number = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let rest = caps.get(2).map(|m| m.as_str()).unwrap_or_default();

        let Ok(value) = number.replace(',', ".").parse::<f64>() else {
            return self.clone();
        };

        let adjusted = value * multiplier;
        let formatted = if (adjusted - adjusted.round()).abs() < 1e-9 {
            format!("{}", adjusted.round() as i64)
        } else {
            format!("{:.1}", adjusted)
        };

        Ingredient {
            quantity: format!("{} {}", formatted, rest).trim().to_string(),
            unit_of_measure: self.unit_of_measure.clone(),
            description: self.description.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub id: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ingredients: Vec<Ingredient>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub method: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub image_url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub category_ids: Vec<i64>,
    #[serde(default = "default_servings", deserialize_with = "servings_or_default")]
    pub servings: u32,
}

impl Recipe {
    /// Ratio between the requested portions and the recipe's default serving count.
    pub fn portion_multiplier(&self, portions: u32) -> f64 {
        if self.servings == 0 {
            return 1.0;
        }
        f64::from(portions) / f64::from(self.servings)
    }

    /// Ingredient list scaled to `portions` servings.
    pub fn ingredients_for(&self, portions: u32) -> Result<Vec<Ingredient>> {
        if portions == 0 {
            return Err(AppError::InvalidArgument(
                "portions must be greater than zero".to_string(),
            ));
        }
        let multiplier = self.portion_multiplier(portions);
        Ok(self
            .ingredients
            .iter()
            .map(|ingredient| ingredient.scaled(multiplier))
            .collect())
    }

    pub fn share_link(&self, share_base: &str) -> String {
        format!("{}/recipe/{}", share_base.trim_end_matches('/'), self.id)
    }

    pub fn share_text(&self, share_base: &str) -> String {
        format!(
            "Try this recipe: {}\n{}",
            self.title,
            self.share_link(share_base)
        )
    }

    /// Record that this recipe was listed under `category_id`.
    pub(crate) fn tag_category(&mut self, category_id: i64) {
        if !self.category_ids.contains(&category_id) {
            self.category_ids.push(category_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingredient(quantity: &str, unit: &str) -> Ingredient {
        Ingredient {
            quantity: quantity.to_string(),
            unit_of_measure: unit.to_string(),
            description: "мука".to_string(),
        }
    }

    fn recipe(servings: u32) -> Recipe {
        Recipe {
            id: 7,
            title: "Блины".to_string(),
            ingredients: vec![
                ingredient("200", "г"),
                ingredient("1,5", "ст"),
                ingredient("по вкусу", ""),
            ],
            method: vec!["Смешать".to_string(), "Жарить".to_string()],
            image_url: "pancakes.png".to_string(),
            category_ids: vec![],
            servings,
        }
    }

    #[test]
    fn decodes_recipe_with_defaults() {
        let json = r#"{
            "id": 3,
            "title": "Чизбургер",
            "ingredients": [{"quantity": "1", "unitOfMeasure": "шт", "description": "булочка"}],
            "method": ["Собрать бургер"],
            "imageUrl": "cheeseburger.png"
        }"#;

        let recipe: Recipe = serde_json::from_str(json).unwrap();
        assert_eq!(recipe.servings, 1);
        assert!(recipe.category_ids.is_empty());
        assert_eq!(recipe.ingredients[0].unit_of_measure, "шт");
        assert_eq!(recipe.ingredients[0].amount(), "1 шт");
    }

    #[test]
    fn null_servings_decodes_as_one() {
        let json = r#"{"id": 4, "title": "Суп", "servings": null, "method": null}"#;

        let recipe: Recipe = serde_json::from_str(json).unwrap();
        assert_eq!(recipe.servings, 1);
        assert!(recipe.method.is_empty());
    }

    #[test]
    fn amount_trims_missing_unit() {
        assert_eq!(ingredient("по вкусу", "").amount(), "по вкусу");
    }

    #[test]
    fn scaling_doubles_numeric_quantities() {
        let scaled = recipe(2).ingredients_for(4).unwrap();
        assert_eq!(scaled[0].quantity, "400");
        assert_eq!(scaled[1].quantity, "3");
        assert_eq!(scaled[2].quantity, "по вкусу");
    }

    #[test]
    fn scaling_keeps_one_decimal_for_fractions() {
        let scaled = recipe(3).ingredients_for(1).unwrap();
        assert_eq!(scaled[0].quantity, "66.7");
        assert_eq!(scaled[1].quantity, "0.5");
    }

    #[test]
    fn scaling_keeps_trailing_text() {
        let scaled = ingredient("2 шт.", "").scaled(1.5);
        assert_eq!(scaled.quantity, "3 шт.");
    }

    #[test]
    fn zero_servings_uses_unit_multiplier() {
        assert_eq!(recipe(0).portion_multiplier(5), 1.0);
    }

    #[test]
    fn zero_portions_is_rejected() {
        assert!(matches!(
            recipe(2).ingredients_for(0),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[test]
    fn share_text_contains_link() {
        let text = recipe(1).share_text("https://recipes.example/");
        assert_eq!(text, "Try this recipe: Блины\nhttps://recipes.example/recipe/7");
    }

    #[test]
    fn tag_category_does_not_duplicate() {
        let mut r = recipe(1);
        r.tag_category(2);
        r.tag_category(2);
        assert_eq!(r.category_ids, vec![2]);
    }
}
