mod category;
mod recipe;

pub use category::Category;
pub use recipe::{Ingredient, Recipe};

use serde::{Deserialize, Deserializer};

/// Decode an explicit `null` as the field's default value.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Resolve an image reference against the images base URL.
///
/// Absolute references are returned as-is; bare file names are joined onto the base.
pub fn image_url(images_base: &str, reference: &str) -> String {
    if reference.starts_with("http") || reference.is_empty() {
        return reference.to_string();
    }
    format!(
        "{}/{}",
        images_base.trim_end_matches('/'),
        reference.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_url_keeps_absolute_references() {
        assert_eq!(
            image_url("https://img.test/images/", "https://cdn.test/a.png"),
            "https://cdn.test/a.png"
        );
    }

    #[test]
    fn image_url_joins_file_names() {
        assert_eq!(
            image_url("https://img.test/images/", "burger.png"),
            "https://img.test/images/burger.png"
        );
        assert_eq!(
            image_url("https://img.test/images", "/burger.png"),
            "https://img.test/images/burger.png"
        );
    }

    #[test]
    fn image_url_leaves_empty_reference_empty() {
        assert_eq!(image_url("https://img.test/images/", ""), "");
    }
}
