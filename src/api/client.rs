use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Client;
use serde::de::DeserializeOwned;
use url::Url;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::models::{Category, Recipe};

use super::RecipeSource;

const USER_AGENT: &str = concat!("recipe-shelf/", env!("CARGO_PKG_VERSION"));

/// HTTP client for the recipes REST API.
pub struct RecipesApi {
    client: Client,
    base_url: Url,
}

impl RecipesApi {
    pub fn new(config: &Config) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: parse_base_url(&config.api_base_url)?,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| AppError::Config(format!("Invalid endpoint {}: {}", path, e)))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        tracing::debug!("GET {}", url);
        let response = self.client.get(url.clone()).send().await?;

        if !response.status().is_success() {
            return Err(AppError::Api(format!(
                "GET {} returned HTTP {}",
                url,
                response.status()
            )));
        }

        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl RecipeSource for RecipesApi {
    async fn list_categories(&self) -> Result<Vec<Category>> {
        let url = self.endpoint("category")?;
        self.get_json(url).await
    }

    async fn list_recipes_by_category(&self, category_id: i64) -> Result<Vec<Recipe>> {
        let url = self.endpoint(&format!("category/{}/recipes", category_id))?;
        self.get_json(url).await
    }
}

/// Parse the API base URL, making sure relative joins stay under its path.
fn parse_base_url(raw: &str) -> Result<Url> {
    let mut normalized = raw.trim().to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    let url = Url::parse(&normalized)
        .map_err(|e| AppError::Config(format!("Invalid api_base_url {:?}: {}", raw, e)))?;
    if url.cannot_be_a_base() {
        return Err(AppError::Config(format!(
            "api_base_url {:?} cannot be used as a base URL",
            raw
        )));
    }
    Ok(url)
}
