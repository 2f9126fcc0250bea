//! Persistent set of favorite recipe ids.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;

use crate::db::{PreferenceStore, Preferences};
use crate::error::Result;

const FAVORITE_RECIPE_IDS: &str = "favorite_recipe_ids";

fn favorite_ids(prefs: &Preferences) -> BTreeSet<String> {
    match prefs.get(FAVORITE_RECIPE_IDS) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(id) => Some(id.clone()),
                Value::Number(id) => Some(id.to_string()),
                _ => None,
            })
            .collect(),
        _ => BTreeSet::new(),
    }
}

fn store_ids(prefs: &mut Preferences, ids: BTreeSet<String>) {
    prefs.insert(
        FAVORITE_RECIPE_IDS.to_string(),
        Value::Array(ids.into_iter().map(Value::String).collect()),
    );
}

pub struct FavoritesStore {
    prefs: Arc<PreferenceStore>,
}

impl FavoritesStore {
    pub fn new(prefs: Arc<PreferenceStore>) -> Self {
        Self { prefs }
    }

    pub async fn is_favorite(&self, recipe_id: i64) -> Result<bool> {
        Ok(self.all().await?.contains(&recipe_id.to_string()))
    }

    pub async fn all(&self) -> Result<BTreeSet<String>> {
        Ok(favorite_ids(&self.prefs.data().await?))
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.all().await?.len())
    }

    pub async fn add(&self, recipe_id: i64) -> Result<()> {
        let id = recipe_id.to_string();
        self.prefs
            .edit(move |prefs| {
                let mut ids = favorite_ids(prefs);
                ids.insert(id);
                store_ids(prefs, ids);
            })
            .await?;
        tracing::debug!("Added recipe {} to favorites", recipe_id);
        Ok(())
    }

    pub async fn remove(&self, recipe_id: i64) -> Result<()> {
        let id = recipe_id.to_string();
        self.prefs
            .edit(move |prefs| {
                let mut ids = favorite_ids(prefs);
                ids.remove(&id);
                store_ids(prefs, ids);
            })
            .await?;
        tracing::debug!("Removed recipe {} from favorites", recipe_id);
        Ok(())
    }

    /// Flip membership and return the new state.
    ///
    /// Membership is read first and then written in a separate edit, so a
    /// concurrent add or remove of the same id can interleave.
    pub async fn toggle(&self, recipe_id: i64) -> Result<bool> {
        if self.is_favorite(recipe_id).await? {
            self.remove(recipe_id).await?;
            Ok(false)
        } else {
            self.add(recipe_id).await?;
            Ok(true)
        }
    }

    /// Current favorite ids, then a new set after every committed change.
    pub fn watch_ids(&self) -> impl Stream<Item = BTreeSet<String>> + Send + 'static {
        let rx = self.prefs.subscribe();
        stream::unfold((rx, None), |(mut rx, last)| async move {
            loop {
                let ids = favorite_ids(&rx.borrow_and_update());
                // Edits to other keys publish too; only a different set is emitted.
                if last.as_ref() != Some(&ids) {
                    return Some((ids.clone(), (rx, Some(ids))));
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
    }

    /// Membership of one recipe, re-emitted whenever it flips.
    pub fn watch_is_favorite(&self, recipe_id: i64) -> impl Stream<Item = bool> + Send + 'static {
        let id = recipe_id.to_string();
        dedup(self.watch_ids().map(move |ids| ids.contains(&id)))
    }

    /// Number of favorites, re-emitted whenever it changes.
    pub fn watch_count(&self) -> impl Stream<Item = usize> + Send + 'static {
        dedup(self.watch_ids().map(|ids| ids.len()))
    }
}

/// Drop consecutive duplicates.
fn dedup<T, St>(stream: St) -> impl Stream<Item = T> + Send + 'static
where
    T: PartialEq + Clone + Send + 'static,
    St: Stream<Item = T> + Send + 'static,
{
    stream
        .scan(None::<T>, |last, item| {
            let changed = last.as_ref() != Some(&item);
            *last = Some(item.clone());
            futures::future::ready(Some(changed.then_some(item)))
        })
        .filter_map(futures::future::ready)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tokio_test::assert_ok;

    async fn store() -> FavoritesStore {
        let prefs = PreferenceStore::open_in_memory().await.unwrap();
        FavoritesStore::new(Arc::new(prefs))
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[tokio::test]
    async fn double_toggle_restores_membership() {
        let favorites = store().await;
        assert!(!favorites.is_favorite(5).await.unwrap());

        assert!(assert_ok!(favorites.toggle(5).await));
        assert!(favorites.is_favorite(5).await.unwrap());

        assert!(!assert_ok!(favorites.toggle(5).await));
        assert!(!favorites.is_favorite(5).await.unwrap());
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let favorites = store().await;
        favorites.add(5).await.unwrap();
        favorites.add(5).await.unwrap();

        assert_eq!(favorites.all().await.unwrap(), set(&["5"]));
        assert_eq!(favorites.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn remove_of_absent_id_is_a_no_op() {
        let favorites = store().await;
        favorites.add(1).await.unwrap();
        favorites.remove(2).await.unwrap();

        assert_eq!(favorites.all().await.unwrap(), set(&["1"]));
    }

    #[tokio::test]
    async fn subscription_emits_after_add() {
        let favorites = store().await;
        let mut updates = Box::pin(favorites.watch_ids());

        assert_eq!(updates.next().await, Some(BTreeSet::new()));

        favorites.add(5).await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(5), updates.next())
            .await
            .unwrap();
        assert_eq!(next, Some(set(&["5"])));
    }

    #[tokio::test]
    async fn idempotent_add_emits_nothing() {
        let favorites = store().await;
        favorites.add(5).await.unwrap();
        let mut updates = Box::pin(favorites.watch_ids());
        assert_eq!(updates.next().await, Some(set(&["5"])));

        favorites.add(5).await.unwrap();
        favorites.add(6).await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(5), updates.next())
            .await
            .unwrap();
        assert_eq!(next, Some(set(&["5", "6"])));
    }

    #[tokio::test]
    async fn unrelated_preference_changes_are_ignored() {
        let prefs = Arc::new(PreferenceStore::open_in_memory().await.unwrap());
        let favorites = FavoritesStore::new(Arc::clone(&prefs));
        let mut updates = Box::pin(favorites.watch_ids());
        assert_eq!(updates.next().await, Some(BTreeSet::new()));

        prefs
            .edit(|p| {
                p.insert("theme".to_string(), Value::String("dark".to_string()));
            })
            .await
            .unwrap();
        favorites.add(3).await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(5), updates.next())
            .await
            .unwrap();
        assert_eq!(next, Some(set(&["3"])));
    }

    #[tokio::test]
    async fn derived_streams_follow_the_set() {
        let favorites = store().await;
        let mut member = Box::pin(favorites.watch_is_favorite(7));
        let mut count = Box::pin(favorites.watch_count());

        assert_eq!(member.next().await, Some(false));
        assert_eq!(count.next().await, Some(0));

        favorites.add(7).await.unwrap();
        favorites.add(8).await.unwrap();

        let timeout = Duration::from_secs(5);
        assert_eq!(
            tokio::time::timeout(timeout, member.next()).await.unwrap(),
            Some(true)
        );
        // Intermediate counts may be coalesced; the latest one wins.
        let latest = tokio::time::timeout(timeout, async {
            loop {
                if let Some(2) = count.next().await {
                    return 2;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(latest, 2);
    }

    #[tokio::test]
    async fn numeric_ids_in_store_are_read() {
        let prefs = Arc::new(PreferenceStore::open_in_memory().await.unwrap());
        prefs
            .edit(|p| {
                p.insert(FAVORITE_RECIPE_IDS.to_string(), serde_json::json!([4, "9"]));
            })
            .await
            .unwrap();

        let favorites = FavoritesStore::new(prefs);
        assert!(favorites.is_favorite(4).await.unwrap());
        assert!(favorites.is_favorite(9).await.unwrap());
    }
}
