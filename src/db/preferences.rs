use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::params;
use serde_json::Value;
use tokio::sync::watch;
use tokio_rusqlite::Connection;

use crate::error::Result;

use super::schema::PREFERENCES_SCHEMA;

/// Full key-value state of the store.
pub type Preferences = BTreeMap<String, Value>;

/// SQLite-backed key-value store with JSON values and a change feed.
///
/// Every edit is a read-modify-write inside one transaction on the connection
/// thread, so edits are serialized and atomic per call. Subscribers see a new
/// snapshot only when an edit changed something.
pub struct PreferenceStore {
    conn: Connection,
    changes: Arc<watch::Sender<Arc<Preferences>>>,
}

impl PreferenceStore {
    pub async fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).await?;
        Self::with_connection(conn).await
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::with_connection(conn).await
    }

    async fn with_connection(conn: Connection) -> Result<Self> {
        let current = conn
            .call(|conn| {
                conn.execute_batch(PREFERENCES_SCHEMA)?;
                Ok(load_all(conn)?)
            })
            .await?;

        let (changes, _) = watch::channel(Arc::new(current));
        Ok(Self {
            conn,
            changes: Arc::new(changes),
        })
    }

    /// Read the whole persisted state.
    pub async fn data(&self) -> Result<Preferences> {
        let data = self.conn.call(|conn| Ok(load_all(conn)?)).await?;
        Ok(data)
    }

    /// Atomically read, modify and write the store. Returns the new state.
    pub async fn edit<F>(&self, f: F) -> Result<Preferences>
    where
        F: FnOnce(&mut Preferences) + Send + 'static,
    {
        let changes = Arc::clone(&self.changes);
        let updated = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let current = load_all(&tx)?;
                let mut updated = current.clone();
                f(&mut updated);

                for (key, value) in &updated {
                    if current.get(key) != Some(value) {
                        tx.execute(
                            r#"INSERT INTO preferences (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                               ON CONFLICT(key) DO UPDATE SET
                                   value = excluded.value,
                                   updated_at = excluded.updated_at"#,
                            params![key, value.to_string()],
                        )?;
                    }
                }
                for key in current.keys() {
                    if !updated.contains_key(key) {
                        tx.execute("DELETE FROM preferences WHERE key = ?1", params![key])?;
                    }
                }
                tx.commit()?;

                // Published from the connection thread so snapshots follow commit order.
                changes.send_if_modified(|snapshot| {
                    if **snapshot == updated {
                        false
                    } else {
                        *snapshot = Arc::new(updated.clone());
                        true
                    }
                });
                Ok(updated)
            })
            .await?;
        Ok(updated)
    }

    /// Subscribe to committed state; the receiver starts at the current snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Preferences>> {
        self.changes.subscribe()
    }
}

fn load_all(conn: &rusqlite::Connection) -> rusqlite::Result<Preferences> {
    let mut stmt = conn.prepare("SELECT key, value FROM preferences")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut preferences = Preferences::new();
    for (key, raw) in rows {
        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => {
                preferences.insert(key, value);
            }
            Err(e) => tracing::warn!("Skipping malformed preference {}: {}", key, e),
        }
    }
    Ok(preferences)
}
