//! Session store implementations.
//!
//! `cookie` mode keeps session data in process memory keyed by the cookie's
//! session id; `sqlite` mode persists it in a table alongside the
//! application database. Both enforce the configured TTL on load.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::{Pool, Row, Sqlite};

use crate::error::Diagnostic;

use super::SessionStore;

pub struct MemorySessionStore {
    entries: RwLock<HashMap<String, (serde_json::Value, DateTime<Utc>)>>,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        MemorySessionStore {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl MemorySessionStore {
    pub fn new() -> MemorySessionStore {
        MemorySessionStore::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, id: &str) -> Result<Option<serde_json::Value>, Diagnostic> {
        let mut entries = self.entries.write();
        match entries.get(id) {
            Some((data, expires)) if *expires > Utc::now() => Ok(Some(data.clone())),
            Some(_) => {
                entries.remove(id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        id: &str,
        data: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), Diagnostic> {
        let expires = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24));
        self.entries
            .write()
            .insert(id.to_string(), (data.clone(), expires));
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), Diagnostic> {
        self.entries.write().remove(id);
        Ok(())
    }
}

pub struct SqliteSessionStore {
    pool: Pool<Sqlite>,
    table: String,
}

impl SqliteSessionStore {
    pub async fn new(
        pool: Pool<Sqlite>,
        table: &str,
    ) -> Result<SqliteSessionStore, crate::error::BasilError> {
        let table = sanitise_table(table)?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            )"
        ))
        .execute(&pool)
        .await?;
        Ok(SqliteSessionStore {
            pool,
            table: table.to_string(),
        })
    }

    /// Remove expired rows. Called periodically by the server when
    /// `session.cleanup` is enabled.
    pub async fn cleanup(&self) -> Result<u64, crate::error::BasilError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE expires_at < ?",
            self.table
        ))
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn sanitise_table(table: &str) -> Result<String, crate::error::BasilError> {
    if table.is_empty()
        || !table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(crate::error::BasilError::Config(format!(
            "invalid session table name '{table}'"
        )));
    }
    Ok(table.to_string())
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, id: &str) -> Result<Option<serde_json::Value>, Diagnostic> {
        let row = sqlx::query(&format!(
            "SELECT data FROM {} WHERE id = ? AND expires_at >= ?",
            self.table
        ))
        .bind(id)
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Diagnostic::runtime("R-SESSION-LOAD", format!("{e}")))?;
        match row {
            Some(row) => {
                let data: String = row
                    .try_get(0)
                    .map_err(|e| Diagnostic::runtime("R-SESSION-LOAD", format!("{e}")))?;
                let json = serde_json::from_str(&data).map_err(|e| {
                    Diagnostic::runtime("R-SESSION-DECODE", format!("corrupt session: {e}"))
                })?;
                Ok(Some(json))
            }
            None => Ok(None),
        }
    }

    async fn save(
        &self,
        id: &str,
        data: &serde_json::Value,
        ttl: Duration,
    ) -> Result<(), Diagnostic> {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let body = data.to_string();
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {} (id, data, expires_at) VALUES (?, ?, ?)",
            self.table
        ))
        .bind(id)
        .bind(body)
        .bind(expires)
        .execute(&self.pool)
        .await
        .map_err(|e| Diagnostic::runtime("R-SESSION-SAVE", format!("{e}")))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), Diagnostic> {
        sqlx::query(&format!("DELETE FROM {} WHERE id = ?", self.table))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Diagnostic::runtime("R-SESSION-DELETE", format!("{e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::SessionStore as _;

    #[tokio::test]
    async fn memory_store_round_trip_and_ttl() {
        let store = MemorySessionStore::new();
        let data = serde_json::json!({"user": "ada"});
        store
            .save("s1", &data, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.load("s1").await.unwrap(), Some(data));

        store
            .save("s2", &serde_json::json!({}), Duration::from_secs(0))
            .await
            .unwrap();
        // Zero TTL expires immediately.
        assert_eq!(store.load("s2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sqlite_store_round_trip_and_cleanup() {
        let db = crate::capability::db::SqliteDb::connect(":memory:")
            .await
            .unwrap();
        let store = SqliteSessionStore::new(db.pool().clone(), "sessions")
            .await
            .unwrap();
        let data = serde_json::json!({"cart": [1, 2]});
        store
            .save("sid", &data, Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(store.load("sid").await.unwrap(), Some(data));

        store.delete("sid").await.unwrap();
        assert_eq!(store.load("sid").await.unwrap(), None);

        store
            .save("old", &serde_json::json!({}), Duration::from_secs(0))
            .await
            .unwrap();
        // Give the zero-TTL row a moment to fall behind the clock.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let removed = store.cleanup().await.unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn table_names_are_validated() {
        assert!(sanitise_table("sessions").is_ok());
        assert!(sanitise_table("bad; DROP").is_err());
    }
}
