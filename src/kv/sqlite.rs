//! SQLite-backed `KvStore` — the `store.backend = local_file` option (spec
//! §6.4). Grounded structurally in
//! `weavegraph::runtimes::checkpointer_sqlite::SQLiteCheckpointer`:
//! a shared `sqlx::SqlitePool`, embedded migrations run on `connect`, and a
//! single table rather than per-component schemas (see
//! `migrations/0001_kv_entries.sql`).

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use super::{KvStore, Result};
use crate::errors::KvError;

/// Durable `KvStore` backed by a single `kv_entries` SQLite table.
pub struct SqliteKvStore {
    pool: SqlitePool,
}

impl SqliteKvStore {
    /// Connect (or create) a SQLite database at `database_url`, e.g.
    /// `"sqlite://supervisor.db"`. Mirrors
    /// `SQLiteCheckpointer::connect`'s embedded-migrations pattern.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| KvError::Unavailable {
                message: format!("connect error: {e}"),
            })?;
        #[cfg(feature = "sqlite-migrations")]
        {
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| KvError::Unavailable {
                    message: format!("migration failure: {e}"),
                })?;
        }
        Ok(Self { pool })
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    #[instrument(skip(self, value), fields(key = %key, bytes = value.len()))]
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<chrono::Duration>) -> Result<()> {
        let expires_at_unix_ms = ttl.map(|d| (Utc::now() + d).timestamp_millis());
        sqlx::query(
            "INSERT INTO kv_entries (key, value, expires_at_unix_ms) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at_unix_ms = excluded.expires_at_unix_ms",
        )
        .bind(key)
        .bind(value)
        .bind(expires_at_unix_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| KvError::Unavailable {
            message: e.to_string(),
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value, expires_at_unix_ms FROM kv_entries WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| KvError::Unavailable {
                message: e.to_string(),
            })?;
        let Some(row) = row else {
            return Ok(None);
        };
        let expires_at_unix_ms: Option<i64> = row.try_get("expires_at_unix_ms").ok();
        if let Some(deadline) = expires_at_unix_ms {
            if deadline <= Utc::now().timestamp_millis() {
                return Ok(None);
            }
        }
        let value: Vec<u8> = row.try_get("value").map_err(|e| KvError::Unavailable {
            message: e.to_string(),
        })?;
        Ok(Some(value))
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| KvError::Unavailable {
                message: e.to_string(),
            })?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(prefix = %prefix))]
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        // LIKE escaping: prefix scans only use keys we control (lock:/ckpt:
        // schemes), none of which contain '%' or '_', so no escape clause is
        // needed here.
        let like_pattern = format!("{prefix}%");
        let now_ms = Utc::now().timestamp_millis();
        let rows = sqlx::query(
            "SELECT key, value FROM kv_entries
             WHERE key LIKE ?1 AND (expires_at_unix_ms IS NULL OR expires_at_unix_ms > ?2)
             ORDER BY key ASC",
        )
        .bind(like_pattern)
        .bind(now_ms)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| KvError::Unavailable {
            message: e.to_string(),
        })?;
        rows.into_iter()
            .map(|row| {
                let key: String = row.try_get("key").map_err(|e| KvError::Unavailable {
                    message: e.to_string(),
                })?;
                let value: Vec<u8> = row.try_get("value").map_err(|e| KvError::Unavailable {
                    message: e.to_string(),
                })?;
                Ok((key, value))
            })
            .collect()
    }

    fn backend_name(&self) -> &'static str {
        "local_file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fresh, on-disk SQLite database per test, torn down with the
    /// `TempDir` on drop.
    async fn temp_store() -> (SqliteKvStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("kv.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let store = SqliteKvStore::connect(&url).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let (store, _dir) = temp_store().await;
        store.put("a", b"1".to_vec(), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert!(store.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn put_overwrites_an_existing_key() {
        let (store, _dir) = temp_store().await;
        store.put("a", b"1".to_vec(), None).await.unwrap();
        store.put("a", b"2".to_vec(), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let (store, _dir) = temp_store().await;
        assert!(!store.delete("missing").await.unwrap());
        store.put("a", b"1".to_vec(), None).await.unwrap();
        assert!(store.delete("a").await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_are_treated_as_absent() {
        let (store, _dir) = temp_store().await;
        store
            .put("a", b"1".to_vec(), Some(chrono::Duration::milliseconds(-1)))
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert!(store.scan("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scan_is_lexicographic_and_prefix_scoped() {
        let (store, _dir) = temp_store().await;
        store.put("ckpt:w1:a", b"1".to_vec(), None).await.unwrap();
        store.put("ckpt:w1:b", b"2".to_vec(), None).await.unwrap();
        store.put("ckpt:w2:a", b"3".to_vec(), None).await.unwrap();
        let results = store.scan("ckpt:w1:").await.unwrap();
        assert_eq!(
            results.into_iter().map(|(k, _)| k).collect::<Vec<_>>(),
            vec!["ckpt:w1:a".to_string(), "ckpt:w1:b".to_string()]
        );
    }

    #[tokio::test]
    async fn state_survives_a_reconnect_to_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("kv.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        {
            let store = SqliteKvStore::connect(&url).await.unwrap();
            store.put("a", b"1".to_vec(), None).await.unwrap();
        }
        let reopened = SqliteKvStore::connect(&url).await.unwrap();
        assert_eq!(reopened.get("a").await.unwrap(), Some(b"1".to_vec()));
    }
}
