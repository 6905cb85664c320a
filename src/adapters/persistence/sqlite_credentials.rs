//! SQLite-backed credential store via libsql. Implements CredentialStore.
//!
//! One `users` table keyed by user_id; saving a key upserts.
//! Database file: data/users.db

use crate::domain::{DomainError, UserId};
use crate::ports::CredentialStore;
use libsql::{Database, params};
use std::path::{Path, PathBuf};
use tracing::info;

const USERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY,
    api_key TEXT NOT NULL,
    updated_at INTEGER NOT NULL
)"#;

fn storage(e: impl std::fmt::Display) -> DomainError {
    DomainError::Storage(e.to_string())
}

pub struct SqliteCredentialStore {
    db: Database,
    db_path: PathBuf,
}

impl SqliteCredentialStore {
    /// Open (or create) `users.db` in `base_dir` and ensure the schema exists.
    pub async fn connect(base_dir: impl AsRef<Path>) -> Result<Self, DomainError> {
        let base = base_dir.as_ref();
        std::fs::create_dir_all(base).map_err(storage)?;
        let db_path = base.join("users.db");
        let path_str = db_path.to_string_lossy();
        let db = libsql::Builder::new_local(path_str.as_ref())
            .build()
            .await
            .map_err(storage)?;
        let conn = db.connect().map_err(storage)?;

        // PRAGMA returns a row; drain it (execute fails when rows are returned).
        let mut wal_rows = conn
            .query("PRAGMA journal_mode=WAL", ())
            .await
            .map_err(|e| DomainError::Storage(format!("WAL pragma failed: {}", e)))?;
        while wal_rows.next().await.map_err(storage)?.is_some() {}

        conn.execute(USERS_TABLE, ()).await.map_err(storage)?;
        info!(path = %db_path.display(), "credential store ready");
        Ok(Self { db, db_path })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }
}

#[async_trait::async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn save_api_key(&self, user_id: UserId, api_key: &str) -> Result<(), DomainError> {
        let conn = self.db.connect().map_err(storage)?;
        let now = chrono::Utc::now().timestamp();
        conn.execute(
            r#"
            INSERT INTO users (user_id, api_key, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (user_id) DO UPDATE SET
                api_key = excluded.api_key,
                updated_at = excluded.updated_at
            "#,
            params![user_id, api_key, now],
        )
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn api_key(&self, user_id: UserId) -> Result<Option<String>, DomainError> {
        let conn = self.db.connect().map_err(storage)?;
        let mut rows = conn
            .query(
                "SELECT api_key FROM users WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(storage)?;
        match rows.next().await.map_err(storage)? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(storage)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCredentialStore::connect(dir.path()).await.unwrap();
        assert_eq!(store.api_key(1).await.unwrap(), None);
        store.save_api_key(1, "first").await.unwrap();
        store.save_api_key(1, "second").await.unwrap();
        store.save_api_key(2, "other").await.unwrap();
        assert_eq!(store.api_key(1).await.unwrap().as_deref(), Some("second"));
        drop(store);

        let reopened = SqliteCredentialStore::connect(dir.path()).await.unwrap();
        assert_eq!(reopened.api_key(2).await.unwrap().as_deref(), Some("other"));
        assert!(reopened.path().ends_with("users.db"));
    }
}
