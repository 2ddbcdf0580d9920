//! SQLite storage backend.
//!
//! The schema is created on connect; there are no migrations to run.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row as _;
use trellis_common::Jid;
use trellis_common::config::HostConfig;

use crate::storage::{OfflineMessage, Storage, StorageBackend, StorageError, User};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (\
        jid TEXT PRIMARY KEY NOT NULL, \
        password TEXT)",
    "CREATE TABLE IF NOT EXISTS offline_messages (\
        id INTEGER PRIMARY KEY AUTOINCREMENT, \
        from_jid TEXT NOT NULL, \
        to_jid TEXT NOT NULL, \
        body TEXT NOT NULL, \
        created_at TEXT NOT NULL)",
    "CREATE INDEX IF NOT EXISTS offline_messages_to ON offline_messages (to_jid)",
];

#[derive(Clone)]
pub struct SqlStorage {
    pool: SqlitePool,
}

impl SqlStorage {
    /// Connect to `url` (e.g. `sqlite://data/trellis.db` or `sqlite::memory:`)
    /// and create the schema if missing.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        tracing::info!("Connecting to SQLite storage at {url}...");
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Every connection to an in-memory database is a separate database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        tracing::info!("SQLite storage ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl Storage for SqlStorage {
    async fn find_user(&self, jid: &Jid) -> Result<Option<User>, StorageError> {
        let row = sqlx::query("SELECT jid, password FROM users WHERE jid = ?1")
            .bind(jid.bare().to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let stored: String = row.try_get("jid")?;
        let password_hash: Option<String> = row.try_get("password")?;
        let jid = Jid::parse(&stored)
            .map_err(|e| StorageError::Backend(format!("stored address '{stored}' is invalid: {e}")))?;
        Ok(Some(User { jid, password_hash }))
    }

    async fn save_user(&self, user: &User) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO users (jid, password) VALUES (?1, ?2) \
             ON CONFLICT (jid) DO UPDATE SET password = excluded.password",
        )
        .bind(user.jid.bare().to_string())
        .bind(user.password_hash.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_message(&self, from: &Jid, to: &Jid, body: &str) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO offline_messages (from_jid, to_jid, body, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(from.to_string())
        .bind(to.bare().to_string())
        .bind(body)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_messages(&self, jid: &Jid) -> Result<Vec<OfflineMessage>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, from_jid, to_jid, body, created_at FROM offline_messages \
             WHERE to_jid = ?1 ORDER BY id",
        )
        .bind(jid.bare().to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let from: String = row.try_get("from_jid")?;
                let to: String = row.try_get("to_jid")?;
                let created_at: DateTime<Utc> = row.try_get("created_at")?;
                Ok(OfflineMessage {
                    id: row.try_get("id")?,
                    from: Jid::parse(&from).map_err(|e| StorageError::Backend(e.to_string()))?,
                    to: Jid::parse(&to).map_err(|e| StorageError::Backend(e.to_string()))?,
                    body: row.try_get("body")?,
                    created_at,
                })
            })
            .collect()
    }

    async fn destroy_message(&self, id: i64) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM offline_messages WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Registry entry for `storage = "sql"`; requires `database_url`.
pub struct SqlBackend;

#[async_trait]
impl StorageBackend for SqlBackend {
    async fn open(&self, host: &HostConfig) -> Result<Arc<dyn Storage>, StorageError> {
        let url = host
            .database_url
            .as_deref()
            .ok_or_else(|| StorageError::Config("sql storage requires database_url".into()))?;
        Ok(Arc::new(SqlStorage::connect(url).await?))
    }
}
