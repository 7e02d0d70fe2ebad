use crate::clock::{SystemTimeSource, TimeSource};
use crate::error::Result;
use crate::store::KvBackend;
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Row, SqlitePool,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Durable `KvBackend` on SQLite. Expiry is stored as unix milliseconds and
/// filtered on every read; `purge_expired` compacts.
pub struct SqliteBackend {
    pool: SqlitePool,
    clock: Arc<dyn TimeSource>,
}

impl SqliteBackend {
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::with_clock(database_url, Arc::new(SystemTimeSource)).await
    }

    pub async fn with_clock(database_url: &str, clock: Arc<dyn TimeSource>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(
                SqliteConnectOptions::from_str(database_url)?
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal),
            )
            .await?;

        let db = Self { pool, clock };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS kv_sets (
                set_name TEXT NOT NULL,
                member TEXT NOT NULL,
                PRIMARY KEY (set_name, member)
            );

            CREATE INDEX IF NOT EXISTS idx_kv_entries_expiry ON kv_entries(expires_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<i64> {
        let ttl_ms = i64::try_from(ttl?.as_millis()).ok()?;
        self.now_ms().checked_add(ttl_ms)
    }

    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(self.now_ms())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            tracing::debug!(removed = result.rows_affected(), "Purged expired entries");
        }
        Ok(result.rows_affected())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl KvBackend for SqliteBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT value FROM kv_entries WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(self.now_ms())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row.get::<String, _>(0)))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(self.expiry(ttl))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        // A single upsert keeps check-and-set atomic: an existing live row is
        // left alone, an expired one is replaced.
        let result = sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at
            WHERE kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= ?
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(self.expiry(ttl))
        .bind(self.now_ms())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM kv_entries WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(self.now_ms())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn set_add(&self, set: &str, member: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO kv_sets (set_name, member) VALUES (?, ?)")
            .bind(set)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_remove(&self, set: &str, member: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_sets WHERE set_name = ? AND member = ?")
            .bind(set)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT member FROM kv_sets WHERE set_name = ? ORDER BY member")
            .bind(set)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|row| row.get::<String, _>(0)).collect())
    }
}
