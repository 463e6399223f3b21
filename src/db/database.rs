use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::db::models::{BotStats, MessageRow, SubscriptionRow, SummaryRow, UserRow};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn init(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Runs the schema migrations against an already-built pool. Tests use
    /// this with a single-connection in-memory pool.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (\
                user_id INTEGER PRIMARY KEY,\
                last_active TEXT NOT NULL\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                user_id INTEGER NOT NULL,\
                role TEXT NOT NULL,\
                content TEXT NOT NULL,\
                created_at TEXT NOT NULL,\
                FOREIGN KEY(user_id) REFERENCES users(user_id)\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS subscriptions (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                user_id INTEGER NOT NULL,\
                is_active INTEGER NOT NULL DEFAULT 0,\
                expires_at TEXT NOT NULL,\
                FOREIGN KEY(user_id) REFERENCES users(user_id)\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS summaries (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                user_id INTEGER NOT NULL,\
                content TEXT NOT NULL,\
                created_at TEXT NOT NULL,\
                FOREIGN KEY(user_id) REFERENCES users(user_id)\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS system_prompt (\
                id INTEGER PRIMARY KEY AUTOINCREMENT,\
                content TEXT NOT NULL\
            );",
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_user_id ON messages(user_id);")
            .execute(&pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at);")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_subscriptions_user_id ON subscriptions(user_id);",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_summaries_user_id ON summaries(user_id);")
            .execute(&pool)
            .await?;

        info!("Database tables created successfully");

        Ok(Database { pool })
    }

    /// Creates the user row on first contact, otherwise refreshes last_active.
    pub async fn touch_user(&self, user_id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO users (user_id, last_active) VALUES (?, ?) \
             ON CONFLICT(user_id) DO UPDATE SET last_active = excluded.last_active",
        )
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_message(
        &self,
        user_id: i64,
        role: &str,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("INSERT INTO messages (user_id, role, content, created_at) VALUES (?, ?, ?, ?)")
            .bind(user_id)
            .bind(role)
            .bind(content)
            .bind(created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Most recent `limit` messages for the user, oldest first.
    pub async fn last_messages(&self, user_id: i64, limit: i64) -> Result<Vec<MessageRow>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT id, user_id, role, content, created_at FROM messages \
             WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().rev().collect())
    }

    pub async fn count_user_messages_since(
        &self,
        user_id: i64,
        cutoff: DateTime<Utc>,
    ) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM messages WHERE user_id = ? AND role = 'user' AND created_at > ?",
        )
        .bind(user_id)
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn delete_messages_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn insert_summary(
        &self,
        user_id: i64,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("INSERT INTO summaries (user_id, content, created_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(content)
            .bind(created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn latest_summary(&self, user_id: i64) -> Result<Option<SummaryRow>> {
        let row = sqlx::query_as::<_, SummaryRow>(
            "SELECT id, user_id, content, created_at FROM summaries \
             WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn subscription(&self, user_id: i64) -> Result<Option<SubscriptionRow>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT id, user_id, is_active, expires_at FROM subscriptions WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn effective_subscription(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<SubscriptionRow>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT id, user_id, is_active, expires_at FROM subscriptions \
             WHERE user_id = ? AND is_active = 1 AND expires_at > ?",
        )
        .bind(user_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Re-activates the existing subscription row in place when one exists,
    /// so a user never accumulates parallel rows.
    pub async fn upsert_subscription(
        &self,
        user_id: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(existing) = self.subscription(user_id).await? {
            sqlx::query("UPDATE subscriptions SET is_active = 1, expires_at = ? WHERE id = ?")
                .bind(expires_at)
                .bind(existing.id)
                .execute(&self.pool)
                .await?;
            info!("Updated subscription for user {user_id} until {expires_at}");
        } else {
            sqlx::query(
                "INSERT INTO subscriptions (user_id, is_active, expires_at) VALUES (?, 1, ?)",
            )
            .bind(user_id)
            .bind(expires_at)
            .execute(&self.pool)
            .await?;
            info!("Created subscription for user {user_id} until {expires_at}");
        }
        Ok(())
    }

    /// Active subscriptions expiring within `days_before` days of `now`.
    pub async fn expiring_subscriptions(
        &self,
        now: DateTime<Utc>,
        days_before: i64,
    ) -> Result<Vec<SubscriptionRow>> {
        let future = now + Duration::days(days_before);
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT id, user_id, is_active, expires_at FROM subscriptions \
             WHERE is_active = 1 AND expires_at > ? AND expires_at <= ?",
        )
        .bind(now)
        .bind(future)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn all_users(&self) -> Result<Vec<UserRow>> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT user_id, last_active FROM users ORDER BY last_active DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> Result<BotStats> {
        let users = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        let subscribers = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM subscriptions WHERE is_active = 1 AND expires_at > ?",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        let messages_today =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE created_at > ?")
                .bind(now - Duration::days(1))
                .fetch_one(&self.pool)
                .await?;

        Ok(BotStats {
            users,
            subscribers,
            messages_today,
        })
    }

    /// The most recently inserted prompt wins.
    pub async fn system_prompt(&self) -> Result<Option<String>> {
        let content = sqlx::query_scalar::<_, String>(
            "SELECT content FROM system_prompt ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(content)
    }

    pub async fn set_system_prompt(&self, content: &str) -> Result<()> {
        sqlx::query("INSERT INTO system_prompt (content) VALUES (?)")
            .bind(content)
            .execute(&self.pool)
            .await?;
        info!("System prompt replaced");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) async fn test_database() -> Database {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    Database::with_pool(pool).await.expect("migrations")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn window_returns_most_recent_messages_oldest_first() {
        let db = test_database().await;
        db.touch_user(1, ts(0)).await.unwrap();
        db.insert_message(1, "user", "A", ts(1)).await.unwrap();
        db.insert_message(1, "assistant", "B", ts(2)).await.unwrap();
        db.insert_message(1, "user", "C", ts(3)).await.unwrap();

        let window = db.last_messages(1, 2).await.unwrap();
        let contents: Vec<&str> = window.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["B", "C"]);
    }

    #[tokio::test]
    async fn window_is_empty_for_unknown_user() {
        let db = test_database().await;
        assert!(db.last_messages(42, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retention_deletes_only_rows_older_than_cutoff() {
        let db = test_database().await;
        db.touch_user(1, ts(0)).await.unwrap();
        db.insert_message(1, "user", "old", ts(0)).await.unwrap();
        db.insert_message(1, "user", "older", ts(10)).await.unwrap();
        db.insert_message(1, "user", "fresh", ts(100)).await.unwrap();

        let deleted = db.delete_messages_older_than(ts(50)).await.unwrap();
        assert_eq!(deleted, 2);

        let remaining = db.last_messages(1, 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "fresh");
    }

    #[tokio::test]
    async fn latest_summary_wins_over_older_ones() {
        let db = test_database().await;
        db.touch_user(1, ts(0)).await.unwrap();
        db.insert_summary(1, "first", ts(1)).await.unwrap();
        db.insert_summary(1, "second", ts(2)).await.unwrap();

        let latest = db.latest_summary(1).await.unwrap().unwrap();
        assert_eq!(latest.content, "second");
    }

    #[tokio::test]
    async fn most_recent_system_prompt_wins() {
        let db = test_database().await;
        assert!(db.system_prompt().await.unwrap().is_none());

        db.set_system_prompt("one").await.unwrap();
        db.set_system_prompt("two").await.unwrap();
        assert_eq!(db.system_prompt().await.unwrap().unwrap(), "two");
    }

    #[tokio::test]
    async fn upsert_subscription_updates_in_place() {
        let db = test_database().await;
        db.touch_user(7, ts(0)).await.unwrap();
        db.upsert_subscription(7, ts(1000)).await.unwrap();
        db.upsert_subscription(7, ts(2000)).await.unwrap();

        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM subscriptions WHERE user_id = 7")
                .fetch_one(&db.pool)
                .await
                .unwrap();
        assert_eq!(count, 1);

        let sub = db.subscription(7).await.unwrap().unwrap();
        assert_eq!(sub.expires_at, ts(2000));
        assert!(sub.is_active);
    }

    #[tokio::test]
    async fn expiring_subscriptions_respects_the_lookahead_window() {
        let db = test_database().await;
        let now = ts(0);
        db.touch_user(1, now).await.unwrap();
        db.touch_user(2, now).await.unwrap();
        db.touch_user(3, now).await.unwrap();
        db.upsert_subscription(1, now + Duration::days(2)).await.unwrap();
        db.upsert_subscription(2, now + Duration::days(10)).await.unwrap();
        db.upsert_subscription(3, now - Duration::days(1)).await.unwrap();

        let expiring = db.expiring_subscriptions(now, 3).await.unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].user_id, 1);
    }
}
