pub mod payment;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::config::CONFIG;
use crate::db::Database;

/// Limit reported for subscribed users instead of the free-tier ceiling.
pub const UNLIMITED_SENTINEL: i64 = 9999;

/// True iff the user holds a subscription that is both active and unexpired.
pub async fn is_subscribed(db: &Database, user_id: i64) -> Result<bool> {
    let sub = db.effective_subscription(user_id, Utc::now()).await?;
    Ok(sub.is_some())
}

/// Messages sent in the trailing 24 hours plus the applicable ceiling.
pub async fn get_usage(db: &Database, user_id: i64) -> Result<(i64, i64)> {
    let cutoff = Utc::now() - Duration::days(1);
    let used = db.count_user_messages_since(user_id, cutoff).await?;
    let limit = if is_subscribed(db, user_id).await? {
        UNLIMITED_SENTINEL
    } else {
        CONFIG.free_user_limit
    };
    Ok((used, limit))
}

/// Creates or extends the user's subscription. The user row is ensured
/// first; callers always compute `expires_at` as now + duration.
pub async fn grant_subscription(
    db: &Database,
    user_id: i64,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    db.touch_user(user_id, Utc::now()).await?;
    db.upsert_subscription(user_id, expires_at).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::database::test_database;

    #[tokio::test]
    async fn user_without_record_is_not_subscribed() {
        crate::config::ensure_test_config();
        let db = test_database().await;
        assert!(!is_subscribed(&db, 1).await.unwrap());

        let (used, limit) = get_usage(&db, 1).await.unwrap();
        assert_eq!(used, 0);
        assert_eq!(limit, CONFIG.free_user_limit);
    }

    #[tokio::test]
    async fn future_grant_takes_effect_immediately() {
        crate::config::ensure_test_config();
        let db = test_database().await;
        grant_subscription(&db, 1, Utc::now() + Duration::days(30))
            .await
            .unwrap();

        assert!(is_subscribed(&db, 1).await.unwrap());
        let (_, limit) = get_usage(&db, 1).await.unwrap();
        assert_eq!(limit, UNLIMITED_SENTINEL);
    }

    #[tokio::test]
    async fn expired_grant_is_not_effective() {
        let db = test_database().await;
        grant_subscription(&db, 1, Utc::now() - Duration::hours(1))
            .await
            .unwrap();
        assert!(!is_subscribed(&db, 1).await.unwrap());
    }

    #[tokio::test]
    async fn double_grant_keeps_a_single_row_and_extends_expiry() {
        let db = test_database().await;
        let first = Utc::now() + Duration::days(30);
        let second = Utc::now() + Duration::days(90);
        grant_subscription(&db, 1, first).await.unwrap();
        grant_subscription(&db, 1, second).await.unwrap();

        let sub = db.subscription(1).await.unwrap().unwrap();
        assert_eq!(sub.expires_at.timestamp(), second.timestamp());
    }

    #[tokio::test]
    async fn usage_counts_only_user_turns_in_the_trailing_day() {
        crate::config::ensure_test_config();
        let db = test_database().await;
        let now = Utc::now();
        db.touch_user(1, now).await.unwrap();
        db.insert_message(1, "user", "stale", now - Duration::days(2))
            .await
            .unwrap();
        db.insert_message(1, "user", "recent", now - Duration::hours(2))
            .await
            .unwrap();
        db.insert_message(1, "assistant", "reply", now - Duration::hours(2))
            .await
            .unwrap();

        let (used, _) = get_usage(&db, 1).await.unwrap();
        assert_eq!(used, 1);
    }
}
