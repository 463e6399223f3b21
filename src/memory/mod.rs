use anyhow::Result;
use chrono::Utc;

use crate::config::SUMMARY_DIRECTIVE;
use crate::db::Database;
use crate::llm::ChatTurn;

/// Short-term context window supplied to the completion request.
pub const SHORT_MEMORY_WINDOW: i64 = 10;

const SUMMARY_CADENCE: usize = 10;

/// Records one conversation turn and refreshes the user's last-active
/// timestamp, creating the user row on first contact.
pub async fn append_turn(db: &Database, user_id: i64, role: &str, content: &str) -> Result<()> {
    let now = Utc::now();
    db.touch_user(user_id, now).await?;
    db.insert_message(user_id, role, content, now).await?;
    Ok(())
}

/// The most recent `limit` turns, oldest first. Used verbatim as
/// conversational context; no token-length truncation is applied.
pub async fn recent_window(db: &Database, user_id: i64, limit: i64) -> Result<Vec<ChatTurn>> {
    let rows = db.last_messages(user_id, limit).await?;
    Ok(rows
        .into_iter()
        .map(|row| ChatTurn {
            role: row.role,
            content: row.content,
        })
        .collect())
}

pub async fn latest_summary(db: &Database, user_id: i64) -> Result<Option<String>> {
    Ok(db.latest_summary(user_id).await?.map(|row| row.content))
}

pub async fn record_summary(db: &Database, user_id: i64, text: &str) -> Result<()> {
    db.touch_user(user_id, Utc::now()).await?;
    db.insert_summary(user_id, text, Utc::now()).await?;
    Ok(())
}

/// Cadence check for the rolling summary. Keys off the length of the
/// window that was fetched for the current turn, so once the window is
/// full the outcome is pinned by the fetch limit rather than the user's
/// all-time turn count.
pub fn should_summarize(window_len: usize) -> bool {
    window_len > 0 && window_len % SUMMARY_CADENCE == 0
}

/// Single directive instructing the model to compress the window into a
/// 1-2 sentence digest.
pub fn build_summary_request(window: &[ChatTurn]) -> String {
    let mut request = String::from(SUMMARY_DIRECTIVE);
    request.push('\n');
    for turn in window {
        request.push_str(&turn.role);
        request.push_str(": ");
        request.push_str(&turn.content);
        request.push('\n');
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::database::test_database;

    fn turn(role: &str, content: &str) -> ChatTurn {
        ChatTurn {
            role: role.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn cadence_fires_only_on_positive_multiples_of_ten() {
        for len in 1..10 {
            assert!(!should_summarize(len), "len {len} must not trigger");
        }
        assert!(!should_summarize(0));
        assert!(should_summarize(10));
        assert!(!should_summarize(11));
        assert!(should_summarize(20));
        assert!(should_summarize(30));
    }

    #[test]
    fn summary_request_lists_turns_after_the_directive() {
        let window = vec![turn("user", "привет"), turn("assistant", "здравствуй")];
        let request = build_summary_request(&window);
        assert!(request.starts_with(SUMMARY_DIRECTIVE));
        assert!(request.contains("user: привет\n"));
        assert!(request.contains("assistant: здравствуй\n"));
    }

    #[tokio::test]
    async fn append_turn_creates_the_user_and_orders_the_window() {
        let db = test_database().await;
        append_turn(&db, 5, "user", "A").await.unwrap();
        append_turn(&db, 5, "assistant", "B").await.unwrap();
        append_turn(&db, 5, "user", "C").await.unwrap();

        let window = recent_window(&db, 5, 2).await.unwrap();
        let contents: Vec<&str> = window.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["B", "C"]);

        let users = db.all_users().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].user_id, 5);
    }

    #[tokio::test]
    async fn latest_summary_roundtrip() {
        let db = test_database().await;
        assert!(latest_summary(&db, 9).await.unwrap().is_none());
        record_summary(&db, 9, "о жизни").await.unwrap();
        assert_eq!(latest_summary(&db, 9).await.unwrap().unwrap(), "о жизни");
    }
}
